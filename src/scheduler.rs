pub mod daemon;

pub use daemon::spawn_sweep_daemon;
