use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{error, info, warn};

use crate::{engine::VerificationEngine, error::SweepError};

/// 一定間隔で検証スイープを実行するデーモンを起動する。
///
/// 最初のスイープは起動直後に走る。スイープの失敗はログに残し、デーモンは止めない。
pub fn spawn_sweep_daemon(engine: VerificationEngine, every: Duration) -> JoinHandle<()> {
    SweepDaemon::new(engine, every).spawn()
}

struct SweepDaemon {
    engine: VerificationEngine,
    every: Duration,
}

impl SweepDaemon {
    fn new(engine: VerificationEngine, every: Duration) -> Self {
        Self { engine, every }
    }

    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut ticker = interval(self.every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_seconds = self.every.as_secs(),
            "starting periodic verification sweeps"
        );

        loop {
            ticker.tick().await;
            match self.engine.verify_ingest().await {
                Ok(report) => info!(
                    dispatched = report.dispatched,
                    skipped_no_original = report.skipped_no_original,
                    failed = report.failed,
                    open_runs = self.engine.open_runs(),
                    "automatic verification sweep completed"
                ),
                Err(SweepError::AlreadyRunning) => {
                    warn!("previous verification sweep still running, skipping tick");
                }
                Err(err) => error!(error = %err, "automatic verification sweep failed"),
            }
        }
    }
}
