#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub(crate) mod api;
pub mod app;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod observability;
pub mod providers;
pub mod scheduler;
pub mod store;
pub mod util;
