//! Background runners for bulk work units
//!
//! Each runner task claims units from the work queue, streams their payloads
//! through a [`UnitProcessor`] and completes them.

mod base;
mod export;
mod runner;

pub use base::{UnitProcessor, UnitProgress};
pub use export::ExportProcessor;
pub use runner::{run_worker, spawn_runners, RunnerContext, WorkerRunnerConfig};
