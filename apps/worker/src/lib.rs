//! Bulk Worker
//!
//! Background process that drains the bulk work queue: claims units, streams
//! their payloads through a processor, keeps the claim alive with heartbeats
//! and records the outcome. Abandoned claims are recovered by the reaper.

pub mod background;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod reaper;
pub mod server;
pub mod state;
pub mod workers;

pub use error::{Error, Result};
