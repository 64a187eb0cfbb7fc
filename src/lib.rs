//! Continuously probe a host with an external ping-style command and keep the
//! timestamps of the last successful and the last failed probe.
//!
//! The core is [`monitor::ProbeMonitor`]; [`output`] persists its state for
//! external readers and [`stats`] samples disk/network counters.

pub mod classify;
pub mod config;
pub mod monitor;
pub mod output;
pub mod probe;
#[cfg(feature = "serve")]
pub mod serve;
pub mod signals;
pub mod state;
pub mod stats;

pub use monitor::{MonitorConfig, MonitorError, MonitorHandle, MonitorPhase, ProbeMonitor};
pub use state::{ProbeReader, ProbeSnapshot, ProbeState};
