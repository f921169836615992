//! Rate-control telemetry daemon.
//!
//! Watches wireless devices under debugfs, broadcasts their rate-control
//! events to TCP subscribers (plain lines or dictionary-compressed frames),
//! forwards subscriber commands back to the devices, and runs on-demand
//! monitoring sessions for individual debugfs files.
//!
//! All state lives in a single [`hub::Hub`] driven by one event channel.

pub mod config;
pub mod control;
pub mod daemon;
pub mod device;
pub mod discovery;
pub mod hub;
pub mod lines;
pub mod net;
pub mod registry;
pub mod session;
pub mod subscriber;
pub mod sync;

#[cfg(test)]
mod test_helpers;

pub use config::{DaemonConfig, FileConfig, load_config};
pub use daemon::Daemon;
