//! Photond - a long-lived daemon hosting stateful photons
//!
//! Photons are small stateful modules compiled from source files. The daemon
//! keeps one live object per (photon, instance), persists state after every
//! mutating call, hot-reloads photons when their source changes and offers
//! pub/sub channels with replay to clients on a local Unix socket.

pub mod config;
pub mod core;
pub mod error;
pub mod ipc;
pub mod photon;

// Re-export commonly used types
pub use config::DaemonConfig;
pub use core::daemon::{Daemon, DaemonEvent};
pub use error::{DaemonError, Result};
pub use ipc::client::DaemonClient;
