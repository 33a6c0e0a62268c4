//! Cloud connector: a self-healing relay between a vizier's local message
//! bus and the remote control plane.
//!
//! The bridge subscribes to `v2c.*` on the bus, forwards wrapped payloads
//! over a single bidirectional stream, republishes cloud traffic under
//! `c2v.<topic>`, heartbeats the cluster's state upstream, and launches
//! updater jobs on command. A watchdog restarts the process when the
//! outbound path stalls beyond what reconnects can fix.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod transport;
pub mod vizier;

pub use bridge::Bridge;
pub use config::Config;
pub use error::BridgeError;
