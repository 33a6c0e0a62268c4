use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Bridge configuration, assembled by the binary from CLI flags and
/// environment variables.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Cluster identity. `None` until enrollment assigns one.
    pub vizier_id: Option<Uuid>,
    /// Signing key sent in the register frame.
    pub jwt_signing_key: String,
    /// Out-of-band credential, used only during enrollment.
    pub deploy_key: String,
    /// Monotonically increasing per process start; stamps every outbound frame.
    pub session_id: i64,
    /// Published in heartbeats.
    pub bootstrap_mode: bool,
    /// Published in heartbeats.
    pub bootstrap_version: String,
}

impl Config {
    /// Session ids only need to increase across restarts of the same cluster,
    /// so wall-clock nanos at startup are sufficient.
    pub fn session_id_from_clock() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}
