//! Well-known bridge topics and local bus subject helpers.
//!
//! In-cluster services publish on `v2c.<topic>` and receive on
//! `c2v.<topic>`. Passthrough query replies use `v2c.reply-<uuid>` subjects
//! and are prioritized over control traffic by the bridge.

pub const REGISTER: &str = "register";
pub const REGISTER_ACK: &str = "registerAck";
pub const HEARTBEAT: &str = "heartbeat";
pub const VIZIER_UPDATE: &str = "VizierUpdate";
pub const VIZIER_UPDATE_RESPONSE: &str = "VizierUpdateResponse";

pub const V2C_PREFIX: &str = "v2c.";
pub const C2V_PREFIX: &str = "c2v.";
pub const PASSTHROUGH_REPLY_PREFIX: &str = "v2c.reply-";

/// Subject the bridge subscribes to for all outbound traffic.
pub fn v2c_wildcard() -> String {
    format!("{V2C_PREFIX}*")
}

pub fn v2c_subject(topic: &str) -> String {
    format!("{V2C_PREFIX}{topic}")
}

pub fn c2v_subject(topic: &str) -> String {
    format!("{C2V_PREFIX}{topic}")
}

/// Strips the outbound prefix, yielding the logical topic. `None` means the
/// subject violates the bus contract.
pub fn strip_v2c(subject: &str) -> Option<&str> {
    subject.strip_prefix(V2C_PREFIX)
}

/// Passthrough replies are detected on the raw subject, before the outbound
/// prefix is stripped.
pub fn is_passthrough_reply(subject: &str) -> bool {
    subject.starts_with(PASSTHROUGH_REPLY_PREFIX)
}
