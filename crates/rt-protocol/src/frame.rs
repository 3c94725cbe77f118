//! The RTU wire frame envelope and channel naming.
//!
//! A frame's shape is fixed (`transaction_id`, `channel`, `event`, `data`,
//! plus reply-only `msg_id`/`processed_timestamp`); `data`'s shape depends
//! on `event` and is deliberately left as [`serde_json::Value`] at this
//! layer — see [`crate::messages`] for the typed payloads keyed by event
//! name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Number of leading hex characters of a file id used to derive its kernel
/// channel name. Frozen at 20 by this port; see `SPEC_FULL.md` §9 for the
/// 15-vs-20 ambiguity this resolves.
pub const KERNEL_POD_HEX_PREFIX_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtuFrame {
    pub transaction_id: Uuid,
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_timestamp: Option<DateTime<Utc>>,
}

impl RtuFrame {
    pub fn request(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        RtuFrame {
            transaction_id: Uuid::new_v4(),
            channel: channel.into(),
            event: event.into(),
            data,
            msg_id: None,
            processed_timestamp: None,
        }
    }

    /// The leading path segment, e.g. `"files"` out of `"files/<uuid>"`.
    pub fn channel_prefix(&self) -> &str {
        self.channel.split('/').next().unwrap_or(&self.channel)
    }

    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// A parsed channel identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    System,
    Files(String),
    Kernels(String),
    /// Any other channel prefix — kept rather than rejected (unknown
    /// channels are routed by prefix-match predicates, not hard errors).
    Other(String),
}

impl Channel {
    pub fn parse(channel: &str) -> Channel {
        let mut parts = channel.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some("system"), _) => Channel::System,
            (Some("files"), Some(id)) => Channel::Files(id.to_owned()),
            (Some("kernels"), Some(pod)) => Channel::Kernels(pod.to_owned()),
            _ => Channel::Other(channel.to_owned()),
        }
    }

    pub fn files(file_id: &str) -> String {
        format!("files/{file_id}")
    }

    /// Derive the kernel channel name for a file id, per §6 of the spec
    /// this implements: `kernels/notebook-kernel-{first N hex chars}`.
    pub fn kernel_for_file(file_id: &str) -> String {
        let hex: String = file_id.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        let prefix: String = hex.chars().take(KERNEL_POD_HEX_PREFIX_LEN).collect();
        format!("kernels/notebook-kernel-{prefix}")
    }
}

/// Event name constants. Grouped by the channel they're sent/received on.
pub mod events {
    pub const AUTHENTICATE_REQUEST: &str = "authenticate_request";
    pub const AUTHENTICATE_REPLY: &str = "authenticate_reply";
    pub const PING_REQUEST: &str = "ping_request";
    pub const PONG_REPLY: &str = "pong_reply";
    pub const WHOAMI_REQUEST: &str = "whoami_request";
    pub const WHOAMI_REPLY: &str = "whoami_reply";

    pub const SUBSCRIBE_REQUEST: &str = "subscribe_request";
    pub const SUBSCRIBE_REPLY: &str = "subscribe_reply";
    pub const UNSUBSCRIBE_REQUEST: &str = "unsubscribe_request";
    pub const UNSUBSCRIBE_REPLY: &str = "unsubscribe_reply";

    pub const NEW_DELTA_REQUEST: &str = "new_delta_request";
    pub const NEW_DELTA_REPLY: &str = "new_delta_reply";
    pub const NEW_DELTA_EVENT: &str = "new_delta_event";

    pub const UPDATE_OUTPUT_COLLECTION_EVENT: &str = "update_output_collection_event";
    pub const APPEND_OUTPUT_EVENT: &str = "append_output_event";

    pub const KERNEL_STATUS_UPDATE_EVENT: &str = "kernel_status_update_event";
    pub const BULK_CELL_STATE_UPDATE_EVENT: &str = "bulk_cell_state_update_event";

    pub const INVALID_EVENT: &str = "invalid_event";
    pub const INVALID_DATA: &str = "invalid_data";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const DELTA_REJECTED: &str = "delta_rejected";
    pub const INCONSISTENT_STATE_EVENT: &str = "inconsistent_state_event";

    /// All error-variant event names, per §4.2.
    pub const ERROR_EVENTS: &[&str] = &[
        INVALID_EVENT,
        INVALID_DATA,
        PERMISSION_DENIED,
        DELTA_REJECTED,
        INCONSISTENT_STATE_EVENT,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_prefix_extracts_leading_segment() {
        let frame = RtuFrame::request("files/abc-123", events::NEW_DELTA_REQUEST, Value::Null);
        assert_eq!(frame.channel_prefix(), "files");
    }

    #[test]
    fn channel_parse_recognises_known_prefixes() {
        assert_eq!(Channel::parse("system"), Channel::System);
        assert_eq!(
            Channel::parse("files/abc"),
            Channel::Files("abc".to_owned())
        );
        assert_eq!(
            Channel::parse("kernels/pod-1"),
            Channel::Kernels("pod-1".to_owned())
        );
    }

    #[test]
    fn kernel_channel_uses_first_twenty_hex_chars() {
        let file_id = "0123456789abcdefABCDEF0123456789";
        let ch = Channel::kernel_for_file(file_id);
        assert_eq!(ch, "kernels/notebook-kernel-0123456789abcdefABCD");
    }
}
