//! Typed payloads for `RtuFrame::data`, keyed by event name.
//!
//! These are decoded on demand via [`crate::frame::RtuFrame::parse_data`];
//! there is no single top-level enum tagged on `event` because `event` is a
//! sibling of `data`, not a tag embedded inside it.

use crate::delta::Delta;
use crate::notebook::Output;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub token: String,
    pub rtu_client_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateReply {
    pub success: bool,
    #[serde(default)]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoamiReply {
    pub user: UserInfo,
}

/// A file subscription selects a starting point either by the last delta
/// the client already applied, or by the notebook version it was seeded
/// from. Exactly one must be set; an all-zero delta id is never sent (the
/// server rejects it — use `from_version_id` on first subscribe instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_delta_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeReply {
    #[serde(default)]
    pub deltas_to_apply: Vec<Delta>,
    #[serde(default)]
    pub latest_delta_id: Option<Uuid>,
    #[serde(default)]
    pub kernel_session: Option<KernelSession>,
    #[serde(default)]
    pub cell_states: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub user_subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSession {
    pub kernel_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeltaRequest {
    pub delta: Delta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeltaReply {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeltaEvent {
    pub delta: Delta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaRejected {
    pub cause: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidData {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDenied {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InconsistentStateEvent {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOutputCollectionEvent {
    pub cell_id: String,
    pub outputs: Vec<Output>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendOutputEvent {
    pub cell_id: String,
    pub output: Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStatusUpdateEvent {
    pub kernel_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCellStateUpdateEvent {
    pub cell_states: std::collections::HashMap<String, String>,
}

/// Generic `{success: bool}` reply shape, common to several events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessReply {
    pub success: bool,
    #[serde(default, flatten)]
    pub extra: Value,
}
