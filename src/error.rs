//! Error taxonomy: one `thiserror` enum per component, unified into
//! [`RtuError`] at the public-operation boundary — the same split the
//! teacher uses between `SessionError`/`UplinkError` and whatever a service
//! surfaces to its own callers.

use rt_model::BuilderError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("permanently refused: {0}")]
    Permanent(String),
    #[error("connection lost")]
    Disconnected,
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("handler for {event} raised: {source}")]
    HandlerFailed {
        event: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("squash of delta {delta_id} failed, document may no longer be trusted: {source}")]
    SquashFailed {
        delta_id: Uuid,
        #[source]
        source: BuilderError,
    },
}

/// The reason a submitted delta was not accepted by the server. Carries the
/// server's own message so callers can log/display it.
#[derive(Debug, thiserror::Error)]
pub enum DeltaRejection {
    #[error("delta rejected: {0}")]
    Rejected(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RtuError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    DeltaRejected(#[from] DeltaRejection),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("cell not found: {cell_id}")]
    CellNotFound { cell_id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("the client has been shut down")]
    ShutDown,
    #[error("operation cancelled")]
    Cancelled,
    #[error("client not initialized — call initialize() first")]
    NotInitialized,
    #[error("seed source error: {0}")]
    Seed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("wire frame decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
