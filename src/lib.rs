//! rtu-client: a realtime client for a collaborative notebook document.
//!
//! Ties together a persistent WebSocket [`transport::Transport`] (C1), an
//! inbound frame [`router::Router`] (C2), a causal-order-enforcing
//! [`sequencer::Sequencer`] wrapping a [`rt_model::NotebookBuilder`] (C4),
//! and the [`client::RtuClient`] orchestrator (C5) that drives the
//! connect/authenticate/subscribe/catch-up lifecycle and exposes the
//! document-editing operations.

pub mod client;
pub mod config;
pub mod error;
pub mod router;
pub mod seed;
pub mod sequencer;
pub mod state;
pub mod transport;

pub use client::{ClientState, ExecutionSelector, RtuClient};
pub use config::{ConfigError, CreatorClientType, RtuConfig, RtuConfigBuilder};
pub use error::{DeltaRejection, RouterError, RtuError, SequencerError, TransportError};
pub use router::{HandlerId, HandlerOutcome, Router, SharedRouter};
pub use seed::{FileMetadata, SeedError, SeedSource};
pub use sequencer::{Sequencer, Squashed};
pub use state::{CellExecutionState, ExecutionOutcome, ExecutionTracker, KernelState};
pub use transport::{Transport, TransportEvent};

#[cfg(feature = "rest-client")]
pub use seed::ReqwestSeedSource;

pub use rt_model::{BuilderError, NotebookBuilder};
pub use rt_protocol::{Cell, CodeCell, Delta, Notebook, Output, RtuFrame, TextCell};
