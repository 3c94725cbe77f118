//! Kernel and cell execution state tracking.
//!
//! `CellExecutionState`'s variants and terminal/error classification are
//! grounded directly on `original_source/origami/types/deltas.py`'s
//! `CellState` enum (its `_generate_next_value_` makes the wire string
//! equal to the Python identifier, which is why the `serde` renames below
//! are literal snake_case rather than camelCase).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellExecutionState {
    #[serde(rename = "not_run")]
    NotRun,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "executing")]
    Executing,
    #[serde(rename = "finished_with_no_error")]
    FinishedWithNoError,
    #[serde(rename = "finished_with_error")]
    FinishedWithError,
    #[serde(rename = "catastrophic_failure")]
    CatastrophicFailure,
    #[serde(rename = "dequeued")]
    Dequeued,
    #[serde(rename = "interrupted")]
    Interrupted,
}

impl CellExecutionState {
    /// Terminal states: the ones a pending execution future resolves on.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CellExecutionState::NotRun
                | CellExecutionState::FinishedWithNoError
                | CellExecutionState::FinishedWithError
                | CellExecutionState::CatastrophicFailure
                | CellExecutionState::Dequeued
                | CellExecutionState::Interrupted
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            CellExecutionState::FinishedWithError
                | CellExecutionState::CatastrophicFailure
                | CellExecutionState::Dequeued
                | CellExecutionState::Interrupted
        )
    }
}

/// Kernel status is an open string rather than a closed enum: the source
/// (`origami/types/kernels.py`) lists a long, evolving set of values
/// (`requested`, `pulling-initialization-resources`, `idle`, `busy`,
/// `restarting`, ...) and new ones are added without client changes, so a
/// client that only cares about `idle` for `wait_for_kernel_idle` gains
/// nothing from a closed enum and would break on every server addition.
pub type KernelState = String;

pub const KERNEL_STATE_IDLE: &str = "idle";

/// Tracks, per cell id, the most recently observed execution state and any
/// outstanding future waiting for that cell to reach a terminal state.
#[derive(Default)]
pub struct ExecutionTracker {
    cell_states: HashMap<String, CellExecutionState>,
    kernel_state: Option<KernelState>,
    pending: HashMap<String, tokio::sync::oneshot::Sender<ExecutionOutcome>>,
}

/// What a pending execution future resolves with.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Finished(CellExecutionState),
    CellNotFound,
    /// The client was shut down before the cell reached a terminal state.
    Cancelled,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel_state(&self) -> Option<&str> {
        self.kernel_state.as_deref()
    }

    pub fn set_kernel_state(&mut self, state: KernelState) {
        self.kernel_state = Some(state);
    }

    pub fn cell_state(&self, cell_id: &str) -> Option<CellExecutionState> {
        self.cell_states.get(cell_id).copied()
    }

    /// Registers a waiter for `cell_id` reaching a terminal state. If the
    /// cell is dropped or the tracker is dropped before resolution, the
    /// receiving end observes a closed channel.
    pub fn register_waiter(&mut self, cell_id: impl Into<String>) -> tokio::sync::oneshot::Receiver<ExecutionOutcome> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.insert(cell_id.into(), tx);
        rx
    }

    /// Applies a `bulk_cell_state_update` entry: records the new state and,
    /// if a waiter is registered and the state is terminal, resolves it.
    pub fn apply_cell_state(&mut self, cell_id: &str, state: CellExecutionState, cell_still_exists: bool) {
        self.cell_states.insert(cell_id.to_owned(), state);
        if !state.is_terminal() {
            return;
        }
        if let Some(tx) = self.pending.remove(cell_id) {
            let outcome = if cell_still_exists {
                ExecutionOutcome::Finished(state)
            } else {
                ExecutionOutcome::CellNotFound
            };
            let _ = tx.send(outcome);
        }
    }

    /// Resolves every outstanding waiter with [`ExecutionOutcome::Cancelled`].
    /// Called once, from `shutdown()`.
    pub fn cancel_all(&mut self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(ExecutionOutcome::Cancelled);
        }
    }
}
