//! Delta Sequencer (C4): enforces the linearization invariant on the
//! incoming delta stream and owns the [`NotebookBuilder`] exclusively.
//!
//! The source's "single-threaded cooperative scheduler" becomes, here, a
//! single writer lock: only the reader-dispatch path (driven by the
//! transport's one reader task, one frame at a time) ever takes
//! [`tokio::sync::RwLock::write`]; every other reader of the document takes
//! `.read()`. That gives the same "no internal locking needed inside the
//! builder, mutation is strictly serial" guarantee the source gets for free
//! from its scheduler, without standing up a dedicated actor task + mpsc
//! channel for what is, in practice, a single call site.

use std::collections::VecDeque;
use std::sync::Arc;

use rt_protocol::{Delta, Notebook};
use tokio::sync::{RwLock, broadcast};
use tracing::warn;
use uuid::Uuid;

use rt_model::NotebookBuilder;

use crate::error::SequencerError;

/// Emitted every time a delta is actually applied to the document — the
/// local analogue of a wire acknowledgement. The delta-submission protocol
/// (§4.5) resolves a pending request's squash handler off of this stream
/// rather than a router predicate, since squashing is a purely local event
/// with no frame of its own.
#[derive(Debug, Clone)]
pub struct Squashed {
    pub delta_id: Uuid,
}

struct State {
    builder: NotebookBuilder,
    catch_up_complete: bool,
    unapplied: VecDeque<Delta>,
}

/// Shared, cloneable handle to the sequencer.
#[derive(Clone)]
pub struct Sequencer {
    state: Arc<RwLock<State>>,
    squashed_tx: broadcast::Sender<Squashed>,
    fatal_tx: broadcast::Sender<Arc<SequencerError>>,
}

impl Sequencer {
    pub fn new(notebook: Notebook) -> Self {
        let (squashed_tx, _) = broadcast::channel(256);
        let (fatal_tx, _) = broadcast::channel(8);
        Self {
            state: Arc::new(RwLock::new(State {
                builder: NotebookBuilder::new(notebook),
                catch_up_complete: false,
                unapplied: VecDeque::new(),
            })),
            squashed_tx,
            fatal_tx,
        }
    }

    /// Replaces the document wholesale — used by the `RESYNC` transition,
    /// which refetches the seed notebook and rebuilds the builder from
    /// scratch rather than trying to reconcile in place.
    pub async fn rebuild(&self, notebook: Notebook) {
        let mut state = self.state.write().await;
        state.builder = NotebookBuilder::new(notebook);
        state.catch_up_complete = false;
        state.unapplied.clear();
    }

    pub fn subscribe_squashed(&self) -> broadcast::Receiver<Squashed> {
        self.squashed_tx.subscribe()
    }

    /// Fires at most once per sequencer: a delta failed to squash and the
    /// document can no longer be trusted. The RTU Client subscribes to this
    /// during `initialize()` and shuts itself down when it fires.
    pub fn subscribe_fatal(&self) -> broadcast::Receiver<Arc<SequencerError>> {
        self.fatal_tx.subscribe()
    }

    pub async fn last_applied_delta_id(&self) -> Option<Uuid> {
        self.state.read().await.builder.last_applied_delta_id()
    }

    pub async fn notebook_json(&self) -> serde_json::Result<String> {
        self.state.read().await.builder.to_json_compact()
    }

    pub async fn cell(&self, cell_id: &str) -> Option<rt_protocol::Cell> {
        self.state
            .read()
            .await
            .builder
            .notebook()
            .cell(cell_id)
            .cloned()
    }

    /// The id of the cell immediately preceding `cell_id` in document
    /// order, or `None` if `cell_id` is first. Used to translate
    /// `add_cell`'s `before` argument into the wire's native `after_id`
    /// concept — the delta payload has no `before_id` of its own.
    pub async fn cell_before(&self, cell_id: &str) -> Option<String> {
        let state = self.state.read().await;
        let notebook = state.builder.notebook();
        let idx = notebook.index_of(cell_id)?;
        idx.checked_sub(1).map(|i| notebook.cells[i].id().to_owned())
    }

    /// Catch-up, triggered once by the subscription reply: applies
    /// `deltas_to_apply` in order, seeds `last_applied_delta_id` from
    /// `latest_delta_id` if the builder still has none, marks catch-up
    /// complete, then drains anything that arrived early via `replay`.
    ///
    /// Each item in `deltas_to_apply` goes through [`apply_catch_up_delta`],
    /// not [`queue_or_apply`]: the server hands us this list already in
    /// causal order, and its first element's `parent_delta_id` is the seed
    /// version's latest delta — not the root sentinel — so anchoring only
    /// applies to the live stream's out-of-order-arrival problem.
    pub async fn catch_up(&self, deltas_to_apply: Vec<Delta>, latest_delta_id: Option<Uuid>) {
        let mut state = self.state.write().await;
        for delta in deltas_to_apply {
            apply_catch_up_delta(&mut state, delta, &self.squashed_tx, &self.fatal_tx);
        }
        if state.builder.last_applied_delta_id().is_none() {
            if let Some(id) = latest_delta_id {
                state.builder.seed_last_applied_delta_id(id);
            }
        }
        state.catch_up_complete = true;
        replay(&mut state, &self.squashed_tx, &self.fatal_tx);
    }

    /// Feeds one delta from the live stream through the sequencer.
    pub async fn on_delta(&self, delta: Delta) {
        let mut state = self.state.write().await;
        if !state.catch_up_complete {
            state.unapplied.push_back(delta);
            return;
        }
        queue_or_apply(&mut state, delta, &self.squashed_tx, &self.fatal_tx);
    }

    /// `append_output_event`/`update_output_collection_event` bypass the
    /// causal chain entirely — they carry no delta id and are applied
    /// directly to the builder.
    pub async fn append_output(&self, cell_id: &str, output: rt_protocol::Output) {
        let mut state = self.state.write().await;
        state.builder.apply_append_output(cell_id, output);
    }

    pub async fn update_output_collection(&self, cell_id: &str, outputs: Vec<rt_protocol::Output>) {
        let mut state = self.state.write().await;
        state.builder.apply_update_output_collection(cell_id, outputs);
    }
}

/// Applies one element of a subscribe reply's `deltas_to_apply` list.
/// Mirrors the ground-truth `queue_or_apply_delta`'s null case exactly: when
/// the builder has no `last_applied_delta_id` yet, apply unconditionally to
/// anchor the chain, regardless of whether `delta.parent_delta_id` happens
/// to be the root sentinel. The server-provided list is already in causal
/// order, so its first element's parent is ordinarily the seed version's
/// latest delta, not root — gating on root here would strand the entire
/// catch-up list behind a seed value it will never match (Testable
/// Invariant #5).
fn apply_catch_up_delta(
    state: &mut State,
    delta: Delta,
    squashed_tx: &broadcast::Sender<Squashed>,
    fatal_tx: &broadcast::Sender<Arc<SequencerError>>,
) {
    match state.builder.last_applied_delta_id() {
        None => {
            apply_one(state, delta, squashed_tx, fatal_tx);
        }
        Some(last) if delta.parent_delta_id == last => {
            if apply_one(state, delta, squashed_tx, fatal_tx) {
                replay(state, squashed_tx, fatal_tx);
            }
        }
        Some(_) => state.unapplied.push_back(delta),
    }
}

/// Feeds one delta from the live post-catch-up stream. Unlike
/// [`apply_catch_up_delta`], a null `last_applied_delta_id` here only
/// establishes a baseline when the delta is itself the chain root —
/// otherwise an out-of-order first arrival (e.g. Scenario A's D2 before D1)
/// would wrongly anchor the chain and strand every delta behind it. In
/// practice `last_applied_delta_id` is always set by the time catch-up
/// completes (either by applying the first catch-up delta or by seeding
/// from `latest_delta_id`), so this null case only matters for a
/// from-scratch live stream with no catch-up history at all.
fn queue_or_apply(
    state: &mut State,
    delta: Delta,
    squashed_tx: &broadcast::Sender<Squashed>,
    fatal_tx: &broadcast::Sender<Arc<SequencerError>>,
) {
    let last_applied = state.builder.last_applied_delta_id();
    match last_applied {
        None if rt_protocol::ids::is_root(delta.parent_delta_id) => {
            if apply_one(state, delta, squashed_tx, fatal_tx) {
                replay(state, squashed_tx, fatal_tx);
            }
        }
        None => state.unapplied.push_back(delta),
        Some(last) if delta.parent_delta_id == last => {
            if apply_one(state, delta, squashed_tx, fatal_tx) {
                replay(state, squashed_tx, fatal_tx);
            }
        }
        Some(_) => state.unapplied.push_back(delta),
    }
}

fn replay(state: &mut State, squashed_tx: &broadcast::Sender<Squashed>, fatal_tx: &broadcast::Sender<Arc<SequencerError>>) {
    loop {
        let position = match state.builder.last_applied_delta_id() {
            None => state
                .unapplied
                .iter()
                .position(|d| rt_protocol::ids::is_root(d.parent_delta_id)),
            Some(last) => state.unapplied.iter().position(|d| d.parent_delta_id == last),
        };
        let Some(position) = position else {
            return;
        };
        let delta = state.unapplied.remove(position).expect("position was just found");
        // A failed squash leaves the document untrustworthy; stop replaying
        // the rest of the queue rather than building further on top of it.
        if !apply_one(state, delta, squashed_tx, fatal_tx) {
            return;
        }
    }
}

/// Applies one delta to the builder. Returns `false` (and fires
/// `fatal_tx`) if the apply failed — a condition the caller must treat as
/// catastrophic, not merely skip.
fn apply_one(
    state: &mut State,
    delta: Delta,
    squashed_tx: &broadcast::Sender<Squashed>,
    fatal_tx: &broadcast::Sender<Arc<SequencerError>>,
) -> bool {
    let delta_id = delta.id;
    if let Err(err) = state.builder.apply_delta(&delta) {
        warn!(delta_id = %delta_id, error = %err, "squash failed, document can no longer be trusted");
        let _ = fatal_tx.send(Arc::new(SequencerError::SquashFailed { delta_id, source: err }));
        return false;
    }
    let _ = squashed_tx.send(Squashed { delta_id });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_protocol::ROOT_DELTA_ID;
    use serde_json::json;

    fn delta(id: Uuid, parent: Uuid) -> Delta {
        Delta {
            id,
            parent_delta_id: parent,
            file_id: Uuid::new_v4(),
            delta_type: "nb_cells".to_owned(),
            delta_action: "add".to_owned(),
            resource_id: None,
            properties: json!({ "id": id.to_string(), "after_id": null, "cell": { "id": id.to_string(), "cell_type": "code", "source": "", "metadata": {}, "outputs": [] } }),
        }
    }

    #[tokio::test]
    async fn out_of_order_deltas_replay_into_causal_order() {
        let sequencer = Sequencer::new(Notebook::empty());
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        let d3 = Uuid::new_v4();
        let d4 = Uuid::new_v4();
        let d5 = Uuid::new_v4();

        sequencer.catch_up(vec![], None).await;
        sequencer.on_delta(delta(d2, d1)).await;
        sequencer.on_delta(delta(d5, d4)).await;
        sequencer.on_delta(delta(d4, d3)).await;
        sequencer.on_delta(delta(d3, d2)).await;
        sequencer.on_delta(delta(d1, ROOT_DELTA_ID)).await;

        assert_eq!(sequencer.last_applied_delta_id().await, Some(d5));
    }

    #[tokio::test]
    async fn catch_up_seeds_last_applied_from_latest_delta_id_when_list_empty() {
        let sequencer = Sequencer::new(Notebook::empty());
        let latest = Uuid::new_v4();
        sequencer.catch_up(vec![], Some(latest)).await;
        assert_eq!(sequencer.last_applied_delta_id().await, Some(latest));
    }

    /// A realistic subscribe reply: the client was seeded from a notebook
    /// version, not a prior delta, so `deltas_to_apply`'s first element's
    /// `parent_delta_id` is the seed version's latest delta id — not the
    /// root sentinel. All of them must still land.
    #[tokio::test]
    async fn catch_up_applies_a_non_empty_chain_rooted_at_a_non_root_parent() {
        let sequencer = Sequencer::new(Notebook::empty());
        let seed_version_delta_id = Uuid::new_v4();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        let d3 = Uuid::new_v4();

        sequencer
            .catch_up(
                vec![
                    delta(d1, seed_version_delta_id),
                    delta(d2, d1),
                    delta(d3, d2),
                ],
                None,
            )
            .await;

        assert_eq!(sequencer.last_applied_delta_id().await, Some(d3));
    }

    #[tokio::test]
    async fn applying_a_delta_broadcasts_a_squash_event() {
        let sequencer = Sequencer::new(Notebook::empty());
        let mut squashed = sequencer.subscribe_squashed();
        sequencer.catch_up(vec![], None).await;
        let d1 = Uuid::new_v4();
        sequencer.on_delta(delta(d1, ROOT_DELTA_ID)).await;

        let event = squashed.try_recv().unwrap();
        assert_eq!(event.delta_id, d1);
    }

    #[tokio::test]
    async fn deltas_before_catch_up_complete_are_queued_not_applied() {
        let sequencer = Sequencer::new(Notebook::empty());
        let d1 = Uuid::new_v4();
        sequencer.on_delta(delta(d1, ROOT_DELTA_ID)).await;
        assert_eq!(sequencer.last_applied_delta_id().await, None);

        sequencer.catch_up(vec![], None).await;
        assert_eq!(sequencer.last_applied_delta_id().await, Some(d1));
    }

    #[tokio::test]
    async fn failed_squash_fires_fatal_and_stops_the_document_from_advancing() {
        let sequencer = Sequencer::new(Notebook::empty());
        let mut fatal = sequencer.subscribe_fatal();
        sequencer.catch_up(vec![], None).await;

        let bad_delete = Delta {
            id: Uuid::new_v4(),
            parent_delta_id: ROOT_DELTA_ID,
            file_id: Uuid::new_v4(),
            delta_type: "nb_cells".to_owned(),
            delta_action: "delete".to_owned(),
            resource_id: Some("missing-cell".to_owned()),
            properties: json!({ "id": "missing-cell" }),
        };
        sequencer.on_delta(bad_delete).await;

        fatal.try_recv().expect("fatal squash failure should have been broadcast");
        assert_eq!(sequencer.last_applied_delta_id().await, None);
    }
}
