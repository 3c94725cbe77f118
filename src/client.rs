//! RTU Client (C5): lifecycle orchestration and the public API. Composes
//! the Transport, Router, and Sequencer into the startup state machine and
//! the delta-submission protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rt_protocol::frame::events;
use rt_protocol::notebook::{Cell, CodeCell};
use rt_protocol::{Channel, Delta, Notebook, RtuFrame, ROOT_DELTA_ID};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RtuConfig;
use crate::error::{DeltaRejection, RouterError, RtuError};
use crate::router::{HandlerOutcome, Router, SharedRouter};
use crate::seed::SeedSource;
use crate::sequencer::Sequencer;
use crate::state::{CellExecutionState, ExecutionOutcome, ExecutionTracker, KERNEL_STATE_IDLE};
use crate::transport::{Transport, TransportEvent};

/// The startup/resync state machine (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
    AuthSent,
    Authenticated,
    Subscribed,
    CaughtUp,
    Steady,
    Resync,
}

struct Shared {
    config: RtuConfig,
    file_id: String,
    current_version_id: StdMutex<Option<Uuid>>,
    seed_source: Arc<dyn SeedSource>,
    transport: StdMutex<Option<Transport>>,
    router: SharedRouter,
    sequencer: StdMutex<Option<Sequencer>>,
    tracker: AsyncMutex<ExecutionTracker>,
    state: StdMutex<ClientState>,
}

/// Handle to a live RTU session for one notebook file. Cloning shares the
/// same background tasks and document state.
#[derive(Clone)]
pub struct RtuClient {
    shared: Arc<Shared>,
}

impl RtuClient {
    pub fn new(config: RtuConfig, file_id: impl Into<String>, seed_source: Arc<dyn SeedSource>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                file_id: file_id.into(),
                current_version_id: StdMutex::new(None),
                seed_source,
                transport: StdMutex::new(None),
                router: Arc::new(Router::new()),
                sequencer: StdMutex::new(None),
                tracker: AsyncMutex::new(ExecutionTracker::new()),
                state: StdMutex::new(ClientState::Disconnected),
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.lock().unwrap()
    }

    fn set_state(&self, state: ClientState) {
        *self.shared.state.lock().unwrap() = state;
    }

    fn files_channel(&self) -> String {
        Channel::files(&self.shared.file_id)
    }

    fn kernel_channel(&self) -> String {
        Channel::kernel_for_file(&self.shared.file_id)
    }

    /// Used by every public operation reachable before `initialize()`
    /// completes (and by the internal helpers those operations funnel
    /// through): reports `NotInitialized` instead of panicking.
    fn transport(&self) -> Result<Transport, RtuError> {
        self.shared.transport.lock().unwrap().clone().ok_or(RtuError::NotInitialized)
    }

    fn sequencer(&self) -> Result<Sequencer, RtuError> {
        self.shared.sequencer.lock().unwrap().clone().ok_or(RtuError::NotInitialized)
    }

    /// Used only inside handlers registered by `register_core_handlers`,
    /// which by construction never run before both fields are populated —
    /// registration happens inside `initialize()`, strictly after the
    /// sequencer is stored, and no frame can arrive before the transport is
    /// spawned. Not a user-reachable precondition, so no `Result` here.
    fn sequencer_unchecked(&self) -> Sequencer {
        self.shared.sequencer.lock().unwrap().clone().expect("sequencer populated before handlers are registered")
    }

    /// Fetches the seed notebook, starts the transport, authenticates,
    /// subscribes, and waits for catch-up to complete.
    pub async fn initialize(&self) -> Result<(), RtuError> {
        let metadata = self
            .shared
            .seed_source
            .fetch_metadata(&self.shared.file_id)
            .await
            .map_err(|e| RtuError::Seed(Box::new(e)))?;
        let version_id = metadata
            .current_version_id
            .as_deref()
            .map(|s| Uuid::parse_str(s).map_err(|e| RtuError::Config(format!("malformed current_version_id: {e}"))))
            .transpose()?
            .ok_or_else(|| RtuError::Config("seed metadata missing current_version_id".to_owned()))?;
        *self.shared.current_version_id.lock().unwrap() = Some(version_id);

        let notebook = self.fetch_notebook(&metadata.presigned_download_url).await?;
        let sequencer = Sequencer::new(notebook);
        let mut fatal_squash = sequencer.subscribe_fatal();
        *self.shared.sequencer.lock().unwrap() = Some(sequencer);

        let fatal_client = self.clone();
        tokio::spawn(async move {
            if let Ok(err) = fatal_squash.recv().await {
                tracing::error!(error = %err, "document desynchronized after a failed squash, shutting down");
                fatal_client.shutdown(true).await;
            }
        });

        self.register_core_handlers();

        let transport = Transport::spawn(
            self.shared.config.rtu_url(),
            self.shared.config.authorization_token.clone(),
            self.shared.router.clone(),
            self.shared.config.reconnect_backoff_base_ms,
            self.shared.config.reconnect_backoff_cap_ms,
        );
        let mut events = transport.subscribe_events();
        *self.shared.transport.lock().unwrap() = Some(transport);

        match events.recv().await {
            Ok(TransportEvent::Connected) => self.set_state(ClientState::Connected),
            Ok(TransportEvent::PermanentFailure(reason)) => return Err(RtuError::Transport(crate::error::TransportError::Permanent(reason))),
            _ => return Err(RtuError::Transport(crate::error::TransportError::Disconnected)),
        }

        self.authenticate().await?;
        self.subscribe().await?;
        Ok(())
    }

    async fn fetch_notebook(&self, presigned_url: &str) -> Result<Notebook, RtuError> {
        let bytes = self
            .shared
            .seed_source
            .download_notebook(presigned_url)
            .await
            .map_err(|e| RtuError::Seed(Box::new(e)))?;
        serde_json::from_slice(&bytes).map_err(RtuError::Decode)
    }

    async fn authenticate(&self) -> Result<(), RtuError> {
        self.set_state(ClientState::AuthSent);
        let transaction_id = Uuid::new_v4();
        let frame = RtuFrame {
            transaction_id,
            channel: "system".to_owned(),
            event: events::AUTHENTICATE_REQUEST.to_owned(),
            data: serde_json::to_value(rt_protocol::messages::AuthenticateRequest {
                token: self.shared.config.authorization_token.clone(),
                rtu_client_type: self.shared.config.creator_client_type.as_wire_str().to_owned(),
            })
            .expect("AuthenticateRequest always serializes"),
            msg_id: None,
            processed_timestamp: None,
        };

        let reply: rt_protocol::messages::AuthenticateReply = self
            .await_transaction_reply(
                transaction_id,
                frame,
                true,
                self.shared.config.authenticate_timeout,
                events::AUTHENTICATE_REPLY,
            )
            .await?;

        if !reply.success {
            self.set_state(ClientState::Disconnected);
            return Err(RtuError::AuthenticationFailed("server rejected credentials".to_owned()));
        }
        self.set_state(ClientState::Authenticated);
        self.transport()?.open_gate();

        if let Some(user) = &reply.user {
            info!(user_id = %user.id, "rtu authenticated");
        }
        self.whoami().await?;
        Ok(())
    }

    /// Sends `whoami_request` and logs the resolved identity; called once
    /// per session immediately after authentication succeeds.
    pub async fn whoami(&self) -> Result<rt_protocol::messages::UserInfo, RtuError> {
        let transaction_id = Uuid::new_v4();
        let frame = RtuFrame::request("system", events::WHOAMI_REQUEST, serde_json::json!({}));
        let reply: rt_protocol::messages::WhoamiReply = self
            .await_transaction_reply(transaction_id, frame, false, self.shared.config.authenticate_timeout, events::WHOAMI_REPLY)
            .await?;
        info!(user_id = %reply.user.id, "whoami confirmed");
        Ok(reply.user)
    }

    /// Liveness probe, independent of file subscription.
    pub async fn ping(&self) -> Result<(), RtuError> {
        let transaction_id = Uuid::new_v4();
        let frame = RtuFrame::request("system", events::PING_REQUEST, serde_json::json!({}));
        let _: serde_json::Value = self
            .await_transaction_reply(transaction_id, frame, false, Duration::from_secs(10), events::PONG_REPLY)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<(), RtuError> {
        let last_applied = self.sequencer()?.last_applied_delta_id().await;
        let request = match last_applied {
            Some(id) if !rt_protocol::ids::is_root(id) => rt_protocol::messages::SubscribeRequest {
                from_delta_id: Some(id),
                from_version_id: None,
            },
            _ => rt_protocol::messages::SubscribeRequest {
                from_delta_id: None,
                from_version_id: *self.shared.current_version_id.lock().unwrap(),
            },
        };

        let transaction_id = Uuid::new_v4();
        let frame = RtuFrame {
            transaction_id,
            channel: self.files_channel(),
            event: events::SUBSCRIBE_REQUEST.to_owned(),
            data: serde_json::to_value(request).expect("SubscribeRequest always serializes"),
            msg_id: None,
            processed_timestamp: None,
        };

        let reply: rt_protocol::messages::SubscribeReply = self
            .await_transaction_reply(
                transaction_id,
                frame,
                false,
                self.shared.config.file_subscribe_timeout,
                events::SUBSCRIBE_REPLY,
            )
            .await?;
        self.set_state(ClientState::Subscribed);

        if let Some(session) = &reply.kernel_session {
            self.shared.tracker.lock().await.set_kernel_state(session.kernel_state.clone());
        }

        self.sequencer()?.catch_up(reply.deltas_to_apply, reply.latest_delta_id).await;
        self.set_state(ClientState::CaughtUp);
        self.set_state(ClientState::Steady);
        Ok(())
    }

    /// Registers the handlers the client needs for the lifetime of the
    /// session: delta events, output streaming events, kernel/cell state
    /// updates, and `inconsistent_state_event` (triggers resync).
    fn register_core_handlers(&self) {
        let router = self.shared.router.clone();

        let sequencer_for_delta = self.clone();
        router.register(
            Router::by_event(events::NEW_DELTA_EVENT),
            move |frame: RtuFrame| {
                let this = sequencer_for_delta.clone();
                async move {
                    let payload: rt_protocol::messages::NewDeltaEvent = frame
                        .parse_data()
                        .map_err(|e| RouterError::HandlerFailed { event: frame.event.clone(), source: Box::new(e) })?;
                    this.sequencer_unchecked().on_delta(payload.delta).await;
                    Ok(HandlerOutcome::Matched)
                }
            },
        );

        let this = self.clone();
        router.register(Router::by_event(events::UPDATE_OUTPUT_COLLECTION_EVENT), move |frame: RtuFrame| {
            let this = this.clone();
            async move {
                let payload: rt_protocol::messages::UpdateOutputCollectionEvent = frame
                    .parse_data()
                    .map_err(|e| RouterError::HandlerFailed { event: frame.event.clone(), source: Box::new(e) })?;
                this.sequencer_unchecked().update_output_collection(&payload.cell_id, payload.outputs).await;
                Ok(HandlerOutcome::Matched)
            }
        });

        let this = self.clone();
        router.register(Router::by_event(events::APPEND_OUTPUT_EVENT), move |frame: RtuFrame| {
            let this = this.clone();
            async move {
                let payload: rt_protocol::messages::AppendOutputEvent = frame
                    .parse_data()
                    .map_err(|e| RouterError::HandlerFailed { event: frame.event.clone(), source: Box::new(e) })?;
                this.sequencer_unchecked().append_output(&payload.cell_id, payload.output).await;
                Ok(HandlerOutcome::Matched)
            }
        });

        let this = self.clone();
        router.register(Router::by_event(events::KERNEL_STATUS_UPDATE_EVENT), move |frame: RtuFrame| {
            let this = this.clone();
            async move {
                let payload: rt_protocol::messages::KernelStatusUpdateEvent = frame
                    .parse_data()
                    .map_err(|e| RouterError::HandlerFailed { event: frame.event.clone(), source: Box::new(e) })?;
                this.shared.tracker.lock().await.set_kernel_state(payload.kernel_state);
                Ok(HandlerOutcome::Matched)
            }
        });

        let this = self.clone();
        router.register(Router::by_event(events::BULK_CELL_STATE_UPDATE_EVENT), move |frame: RtuFrame| {
            let this = this.clone();
            async move {
                let payload: rt_protocol::messages::BulkCellStateUpdateEvent = frame
                    .parse_data()
                    .map_err(|e| RouterError::HandlerFailed { event: frame.event.clone(), source: Box::new(e) })?;
                for (cell_id, state_tag) in payload.cell_states {
                    let Ok(state) = serde_json::from_value::<CellExecutionState>(serde_json::Value::String(state_tag.clone())) else {
                        warn!(cell_id = %cell_id, state = %state_tag, "unrecognised cell execution state");
                        continue;
                    };
                    let still_exists = this.sequencer_unchecked().cell(&cell_id).await.is_some();
                    this.shared.tracker.lock().await.apply_cell_state(&cell_id, state, still_exists);
                }
                Ok(HandlerOutcome::Matched)
            }
        });

        let this = self.clone();
        router.register(Router::by_event(events::INCONSISTENT_STATE_EVENT), move |_frame: RtuFrame| {
            let this = this.clone();
            async move {
                tokio::spawn(async move {
                    if let Err(err) = this.resync().await {
                        warn!(error = %err, "resync after inconsistent_state_event failed");
                    }
                });
                Ok(HandlerOutcome::Matched)
            }
        });
    }

    /// `STEADY` → `RESYNC` → `SUBSCRIBED` → `STEADY`: unsubscribe, refetch
    /// the seed notebook, rebuild the sequencer/builder, re-subscribe.
    async fn resync(&self) -> Result<(), RtuError> {
        self.set_state(ClientState::Resync);
        let _ = self.unsubscribe().await;

        let metadata = self
            .shared
            .seed_source
            .fetch_metadata(&self.shared.file_id)
            .await
            .map_err(|e| RtuError::Seed(Box::new(e)))?;
        if let Some(version) = metadata.current_version_id.as_deref() {
            if let Ok(id) = Uuid::parse_str(version) {
                *self.shared.current_version_id.lock().unwrap() = Some(id);
            }
        }
        let notebook = self.fetch_notebook(&metadata.presigned_download_url).await?;
        self.sequencer()?.rebuild(notebook).await;

        self.subscribe().await
    }

    async fn unsubscribe(&self) -> Result<(), RtuError> {
        let transaction_id = Uuid::new_v4();
        let frame = RtuFrame::request(self.files_channel(), events::UNSUBSCRIBE_REQUEST, serde_json::json!({}));
        let _: serde_json::Value = self
            .await_transaction_reply(transaction_id, frame, false, Duration::from_secs(10), events::UNSUBSCRIBE_REPLY)
            .await?;
        Ok(())
    }

    /// Registers a one-shot handler matching `transaction_id`, sends
    /// `frame` (bypassing the gate when `priority` is set, as
    /// `authenticate_request` must), and awaits exactly one reply carrying
    /// `expected_event`, deregistering the handler on any resolution.
    async fn await_transaction_reply<T>(
        &self,
        transaction_id: Uuid,
        frame: RtuFrame,
        priority: bool,
        timeout: Duration,
        expected_event: &'static str,
    ) -> Result<T, RtuError>
    where
        T: for<'de> serde::Deserialize<'de> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<serde_json::Value, RtuError>>();
        let tx = Arc::new(StdMutex::new(Some(tx)));
        let tx_for_handler = tx.clone();

        let handler_id = self.shared.router.register(Router::by_transaction_id(transaction_id), move |frame: RtuFrame| {
            let tx = tx_for_handler.clone();
            async move {
                let result = if frame.event == expected_event {
                    Some(Ok(frame.data.clone()))
                } else if events::ERROR_EVENTS.contains(&frame.event.as_str()) {
                    Some(Err(classify_error_event(&frame)))
                } else {
                    None
                };
                match result {
                    Some(result) => {
                        if let Some(tx) = tx.lock().unwrap().take() {
                            let _ = tx.send(result);
                        }
                        Ok(HandlerOutcome::Matched)
                    }
                    None => Ok(HandlerOutcome::Skip),
                }
            }
        });

        let transport = self.transport()?;
        let send_result = if priority {
            transport.send_priority(frame)
        } else {
            transport.send(frame)
        };
        if let Err(err) = send_result {
            self.shared.router.deregister(handler_id);
            return Err(RtuError::Transport(err));
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.shared.router.deregister(handler_id);

        match outcome {
            Ok(Ok(Ok(data))) => serde_json::from_value(data).map_err(RtuError::Decode),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(RtuError::Cancelled),
            Err(_) => Err(RtuError::Timeout("reply")),
        }
    }

    /// The delta-submission protocol (§4.5): a transaction handler catches
    /// rejection, and a squash-event listener catches successful
    /// application; whichever resolves first wins and both are torn down.
    async fn submit_delta(&self, mut delta: Delta) -> Result<(), RtuError> {
        delta.id = Uuid::new_v4();
        delta.file_id = Uuid::parse_str(&self.shared.file_id).unwrap_or(delta.file_id);
        let delta_id = delta.id;

        let (tx, rx) = oneshot::channel::<Result<(), RtuError>>();
        let tx = Arc::new(StdMutex::new(Some(tx)));

        let tx_for_txn = tx.clone();
        let transaction_id = Uuid::new_v4();
        let txn_handler = self.shared.router.register(Router::by_transaction_id(transaction_id), move |frame: RtuFrame| {
            let tx = tx_for_txn.clone();
            async move {
                if !events::ERROR_EVENTS.contains(&frame.event.as_str()) {
                    return Ok(HandlerOutcome::Skip);
                }
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(Err(classify_error_event(&frame)));
                }
                Ok(HandlerOutcome::Matched)
            }
        });

        let tx_for_squash = tx.clone();
        let mut squashed_rx = self.sequencer()?.subscribe_squashed();
        let squash_task = tokio::spawn(async move {
            while let Ok(squashed) = squashed_rx.recv().await {
                if squashed.delta_id == delta_id {
                    if let Some(tx) = tx_for_squash.lock().unwrap().take() {
                        let _ = tx.send(Ok(()));
                    }
                    return;
                }
            }
        });

        let request_frame = RtuFrame {
            transaction_id,
            channel: self.files_channel(),
            event: events::NEW_DELTA_REQUEST.to_owned(),
            data: serde_json::to_value(rt_protocol::messages::NewDeltaRequest { delta }).expect("NewDeltaRequest always serializes"),
            msg_id: None,
            processed_timestamp: None,
        };

        if let Err(err) = self.transport()?.send(request_frame) {
            self.shared.router.deregister(txn_handler);
            squash_task.abort();
            return Err(RtuError::Transport(err));
        }

        let result = rx.await.unwrap_or(Err(RtuError::Cancelled));
        self.shared.router.deregister(txn_handler);
        squash_task.abort();
        result
    }

    // ---------------------------------------------------------------
    // Public document-mutating operations
    // ---------------------------------------------------------------

    /// `before`/`after` are mutually exclusive; `before` is resolved against
    /// the current document order into the equivalent `after_id` before the
    /// delta is built, since `nb_cells/add`'s wire payload only ever carries
    /// `after_id`.
    pub async fn add_cell(
        &self,
        source: Option<String>,
        cell: Option<Cell>,
        before_id: Option<String>,
        after_id: Option<String>,
    ) -> Result<Cell, RtuError> {
        if before_id.is_some() && after_id.is_some() {
            return Err(RtuError::InvalidArgument("cannot define both a before and after".to_owned()));
        }
        let after_id = match before_id {
            Some(before) => self.sequencer()?.cell_before(&before).await,
            None => after_id,
        };
        let new_id = Uuid::new_v4().to_string();
        let mut cell = cell.unwrap_or_else(|| {
            Cell::Code(CodeCell {
                id: new_id.clone(),
                source: source.clone().unwrap_or_default(),
                metadata: Default::default(),
                execution_count: None,
                outputs: Vec::new(),
            })
        });
        cell.set_id(new_id.clone());
        if let Some(source) = source {
            cell.set_source(source);
        }

        let delta = Delta {
            id: Uuid::nil(),
            parent_delta_id: ROOT_DELTA_ID,
            file_id: Uuid::nil(),
            delta_type: "nb_cells".to_owned(),
            delta_action: "add".to_owned(),
            resource_id: Some(new_id.clone()),
            properties: serde_json::json!({ "id": new_id, "after_id": after_id, "cell": cell }),
        };
        self.submit_delta(delta).await?;
        self.sequencer()?
            .cell(&new_id)
            .await
            .ok_or_else(|| RtuError::CellNotFound { cell_id: new_id })
    }

    pub async fn delete_cell(&self, cell_id: impl Into<String>) -> Result<(), RtuError> {
        let cell_id = cell_id.into();
        let delta = Delta {
            id: Uuid::nil(),
            parent_delta_id: ROOT_DELTA_ID,
            file_id: Uuid::nil(),
            delta_type: "nb_cells".to_owned(),
            delta_action: "delete".to_owned(),
            resource_id: Some(cell_id.clone()),
            properties: serde_json::json!({ "id": cell_id }),
        };
        self.submit_delta(delta).await
    }

    /// Emits a `cell_metadata/replace` delta changing the cell's type tag
    /// and, if given, its language (written into `metadata.noteable.cell_type`,
    /// per §4.3's edge-case policy). When `db` or `assign_to` is given — the
    /// SQL-cell case — emits a second `cell_metadata/replace` delta carrying
    /// `metadata.noteable.db_connection`/`assign_results_to`, grounded on
    /// `make_sql_cell`'s metadata shape.
    pub async fn change_cell_type(
        &self,
        cell_id: impl Into<String>,
        new_type: &str,
        language: Option<String>,
        db: Option<String>,
        assign_to: Option<String>,
    ) -> Result<Cell, RtuError> {
        let cell_id = cell_id.into();
        let delta = Delta {
            id: Uuid::nil(),
            parent_delta_id: ROOT_DELTA_ID,
            file_id: Uuid::nil(),
            delta_type: "cell_metadata".to_owned(),
            delta_action: "replace".to_owned(),
            resource_id: Some(cell_id.clone()),
            properties: serde_json::json!({ "cell_type": new_type, "language": language }),
        };
        self.submit_delta(delta).await?;

        if db.is_some() || assign_to.is_some() {
            let sql_delta = Delta {
                id: Uuid::nil(),
                parent_delta_id: ROOT_DELTA_ID,
                file_id: Uuid::nil(),
                delta_type: "cell_metadata".to_owned(),
                delta_action: "replace".to_owned(),
                resource_id: Some(cell_id.clone()),
                properties: serde_json::json!({ "db_connection": db, "assign_to": assign_to }),
            };
            self.submit_delta(sql_delta).await?;
        }

        self.sequencer()?
            .cell(&cell_id)
            .await
            .ok_or(RtuError::CellNotFound { cell_id })
    }

    pub async fn update_cell_content(&self, cell_id: impl Into<String>, patch: impl Into<String>) -> Result<Cell, RtuError> {
        let cell_id = cell_id.into();
        let delta = Delta {
            id: Uuid::nil(),
            parent_delta_id: ROOT_DELTA_ID,
            file_id: Uuid::nil(),
            delta_type: "cell_contents".to_owned(),
            delta_action: "update".to_owned(),
            resource_id: Some(cell_id.clone()),
            properties: serde_json::json!({ "patch": patch.into() }),
        };
        self.submit_delta(delta).await?;
        self.sequencer()?.cell(&cell_id).await.ok_or(RtuError::CellNotFound { cell_id })
    }

    pub async fn replace_cell_content(&self, cell_id: impl Into<String>, source: impl Into<String>) -> Result<Cell, RtuError> {
        let cell_id = cell_id.into();
        let delta = Delta {
            id: Uuid::nil(),
            parent_delta_id: ROOT_DELTA_ID,
            file_id: Uuid::nil(),
            delta_type: "cell_contents".to_owned(),
            delta_action: "replace".to_owned(),
            resource_id: Some(cell_id.clone()),
            properties: serde_json::json!({ "source": source.into() }),
        };
        self.submit_delta(delta).await?;
        self.sequencer()?.cell(&cell_id).await.ok_or(RtuError::CellNotFound { cell_id })
    }

    /// Submits a `cell_execute` delta for exactly one of `cell_id`
    /// (`execute`), `before_id`/`after_id` (`execute_before`/`execute_after`),
    /// or `run_all`. Returns a oneshot receiver per eligible code cell, each
    /// resolving when that cell reaches a terminal execution state.
    pub async fn queue_execution(&self, selector: ExecutionSelector) -> Result<HashMap<String, oneshot::Receiver<ExecutionOutcome>>, RtuError> {
        let (kind, resource_id) = match &selector {
            ExecutionSelector::Cell(id) => ("execute", Some(id.clone())),
            ExecutionSelector::Before(id) => ("execute_before", Some(id.clone())),
            ExecutionSelector::After(id) => ("execute_after", Some(id.clone())),
            ExecutionSelector::RunAll => ("execute_all", None),
        };

        let delta = Delta {
            id: Uuid::nil(),
            parent_delta_id: ROOT_DELTA_ID,
            file_id: Uuid::nil(),
            delta_type: "cell_execute".to_owned(),
            delta_action: kind.to_owned(),
            resource_id: resource_id.clone(),
            properties: serde_json::json!({}),
        };
        self.submit_delta(delta).await?;

        let notebook_json = self.sequencer()?.notebook_json().await.map_err(RtuError::Decode)?;
        let notebook: Notebook = serde_json::from_str(&notebook_json).map_err(RtuError::Decode)?;
        let eligible: Vec<String> = match &selector {
            ExecutionSelector::RunAll => notebook
                .cells
                .iter()
                .filter(|c| matches!(c, Cell::Code(_)))
                .map(|c| c.id().to_owned())
                .collect(),
            ExecutionSelector::Cell(id) | ExecutionSelector::Before(id) | ExecutionSelector::After(id) => {
                vec![id.clone()]
            }
        };

        let mut tracker = self.shared.tracker.lock().await;
        let mut futures = HashMap::new();
        for cell_id in eligible {
            futures.insert(cell_id.clone(), tracker.register_waiter(cell_id));
        }
        Ok(futures)
    }

    /// Polls `kernel_state` until it reports `idle`.
    pub async fn wait_for_kernel_idle(&self) {
        loop {
            {
                let tracker = self.shared.tracker.lock().await;
                if tracker.kernel_state() == Some(KERNEL_STATE_IDLE) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Tears the session down: cancels every pending execution future and
    /// closes the transport. `now == true` aborts the background tasks
    /// immediately; `now == false` gives the writer a brief grace period to
    /// flush anything already enqueued before aborting.
    pub async fn shutdown(&self, now: bool) {
        self.set_state(ClientState::Disconnected);
        self.shared.tracker.lock().await.cancel_all();
        if let Some(transport) = self.shared.transport.lock().unwrap().clone() {
            transport.shutdown(now).await;
        }
    }
}

/// Selects which cells a `queue_execution` call targets. Exactly one
/// variant is chosen per call, mirroring the mutually-exclusive
/// `cell_id?`/`before_id?`/`after_id?`/`run_all` parameters.
#[derive(Debug, Clone)]
pub enum ExecutionSelector {
    Cell(String),
    Before(String),
    After(String),
    RunAll,
}

fn classify_error_event(frame: &RtuFrame) -> RtuError {
    match frame.event.as_str() {
        events::DELTA_REJECTED => {
            let cause = frame
                .parse_data::<rt_protocol::messages::DeltaRejected>()
                .map(|d| d.cause)
                .unwrap_or_else(|_| "unknown".to_owned());
            RtuError::DeltaRejected(DeltaRejection::Rejected(cause))
        }
        events::INVALID_DATA => {
            let message = frame
                .parse_data::<rt_protocol::messages::InvalidData>()
                .map(|d| d.message)
                .unwrap_or_else(|_| "unknown".to_owned());
            RtuError::DeltaRejected(DeltaRejection::InvalidData(message))
        }
        events::PERMISSION_DENIED => {
            let message = frame
                .parse_data::<rt_protocol::messages::PermissionDenied>()
                .map(|d| d.message)
                .unwrap_or_else(|_| "unknown".to_owned());
            RtuError::DeltaRejected(DeltaRejection::PermissionDenied(message))
        }
        events::INCONSISTENT_STATE_EVENT => RtuError::Config("inconsistent state event during request".to_owned()),
        other => RtuError::Config(format!("unexpected error event: {other}")),
    }
}
