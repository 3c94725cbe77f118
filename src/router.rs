//! Inbound frame dispatch: a registry of (predicate, handler) pairs scanned
//! for every frame, in the style of the teacher's boxed-future trait objects
//! (`rt-updater::workflow::Checker`) rather than `async_trait` — handlers
//! here are plain closures, not a trait, so the manual `Pin<Box<dyn Future>>`
//! shape is the natural fit.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rt_protocol::RtuFrame;
use uuid::Uuid;

use crate::error::RouterError;

/// What a handler reports after looking at a frame it matched.
///
/// `Skip` lets a handler decline to treat this particular match as
/// consumed — the registration stays in place for the next frame — without
/// resorting to exceptions for ordinary control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Matched,
    Skip,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Predicate = Box<dyn Fn(&RtuFrame) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(RtuFrame) -> BoxFuture<'static, Result<HandlerOutcome, RouterError>> + Send + Sync>;

/// A handle returned by [`Router::register`]; pass it to [`Router::deregister`]
/// to remove the registration. Used by the delta-request protocol, which
/// registers a transaction handler and a squash handler together and must
/// tear both down on the same resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

struct Registration {
    id: HandlerId,
    predicate: Predicate,
    handler: Handler,
}

/// The inbound message router (C2). Holds no transport state; it is driven
/// by the reader task, which awaits [`Router::dispatch`] to completion
/// before reading the next frame.
#[derive(Default)]
pub struct Router {
    registrations: std::sync::Mutex<Vec<Arc<Registration>>>,
    next_id: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self {
            registrations: std::sync::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a predicate + async handler pair. Returns a handle that can
    /// later be passed to [`Router::deregister`].
    pub fn register<P, H, Fut>(&self, predicate: P, handler: H) -> HandlerId
    where
        P: Fn(&RtuFrame) -> bool + Send + Sync + 'static,
        H: Fn(RtuFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutcome, RouterError>> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Box::new(move |frame| Box::pin(handler(frame)));
        self.registrations.lock().unwrap().push(Arc::new(Registration {
            id,
            predicate: Box::new(predicate),
            handler,
        }));
        id
    }

    pub fn deregister(&self, id: HandlerId) {
        self.registrations.lock().unwrap().retain(|r| r.id != id);
    }

    /// Scans all registered predicates against `frame` and awaits the
    /// matching handlers' callbacks in registration order. A handler whose
    /// future resolves to an error is logged and does not interrupt
    /// dispatch to the remaining handlers (§4.2: "handlers that raise are
    /// logged and do not break the loop").
    pub async fn dispatch(&self, frame: RtuFrame) {
        // Clone the matching Arcs and drop the lock before awaiting, since
        // handlers may themselves need to register/deregister (e.g. a
        // one-shot reply handler removing itself on resolution).
        let matching: Vec<Arc<Registration>> = {
            let guard = self.registrations.lock().unwrap();
            guard
                .iter()
                .filter(|r| (r.predicate)(&frame))
                .cloned()
                .collect()
        };

        for registration in matching {
            match (registration.handler)(frame.clone()).await {
                Ok(HandlerOutcome::Matched) => {}
                Ok(HandlerOutcome::Skip) => {
                    tracing::trace!(id = %registration.id, event = %frame.event, "handler skipped frame");
                }
                Err(err) => {
                    tracing::warn!(id = %registration.id, event = %frame.event, error = %err, "handler failed");
                }
            }
        }
    }

    /// Convenience predicate: matches replies correlated to `transaction_id`.
    pub fn by_transaction_id(transaction_id: Uuid) -> impl Fn(&RtuFrame) -> bool + Send + Sync + Clone {
        move |frame: &RtuFrame| frame.transaction_id == transaction_id
    }

    /// Convenience predicate: matches a concrete event name on any channel.
    pub fn by_event(event: &'static str) -> impl Fn(&RtuFrame) -> bool + Send + Sync + Clone {
        move |frame: &RtuFrame| frame.event == event
    }

    /// Convenience predicate: matches frames whose channel starts with `prefix`.
    pub fn by_channel_prefix(prefix: &'static str) -> impl Fn(&RtuFrame) -> bool + Send + Sync + Clone {
        move |frame: &RtuFrame| frame.channel_prefix() == prefix
    }
}

/// Shared handle to a [`Router`], cloned freely across the writer/reader/
/// client-facing call sites that all need to register or dispatch.
pub type SharedRouter = Arc<Router>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn frame(event: &str) -> RtuFrame {
        RtuFrame::request("system", event, json!({}))
    }

    #[tokio::test]
    async fn dispatches_to_matching_handlers_in_registration_order() {
        let router = Router::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order_a = order.clone();
        router.register(Router::by_event("ping_request"), move |_f| {
            let order_a = order_a.clone();
            async move {
                order_a.lock().unwrap().push("a");
                Ok(HandlerOutcome::Matched)
            }
        });
        let order_b = order.clone();
        router.register(Router::by_event("ping_request"), move |_f| {
            let order_b = order_b.clone();
            async move {
                order_b.lock().unwrap().push("b");
                Ok(HandlerOutcome::Matched)
            }
        });

        router.dispatch(frame("ping_request")).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn non_matching_predicate_is_not_invoked() {
        let router = Router::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        router.register(Router::by_event("pong_reply"), move |_f| {
            let calls2 = calls2.clone();
            async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Matched)
            }
        });

        router.dispatch(frame("ping_request")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_the_next_handler() {
        let router = Router::new();
        router.register(Router::by_event("ping_request"), |_f| async {
            Err(RouterError::HandlerFailed {
                event: "ping_request".to_owned(),
                source: "boom".into(),
            })
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        router.register(Router::by_event("ping_request"), move |_f| {
            let calls2 = calls2.clone();
            async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Matched)
            }
        });

        router.dispatch(frame("ping_request")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deregistered_handler_stops_receiving_dispatches() {
        let router = Router::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let id = router.register(Router::by_event("ping_request"), move |_f| {
            let calls2 = calls2.clone();
            async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Matched)
            }
        });

        router.dispatch(frame("ping_request")).await;
        router.deregister(id);
        router.dispatch(frame("ping_request")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_outcome_keeps_registration_alive() {
        let router = Router::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        router.register(Router::by_event("ping_request"), move |_f| {
            let calls2 = calls2.clone();
            async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Skip)
            }
        });

        router.dispatch(frame("ping_request")).await;
        router.dispatch(frame("ping_request")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn channel_prefix_predicate_matches_files_channel() {
        let pred = Router::by_channel_prefix("files");
        assert!(pred(&RtuFrame::request("files/abc-123", "new_delta_event", json!({}))));
        assert!(!pred(&RtuFrame::request("kernels/abc-123", "status", json!({}))));
    }
}
