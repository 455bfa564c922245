//! Request/response correlation.
//!
//! The correlator owns the map of in-flight request ids. Each `register()`
//! hands back a fresh id plus a `PendingCall` that completes exactly once:
//! by a matching response, by `fail_all` when the connection dies, or by
//! `cancel` when the caller gives up. Once the connection has been failed
//! the correlator stays closed and refuses new registrations, so nothing
//! can wait on a dead pipe.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use super::errors::McpError;

type Slot = oneshot::Sender<Result<Value, McpError>>;

#[derive(Default)]
struct Inner {
    /// Last id handed out; ids start at 1.
    last_id: u64,
    pending: HashMap<u64, Slot>,
    /// Set by `fail_all`; the reason new registrations are refused.
    closed: Option<String>,
}

/// Tracks outstanding requests by id.
#[derive(Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
}

/// The caller's side of one outstanding request.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value, McpError>>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Suspend until the request is resolved or rejected.
    pub async fn wait(self) -> Result<Value, McpError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Only reachable if the correlator itself was dropped.
            Err(_) => Err(McpError::connection_lost("correlator dropped")),
        }
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and a waiter for it.
    ///
    /// Fails with `ConnectionLost` once `fail_all` has run.
    pub fn register(&self) -> Result<PendingCall, McpError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(McpError::connection_lost(reason.clone()));
        }
        inner.last_id += 1;
        let id = inner.last_id;
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        Ok(PendingCall { id, rx })
    }

    /// Complete a waiter with a successful result. Unknown ids are ignored.
    pub fn resolve(&self, id: u64, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Complete a waiter with an error. Unknown ids are ignored.
    pub fn reject(&self, id: u64, error: McpError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: u64, outcome: Result<Value, McpError>) -> bool {
        let Some(slot) = self.lock().pending.remove(&id) else {
            return false;
        };
        // The receiver may already be gone (caller timed out); still counts
        // as this id's single completion.
        let _ = slot.send(outcome);
        true
    }

    /// Drop a waiter without completing it, e.g. after a local timeout.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Reject every outstanding waiter with `ConnectionLost` and close the
    /// correlator. Returns how many waiters were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<Slot> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_string());
            }
            inner.pending.drain().map(|(_, slot)| slot).collect()
        };
        let count = drained.len();
        for slot in drained {
            let _ = slot.send(Err(McpError::connection_lost(reason)));
        }
        count
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// The `fail_all` reason, if the correlator has been closed.
    pub fn closed_reason(&self) -> Option<String> {
        self.lock().closed.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use serde_json::json;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let c = Correlator::new();
        let a = c.register().unwrap();
        let b = c.register().unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(c.pending_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_yields_unique_ids() {
        let c = Arc::new(Correlator::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                (0..100)
                    .map(|_| c.register().unwrap().id())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.await.unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 1600);
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_matching_waiter() {
        let c = Correlator::new();
        let first = c.register().unwrap();
        let second = c.register().unwrap();

        // Out of order on purpose.
        assert!(c.resolve(second.id(), json!("two")));
        assert!(c.resolve(first.id(), json!("one")));

        assert_eq!(first.wait().await.unwrap(), json!("one"));
        assert_eq!(second.wait().await.unwrap(), json!("two"));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_completion_is_a_no_op() {
        let c = Correlator::new();
        let call = c.register().unwrap();
        let id = call.id();

        assert!(c.resolve(id, json!(1)));
        assert!(!c.resolve(id, json!(2)));
        assert!(!c.reject(id, McpError::connection_lost("late")));

        assert_eq!(call.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_reject_delivers_error() {
        let c = Correlator::new();
        let call = c.register().unwrap();
        c.reject(
            call.id(),
            McpError::ProtocolError {
                code: -32602,
                message: "bad params".into(),
                data: None,
            },
        );
        let err = call.wait().await.unwrap_err();
        assert!(matches!(err, McpError::ProtocolError { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_unknown_id_does_not_disturb_others() {
        let c = Correlator::new();
        let call = c.register().unwrap();

        assert!(!c.resolve(999, json!("stray")));
        assert!(!c.reject(0, McpError::connection_lost("stray")));
        assert_eq!(c.pending_count(), 1);

        c.resolve(call.id(), json!("mine"));
        assert_eq!(call.wait().await.unwrap(), json!("mine"));
    }

    #[tokio::test]
    async fn test_fail_all_completes_every_waiter() {
        let c = Correlator::new();
        let calls: Vec<_> = (0..5).map(|_| c.register().unwrap()).collect();

        assert_eq!(c.fail_all("stream closed"), 5);
        assert_eq!(c.pending_count(), 0);

        for call in calls {
            match call.wait().await.unwrap_err() {
                McpError::ConnectionLost { reason } => assert_eq!(reason, "stream closed"),
                other => panic!("expected ConnectionLost, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_register_after_fail_all_is_refused() {
        let c = Correlator::new();
        c.fail_all("stream closed");
        c.fail_all("second reason is ignored");

        let err = c.register().unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(c.closed_reason().as_deref(), Some("stream closed"));
    }

    #[test]
    fn test_resolve_after_fail_all_is_ignored() {
        let c = Correlator::new();
        let call = c.register().unwrap();
        c.fail_all("gone");
        assert!(!c.resolve(call.id(), json!("too late")));
    }

    #[tokio::test]
    async fn test_cancel_removes_entry() {
        let c = Correlator::new();
        let call = c.register().unwrap();
        let id = call.id();
        drop(call);

        assert!(c.cancel(id));
        assert!(!c.cancel(id));
        // A late response for a cancelled id is just a stray.
        assert!(!c.resolve(id, json!("late")));
    }

    #[test]
    fn test_resolve_with_dropped_receiver_still_consumes_id() {
        let c = Correlator::new();
        let id = c.register().unwrap().id();
        assert!(c.resolve(id, json!(null)));
        assert_eq!(c.pending_count(), 0);
    }
}
