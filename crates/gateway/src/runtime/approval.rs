//! Tool approval futures.
//!
//! When a tool requires approval, the agent loop registers a one-shot
//! future keyed by `approval_id` and suspends on it; the session handler
//! completes it when the client answers. The map lives on the handler and
//! is never visible across handlers.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

/// The client's answer to an approval request.
#[derive(Debug)]
pub enum ApprovalDecision {
    Approved {
        modified_args: Option<Map<String, Value>>,
    },
    Denied,
}

pub struct ApprovalStore {
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    timeout: Duration,
}

impl ApprovalStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a pending approval and return the future to await.
    pub fn register(&self, approval_id: &str) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(approval_id.to_string(), tx);
        rx
    }

    /// Complete a pending approval. Returns `false` for unknown ids
    /// (unmatched responses are ignored by the caller).
    pub fn resolve(
        &self,
        approval_id: &str,
        approved: bool,
        modified_args: Option<Map<String, Value>>,
    ) -> bool {
        if let Some(tx) = self.pending.lock().remove(approval_id) {
            let decision = if approved {
                ApprovalDecision::Approved { modified_args }
            } else {
                ApprovalDecision::Denied
            };
            let _ = tx.send(decision);
            return true;
        }
        false
    }

    /// Drop a pending approval without an answer (timeout path).
    pub fn remove(&self, approval_id: &str) {
        self.pending.lock().remove(approval_id);
    }

    /// Deny everything still pending. Called on cancellation so suspended
    /// agent loops unwind promptly.
    pub fn deny_all(&self) {
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(ApprovalDecision::Denied);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ApprovalStore {
        ApprovalStore::new(Duration::from_secs(300))
    }

    #[tokio::test]
    async fn approve_resolves_future() {
        let store = store();
        let rx = store.register("a1");
        assert!(store.resolve("a1", true, None));
        match rx.await.unwrap() {
            ApprovalDecision::Approved { modified_args } => assert!(modified_args.is_none()),
            _ => panic!("expected Approved"),
        }
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn deny_resolves_future() {
        let store = store();
        let rx = store.register("a1");
        assert!(store.resolve("a1", false, None));
        assert!(matches!(rx.await.unwrap(), ApprovalDecision::Denied));
    }

    #[tokio::test]
    async fn approve_with_modified_args() {
        let store = store();
        let rx = store.register("a1");
        let mut args = Map::new();
        args.insert("path".into(), Value::String("/tmp".into()));
        store.resolve("a1", true, Some(args));
        match rx.await.unwrap() {
            ApprovalDecision::Approved { modified_args } => {
                assert_eq!(modified_args.unwrap()["path"], "/tmp");
            }
            _ => panic!("expected Approved"),
        }
    }

    #[test]
    fn unmatched_response_is_ignored() {
        let store = store();
        assert!(!store.resolve("ghost", true, None));
    }

    #[tokio::test]
    async fn deny_all_releases_everything() {
        let store = store();
        let rx1 = store.register("a1");
        let rx2 = store.register("a2");
        store.deny_all();
        assert!(matches!(rx1.await.unwrap(), ApprovalDecision::Denied));
        assert!(matches!(rx2.await.unwrap(), ApprovalDecision::Denied));
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn removed_approval_drops_sender() {
        let store = store();
        let rx = store.register("a1");
        store.remove("a1");
        assert!(rx.await.is_err());
    }
}
