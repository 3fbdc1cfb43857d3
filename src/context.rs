//! Session-scoped context: TTL-bounded JSON documents keyed by
//! (`session_id`, `namespace`).
//!
//! Upserts replace the whole document; merging is the caller's problem.
//! An expired document is unreadable the instant its TTL elapses, and a
//! background sweeper reclaims memory at a bounded rate so abandoned
//! sessions cannot grow the map forever.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// How often the sweeper scans, and the most entries it removes per
/// scan.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SWEEP_BATCH: usize = 128;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct ContextKey {
    session_id: String,
    namespace: String,
}

#[derive(Debug, Clone)]
struct ContextDocument {
    payload: Value,
    expires_at: Instant,
}

/// In-memory TTL'd key/value store for conversational context.
#[derive(Default)]
pub struct ContextStore {
    documents: Mutex<HashMap<ContextKey, ContextDocument>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the document and reset its TTL. Returns true when the key
    /// was not previously live (created, not replaced).
    pub fn upsert(&self, session_id: &str, namespace: &str, payload: Value, ttl: Duration) -> bool {
        let key = ContextKey {
            session_id: session_id.to_string(),
            namespace: namespace.to_string(),
        };
        let now = Instant::now();
        let mut documents = self.documents.lock().expect("context lock");
        let was_live = documents
            .get(&key)
            .is_some_and(|doc| doc.expires_at > now);
        documents.insert(
            key,
            ContextDocument {
                payload,
                expires_at: now + ttl,
            },
        );
        !was_live
    }

    /// Read the document, treating anything at or past its expiry as
    /// absent.
    pub fn get(&self, session_id: &str, namespace: &str) -> Option<Value> {
        let key = ContextKey {
            session_id: session_id.to_string(),
            namespace: namespace.to_string(),
        };
        let documents = self.documents.lock().expect("context lock");
        documents
            .get(&key)
            .filter(|doc| doc.expires_at > Instant::now())
            .map(|doc| doc.payload.clone())
    }

    pub fn delete(&self, session_id: &str, namespace: &str) -> bool {
        let key = ContextKey {
            session_id: session_id.to_string(),
            namespace: namespace.to_string(),
        };
        let mut documents = self.documents.lock().expect("context lock");
        documents.remove(&key).is_some()
    }

    /// Remove up to `SWEEP_BATCH` expired documents.
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut documents = self.documents.lock().expect("context lock");
        let expired: Vec<ContextKey> = documents
            .iter()
            .filter(|(_, doc)| doc.expires_at <= now)
            .take(SWEEP_BATCH)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            documents.remove(key);
        }
        expired.len()
    }

    /// Background sweeper task. Runs until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired context documents");
                        }
                    }
                    _ = shutdown_rx.wait_for(|stop| *stop) => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn document_expires_exactly_at_ttl() {
        let store = ContextStore::new();
        let created = store.upsert(
            "s1",
            "ns1",
            serde_json::json!({"a": 1}),
            Duration::from_secs(1),
        );
        assert!(created);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(store.get("s1", "ns1"), Some(serde_json::json!({"a": 1})));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.get("s1", "ns1"), None, "expired documents are unreadable");
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_replaces_document_and_resets_ttl() {
        let store = ContextStore::new();
        assert!(store.upsert("s1", "ns1", serde_json::json!({"a": 1}), Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(1)).await;
        let created = store.upsert("s1", "ns1", serde_json::json!({"b": 2}), Duration::from_secs(2));
        assert!(!created, "a live key is replaced, not created");

        // The old deadline has passed; the reset TTL keeps the new
        // document alive, and the payload is fully replaced.
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(store.get("s1", "ns1"), Some(serde_json::json!({"b": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_counts_as_created_on_upsert() {
        let store = ContextStore::new();
        assert!(store.upsert("s1", "ns1", serde_json::json!(1), Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(
            store.upsert("s1", "ns1", serde_json::json!(2), Duration::from_secs(1)),
            "an expired key behaves like an absent one"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reclaims_expired_documents() {
        let store = Arc::new(ContextStore::new());
        for index in 0..10 {
            store.upsert(
                "s1",
                &format!("ns{index}"),
                serde_json::json!(index),
                Duration::from_millis(100),
            );
        }
        store.upsert("s1", "keeper", serde_json::json!("stays"), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        let removed = store.sweep();
        assert_eq!(removed, 10);

        let documents = store.documents.lock().expect("context lock");
        assert_eq!(documents.len(), 1, "live documents survive the sweep");
    }

    #[test]
    fn delete_removes_live_documents() {
        let store = ContextStore::new();
        store.upsert("s1", "ns1", serde_json::json!(1), Duration::from_secs(60));
        assert!(store.delete("s1", "ns1"));
        assert!(!store.delete("s1", "ns1"));
        assert_eq!(store.get("s1", "ns1"), None);
    }
}
