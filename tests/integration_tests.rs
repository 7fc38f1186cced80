//! tiercache Integration Tests
//!
//! Exercises the public API end to end:
//! - Read/write/delete semantics across tier subsets
//! - TTL expiry and tag invalidation
//! - Auto-refresh
//! - Failing-tier isolation
//! - WebSocket invalidation delivery

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use tiercache::cache::MemoryStore;
use tiercache::{
    CacheCoordinator, CacheValue, Error, Result, SetOptions, TierKind, TierSet, TierStore,
};

/// Memory-backed store standing in for a remote tier
struct StandInStore {
    kind: TierKind,
    store: MemoryStore,
}

impl StandInStore {
    fn new(kind: TierKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            store: MemoryStore::new(),
        })
    }
}

#[async_trait]
impl TierStore for StandInStore {
    fn kind(&self) -> TierKind {
        self.kind
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.store.insert(key, value, ttl)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.store.lookup(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.store.purge();
        Ok(())
    }
}

/// A tier that is permanently down
struct DownStore(TierKind);

#[async_trait]
impl TierStore for DownStore {
    fn kind(&self) -> TierKind {
        self.0
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
        Err(Error::tier(self.0, "simulated outage"))
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        Err(Error::tier(self.0, "simulated outage"))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(Error::tier(self.0, "simulated outage"))
    }

    async fn clear(&self) -> Result<()> {
        Err(Error::tier(self.0, "simulated outage"))
    }

    async fn ping(&self) -> Result<()> {
        Err(Error::tier(self.0, "simulated outage"))
    }
}

/// Every non-empty subset of the three tiers, built from stand-ins
async fn coordinators_for_every_subset() -> Vec<CacheCoordinator> {
    let mut coordinators = Vec::new();
    for mask in 1u8..8 {
        let mut builder = CacheCoordinator::builder().tiers([]);
        for (bit, kind) in TierKind::ALL.into_iter().enumerate() {
            if mask & (1 << bit) != 0 {
                builder = builder.store(StandInStore::new(kind));
            }
        }
        coordinators.push(builder.build().await.unwrap());
    }
    coordinators
}

fn ttl(secs: u64) -> SetOptions {
    SetOptions::with_ttl(Duration::from_secs(secs))
}

// =============================================================================
// Core Semantics
// =============================================================================

mod coordinator_tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_for_every_tier_subset() {
        let coordinators = coordinators_for_every_subset().await;
        assert_eq!(coordinators.len(), 7);

        for cache in coordinators {
            let value = CacheValue::Json(json!({"nested": {"list": [1, 2, 3]}, "ok": true}));
            let report = cache.set("doc", value.clone(), ttl(60)).await.unwrap();
            assert!(report.is_complete());
            assert_eq!(report.succeeded().len(), cache.tiers().len());

            assert_eq!(cache.get("doc").await.unwrap(), Some(value), "tiers {}", cache.tiers());
        }
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        for cache in coordinators_for_every_subset().await {
            cache.set("k", "v", ttl(60)).await.unwrap();
            for _ in 0..3 {
                let report = cache.delete("k").await.unwrap();
                assert!(report.is_complete());
                assert_eq!(cache.get("k").await.unwrap(), None);
            }
        }
    }

    #[tokio::test]
    async fn test_clear_removes_every_key() {
        let remote = StandInStore::new(TierKind::Networked);
        let cache = CacheCoordinator::builder()
            .store(remote.clone())
            .build()
            .await
            .unwrap();

        for i in 0..10 {
            cache.set(&format!("k{i}"), i.to_string(), ttl(60)).await.unwrap();
        }
        tokio_test::assert_ok!(cache.clear().await.into_result());

        for i in 0..10 {
            assert_eq!(cache.get(&format!("k{i}")).await.unwrap(), None);
        }
        assert!(remote.store.is_empty());
    }

    #[tokio::test]
    async fn test_multi_key_round_trip() {
        let cache = CacheCoordinator::builder().build().await.unwrap();
        cache
            .set_many([("a", json!(1)), ("b", json!(2))], ttl(60))
            .await
            .unwrap();

        let found = cache.get_many(["a", "b", "c"]).await.unwrap();
        assert_eq!(
            found,
            vec![
                ("a".to_string(), Some(CacheValue::Json(json!(1)))),
                ("b".to_string(), Some(CacheValue::Json(json!(2)))),
                ("c".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_binary_values_survive_every_tier() {
        let blob: Vec<u8> = (0..=255).collect();
        for cache in coordinators_for_every_subset().await {
            cache.set_buffer("blob", &blob, ttl(60)).await.unwrap();
            assert_eq!(cache.get_buffer("blob").await.unwrap().as_deref(), Some(&blob[..]));
        }
    }

    #[tokio::test]
    async fn test_lower_tier_hit_served_without_promotion() {
        let durable = StandInStore::new(TierKind::Durable);
        let memory = Arc::new(MemoryStore::new());
        let cache = CacheCoordinator::builder()
            .memory_store(memory.clone())
            .store(durable.clone())
            .build()
            .await
            .unwrap();

        cache.set_text("k", "v", ttl(60)).await.unwrap();
        memory.remove("k");

        assert_eq!(cache.get_text("k").await.unwrap().as_deref(), Some("v"));
        assert!(!memory.contains("k"));

        let snap = cache.metrics();
        assert_eq!(snap.memory_misses, 1);
        assert_eq!(snap.durable_hits, 1);
    }
}

// =============================================================================
// Expiry and Tags
// =============================================================================

mod expiry_and_tag_tests {
    use super::*;

    #[tokio::test]
    async fn test_ttl_expiry() {
        let remote = StandInStore::new(TierKind::Networked);
        let cache = CacheCoordinator::builder()
            .store(remote)
            .build()
            .await
            .unwrap();

        cache
            .set_text("short", "v", SetOptions::with_ttl(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(cache.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.memory_stats().unwrap().expirations, 1);
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let cache = CacheCoordinator::builder()
            .store(StandInStore::new(TierKind::Networked))
            .build()
            .await
            .unwrap();

        cache.set_with_tag("k1", "v1", ["t"], ttl(60)).await.unwrap();
        cache.set_with_tag("k2", "v2", ["t", "other"], ttl(60)).await.unwrap();
        cache.set_with_tag("k3", "v3", ["other"], ttl(60)).await.unwrap();

        let report = cache.delete_by_tag("t").await.unwrap();
        assert!(report.is_complete());

        assert_eq!(cache.get("k1").await.unwrap(), None);
        assert_eq!(cache.get("k2").await.unwrap(), None);
        assert_eq!(cache.get_text("k3").await.unwrap().as_deref(), Some("v3"));

        // k2 was pruned from "other" as well
        assert_eq!(cache.keys_for_tag("other"), vec!["k3"]);
    }

    #[tokio::test]
    async fn test_concurrent_tagging_keeps_every_key() {
        let cache = CacheCoordinator::builder().build().await.unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .set_with_tag(&format!("k{i}"), "v", ["shared"], ttl(60))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.keys_for_tag("shared").len(), 50);
    }
}

// =============================================================================
// Auto-Refresh
// =============================================================================

mod refresh_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_refresh_replaces_value_before_expiry() {
        let cache = CacheCoordinator::builder().build().await.unwrap();
        cache
            .set_with_auto_refresh("k", "v0", Duration::from_secs(3), || async {
                Ok::<_, Error>("v1")
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2800)).await;
        assert_eq!(cache.get_text("k").await.unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_one_shot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CacheCoordinator::builder().build().await.unwrap();

        let counter = calls.clone();
        cache
            .set_with_auto_refresh("k", "v0", Duration::from_secs(3), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>("v1")
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.pending_refreshes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_cancels_pending_refresh() {
        let cache = CacheCoordinator::builder().build().await.unwrap();
        cache
            .set_with_auto_refresh("k", "v0", Duration::from_secs(3), || async {
                Ok::<_, Error>("from refresh")
            })
            .await
            .unwrap();
        cache.set_text("k", "manual", ttl(60)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.get_text("k").await.unwrap().as_deref(), Some("manual"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_producer_prevents_resurrection() {
        let cache = CacheCoordinator::builder().build().await.unwrap();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        cache
            .set_with_auto_refresh("k", "v0", Duration::from_secs(3), move || async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok::<_, Error>("late")
            })
            .await
            .unwrap();

        started_rx.await.unwrap();
        cache.delete("k").await.unwrap();
        release_tx.send(()).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.metrics().refreshes, 0);
    }

    /// Networked stand-in whose writes take half a second to land
    struct SlowWriteStore {
        store: MemoryStore,
        writes: AtomicUsize,
        refresh_write_started: tokio::sync::Notify,
    }

    #[async_trait]
    impl TierStore for SlowWriteStore {
        fn kind(&self) -> TierKind {
            TierKind::Networked
        }

        async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 1 {
                self.refresh_write_started.notify_one();
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.store.insert(key, value, ttl)
        }

        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            Ok(self.store.lookup(key))
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.store.remove(key);
            Ok(())
        }

        async fn clear(&self) -> Result<()> {
            self.store.purge();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_refresh_write_prevents_resurrection() {
        let slow = Arc::new(SlowWriteStore {
            store: MemoryStore::new(),
            writes: AtomicUsize::new(0),
            refresh_write_started: tokio::sync::Notify::new(),
        });
        let cache = CacheCoordinator::builder()
            .store(slow.clone())
            .build()
            .await
            .unwrap();

        cache
            .set_with_auto_refresh("k", "v1", Duration::from_secs(10), || async {
                Ok::<_, Error>("refreshed")
            })
            .await
            .unwrap();

        // the refresh has claimed its write and the networked half is pending
        slow.refresh_write_started.notified().await;
        let report = cache.delete("k").await.unwrap();
        assert!(report.is_complete());
        assert_eq!(cache.get("k").await.unwrap(), None);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(slow.store.lookup("k"), None);
        assert_eq!(cache.pending_refreshes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_every_refresh() {
        let cache = CacheCoordinator::builder().build().await.unwrap();
        for key in ["a", "b", "c"] {
            cache
                .set_with_auto_refresh(key, "v0", Duration::from_secs(3), || async {
                    Ok::<_, Error>("v1")
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.pending_refreshes(), 3);

        cache.clear().await;
        assert_eq!(cache.pending_refreshes(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        for key in ["a", "b", "c"] {
            assert_eq!(cache.get(key).await.unwrap(), None);
        }
        assert_eq!(cache.metrics().refreshes_cancelled, 3);
    }
}

// =============================================================================
// Failure Isolation
// =============================================================================

mod failure_tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_one_tier_down_others_serve() {
        let durable = StandInStore::new(TierKind::Durable);
        let cache = CacheCoordinator::builder()
            .store(Arc::new(DownStore(TierKind::Networked)))
            .store(durable.clone())
            .build()
            .await
            .unwrap();
        assert_eq!(cache.tiers(), TierSet::all());

        let report = cache.set_text("k", "v", ttl(60)).await.unwrap();
        assert_eq!(report.failed_tiers(), vec![TierKind::Networked]);
        assert_eq!(report.succeeded(), &[TierKind::Memory, TierKind::Durable]);
        assert_matches!(
            report.clone().into_result(),
            Err(Error::PartialFailure { ref failures }) if failures[0].tier == TierKind::Networked
        );

        assert_eq!(cache.get_text("k").await.unwrap().as_deref(), Some("v"));

        let report = cache.delete("k").await.unwrap();
        assert_eq!(report.failed_tiers(), vec![TierKind::Networked]);
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(durable.store.is_empty());
    }

    #[tokio::test]
    async fn test_read_falls_through_a_down_tier() {
        let durable = StandInStore::new(TierKind::Durable);
        let memory = Arc::new(MemoryStore::new());
        let cache = CacheCoordinator::builder()
            .memory_store(memory.clone())
            .store(Arc::new(DownStore(TierKind::Networked)))
            .store(durable)
            .build()
            .await
            .unwrap();

        cache.set_text("k", "v", ttl(60)).await.unwrap();
        memory.purge();

        assert_eq!(cache.get_text("k").await.unwrap().as_deref(), Some("v"));
        let snap = cache.metrics();
        assert_eq!(snap.networked_misses, 1);
        assert_eq!(snap.durable_hits, 1);
    }

    #[tokio::test]
    async fn test_ping_reports_down_tier() {
        let cache = CacheCoordinator::builder()
            .store(Arc::new(DownStore(TierKind::Durable)))
            .build()
            .await
            .unwrap();

        let report = cache.ping().await;
        assert_eq!(report.succeeded(), &[TierKind::Memory]);
        assert_eq!(report.failures()[0].reason, "simulated outage");
    }
}

// =============================================================================
// Invalidation Broadcast
// =============================================================================

mod broadcast_tests {
    use super::*;
    use futures::StreamExt;
    use tiercache::broadcast::serve_websocket;
    use tiercache::InvalidationHub;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_delete_reaches_websocket_subscriber() {
        let hub = Arc::new(InvalidationHub::new());
        let cache = CacheCoordinator::builder()
            .broadcaster(hub.clone())
            .build()
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_websocket(listener, hub.clone(), shutdown.clone()));

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        for _ in 0..100 {
            if hub.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.subscriber_count(), 1);

        cache.set_text("session:9", "v", ttl(60)).await.unwrap();
        cache.delete("session:9").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(text) = msg else {
            panic!("expected a text frame, got {msg:?}");
        };
        let event: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(event, json!({"action": "invalidate", "key": "session:9"}));
        assert_eq!(cache.metrics().invalidations, 1);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_in_process_subscriber() {
        let hub = Arc::new(InvalidationHub::new());
        let mut subscription = hub.subscribe();
        let cache = CacheCoordinator::builder()
            .broadcaster(hub.clone())
            .build()
            .await
            .unwrap();

        cache.set_with_tag("a", "1", ["g"], ttl(60)).await.unwrap();
        cache.set_with_tag("b", "2", ["g"], ttl(60)).await.unwrap();
        cache.delete_by_tag("g").await.unwrap();

        let first = subscription.recv().await.unwrap();
        let second = subscription.recv().await.unwrap();
        assert!(first.contains(r#""key":"a""#));
        assert!(second.contains(r#""key":"b""#));
    }
}

// =============================================================================
// Metrics
// =============================================================================

mod metrics_tests {
    use super::*;

    #[tokio::test]
    async fn test_prometheus_exposition() {
        let cache = CacheCoordinator::builder().build().await.unwrap();
        cache.set_text("k", "v", ttl(60)).await.unwrap();
        cache.get("k").await.unwrap();
        cache.get("missing").await.unwrap();

        let text = cache.metrics_text().unwrap();
        assert!(text.contains("tiercache_tier_hits_total{tier=\"memory\"} 1"));
        assert!(text.contains("tiercache_tier_misses_total{tier=\"memory\"} 1"));
        assert!(text.contains("tiercache_memory_entries 1"));
    }

    #[tokio::test]
    async fn test_memory_evictions_visible() {
        let memory = Arc::new(MemoryStore::with_capacity(std::num::NonZeroUsize::new(2).unwrap()));
        let cache = CacheCoordinator::builder()
            .memory_store(memory)
            .build()
            .await
            .unwrap();

        for key in ["a", "b", "c"] {
            cache.set_text(key, "v", ttl(60)).await.unwrap();
        }
        let snap = cache.metrics();
        assert_eq!(snap.memory_entries, 2);
        assert_eq!(snap.memory_evictions, 1);
        assert_eq!(cache.get("a").await.unwrap(), None);
    }
}
