//! In-memory `RowStore` + `PresenceFeed` backend.
//!
//! Keeps every presence row under a single lock and fans change events
//! out through a `tokio::sync::broadcast` channel per presence channel.
//! Intended for tests and single-process embedding; a real deployment
//! points the engine at its own store adapter instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::debug;

use halo_common::StoreError;

use crate::protocol::{ChangeKind, PresenceRow, RowChange, RowPatch};
use crate::store::{PresenceFeed, RowStore, Subscription};

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    /// Rows keyed by `(channel_id, user_id)`.
    rows: HashMap<(String, String), PresenceRow>,
    /// One fan-out sender per channel, created lazily.
    feeds: HashMap<String, broadcast::Sender<RowChange>>,
}

/// Shared in-memory backend. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    /// When set, every write returns `PermissionDenied`. Lets tests
    /// exercise the receive-only degraded mode.
    deny_writes: Arc<AtomicBool>,
    /// When set, `list` returns `PermissionDenied`.
    deny_reads: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle write rejection (simulates a store-side permission rule).
    pub fn set_deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    /// Toggle read rejection.
    pub fn set_deny_reads(&self, deny: bool) {
        self.deny_reads.store(deny, Ordering::SeqCst);
    }

    /// Number of rows currently stored in a channel.
    pub async fn row_count(&self, channel_id: &str) -> usize {
        self.inner
            .read()
            .await
            .rows
            .keys()
            .filter(|(ch, _)| ch == channel_id)
            .count()
    }

    async fn publish(&self, change: RowChange) {
        let inner = self.inner.read().await;
        if let Some(tx) = inner.feeds.get(&change.channel_id) {
            // Lagging or absent receivers are the subscriber's problem.
            let _ = tx.send(change);
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied);
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn update(
        &self,
        channel_id: &str,
        user_id: &str,
        patch: RowPatch,
    ) -> Result<PresenceRow, StoreError> {
        self.check_writable()?;
        let updated = {
            let mut inner = self.inner.write().await;
            let key = (channel_id.to_string(), user_id.to_string());
            let row = inner
                .rows
                .get_mut(&key)
                .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
            row.apply(&patch);
            row.clone()
        };

        self.publish(RowChange {
            kind: ChangeKind::Update,
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            row: Some(updated.clone()),
            patch: Some(patch),
        })
        .await;
        Ok(updated)
    }

    async fn create(&self, row: PresenceRow) -> Result<PresenceRow, StoreError> {
        self.check_writable()?;
        {
            let mut inner = self.inner.write().await;
            let key = (row.channel_id.clone(), row.user_id.clone());
            if inner.rows.contains_key(&key) {
                return Err(StoreError::Conflict(row.user_id.clone()));
            }
            inner.rows.insert(key, row.clone());
        }

        self.publish(RowChange {
            kind: ChangeKind::Create,
            channel_id: row.channel_id.clone(),
            user_id: row.user_id.clone(),
            row: Some(row.clone()),
            patch: None,
        })
        .await;
        Ok(row)
    }

    async fn list(&self, channel_id: &str) -> Result<Vec<PresenceRow>, StoreError> {
        if self.deny_reads.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied);
        }
        let inner = self.inner.read().await;
        Ok(inner
            .rows
            .iter()
            .filter(|((ch, _), _)| ch == channel_id)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete(&self, channel_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let existed = {
            let mut inner = self.inner.write().await;
            inner
                .rows
                .remove(&(channel_id.to_string(), user_id.to_string()))
                .is_some()
        };

        if existed {
            self.publish(RowChange {
                kind: ChangeKind::Delete,
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
                row: None,
                patch: None,
            })
            .await;
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceFeed for MemoryStore {
    async fn subscribe(&self, channel_id: &str) -> Result<Subscription, StoreError> {
        let mut rx = {
            let mut inner = self.inner.write().await;
            inner
                .feeds
                .entry(channel_id.to_string())
                .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
                .subscribe()
        };

        // Bridge broadcast -> mpsc so subscribers get the plain
        // `Subscription` shape. The task exits when either side closes.
        let (tx, events) = mpsc::channel(FEED_CAPACITY);
        let channel = channel_id.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(channel = %channel, skipped = n, "Feed subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(events, None))
    }
}
