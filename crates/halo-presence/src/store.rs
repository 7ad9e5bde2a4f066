//! Abstract seams to the externally-owned row store and its
//! notification channel.
//!
//! The engine never talks to a concrete backend: a session is only
//! constructible once a `RowStore` and a `PresenceFeed` exist, which
//! replaces the original system's poll-until-ready sequencing with a
//! plain constructor contract.

use async_trait::async_trait;
use tokio::sync::mpsc;

use halo_common::StoreError;

use crate::protocol::{PresenceRow, RowChange, RowPatch};

/// Keyed row API over the backing store, scoped to presence rows.
/// Row key is `(channel_id, user_id)`; the store owns write ordering
/// across racing writers.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Update an existing row. `StoreError::NotFound` if absent.
    async fn update(
        &self,
        channel_id: &str,
        user_id: &str,
        patch: RowPatch,
    ) -> Result<PresenceRow, StoreError>;

    /// Create a row. `StoreError::Conflict` if it already exists.
    async fn create(&self, row: PresenceRow) -> Result<PresenceRow, StoreError>;

    /// All rows in a channel.
    async fn list(&self, channel_id: &str) -> Result<Vec<PresenceRow>, StoreError>;

    /// Delete a row. Deleting an absent row is not an error.
    async fn delete(&self, channel_id: &str, user_id: &str) -> Result<(), StoreError>;
}

/// Live subscription to a channel's row changes. Delivery is
/// at-least-once; dropping the subscription (or calling `close`)
/// unsubscribes.
pub struct Subscription {
    events: mpsc::Receiver<RowChange>,
    // Dropped on close; the feed side observes the closure.
    _guard: Option<Box<dyn Send>>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<RowChange>, guard: Option<Box<dyn Send>>) -> Self {
        Self {
            events,
            _guard: guard,
        }
    }

    /// Next change event, or `None` once the feed has closed.
    pub async fn recv(&mut self) -> Option<RowChange> {
        self.events.recv().await
    }

    /// Unsubscribe explicitly.
    pub fn close(&mut self) {
        self.events.close();
        self._guard = None;
    }
}

/// Subscribe-channel API over the store's pub/sub mechanism.
#[async_trait]
pub trait PresenceFeed: Send + Sync {
    async fn subscribe(&self, channel_id: &str) -> Result<Subscription, StoreError>;
}
