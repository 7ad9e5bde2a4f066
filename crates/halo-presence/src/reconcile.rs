//! Folding the store's change events into the in-memory cursor table.
//!
//! A single malformed event must never tear down the subscription:
//! everything here is drop-and-warn, the task only exits when the feed
//! itself closes.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::events::SessionEvent;
use crate::protocol::{decode_field, now_ms, ChangeKind, RowChange};
use crate::store::Subscription;
use crate::table::{CursorEntry, CursorTable};

/// Folds one channel's row changes into the session's cursor table and
/// emits display events.
pub struct Reconciler {
    channel_id: String,
    self_id: String,
    cursors: Arc<RwLock<CursorTable>>,
    /// Element the local user is editing right now, if any. Remote
    /// echoes for that element update the table but are suppressed
    /// from display so in-progress typing is not clobbered.
    local_editing: Arc<RwLock<Option<String>>>,
    events: mpsc::Sender<SessionEvent>,
}

impl Reconciler {
    pub fn new(
        channel_id: impl Into<String>,
        self_id: impl Into<String>,
        cursors: Arc<RwLock<CursorTable>>,
        local_editing: Arc<RwLock<Option<String>>>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            self_id: self_id.into(),
            cursors,
            local_editing,
            events,
        }
    }

    /// Consume the subscription until the feed closes.
    pub async fn run(self, mut subscription: Subscription) {
        while let Some(change) = subscription.recv().await {
            self.apply(change).await;
        }
        debug!(channel = %self.channel_id, "Presence feed closed");
        let _ = self.events.send(SessionEvent::SubscriptionClosed).await;
    }

    /// Fold a single change event into the table.
    pub async fn apply(&self, change: RowChange) {
        // Cross-channel noise and echoes of our own writes.
        if change.channel_id != self.channel_id || change.user_id == self.self_id {
            return;
        }

        match change.kind {
            ChangeKind::Create => self.apply_join(change).await,
            ChangeKind::Update => self.apply_update(change).await,
            ChangeKind::Delete => self.apply_leave(change).await,
        }
    }

    async fn apply_join(&self, change: RowChange) {
        let Some(row) = change.row else {
            warn!(user = %change.user_id, "Create event without a row; dropping");
            return;
        };
        let entry = CursorEntry::from_row(row, now_ms());
        self.cursors
            .write()
            .await
            .insert(change.user_id.clone(), entry.clone());

        let _ = self.events.send(SessionEvent::Joined(entry)).await;
        self.emit_cursors().await;
    }

    async fn apply_update(&self, change: RowChange) {
        // At-least-once delivery can reorder an update past its
        // create; a full row lets us treat the update as a join.
        if !self.cursors.read().await.contains_key(&change.user_id) {
            if change.row.is_some() {
                let change = RowChange {
                    kind: ChangeKind::Create,
                    ..change
                };
                self.apply_join(change).await;
            } else {
                warn!(user = %change.user_id, "Update for unknown participant; dropping");
            }
            return;
        }

        let Some(patch) = change.patch.as_ref() else {
            warn!(user = %change.user_id, "Update event without a patch; dropping");
            return;
        };

        let mut suppress = false;
        {
            let mut cursors = self.cursors.write().await;
            let Some(entry) = cursors.get_mut(&change.user_id) else {
                return;
            };

            entry.row.apply(patch);
            entry.last_update_ms = now_ms();

            // Re-decode only the sub-documents the patch touched.
            if let Some(focus) = &patch.focus {
                entry.focus =
                    decode_field("focus", focus.clone().map(Value::String).as_ref());
            }
            if let Some(selection) = &patch.selection {
                entry.selection =
                    decode_field("selection", selection.clone().map(Value::String).as_ref());
            }
            if let Some(editing) = &patch.editing {
                entry.editing =
                    decode_field("editing", editing.clone().map(Value::String).as_ref());
            }

            // Local-edit protection: the stored entry above is current,
            // but while the local user owns this element the display
            // path must not replay the remote echo over their typing.
            // Only updates that carried `editing` count; a sparse patch
            // (cursor motion from a store emitting minimal diffs) still
            // displays.
            if patch.editing.is_some() {
                if let Some(remote_editing) = &entry.editing {
                    let local = self.local_editing.read().await;
                    if local.as_deref() == Some(remote_editing.element_id.as_str()) {
                        suppress = true;
                    }
                }
            }
        }

        if !suppress {
            self.emit_cursors().await;
        }
    }

    async fn apply_leave(&self, change: RowChange) {
        let removed = self.cursors.write().await.remove(&change.user_id);
        let Some(entry) = removed else {
            // Duplicate delivery of the delete; already gone.
            return;
        };

        let _ = self
            .events
            .send(SessionEvent::Left {
                user_id: change.user_id,
                name: entry.row.name,
            })
            .await;
        self.emit_cursors().await;
    }

    async fn emit_cursors(&self) {
        let snapshot: Vec<CursorEntry> = self.cursors.read().await.values().cloned().collect();
        let _ = self
            .events
            .send(SessionEvent::CursorsChanged(snapshot))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PresenceRow, RowPatch};

    fn row(user: &str) -> PresenceRow {
        PresenceRow {
            user_id: user.into(),
            channel_id: "doc-1".into(),
            x: 10.0,
            y: 10.0,
            vx: None,
            vy: None,
            name: user.to_uppercase(),
            color: "hsl(0, 70%, 50%)".into(),
            last_seen: 1_000,
            focus: None,
            selection: None,
            editing: None,
        }
    }

    fn create_event(user: &str) -> RowChange {
        RowChange {
            kind: ChangeKind::Create,
            channel_id: "doc-1".into(),
            user_id: user.into(),
            row: Some(row(user)),
            patch: None,
        }
    }

    fn update_event(user: &str, patch: RowPatch) -> RowChange {
        RowChange {
            kind: ChangeKind::Update,
            channel_id: "doc-1".into(),
            user_id: user.into(),
            row: None,
            patch: Some(patch),
        }
    }

    fn delete_event(user: &str) -> RowChange {
        RowChange {
            kind: ChangeKind::Delete,
            channel_id: "doc-1".into(),
            user_id: user.into(),
            row: None,
            patch: None,
        }
    }

    struct Rig {
        reconciler: Reconciler,
        cursors: Arc<RwLock<CursorTable>>,
        local_editing: Arc<RwLock<Option<String>>>,
        rx: mpsc::Receiver<SessionEvent>,
    }

    fn rig() -> Rig {
        let cursors: Arc<RwLock<CursorTable>> = Arc::new(RwLock::new(CursorTable::new()));
        let local_editing: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let (tx, rx) = mpsc::channel(64);
        let reconciler = Reconciler::new(
            "doc-1",
            "me",
            Arc::clone(&cursors),
            Arc::clone(&local_editing),
            tx,
        );
        Rig {
            reconciler,
            cursors,
            local_editing,
            rx,
        }
    }

    #[tokio::test]
    async fn create_inserts_and_emits_join() {
        let mut r = rig();
        r.reconciler.apply(create_event("u-2")).await;

        assert!(r.cursors.read().await.contains_key("u-2"));
        let e = r.rx.recv().await.unwrap();
        assert!(matches!(e, SessionEvent::Joined(ref entry) if entry.row.user_id == "u-2"));
        let e = r.rx.recv().await.unwrap();
        assert!(matches!(e, SessionEvent::CursorsChanged(ref v) if v.len() == 1));
    }

    #[tokio::test]
    async fn cross_channel_events_ignored() {
        let mut r = rig();
        let mut event = create_event("u-2");
        event.channel_id = "doc-OTHER".into();
        r.reconciler.apply(event).await;

        assert!(r.cursors.read().await.is_empty());
        assert!(r.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn own_echo_ignored() {
        let mut r = rig();
        r.reconciler.apply(create_event("me")).await;

        assert!(r.cursors.read().await.is_empty());
        assert!(r.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_merges_partially() {
        let mut r = rig();
        r.reconciler.apply(create_event("u-2")).await;
        let _ = r.rx.recv().await;
        let _ = r.rx.recv().await;

        let patch = RowPatch {
            x: Some(99.0),
            focus: Some(Some(r#"{"element_id":"title"}"#.into())),
            ..Default::default()
        };
        r.reconciler.apply(update_event("u-2", patch)).await;

        let cursors = r.cursors.read().await;
        let entry = cursors.get("u-2").unwrap();
        // Patched fields changed, absent fields kept.
        assert_eq!(entry.row.x, 99.0);
        assert_eq!(entry.row.y, 10.0);
        assert_eq!(entry.focus.as_ref().unwrap().element_id, "title");
        drop(cursors);

        let e = r.rx.recv().await.unwrap();
        assert!(matches!(e, SessionEvent::CursorsChanged(_)));
    }

    #[tokio::test]
    async fn update_for_unknown_user_with_row_joins() {
        let mut r = rig();
        let event = RowChange {
            kind: ChangeKind::Update,
            channel_id: "doc-1".into(),
            user_id: "u-3".into(),
            row: Some(row("u-3")),
            patch: None,
        };
        r.reconciler.apply(event).await;

        assert!(r.cursors.read().await.contains_key("u-3"));
        let e = r.rx.recv().await.unwrap();
        assert!(matches!(e, SessionEvent::Joined(_)));
    }

    #[tokio::test]
    async fn update_for_unknown_user_without_row_dropped() {
        let mut r = rig();
        r.reconciler
            .apply(update_event("ghost", RowPatch::default()))
            .await;

        assert!(r.cursors.read().await.is_empty());
        assert!(r.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_edit_protection_suppresses_display_only() {
        let mut r = rig();
        r.reconciler.apply(create_event("u-2")).await;
        let _ = r.rx.recv().await;
        let _ = r.rx.recv().await;

        // Local user is mid-edit on "notes".
        *r.local_editing.write().await = Some("notes".into());

        let patch = RowPatch {
            editing: Some(Some(
                r#"{"element_id":"notes","value":"their text","caret_position":3}"#.into(),
            )),
            ..Default::default()
        };
        r.reconciler.apply(update_event("u-2", patch)).await;

        // Stored entry updated...
        let cursors = r.cursors.read().await;
        let entry = cursors.get("u-2").unwrap();
        assert_eq!(entry.editing.as_ref().unwrap().value, "their text");
        drop(cursors);
        // ...but no display event surfaced.
        assert!(r.rx.try_recv().is_err());

        // A different element is not suppressed.
        let patch = RowPatch {
            editing: Some(Some(
                r#"{"element_id":"title","value":"x","caret_position":1}"#.into(),
            )),
            ..Default::default()
        };
        r.reconciler.apply(update_event("u-2", patch)).await;
        let e = r.rx.recv().await.unwrap();
        assert!(matches!(e, SessionEvent::CursorsChanged(_)));
    }

    #[tokio::test]
    async fn cursor_only_patch_displays_despite_stored_editing_match() {
        let mut r = rig();
        r.reconciler.apply(create_event("u-2")).await;
        let _ = r.rx.recv().await;
        let _ = r.rx.recv().await;

        *r.local_editing.write().await = Some("notes".into());
        let patch = RowPatch {
            editing: Some(Some(
                r#"{"element_id":"notes","value":"t","caret_position":1}"#.into(),
            )),
            ..Default::default()
        };
        r.reconciler.apply(update_event("u-2", patch)).await;
        assert!(r.rx.try_recv().is_err());

        // A later patch carrying only cursor motion is display-worthy
        // even though the stored entry still has the matching edit.
        let patch = RowPatch {
            x: Some(42.0),
            ..Default::default()
        };
        r.reconciler.apply(update_event("u-2", patch)).await;
        let e = r.rx.recv().await.unwrap();
        assert!(matches!(e, SessionEvent::CursorsChanged(_)));
    }

    #[tokio::test]
    async fn malformed_editing_payload_is_dropped_not_fatal() {
        let mut r = rig();
        r.reconciler.apply(create_event("u-2")).await;
        let _ = r.rx.recv().await;
        let _ = r.rx.recv().await;

        let patch = RowPatch {
            x: Some(55.0),
            editing: Some(Some("{definitely not json".into())),
            ..Default::default()
        };
        r.reconciler.apply(update_event("u-2", patch)).await;

        let cursors = r.cursors.read().await;
        let entry = cursors.get("u-2").unwrap();
        assert_eq!(entry.row.x, 55.0);
        assert!(entry.editing.is_none());
    }

    #[tokio::test]
    async fn delete_evicts_and_emits_left_once() {
        let mut r = rig();
        r.reconciler.apply(create_event("u-2")).await;
        let _ = r.rx.recv().await;
        let _ = r.rx.recv().await;

        r.reconciler.apply(delete_event("u-2")).await;
        assert!(r.cursors.read().await.is_empty());

        let e = r.rx.recv().await.unwrap();
        assert!(matches!(e, SessionEvent::Left { ref user_id, .. } if user_id == "u-2"));
        let e = r.rx.recv().await.unwrap();
        assert!(matches!(e, SessionEvent::CursorsChanged(ref v) if v.is_empty()));

        // Duplicate delivery: no second Left.
        r.reconciler.apply(delete_event("u-2")).await;
        assert!(r.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_emits_subscription_closed_when_feed_ends() {
        let r = rig();
        let (feed_tx, feed_rx) = mpsc::channel(8);
        let subscription = Subscription::new(feed_rx, None);

        let mut rx = r.rx;
        let handle = tokio::spawn(r.reconciler.run(subscription));

        feed_tx.send(create_event("u-2")).await.unwrap();
        drop(feed_tx);
        handle.await.unwrap();

        let mut saw_closed = false;
        while let Ok(e) = rx.try_recv() {
            if matches!(e, SessionEvent::SubscriptionClosed) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }
}
