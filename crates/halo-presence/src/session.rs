//! Session controller: lifecycle and composition of the presence
//! engine for one channel.
//!
//! A session owns its cursor table, its writer state, and its
//! reconciler task. Multiple channels are simply multiple sessions;
//! there is no process-wide registry of any kind. A session is only
//! constructible once its collaborators (row store, feed) exist, so
//! there is no readiness polling anywhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use halo_common::Result;

use crate::config::PresenceConfig;
use crate::detect::{CursorPos, LocalState};
use crate::events::SessionEvent;
use crate::interpolate::predict_entry;
use crate::protocol::{now_ms, EditingState, FocusTarget, SelectionRange, UserInfo};
use crate::reader::load_snapshot;
use crate::reconcile::Reconciler;
use crate::store::{PresenceFeed, RowStore};
use crate::table::{CursorEntry, CursorTable};
use crate::writer::{BroadcastOutcome, PresenceWriter};

// ---------------------------------------------------------------------------
// Local state updates
// ---------------------------------------------------------------------------

/// A partial update to the local participant's shared state. `None`
/// leaves a field untouched; the sub-documents use a two-level option
/// so "clear" and "leave alone" stay distinguishable.
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub cursor: Option<CursorPos>,
    pub focus: Option<Option<FocusTarget>>,
    pub selection: Option<Option<SelectionRange>>,
    pub editing: Option<Option<EditingState>>,
}

impl StateDelta {
    pub fn cursor(x: f64, y: f64) -> Self {
        Self {
            cursor: Some(CursorPos { x, y }),
            ..Default::default()
        }
    }

    pub fn focus(target: Option<FocusTarget>) -> Self {
        Self {
            focus: Some(target),
            ..Default::default()
        }
    }

    pub fn selection(range: Option<SelectionRange>) -> Self {
        Self {
            selection: Some(range),
            ..Default::default()
        }
    }

    pub fn editing(state: Option<EditingState>) -> Self {
        Self {
            editing: Some(state),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionInner {
    store: Arc<dyn RowStore>,
    channel_id: String,
    user: UserInfo,
    config: PresenceConfig,
    stopped: Arc<AtomicBool>,
    cursors: Arc<RwLock<CursorTable>>,
    /// Element the local user is currently editing; shared with the
    /// reconciler for the display-suppression rule.
    local_editing: Arc<RwLock<Option<String>>>,
    /// Writer state and the merged local state live under one lock so
    /// gate decisions always see a consistent sample.
    writer: Mutex<WriterCell>,
    events: mpsc::Sender<SessionEvent>,
    degraded_notified: AtomicBool,
    reconciler_task: Mutex<Option<JoinHandle<()>>>,
}

struct WriterCell {
    writer: PresenceWriter,
    local_state: LocalState,
}

/// Handle to a running presence session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

/// Entry point for the presence engine.
pub struct PresenceSession;

impl PresenceSession {
    /// Start presence for one channel: load the initial snapshot,
    /// subscribe to the feed, and hand back a handle plus the event
    /// stream the host renders from.
    ///
    /// A denied snapshot degrades to an empty table (receive-only
    /// deployments still get live updates); a failed subscription
    /// degrades to snapshot-only and surfaces `SubscriptionClosed` so
    /// the host can restart at its discretion. Neither is fatal.
    pub async fn start(
        store: Arc<dyn RowStore>,
        feed: Arc<dyn PresenceFeed>,
        channel_id: impl Into<String>,
        user: UserInfo,
        config: PresenceConfig,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>)> {
        let channel_id = channel_id.into();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);

        let snapshot = load_snapshot(store.as_ref(), &channel_id, &user.user_id).await?;
        let mut table = CursorTable::new();
        for entry in &snapshot {
            table.insert(entry.row.user_id.clone(), entry.clone());
        }
        let cursors = Arc::new(RwLock::new(table));
        let local_editing: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let stopped = Arc::new(AtomicBool::new(false));

        let _ = event_tx
            .send(SessionEvent::CursorsChanged(snapshot))
            .await;

        let reconciler_task = match feed.subscribe(&channel_id).await {
            Ok(subscription) => {
                let reconciler = Reconciler::new(
                    channel_id.clone(),
                    user.user_id.clone(),
                    Arc::clone(&cursors),
                    Arc::clone(&local_editing),
                    event_tx.clone(),
                );
                Some(tokio::spawn(reconciler.run(subscription)))
            }
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "Presence feed unavailable");
                let _ = event_tx
                    .send(SessionEvent::Degraded(format!("subscription failed: {e}")))
                    .await;
                let _ = event_tx.send(SessionEvent::SubscriptionClosed).await;
                None
            }
        };

        let writer = PresenceWriter::new(
            Arc::clone(&store),
            channel_id.clone(),
            user.clone(),
            config.clone(),
            Arc::clone(&stopped),
            now_ms(),
        );

        info!(channel = %channel_id, user = %user.user_id, "Presence session started");

        let inner = Arc::new(SessionInner {
            store,
            channel_id,
            user,
            config,
            stopped,
            cursors,
            local_editing,
            writer: Mutex::new(WriterCell {
                writer,
                local_state: LocalState::default(),
            }),
            events: event_tx,
            degraded_notified: AtomicBool::new(false),
            reconciler_task: Mutex::new(reconciler_task),
        });

        Ok((SessionHandle { inner }, event_rx))
    }
}

impl SessionHandle {
    /// Merge a local input sample and attempt a broadcast. Cursor
    /// motion goes through the full gate chain; focus, selection, and
    /// editing transitions bypass the change gate (`force`), since
    /// they signal discrete intent.
    pub async fn update_local_state(&self, delta: StateDelta) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Keep the reconciler's view of "what the local user is
        // editing" current before any remote echo can arrive.
        if let Some(editing) = &delta.editing {
            *self.inner.local_editing.write().await =
                editing.as_ref().map(|e| e.element_id.clone());
        }

        let now = now_ms();
        let mut cell = self.inner.writer.lock().await;

        let mut force = !cell.writer.has_published();
        if let Some(cursor) = delta.cursor {
            cell.local_state.cursor = Some(cursor);
        }
        if let Some(focus) = delta.focus {
            if cell.local_state.focus != focus {
                force = true;
            }
            cell.local_state.focus = focus;
        }
        if let Some(selection) = delta.selection {
            if cell.local_state.selection != selection {
                force = true;
            }
            cell.local_state.selection = selection;
        }
        if let Some(editing) = delta.editing {
            if cell.local_state.editing != editing {
                force = true;
            }
            cell.local_state.editing = editing;
        }

        cell.writer.mark_activity(now);
        let state = cell.local_state.clone();
        let outcome = cell.writer.broadcast(&state, force, now).await?;
        drop(cell);

        if outcome == BroadcastOutcome::Denied
            && !self.inner.degraded_notified.swap(true, Ordering::SeqCst)
        {
            let _ = self
                .inner
                .events
                .send(SessionEvent::Degraded("presence writes denied".into()))
                .await;
        }
        Ok(())
    }

    /// Current stored view of the remote cursor table.
    pub async fn cursors(&self) -> Vec<CursorEntry> {
        self.inner.cursors.read().await.values().cloned().collect()
    }

    /// Dead-reckoned view of the cursor table for rendering between
    /// network updates. Derived values only; the table is untouched.
    pub async fn predicted_cursors(&self) -> Vec<CursorEntry> {
        let now = now_ms();
        self.inner
            .cursors
            .read()
            .await
            .values()
            .map(|entry| predict_entry(entry, now))
            .collect()
    }

    /// The channel this session is bound to.
    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    /// Whether the session has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop the session: no further writes (including any in-flight
    /// upsert retry), subscription closed, and the local row deleted
    /// when the deployment semantics call for an explicit leave.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.inner.reconciler_task.lock().await.take() {
            task.abort();
        }

        if self.inner.config.leave_on_stop {
            if let Err(e) = self
                .inner
                .store
                .delete(&self.inner.channel_id, &self.inner.user.user_id)
                .await
            {
                warn!(
                    channel = %self.inner.channel_id,
                    error = %e,
                    "Failed to delete presence row on stop"
                );
            }
        }

        info!(channel = %self.inner.channel_id, "Presence session stopped");
    }
}
