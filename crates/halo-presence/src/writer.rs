//! Broadcasting the local participant's state to the row store.
//!
//! Every call runs the gate chain (stop flag, throttle, idle, change
//! detection) before touching the network, then performs an upsert
//! with one conflict retry. The store has no atomic upsert primitive
//! in its abstract API, so the writer improvises one:
//! update -> on NotFound create -> on Conflict retry update once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use halo_common::{PresenceError, StoreError};

use crate::config::PresenceConfig;
use crate::detect::{should_broadcast, CursorPos, LocalState};
use crate::protocol::{encode_field, PresenceRow, RowPatch, UserInfo};
use crate::store::RowStore;

/// What a broadcast attempt did. Skips are not errors; presence is a
/// best-effort enhancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// A write reached the store.
    Sent,
    /// The session is stopped; nothing will ever be written again.
    Stopped,
    /// Inside the throttle window.
    Throttled,
    /// No local input for longer than the idle threshold.
    Idle,
    /// The change gate decided the sample was not worth a write.
    Unchanged,
    /// The store denied the write; operating receive-only.
    Denied,
}

/// Writer for the local participant's presence row.
///
/// All methods take an explicit `now` (epoch ms) so gating decisions
/// and the stored `last_seen` stamp always agree on one clock reading.
pub struct PresenceWriter {
    store: Arc<dyn RowStore>,
    channel_id: String,
    user: UserInfo,
    config: PresenceConfig,
    stopped: Arc<AtomicBool>,
    /// Snapshot the change detector compares against. Updated
    /// optimistically at enqueue time, before the write completes.
    last_sent: Option<LocalState>,
    last_broadcast_ms: u64,
    last_activity_ms: u64,
    /// Previous accepted cursor sample, for velocity derivation.
    prev_sample: Option<(CursorPos, u64)>,
    /// Permission failures are logged once, then silent.
    permission_logged: bool,
}

impl PresenceWriter {
    pub fn new(
        store: Arc<dyn RowStore>,
        channel_id: impl Into<String>,
        user: UserInfo,
        config: PresenceConfig,
        stopped: Arc<AtomicBool>,
        now: u64,
    ) -> Self {
        Self {
            store,
            channel_id: channel_id.into(),
            user,
            config,
            stopped,
            last_sent: None,
            last_broadcast_ms: 0,
            last_activity_ms: now,
            prev_sample: None,
            permission_logged: false,
        }
    }

    /// Record local input activity. Resets the idle clock.
    pub fn mark_activity(&mut self, now: u64) {
        self.last_activity_ms = now;
    }

    /// Whether at least one broadcast has gone out.
    pub fn has_published(&self) -> bool {
        self.last_sent.is_some()
    }

    /// Attempt to broadcast `state`. `force` bypasses the change gate
    /// (first publish, focus/selection/editing transitions); throttle
    /// and idle gating still apply.
    pub async fn broadcast(
        &mut self,
        state: &LocalState,
        force: bool,
        now: u64,
    ) -> Result<BroadcastOutcome, PresenceError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(BroadcastOutcome::Stopped);
        }
        if self.last_broadcast_ms != 0 && now.saturating_sub(self.last_broadcast_ms) < self.config.throttle_ms
        {
            return Ok(BroadcastOutcome::Throttled);
        }
        if now.saturating_sub(self.last_activity_ms) > self.config.idle_threshold_ms {
            return Ok(BroadcastOutcome::Idle);
        }
        if !force
            && !should_broadcast(state, self.last_sent.as_ref(), self.config.min_change_threshold_px)
        {
            return Ok(BroadcastOutcome::Unchanged);
        }

        let velocity = self.derive_velocity(state.cursor, now);
        let patch = self.build_patch(state, velocity, now)?;
        let row = self.build_row(state, velocity, now)?;

        // Optimistic bookkeeping at enqueue time: the next gate run
        // compares against this sample whether or not the write below
        // reaches the store.
        self.last_sent = Some(state.clone());
        self.last_broadcast_ms = now;
        if let Some(cursor) = state.cursor {
            self.prev_sample = Some((cursor, now));
        }

        match self.upsert(patch, row).await {
            Ok(()) => {
                debug!(channel = %self.channel_id, "Presence broadcast");
                Ok(BroadcastOutcome::Sent)
            }
            Err(StoreError::PermissionDenied) => {
                if !self.permission_logged {
                    self.permission_logged = true;
                    warn!(
                        channel = %self.channel_id,
                        "Presence writes denied; continuing receive-only"
                    );
                }
                Ok(BroadcastOutcome::Denied)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Velocity in px/s from the previous accepted sample, when the
    /// deployment wants it and the samples are close enough in time to
    /// be meaningful.
    fn derive_velocity(&self, cursor: Option<CursorPos>, now: u64) -> Option<(f64, f64)> {
        if !self.config.include_velocity {
            return None;
        }
        let cursor = cursor?;
        let (prev, prev_ms) = self.prev_sample?;
        let dt_ms = now.saturating_sub(prev_ms);
        if dt_ms == 0 || dt_ms > 2_000 {
            return None;
        }
        let dt_s = dt_ms as f64 / 1_000.0;
        Some(((cursor.x - prev.x) / dt_s, (cursor.y - prev.y) / dt_s))
    }

    async fn upsert(&self, patch: RowPatch, row: PresenceRow) -> Result<(), StoreError> {
        match self
            .store
            .update(&self.channel_id, &self.user.user_id, patch.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                if self.stopped.load(Ordering::SeqCst) {
                    return Ok(());
                }
                match self.store.create(row).await {
                    Ok(_) => Ok(()),
                    // Row appeared between update and create: another
                    // tab or process won the race. Retry the update
                    // exactly once.
                    Err(StoreError::Conflict(_)) => {
                        if self.stopped.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        self.store
                            .update(&self.channel_id, &self.user.user_id, patch)
                            .await
                            .map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn build_patch(
        &self,
        state: &LocalState,
        velocity: Option<(f64, f64)>,
        now: u64,
    ) -> Result<RowPatch, PresenceError> {
        Ok(RowPatch {
            x: state.cursor.map(|c| c.x),
            y: state.cursor.map(|c| c.y),
            vx: velocity.map(|(vx, _)| vx),
            vy: velocity.map(|(_, vy)| vy),
            last_seen: Some(now),
            focus: Some(encode_field(&state.focus)?),
            selection: Some(encode_field(&state.selection)?),
            editing: Some(encode_field(&state.editing)?),
        })
    }

    fn build_row(
        &self,
        state: &LocalState,
        velocity: Option<(f64, f64)>,
        now: u64,
    ) -> Result<PresenceRow, PresenceError> {
        let cursor = state.cursor.unwrap_or(CursorPos { x: 0.0, y: 0.0 });
        Ok(PresenceRow {
            user_id: self.user.user_id.clone(),
            channel_id: self.channel_id.clone(),
            x: cursor.x,
            y: cursor.y,
            vx: velocity.map(|(vx, _)| vx),
            vy: velocity.map(|(_, vy)| vy),
            name: self.user.name.clone(),
            color: self.user.effective_color(),
            last_seen: now,
            focus: encode_field(&state.focus)?,
            selection: encode_field(&state.selection)?,
            editing: encode_field(&state.editing)?,
        })
    }
}
