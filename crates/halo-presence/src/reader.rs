//! Initial snapshot load of a channel's participants.

use tracing::{debug, warn};

use halo_common::StoreError;

use crate::protocol::now_ms;
use crate::store::RowStore;
use crate::table::CursorEntry;

/// Load the current snapshot of all *other* participants in a channel.
///
/// Permission-denied yields an empty snapshot (receive-only deployments
/// still render whatever arrives on the feed later); every other store
/// error propagates to the caller.
pub async fn load_snapshot(
    store: &dyn RowStore,
    channel_id: &str,
    self_id: &str,
) -> Result<Vec<CursorEntry>, StoreError> {
    let rows = match store.list(channel_id).await {
        Ok(rows) => rows,
        Err(StoreError::PermissionDenied) => {
            warn!(channel = %channel_id, "Snapshot denied; starting receive-only");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let now = now_ms();
    let entries: Vec<CursorEntry> = rows
        .into_iter()
        .filter(|row| row.user_id != self_id)
        .map(|row| CursorEntry::from_row(row, now))
        .collect();
    debug!(channel = %channel_id, participants = entries.len(), "Snapshot loaded");
    Ok(entries)
}
