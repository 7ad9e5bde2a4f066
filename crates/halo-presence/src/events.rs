//! Events emitted by a presence session for the host to consume.

use crate::table::CursorEntry;

/// What the host application sees. One receiver per session; the host
/// renders cursors from `CursorsChanged` and may restart the session
/// on `SubscriptionClosed`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A remote participant appeared in the channel.
    Joined(CursorEntry),
    /// A remote participant left the channel.
    Left { user_id: String, name: String },
    /// The cursor table changed; full current view of remote
    /// participants.
    CursorsChanged(Vec<CursorEntry>),
    /// Writes are being denied; the session continues receive-only.
    Degraded(String),
    /// The realtime feed closed and will not recover on its own.
    SubscriptionClosed,
}
