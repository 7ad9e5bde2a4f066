//! Ephemeral multi-user presence synchronization.
//!
//! Lets many concurrent clients observe each other's cursor position,
//! focus target, text selection, and in-progress edits against a
//! shared backing store, with change-gated writes on the way out and
//! dead-reckoned interpolation on the way in. The backing store and
//! its notification channel are abstract seams (`RowStore`,
//! `PresenceFeed`); an in-memory backend is bundled for tests and
//! single-process embedding.

pub mod config;
pub mod detect;
pub mod events;
pub mod interpolate;
pub mod memory;
pub mod protocol;
pub mod reader;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod table;
pub mod writer;

pub use config::PresenceConfig;
pub use detect::{should_broadcast, CursorPos, LocalState};
pub use events::SessionEvent;
pub use interpolate::{predict, predict_entry, Predicted, Velocity};
pub use memory::MemoryStore;
pub use protocol::{
    color_for_user, ChangeKind, EditingState, FocusTarget, PresenceRow, RowChange, RowPatch,
    SelectionRange, UserInfo,
};
pub use reader::load_snapshot;
pub use reconcile::Reconciler;
pub use session::{PresenceSession, SessionHandle, StateDelta};
pub use store::{PresenceFeed, RowStore, Subscription};
pub use table::{CursorEntry, CursorTable};
pub use writer::{BroadcastOutcome, PresenceWriter};

pub use halo_common::{PresenceError, StoreError};
