//! In-memory cursor table: one entry per remote participant.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::{decode_field, EditingState, FocusTarget, PresenceRow, SelectionRange};

/// In-memory mirror of a remote participant's presence row, plus the
/// decoded sub-documents and local bookkeeping for interpolation.
#[derive(Debug, Clone)]
pub struct CursorEntry {
    pub row: PresenceRow,
    pub focus: Option<FocusTarget>,
    pub selection: Option<SelectionRange>,
    pub editing: Option<EditingState>,
    /// Local wall-clock ms at which this entry was last touched.
    pub last_update_ms: u64,
    /// Set only on derived (predicted) reads, never on stored entries.
    pub interpolated: bool,
}

impl CursorEntry {
    /// Build an entry from a stored row, decoding the transported
    /// sub-documents. Malformed payloads decode to `None`.
    pub fn from_row(row: PresenceRow, now_ms: u64) -> Self {
        let focus = decode_field("focus", row.focus.clone().map(Value::String).as_ref());
        let selection = decode_field("selection", row.selection.clone().map(Value::String).as_ref());
        let editing = decode_field("editing", row.editing.clone().map(Value::String).as_ref());
        Self {
            row,
            focus,
            selection,
            editing,
            last_update_ms: now_ms,
            interpolated: false,
        }
    }
}

/// Cursor table keyed by `user_id`. Owned by one session instance;
/// never a process-wide singleton.
pub type CursorTable = HashMap<String, CursorEntry>;
