//! Change detection: decides whether a local state sample differs
//! enough from the last broadcast sample to warrant a network write.

use serde::{Deserialize, Serialize};

use crate::protocol::{EditingState, FocusTarget, SelectionRange};

/// A cursor position in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub x: f64,
    pub y: f64,
}

/// The local participant's shareable state at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    pub cursor: Option<CursorPos>,
    pub focus: Option<FocusTarget>,
    pub selection: Option<SelectionRange>,
    pub editing: Option<EditingState>,
}

/// Whether `current` differs enough from `last_sent` to broadcast.
///
/// Cursor motion only counts once it moves at least `min_delta` pixels
/// on either axis. Focus, selection, and editing transitions always
/// force a broadcast regardless of distance: they signal discrete user
/// intent, not continuous motion. The very first sample (nothing sent
/// yet) always broadcasts.
pub fn should_broadcast(current: &LocalState, last_sent: Option<&LocalState>, min_delta: f64) -> bool {
    let Some(last) = last_sent else {
        return true;
    };

    if current.focus != last.focus
        || current.selection != last.selection
        || current.editing != last.editing
    {
        return true;
    }

    match (current.cursor, last.cursor) {
        (Some(cur), Some(prev)) => {
            (cur.x - prev.x).abs() >= min_delta || (cur.y - prev.y).abs() >= min_delta
        }
        // First cursor sample ever, or cursor withdrawn.
        (Some(_), None) | (None, Some(_)) => true,
        (None, None) => false,
    }
}
