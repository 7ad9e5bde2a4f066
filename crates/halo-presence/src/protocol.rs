//! Row and payload types for the presence engine.
//!
//! These types define the durable row shape shared through the backing
//! store and the change events that ride on its notification channel.
//! The structured sub-documents (`focus`, `selection`, `editing`) are
//! transported as JSON-encoded strings for compatibility with stores
//! lacking native nested columns; decoding tolerates both the encoded
//! string form and a native JSON object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use halo_common::PresenceError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Display identity of a participant, as supplied by the host
/// application. Authentication is someone else's problem; this is an
/// opaque tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub name: String,
    /// Display color. Derived from `user_id` when not supplied.
    pub color: Option<String>,
}

impl UserInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            color: None,
        }
    }

    /// An anonymous participant: a fresh random user id with the given
    /// display name. Useful for hosts without their own identity layer.
    pub fn anonymous(name: impl Into<String>) -> Self {
        Self::new(halo_common::new_id(), name)
    }

    /// The effective display color: the supplied one, or a hue derived
    /// deterministically from the user id.
    pub fn effective_color(&self) -> String {
        self.color
            .clone()
            .unwrap_or_else(|| color_for_user(&self.user_id))
    }
}

/// Map a user id onto a stable `hsl()` color via an FNV-1a hash of the
/// id bytes. The same id always yields the same hue, so a participant
/// keeps their color across sessions without any coordination.
pub fn color_for_user(user_id: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for b in user_id.bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let hue = hash % 360;
    format!("hsl({hue}, 70%, 50%)")
}

// ---------------------------------------------------------------------------
// Structured sub-documents
// ---------------------------------------------------------------------------

/// Which element a participant has focused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusTarget {
    pub element_id: String,
}

/// A text selection within an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub element_id: String,
    pub start: usize,
    pub end: usize,
}

/// An in-progress edit: the element, its current (unsaved) value, and
/// the caret position within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditingState {
    pub element_id: String,
    pub value: String,
    pub caret_position: usize,
}

/// Decode a sub-document from its transported form. Accepts a JSON
/// string (the storage shim), a native object, or null/absent. A
/// malformed payload decodes to `None` with a warning; a single bad
/// field must never fail the enclosing row or event.
pub fn decode_field<T: serde::de::DeserializeOwned>(field: &str, value: Option<&Value>) -> Option<T> {
    let value = value?;
    let result = match value {
        Value::Null => return None,
        Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    match result {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(field, error = %e, "Dropping undecodable presence payload");
            None
        }
    }
}

/// Encode a sub-document into its transported string form. `None`
/// encodes to `None`; a payload the serializer rejects is an error,
/// not a silently dropped field.
pub fn encode_field<T: Serialize>(value: &Option<T>) -> Result<Option<String>, PresenceError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(|e| PresenceError::Encode(e.to_string())))
        .transpose()
}

// ---------------------------------------------------------------------------
// Durable row
// ---------------------------------------------------------------------------

/// One participant's last-known shared state: exactly one row per
/// `(channel_id, user_id)` pair. No row means the participant is not
/// present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRow {
    pub user_id: String,
    pub channel_id: String,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vy: Option<f64>,
    pub name: String,
    pub color: String,
    /// Epoch milliseconds of the last write.
    pub last_seen: u64,
    /// JSON-encoded `FocusTarget`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    /// JSON-encoded `SelectionRange`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    /// JSON-encoded `EditingState`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editing: Option<String>,
}

/// A partial update to a presence row. Fields set to `None` are left
/// untouched by the store; the sub-documents use an explicit
/// two-level option so "clear this field" and "don't touch this
/// field" stay distinguishable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editing: Option<Option<String>>,
}

impl PresenceRow {
    /// Apply a partial update in place. Absent patch fields retain
    /// prior values.
    pub fn apply(&mut self, patch: &RowPatch) {
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if patch.vx.is_some() {
            self.vx = patch.vx;
        }
        if patch.vy.is_some() {
            self.vy = patch.vy;
        }
        if let Some(seen) = patch.last_seen {
            self.last_seen = seen;
        }
        if let Some(focus) = &patch.focus {
            self.focus = focus.clone();
        }
        if let Some(selection) = &patch.selection {
            self.selection = selection.clone();
        }
        if let Some(editing) = &patch.editing {
            self.editing = editing.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// Kind of row change carried on the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// A single row change observed on the store's pub/sub channel.
/// `Update` events carry a patch; `Create` carries the full row;
/// `Delete` carries only the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub channel_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<PresenceRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<RowPatch>,
}

/// Current wall-clock time in epoch milliseconds.
///
/// SystemTime is enough here; a proper date type would pull in chrono
/// for no benefit since rows only ever compare millisecond counters.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_is_deterministic() {
        let a = color_for_user("user-1");
        let b = color_for_user("user-1");
        assert_eq!(a, b);
        assert!(a.starts_with("hsl("));
    }

    #[test]
    fn color_differs_between_users() {
        // Not guaranteed in general (360 buckets), but these two should
        // land apart.
        assert_ne!(color_for_user("alice"), color_for_user("bob"));
    }

    #[test]
    fn anonymous_users_get_distinct_ids() {
        let a = UserInfo::anonymous("Guest");
        let b = UserInfo::anonymous("Guest");
        assert_ne!(a.user_id, b.user_id);
        assert_eq!(a.name, "Guest");
    }

    #[test]
    fn effective_color_prefers_supplied() {
        let mut user = UserInfo::new("u-1", "Alice");
        assert_eq!(user.effective_color(), color_for_user("u-1"));

        user.color = Some("#ff0000".into());
        assert_eq!(user.effective_color(), "#ff0000");
    }

    #[test]
    fn decode_field_accepts_encoded_string() {
        let value = Value::String(r#"{"element_id":"title"}"#.into());
        let focus: Option<FocusTarget> = decode_field("focus", Some(&value));
        assert_eq!(focus.unwrap().element_id, "title");
    }

    #[test]
    fn decode_field_accepts_native_object() {
        let value = serde_json::json!({ "element_id": "body", "start": 2, "end": 9 });
        let sel: Option<SelectionRange> = decode_field("selection", Some(&value));
        let sel = sel.unwrap();
        assert_eq!(sel.element_id, "body");
        assert_eq!(sel.start, 2);
        assert_eq!(sel.end, 9);
    }

    #[test]
    fn decode_field_tolerates_garbage() {
        let value = Value::String("not json at all".into());
        let focus: Option<FocusTarget> = decode_field("focus", Some(&value));
        assert!(focus.is_none());

        let focus: Option<FocusTarget> = decode_field("focus", Some(&Value::Null));
        assert!(focus.is_none());

        let focus: Option<FocusTarget> = decode_field("focus", None);
        assert!(focus.is_none());
    }

    #[test]
    fn encode_decode_round_trip() {
        let editing = Some(EditingState {
            element_id: "notes".into(),
            value: "hello".into(),
            caret_position: 5,
        });
        let encoded = encode_field(&editing).unwrap().unwrap();
        let value = Value::String(encoded);
        let back: Option<EditingState> = decode_field("editing", Some(&value));
        assert_eq!(back, editing);

        assert_eq!(encode_field(&None::<EditingState>).unwrap(), None);
    }

    #[test]
    fn encode_field_reports_unserializable_payload() {
        use std::collections::HashMap;
        // serde_json rejects non-string map keys.
        let bad: Option<HashMap<Vec<u32>, u32>> = Some(HashMap::from([(vec![1], 1)]));
        let err = encode_field(&bad).unwrap_err();
        assert!(matches!(err, PresenceError::Encode(_)));
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let mut row = PresenceRow {
            user_id: "u-1".into(),
            channel_id: "doc-1".into(),
            x: 10.0,
            y: 20.0,
            vx: Some(1.0),
            vy: Some(2.0),
            name: "Alice".into(),
            color: "hsl(1, 70%, 50%)".into(),
            last_seen: 100,
            focus: Some(r#"{"element_id":"a"}"#.into()),
            selection: None,
            editing: None,
        };

        let patch = RowPatch {
            x: Some(30.0),
            last_seen: Some(200),
            focus: Some(None), // explicit clear
            ..Default::default()
        };
        row.apply(&patch);

        assert_eq!(row.x, 30.0);
        assert_eq!(row.y, 20.0);
        assert_eq!(row.vx, Some(1.0));
        assert_eq!(row.last_seen, 200);
        assert!(row.focus.is_none());
    }

    #[test]
    fn change_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ChangeKind::Create).unwrap(),
            "\"create\""
        );
        assert_eq!(
            serde_json::to_string(&ChangeKind::Delete).unwrap(),
            "\"delete\""
        );
    }
}
