//! Shape and naming of the per-document JSON files under `docs/`.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;

use crate::{Error, Result};

pub const DELETED_FIELD: &str = "_deleted";
pub const ATTACHMENTS_FIELD: &str = "_attachments";
pub const META_FIELD: &str = "_meta";

/// Characters that cannot survive as file names on the remote side.
/// Percent-encoding keeps the mapping from primary key to file name
/// injective, which the checkpoint's name list depends on.
const NAME_HOSTILE: &AsciiSet = &CONTROLS.add(b'/').add(b'\\').add(b'%');

/// File name of the document with the given primary key.
pub fn file_name(primary_key_value: &str) -> String {
    format!("{}.json", utf8_percent_encode(primary_key_value, NAME_HOSTILE))
}

/// Extract the primary key value out of a document state.
pub fn primary_key_of<'d>(state: &'d Value, primary_key: &str) -> Result<&'d str> {
    state
        .get(primary_key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MissingPrimaryKey(primary_key.to_string()))
}

/// Ensure the stored shape: the tombstone marker and the attachments map
/// are present even when empty.
pub fn normalize(mut state: Value) -> Value {
    if let Value::Object(fields) = &mut state {
        fields
            .entry(DELETED_FIELD.to_string())
            .or_insert(Value::Bool(false));
        fields
            .entry(ATTACHMENTS_FIELD.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    state
}

pub fn is_deleted(state: &Value) -> bool {
    state.get(DELETED_FIELD).and_then(Value::as_bool).unwrap_or(false)
}

/// Deep equality of two document states, ignoring attachment and
/// tombstone bookkeeping. JSON maps deserialize key-sorted, so plain
/// `Value` comparison is already canonical with respect to key order.
pub fn states_equal(a: &Value, b: &Value) -> bool {
    strip_meta(a.clone()) == strip_meta(b.clone())
}

fn strip_meta(mut state: Value) -> Value {
    if let Value::Object(fields) = &mut state {
        fields.remove(DELETED_FIELD);
        fields.remove(ATTACHMENTS_FIELD);
        fields.remove(META_FIELD);
    }
    state
}
