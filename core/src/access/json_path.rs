//! Dot-notation claim lookup with array indices, used by [`super::ClaimMatcher`]
//! (spec §4.5, supplemented per `original_source/access_resolver.py`'s separate
//! walker).

use serde_json::Value;

/// Walks `path` (e.g. `"realm_access.roles.0"`) into `value`. Each segment is
/// either an object key or, if the current value is an array, a parseable
/// index. Returns `None` on any missing key, out-of-range index, or type
/// mismatch — callers treat that as a non-match, not an error.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}
