//! The event document flowing through the pipeline
//!
//! Events are opaque JSON trees: the pipeline never validates their inner
//! semantics, only their shape at the top level. Keeping them as untyped
//! maps is what guarantees unrelated fields survive enrichment untouched.

use serde_json::Value;

/// One event document: a JSON object keyed by strings.
///
/// Enrichment reads `source.ip` and may add `source.as.*`, `source.geo.*`
/// and `source.domain`; everything else passes through unchanged.
pub type Event = serde_json::Map<String, Value>;

/// Size of the event after re-serialization, in bytes.
///
/// The per-event admission cap is measured on the round-tripped document,
/// not the source span, so key order in the incoming text does not affect
/// the result.
pub fn encoded_len(event: &Event) -> usize {
    serde_json::to_vec(event).map_or(0, |b| b.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encoded_len_matches_serialization() {
        let Value::Object(event) = json!({"a": 1, "b": "two"}) else {
            panic!("not an object");
        };
        assert_eq!(encoded_len(&event), serde_json::to_vec(&event).unwrap().len());
    }

    #[test]
    fn test_encoded_len_empty_object() {
        let event = Event::new();
        assert_eq!(encoded_len(&event), 2); // "{}"
    }
}
