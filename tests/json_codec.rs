//! Wire-JSON guarantees the rest of the runtime leans on: structural
//! round-trips, surrogate-pair handling, 64-bit integers, and
//! deterministic key order on output.

use serde_json::{json, Value};

#[test]
fn parse_stringify_round_trips_structurally() {
    let samples = [
        json!(null),
        json!(true),
        json!(-9_007_199_254_740_993i64),
        json!(0.5),
        json!("plain"),
        json!([1, "two", null, {"three": 3}]),
        json!({
            "post_type": "message",
            "user_id": 12345678901i64,
            "message": [{"type": "text", "data": {"text": "hi"}}],
            "nested": {"a": [true, false], "b": {}}
        }),
    ];
    for value in samples {
        let text = serde_json::to_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed, value);
    }
}

#[test]
fn stringify_normalizes_whitespace_and_key_order() {
    let messy = "{ \"zebra\" : 1 ,\n \"alpha\" : 2 , \"mid\" : 3 }";
    let value: Value = serde_json::from_str(messy).unwrap();
    let normalized = serde_json::to_string(&value).unwrap();
    assert_eq!(normalized, r#"{"alpha":2,"mid":3,"zebra":1}"#);

    // Normalization is idempotent.
    let again: Value = serde_json::from_str(&normalized).unwrap();
    assert_eq!(serde_json::to_string(&again).unwrap(), normalized);
}

#[test]
fn surrogate_pairs_combine_into_one_codepoint() {
    // U+1F600 GRINNING FACE as a \uXXXX escape pair.
    let escaped = "\"\\uD83D\\uDE00\"";
    let value: Value = serde_json::from_str(escaped).unwrap();
    let text = value.as_str().unwrap();
    assert_eq!(text.chars().count(), 1);
    assert_eq!(text, "\u{1F600}");
    assert_eq!(text.len(), 4); // one UTF-8 sequence, not six bytes
}

#[test]
fn integers_in_i64_range_stay_integers() {
    let value: Value = serde_json::from_str("9223372036854775807").unwrap();
    assert_eq!(value.as_i64(), Some(i64::MAX));
    assert!(value.is_i64());

    // Past the i64 range the slot degrades rather than truncating.
    let value: Value = serde_json::from_str("9223372036854775808").unwrap();
    assert!(value.as_i64().is_none());
    assert!(value.is_u64() || value.is_f64());
}

#[test]
fn gateway_payload_shape_survives_round_trip() {
    let payload = json!({
        "action": "send_group_msg",
        "params": {"group_id": 123456789012i64, "message": "带中文 and \u{1F980}"},
        "echo": "lchbot_7"
    });
    let wire = serde_json::to_string(&payload).unwrap();
    let back: Value = serde_json::from_str(&wire).unwrap();
    assert_eq!(back, payload);
    assert_eq!(back["params"]["message"].as_str().unwrap(), "带中文 and 🦀");
}
