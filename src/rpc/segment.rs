//! Message-segment constructors and wire serialization.

use crate::event::MessageSegment;
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn make(kind: &str, pairs: &[(&str, String)]) -> MessageSegment {
    let mut data = BTreeMap::new();
    for (k, v) in pairs {
        data.insert((*k).to_string(), v.clone());
    }
    MessageSegment {
        kind: kind.to_string(),
        data,
    }
}

pub fn text(content: &str) -> MessageSegment {
    make("text", &[("text", content.to_string())])
}

pub fn face(id: i32) -> MessageSegment {
    make("face", &[("id", id.to_string())])
}

pub fn image(file: &str) -> MessageSegment {
    make("image", &[("file", file.to_string())])
}

pub fn record(file: &str) -> MessageSegment {
    make("record", &[("file", file.to_string())])
}

pub fn at(user_id: i64) -> MessageSegment {
    make("at", &[("qq", user_id.to_string())])
}

pub fn at_all() -> MessageSegment {
    make("at", &[("qq", "all".to_string())])
}

pub fn reply(message_id: i32) -> MessageSegment {
    make("reply", &[("id", message_id.to_string())])
}

pub fn share(url: &str, title: &str, content: &str, image: &str) -> MessageSegment {
    let mut pairs = vec![("url", url.to_string()), ("title", title.to_string())];
    if !content.is_empty() {
        pairs.push(("content", content.to_string()));
    }
    if !image.is_empty() {
        pairs.push(("image", image.to_string()));
    }
    make("share", &pairs)
}

/// Serialize segments into the OneBot message-array shape.
pub fn to_json(segments: &[MessageSegment]) -> Value {
    Value::Array(
        segments
            .iter()
            .map(|seg| {
                json!({
                    "type": seg.kind,
                    "data": seg.data,
                })
            })
            .collect(),
    )
}
