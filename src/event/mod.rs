//! Typed events decoded from gateway JSON.
//!
//! The gateway is loose with field types (numbers as strings, `message` as
//! either an array of segments or a bare string), so decoding normalizes
//! everything into the structs below while keeping the raw value around
//! for plugins that want it.

use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Private,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    GroupUpload,
    GroupAdmin,
    GroupDecrease,
    GroupIncrease,
    GroupBan,
    FriendAdd,
    GroupRecall,
    FriendRecall,
    Notify,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Friend,
    Group,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Lifecycle,
    Heartbeat,
    Unknown,
}

/// One element of the OneBot message array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageSegment {
    pub kind: String,
    pub data: BTreeMap<String, String>,
}

impl MessageSegment {
    pub fn text(content: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert("text".to_string(), content.into());
        Self {
            kind: "text".into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub user_id: i64,
    pub nickname: String,
    pub card: String,
    pub sex: String,
    pub age: i32,
    pub area: String,
    pub level: String,
    pub role: String,
    pub title: String,
}

impl Sender {
    /// Group card when set, nickname otherwise.
    pub fn display_name(&self) -> &str {
        if self.card.is_empty() {
            &self.nickname
        } else {
            &self.card
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageEvent {
    pub kind: Option<MessageKind>,
    pub sub_type: String,
    pub message_id: i32,
    pub user_id: i64,
    /// 0 for private messages.
    pub group_id: i64,
    pub segments: Vec<MessageSegment>,
    pub raw_message: String,
    pub sender: Sender,
    // Mirrored from the envelope so handlers that only see the message
    // body still have them.
    pub time: i64,
    pub self_id: i64,
}

impl MessageEvent {
    pub fn is_group(&self) -> bool {
        self.kind == Some(MessageKind::Group)
    }

    pub fn is_private(&self) -> bool {
        !self.is_group()
    }

    /// Concatenation of all text segments.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            if seg.kind == "text" {
                if let Some(text) = seg.data.get("text") {
                    out.push_str(text);
                }
            }
        }
        out
    }

    /// Conversation key: `g_<group_id>` or `p_<user_id>`.
    pub fn context_key(&self) -> String {
        if self.is_group() {
            format!("g_{}", self.group_id)
        } else {
            format!("p_{}", self.user_id)
        }
    }

    /// True when any `at` segment targets `self_id`.
    pub fn mentions(&self, self_id: i64) -> bool {
        let target = self_id.to_string();
        self.segments
            .iter()
            .any(|seg| seg.kind == "at" && seg.data.get("qq") == Some(&target))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoticeEvent {
    pub kind: NoticeKind,
    pub sub_type: String,
    pub group_id: i64,
    pub user_id: i64,
    pub operator_id: i64,
    pub target_id: i64,
    pub duration: i64,
    pub message_id: i32,
}

impl Default for NoticeKind {
    fn default() -> Self {
        NoticeKind::Unknown
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestEvent {
    pub kind: RequestKind,
    pub sub_type: String,
    pub user_id: i64,
    pub group_id: i64,
    pub comment: String,
    /// Opaque gateway token, echoed back to approve or reject.
    pub flag: String,
}

impl Default for RequestKind {
    fn default() -> Self {
        RequestKind::Unknown
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetaEvent {
    pub kind: MetaKind,
    pub sub_type: String,
    pub interval: i64,
    pub status: Value,
}

impl Default for MetaKind {
    fn default() -> Self {
        MetaKind::Unknown
    }
}

#[derive(Debug, Clone)]
pub enum EventBody {
    Message(MessageEvent),
    Notice(NoticeEvent),
    Request(RequestEvent),
    Meta(MetaEvent),
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: i64,
    pub self_id: i64,
    pub post_type: String,
    /// The full decoded payload, shared read-only with plugins.
    pub raw: Value,
    pub body: EventBody,
}

fn get_i64(obj: &Value, key: &str) -> i64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn get_str(obj: &Value, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Decode one inbound JSON object into an event.
///
/// Returns `None` when `post_type` is absent; an unrecognized `post_type`
/// still surfaces as an event with an `Unknown` body.
pub fn decode(value: &Value) -> Option<Event> {
    let obj = value.as_object()?;
    let post_type = obj.get("post_type")?.as_str()?.to_string();

    let body = match post_type.as_str() {
        "message" | "message_sent" => EventBody::Message(decode_message(value)),
        "notice" => EventBody::Notice(decode_notice(value)),
        "request" => EventBody::Request(decode_request(value)),
        "meta_event" => EventBody::Meta(decode_meta(value)),
        _ => EventBody::Unknown,
    };

    Some(Event {
        timestamp: get_i64(value, "time"),
        self_id: get_i64(value, "self_id"),
        post_type,
        raw: value.clone(),
        body,
    })
}

fn decode_message(value: &Value) -> MessageEvent {
    let mut event = MessageEvent {
        kind: match value.get("message_type").and_then(Value::as_str) {
            Some("group") => Some(MessageKind::Group),
            _ => Some(MessageKind::Private),
        },
        sub_type: get_str(value, "sub_type"),
        message_id: get_i64(value, "message_id") as i32,
        user_id: get_i64(value, "user_id"),
        group_id: get_i64(value, "group_id"),
        raw_message: get_str(value, "raw_message"),
        time: get_i64(value, "time"),
        self_id: get_i64(value, "self_id"),
        ..Default::default()
    };

    match value.get("message") {
        Some(Value::Array(segments)) => {
            for seg in segments {
                let mut segment = MessageSegment {
                    kind: get_str(seg, "type"),
                    data: BTreeMap::new(),
                };
                if let Some(data) = seg.get("data").and_then(Value::as_object) {
                    for (k, v) in data {
                        let rendered = match v {
                            Value::String(s) => s.clone(),
                            Value::Number(n) => n.to_string(),
                            Value::Bool(b) => b.to_string(),
                            _ => continue,
                        };
                        segment.data.insert(k.clone(), rendered);
                    }
                }
                event.segments.push(segment);
            }
        }
        // A bare string decodes into a single text segment.
        Some(Value::String(text)) => {
            event.segments.push(MessageSegment::text(text.clone()));
        }
        _ => {}
    }

    if let Some(sender) = value.get("sender") {
        event.sender = Sender {
            user_id: get_i64(sender, "user_id"),
            nickname: get_str(sender, "nickname"),
            card: get_str(sender, "card"),
            sex: get_str(sender, "sex"),
            age: get_i64(sender, "age") as i32,
            area: get_str(sender, "area"),
            level: get_str(sender, "level"),
            role: get_str(sender, "role"),
            title: get_str(sender, "title"),
        };
    }

    event
}

fn decode_notice(value: &Value) -> NoticeEvent {
    NoticeEvent {
        kind: match value.get("notice_type").and_then(Value::as_str) {
            Some("group_upload") => NoticeKind::GroupUpload,
            Some("group_admin") => NoticeKind::GroupAdmin,
            Some("group_decrease") => NoticeKind::GroupDecrease,
            Some("group_increase") => NoticeKind::GroupIncrease,
            Some("group_ban") => NoticeKind::GroupBan,
            Some("friend_add") => NoticeKind::FriendAdd,
            Some("group_recall") => NoticeKind::GroupRecall,
            Some("friend_recall") => NoticeKind::FriendRecall,
            Some("notify") => NoticeKind::Notify,
            _ => NoticeKind::Unknown,
        },
        sub_type: get_str(value, "sub_type"),
        group_id: get_i64(value, "group_id"),
        user_id: get_i64(value, "user_id"),
        operator_id: get_i64(value, "operator_id"),
        target_id: get_i64(value, "target_id"),
        duration: get_i64(value, "duration"),
        message_id: get_i64(value, "message_id") as i32,
    }
}

fn decode_request(value: &Value) -> RequestEvent {
    RequestEvent {
        kind: match value.get("request_type").and_then(Value::as_str) {
            Some("friend") => RequestKind::Friend,
            Some("group") => RequestKind::Group,
            _ => RequestKind::Unknown,
        },
        sub_type: get_str(value, "sub_type"),
        user_id: get_i64(value, "user_id"),
        group_id: get_i64(value, "group_id"),
        comment: get_str(value, "comment"),
        flag: get_str(value, "flag"),
    }
}

fn decode_meta(value: &Value) -> MetaEvent {
    MetaEvent {
        kind: match value.get("meta_event_type").and_then(Value::as_str) {
            Some("lifecycle") => MetaKind::Lifecycle,
            Some("heartbeat") => MetaKind::Heartbeat,
            _ => MetaKind::Unknown,
        },
        sub_type: get_str(value, "sub_type"),
        interval: get_i64(value, "interval"),
        status: value.get("status").cloned().unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_message_with_segment_array() {
        let payload = json!({
            "post_type": "message",
            "message_type": "group",
            "time": 1700000000,
            "self_id": 10001,
            "message_id": 555,
            "user_id": 42,
            "group_id": 777,
            "raw_message": "[CQ:at,qq=10001] hello",
            "message": [
                {"type": "at", "data": {"qq": "10001"}},
                {"type": "text", "data": {"text": " hello"}}
            ],
            "sender": {"user_id": 42, "nickname": "nick", "card": "card-name", "role": "member"}
        });
        let event = decode(&payload).unwrap();
        assert_eq!(event.timestamp, 1700000000);
        assert_eq!(event.self_id, 10001);
        let EventBody::Message(msg) = &event.body else {
            panic!("expected message");
        };
        assert!(msg.is_group());
        assert_eq!(msg.message_id, 555);
        assert_eq!(msg.context_key(), "g_777");
        assert_eq!(msg.plain_text(), " hello");
        assert!(msg.mentions(10001));
        assert!(!msg.mentions(99));
        assert_eq!(msg.sender.display_name(), "card-name");
    }

    #[test]
    fn bare_string_message_becomes_text_segment() {
        let payload = json!({
            "post_type": "message",
            "message_type": "private",
            "user_id": 42,
            "message": "just text"
        });
        let event = decode(&payload).unwrap();
        let EventBody::Message(msg) = &event.body else {
            panic!("expected message");
        };
        assert!(msg.is_private());
        assert_eq!(msg.segments.len(), 1);
        assert_eq!(msg.segments[0].kind, "text");
        assert_eq!(msg.plain_text(), "just text");
        assert_eq!(msg.context_key(), "p_42");
    }

    #[test]
    fn message_sent_decodes_like_message() {
        let payload = json!({
            "post_type": "message_sent",
            "message_type": "group",
            "group_id": 1,
            "message": "echo"
        });
        let event = decode(&payload).unwrap();
        assert!(matches!(event.body, EventBody::Message(_)));
    }

    #[test]
    fn notice_kinds_map_and_unknown_survives() {
        let payload = json!({
            "post_type": "notice",
            "notice_type": "group_recall",
            "group_id": 7,
            "operator_id": 1,
            "message_id": 99
        });
        let event = decode(&payload).unwrap();
        let EventBody::Notice(notice) = &event.body else {
            panic!("expected notice");
        };
        assert_eq!(notice.kind, NoticeKind::GroupRecall);
        assert_eq!(notice.message_id, 99);

        let payload = json!({"post_type": "notice", "notice_type": "brand_new_kind"});
        let event = decode(&payload).unwrap();
        let EventBody::Notice(notice) = &event.body else {
            panic!("expected notice");
        };
        assert_eq!(notice.kind, NoticeKind::Unknown);
    }

    #[test]
    fn request_carries_flag() {
        let payload = json!({
            "post_type": "request",
            "request_type": "friend",
            "user_id": 5,
            "comment": "hi",
            "flag": "opaque-token-1"
        });
        let event = decode(&payload).unwrap();
        let EventBody::Request(req) = &event.body else {
            panic!("expected request");
        };
        assert_eq!(req.kind, RequestKind::Friend);
        assert_eq!(req.flag, "opaque-token-1");
    }

    #[test]
    fn meta_heartbeat() {
        let payload = json!({
            "post_type": "meta_event",
            "meta_event_type": "heartbeat",
            "interval": 5000
        });
        let event = decode(&payload).unwrap();
        let EventBody::Meta(meta) = &event.body else {
            panic!("expected meta");
        };
        assert_eq!(meta.kind, MetaKind::Heartbeat);
        assert_eq!(meta.interval, 5000);
    }

    #[test]
    fn missing_post_type_is_none_unknown_is_surfaced() {
        assert!(decode(&json!({"time": 1})).is_none());
        assert!(decode(&json!("not an object")).is_none());

        let event = decode(&json!({"post_type": "future_type"})).unwrap();
        assert!(matches!(event.body, EventBody::Unknown));
        assert_eq!(event.post_type, "future_type");
    }

    #[test]
    fn numeric_strings_coerce() {
        let payload = json!({
            "post_type": "message",
            "message_type": "private",
            "user_id": "12345",
            "message": "x"
        });
        let event = decode(&payload).unwrap();
        let EventBody::Message(msg) = &event.body else {
            panic!("expected message");
        };
        assert_eq!(msg.user_id, 12345);
    }
}
