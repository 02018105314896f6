//! Upstream AI endpoint client and prompt assembly.
//!
//! The endpoint contract is small: POST `{"question": ..., "type":
//! "json", "system"?: ...}` and read back one of several response shapes.
//! Any non-empty recognized field is the reply body; a 2xx body matching
//! none of them is an UnknownFormat error.

use crate::config::AiConfig;
use crate::error::{AiApiErrorKind, BotError, Result};
use chrono::{Datelike, Local, Timelike};
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AiClient {
    url: String,
    api_key: String,
    pub model: String,
    http: reqwest::Client,
}

impl AiClient {
    pub fn new(config: &AiConfig) -> Self {
        let model = if config.model.is_empty() {
            "default".to_string()
        } else {
            config.model.clone()
        };
        Self {
            url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }

    /// One chat turn against the upstream endpoint.
    pub async fn chat(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        if self.url.is_empty() {
            return Err(BotError::AiApi {
                kind: AiApiErrorKind::Generic,
                detail: "ai api_url not configured".into(),
            });
        }

        let mut body = json!({"question": prompt, "type": "json"});
        if let Some(system) = system {
            if !system.is_empty() {
                body["system"] = json!(system);
            }
        }

        let mut request = self.http.post(&self.url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| BotError::AiApi {
            kind: AiApiErrorKind::Generic,
            detail: e.to_string(),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| BotError::AiApi {
            kind: AiApiErrorKind::Generic,
            detail: e.to_string(),
        })?;

        if status.as_u16() == 429 {
            return Err(BotError::AiApi {
                kind: AiApiErrorKind::RateLimit,
                detail: format!("status {status}"),
            });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BotError::AiApi {
                kind: AiApiErrorKind::InvalidKey,
                detail: format!("status {status}"),
            });
        }
        if !status.is_success() {
            return Err(BotError::AiApi {
                kind: AiApiErrorKind::Generic,
                detail: format!("status {status}"),
            });
        }
        if text.trim().is_empty() {
            return Err(BotError::AiApi {
                kind: AiApiErrorKind::EmptyResponse,
                detail: "empty body".into(),
            });
        }

        extract_reply(&text)
    }
}

/// Pull the reply body out of a response. The upstream has shipped
/// several shapes over time; the first non-empty recognized field wins.
pub fn extract_reply(body: &str) -> Result<String> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Err(BotError::AiApi {
            kind: AiApiErrorKind::UnknownFormat,
            detail: "non-JSON body".into(),
        });
    };

    if let Some(s) = value.as_str() {
        if !s.is_empty() {
            return Ok(s.to_string());
        }
    }

    // {"success": true, "content": "..."} envelope
    if value.get("success").and_then(Value::as_bool) == Some(true) {
        if let Some(content) = value.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                return Ok(content.to_string());
            }
        }
    }

    for field in ["answer", "response", "text", "content"] {
        if let Some(s) = value.get(field).and_then(Value::as_str) {
            if !s.is_empty() {
                return Ok(s.to_string());
            }
        }
    }

    Err(BotError::AiApi {
        kind: AiApiErrorKind::UnknownFormat,
        detail: "no recognized reply field".into(),
    })
}

/// Fixed-date holidays the prompt header mentions.
fn holiday_for(month: u32, day: u32) -> Option<&'static str> {
    match (month, day) {
        (1, 1) => Some("New Year's Day"),
        (2, 14) => Some("Valentine's Day"),
        (3, 8) => Some("Women's Day"),
        (4, 1) => Some("April Fools' Day"),
        (5, 1) => Some("Labor Day"),
        (6, 1) => Some("Children's Day"),
        (10, 1) => Some("National Day"),
        (12, 24) => Some("Christmas Eve"),
        (12, 25) => Some("Christmas Day"),
        (12, 31) => Some("New Year's Eve"),
        _ => None,
    }
}

/// Full prompt for one chat turn: date header, persona, history window,
/// then the current message.
pub fn build_chat_prompt(
    persona_prompt: &str,
    history_window: &str,
    sender_name: &str,
    message: &str,
) -> String {
    let now = Local::now();
    let weekday = match now.weekday() {
        chrono::Weekday::Mon => "Monday",
        chrono::Weekday::Tue => "Tuesday",
        chrono::Weekday::Wed => "Wednesday",
        chrono::Weekday::Thu => "Thursday",
        chrono::Weekday::Fri => "Friday",
        chrono::Weekday::Sat => "Saturday",
        chrono::Weekday::Sun => "Sunday",
    };
    let mut out = format!(
        "[current time]\n{}-{:02}-{:02} {} {:02}:{:02}:{:02}",
        now.year(),
        now.month(),
        now.day(),
        weekday,
        now.hour(),
        now.minute(),
        now.second()
    );
    if let Some(holiday) = holiday_for(now.month(), now.day()) {
        out.push_str(&format!(" ({holiday})"));
    }
    out.push('\n');

    if !persona_prompt.is_empty() {
        out.push_str("\n[persona]\n");
        out.push_str(persona_prompt);
        out.push('\n');
    }
    if !history_window.is_empty() {
        out.push('\n');
        out.push_str(history_window);
        out.push('\n');
    }
    out.push_str("\n[current message]\n");
    let clock = format!("[{:02}:{:02}]", now.hour(), now.minute());
    if sender_name.is_empty() {
        out.push_str(&format!("{clock} {message}"));
    } else {
        out.push_str(&format!("{clock} {sender_name}: {message}"));
    }
    out
}
