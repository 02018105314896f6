//! Error kinds shared by every subsystem, plus the user-safe message table.
//!
//! Internal errors carry full detail for logs; anything that reaches an
//! end user goes through [`user_message`] so internals never leak into
//! chat.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiApiErrorKind {
    RateLimit,
    InvalidKey,
    EmptyResponse,
    UnknownFormat,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxViolationKind {
    Permission,
    Quota,
    Timeout,
    PathDenied,
    HostDenied,
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error("config load failed: {0}")]
    ConfigLoad(String),

    #[error("transport disconnected: {0}")]
    TransportDisconnect(String),

    #[error("rpc timed out waiting for echo {0}")]
    RpcTimeout(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("ai api error ({kind:?}): {detail}")]
    AiApi {
        kind: AiApiErrorKind,
        detail: String,
    },

    #[error("plugin load failed: {0}")]
    PluginLoad(String),

    #[error("plugin {plugin} failed during dispatch: {detail}")]
    PluginRuntime { plugin: String, detail: String },

    #[error("sandbox violation ({kind:?}) for {plugin}: {detail}")]
    SandboxViolation {
        kind: SandboxViolationKind,
        plugin: String,
        detail: String,
    },

    #[error("db query failed: {0}")]
    DbQuery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BotError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Zh,
    En,
}

/// Stable (module, code) pair for metrics labels. Code ranges follow the
/// wire-visible numbering: 1xxx core, 2xxx network, 3xxx AI, 4xxx plugin,
/// 6xxx database.
pub fn error_code(err: &BotError) -> (&'static str, u32) {
    match err {
        BotError::ConfigLoad(_) => ("core", 1001),
        BotError::TransportDisconnect(_) => ("network", 2001),
        BotError::RpcTimeout(_) => ("network", 2002),
        BotError::ProtocolViolation(_) => ("network", 2004),
        BotError::AiApi { kind, .. } => (
            "ai",
            match kind {
                AiApiErrorKind::Generic => 3001,
                AiApiErrorKind::RateLimit => 3002,
                AiApiErrorKind::InvalidKey => 3003,
                AiApiErrorKind::EmptyResponse => 3004,
                AiApiErrorKind::UnknownFormat => 3006,
            },
        ),
        BotError::PluginLoad(_) => ("plugin", 4001),
        BotError::PluginRuntime { .. } => ("plugin", 4002),
        BotError::SandboxViolation { .. } => ("plugin", 4003),
        BotError::DbQuery(_) => ("database", 6002),
        BotError::Io(_) => ("core", 1002),
    }
}

/// Render a user-safe reply string for an error. Never includes the
/// internal detail text.
pub fn user_message(err: &BotError, lang: Language) -> String {
    let (zh, en) = match err {
        BotError::AiApi { kind, .. } => match kind {
            AiApiErrorKind::RateLimit => ("AI服务繁忙,请稍后重试", "AI service busy, retry later"),
            AiApiErrorKind::InvalidKey => ("AI服务配置错误", "AI service config error"),
            AiApiErrorKind::EmptyResponse | AiApiErrorKind::UnknownFormat => {
                ("AI服务响应异常", "AI service response error")
            }
            AiApiErrorKind::Generic => ("AI服务暂时不可用", "AI service unavailable"),
        },
        BotError::PluginRuntime { .. } => ("插件处理出错", "Plugin handler error"),
        BotError::DbQuery(_) => ("数据查询失败", "Data query failed"),
        BotError::RpcTimeout(_) | BotError::TransportDisconnect(_) => {
            ("网络请求超时", "Network timeout")
        }
        _ => ("服务暂时不可用", "Service unavailable"),
    };
    match lang {
        Language::Zh => zh.to_string(),
        Language::En => en.to_string(),
    }
}
