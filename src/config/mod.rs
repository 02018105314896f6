//! Bot configuration loaded from an INI file.
//!
//! Sections: `[websocket]` `[plugin]` `[log]` `[general]` `[ai]`. Unknown
//! keys are ignored so older configs keep working. A default file is
//! written when the path does not exist yet.

use crate::error::{BotError, Result};
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub token: String,
    /// Milliseconds between heartbeat pings.
    pub heartbeat_interval: u64,
    /// Milliseconds to wait before a reconnect attempt.
    pub reconnect_interval: u64,
    /// 0 means retry forever.
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3001,
            path: "/".into(),
            token: String::new(),
            heartbeat_interval: 60_000,
            reconnect_interval: 5_000,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub plugins_dir: String,
    pub enable_scripted: bool,
    pub enable_native: bool,
    pub hot_reload_interval_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugins_dir: "plugins".into(),
            enable_scripted: true,
            enable_native: true,
            hot_reload_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_level: String,
    pub console_output: bool,
    pub file_output: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".into(),
            log_level: "info".into(),
            console_output: true,
            file_output: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AiConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub websocket: WebSocketConfig,
    pub plugin: PluginConfig,
    pub log: LogConfig,
    pub ai: AiConfig,
    pub data_dir: String,
    pub admin_port: u16,
    pub master_qq: Vec<i64>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            websocket: WebSocketConfig::default(),
            plugin: PluginConfig::default(),
            log: LogConfig::default(),
            ai: AiConfig::default(),
            data_dir: "data".into(),
            admin_port: 8080,
            master_qq: Vec::new(),
        }
    }
}

impl BotConfig {
    /// Load from `path`, creating a default file when missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = Self::default();
            cfg.save(path)?;
            return Ok(cfg);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| BotError::ConfigLoad(format!("{}: {e}", path.display())))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut cfg = Self::default();
        let mut section = String::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            cfg.apply(&section, key.trim(), value.trim());
        }
        cfg
    }

    fn apply(&mut self, section: &str, key: &str, value: &str) {
        let truthy = value == "true" || value == "1";
        match section {
            "websocket" => match key {
                "host" => self.websocket.host = value.into(),
                "port" => {
                    if let Ok(v) = value.parse() {
                        self.websocket.port = v;
                    }
                }
                "path" => self.websocket.path = value.into(),
                "token" => self.websocket.token = value.into(),
                "heartbeat_interval" => {
                    if let Ok(v) = value.parse() {
                        self.websocket.heartbeat_interval = v;
                    }
                }
                "reconnect_interval" => {
                    if let Ok(v) = value.parse() {
                        self.websocket.reconnect_interval = v;
                    }
                }
                "max_reconnect_attempts" => {
                    if let Ok(v) = value.parse() {
                        self.websocket.max_reconnect_attempts = v;
                    }
                }
                _ => {}
            },
            "plugin" => match key {
                "plugins_dir" => self.plugin.plugins_dir = value.into(),
                "enable_scripted" => self.plugin.enable_scripted = truthy,
                "enable_native" => self.plugin.enable_native = truthy,
                "hot_reload_interval" => {
                    if let Ok(v) = value.parse() {
                        self.plugin.hot_reload_interval_secs = v;
                    }
                }
                _ => {}
            },
            "log" => match key {
                "log_dir" => self.log.log_dir = value.into(),
                "log_level" => self.log.log_level = value.into(),
                "console_output" => self.log.console_output = truthy,
                "file_output" => self.log.file_output = truthy,
                _ => {}
            },
            "general" => match key {
                "data_dir" => self.data_dir = value.into(),
                "admin_port" => {
                    if let Ok(v) = value.parse() {
                        self.admin_port = v;
                    }
                }
                "master_qq" => {
                    self.master_qq = value
                        .split(',')
                        .filter_map(|t| t.trim().parse().ok())
                        .collect();
                }
                _ => {}
            },
            "ai" => match key {
                "api_url" => self.ai.api_url = value.into(),
                "api_key" => self.ai.api_key = value.into(),
                "model" => self.ai.model = value.into(),
                _ => {}
            },
            _ => {}
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut out = String::new();
        let _ = writeln!(out, "[websocket]");
        let _ = writeln!(out, "host={}", self.websocket.host);
        let _ = writeln!(out, "port={}", self.websocket.port);
        let _ = writeln!(out, "path={}", self.websocket.path);
        let _ = writeln!(out, "token={}", self.websocket.token);
        let _ = writeln!(
            out,
            "heartbeat_interval={}",
            self.websocket.heartbeat_interval
        );
        let _ = writeln!(
            out,
            "reconnect_interval={}",
            self.websocket.reconnect_interval
        );
        let _ = writeln!(
            out,
            "max_reconnect_attempts={}",
            self.websocket.max_reconnect_attempts
        );
        let _ = writeln!(out, "\n[plugin]");
        let _ = writeln!(out, "plugins_dir={}", self.plugin.plugins_dir);
        let _ = writeln!(out, "enable_scripted={}", self.plugin.enable_scripted);
        let _ = writeln!(out, "enable_native={}", self.plugin.enable_native);
        let _ = writeln!(
            out,
            "hot_reload_interval={}",
            self.plugin.hot_reload_interval_secs
        );
        let _ = writeln!(out, "\n[log]");
        let _ = writeln!(out, "log_dir={}", self.log.log_dir);
        let _ = writeln!(out, "log_level={}", self.log.log_level);
        let _ = writeln!(out, "console_output={}", self.log.console_output);
        let _ = writeln!(out, "file_output={}", self.log.file_output);
        let _ = writeln!(out, "\n[general]");
        let _ = writeln!(out, "data_dir={}", self.data_dir);
        let _ = writeln!(out, "admin_port={}", self.admin_port);
        if !self.master_qq.is_empty() {
            let joined: Vec<String> = self.master_qq.iter().map(|m| m.to_string()).collect();
            let _ = writeln!(out, "master_qq={}", joined.join(","));
        }
        let _ = writeln!(out, "\n[ai]");
        let _ = writeln!(out, "api_url={}", self.ai.api_url);
        let _ = writeln!(out, "api_key={}", self.ai.api_key);
        let _ = writeln!(out, "model={}", self.ai.model);
        std::fs::write(path, out)?;
        Ok(())
    }
}
