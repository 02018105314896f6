//! Cooperative per-plugin sandbox: permission bits, resource quotas, and
//! a bounded violation log.
//!
//! The host calls the check methods before any gated operation on a
//! plugin's behalf. This is quota enforcement, not OS-level isolation;
//! a plugin that never asks is only caught by the execution timeout.

use crate::error::{BotError, Result, SandboxViolationKind};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ_CONFIG: Permissions = Permissions(1);
    pub const WRITE_CONFIG: Permissions = Permissions(1 << 1);
    pub const NETWORK_ACCESS: Permissions = Permissions(1 << 2);
    pub const FILE_READ: Permissions = Permissions(1 << 3);
    pub const FILE_WRITE: Permissions = Permissions(1 << 4);
    pub const EXECUTE_COMMAND: Permissions = Permissions(1 << 5);
    pub const SEND_MESSAGE: Permissions = Permissions(1 << 6);
    pub const READ_HISTORY: Permissions = Permissions(1 << 7);
    pub const ADMIN_API: Permissions = Permissions(1 << 8);
    pub const ALL: Permissions = Permissions(0x1FF);

    pub fn contains(self, required: Permissions) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;
    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_memory_bytes: i64,
    pub max_execution_time_ms: u64,
    pub max_network_requests: u32,
    pub max_file_operations: u32,
    pub max_messages_per_minute: u32,
    pub allowed_paths: Vec<String>,
    pub allowed_hosts: Vec<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 * 1024 * 1024,
            max_execution_time_ms: 30_000,
            max_network_requests: 100,
            max_file_operations: 1000,
            max_messages_per_minute: 60,
            allowed_paths: Vec::new(),
            allowed_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub permissions: Permissions,
    pub limits: ResourceLimits,
    pub enabled: bool,
    pub kill_on_violation: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            permissions: Permissions::SEND_MESSAGE | Permissions::READ_HISTORY,
            limits: ResourceLimits::default(),
            enabled: true,
            kill_on_violation: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ResourceUsage {
    pub memory_bytes: i64,
    pub cpu_time_us: i64,
    pub network_requests: u32,
    pub file_operations: u32,
    pub messages_sent: u32,
    pub violations: u32,
}

#[derive(Debug, Clone)]
pub struct PluginSandboxStats {
    pub plugin: String,
    pub enabled: bool,
    pub permissions: u32,
    pub usage: ResourceUsage,
}

struct Registered {
    config: SandboxConfig,
    usage: ResourceUsage,
    last_reset: Instant,
}

const VIOLATION_LOG_CAP: usize = 10_000;
const VIOLATION_LOG_TRIM: usize = 1_000;

pub struct Sandbox {
    inner: Mutex<SandboxInner>,
}

struct SandboxInner {
    plugins: HashMap<String, Registered>,
    violations: VecDeque<(String, String)>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SandboxInner {
                plugins: HashMap::new(),
                violations: VecDeque::new(),
            }),
        }
    }

    pub fn register(&self, plugin: &str, config: SandboxConfig) {
        let mut inner = self.inner.lock();
        inner.plugins.insert(
            plugin.to_string(),
            Registered {
                config,
                usage: ResourceUsage::default(),
                last_reset: Instant::now(),
            },
        );
        tracing::info!(plugin, "sandbox registered");
    }

    pub fn unregister(&self, plugin: &str) {
        self.inner.lock().plugins.remove(plugin);
    }

    /// Pull the descriptor back out (used to preserve it across a hot
    /// reload).
    pub fn config_of(&self, plugin: &str) -> Option<SandboxConfig> {
        self.inner.lock().plugins.get(plugin).map(|r| r.config.clone())
    }

    pub fn set_permissions(&self, plugin: &str, permissions: Permissions) {
        if let Some(reg) = self.inner.lock().plugins.get_mut(plugin) {
            reg.config.permissions = permissions;
        }
    }

    pub fn set_limits(&self, plugin: &str, limits: ResourceLimits) {
        if let Some(reg) = self.inner.lock().plugins.get_mut(plugin) {
            reg.config.limits = limits;
        }
    }

    pub fn set_enabled(&self, plugin: &str, enabled: bool) {
        if let Some(reg) = self.inner.lock().plugins.get_mut(plugin) {
            reg.config.enabled = enabled;
        }
    }

    fn violation(
        inner: &mut SandboxInner,
        plugin: &str,
        kind: SandboxViolationKind,
        detail: &str,
    ) -> BotError {
        if let Some(reg) = inner.plugins.get_mut(plugin) {
            reg.usage.violations += 1;
            if reg.config.kill_on_violation {
                reg.config.enabled = false;
                tracing::warn!(plugin, "plugin disabled after sandbox violation");
            }
        }
        inner
            .violations
            .push_back((plugin.to_string(), detail.to_string()));
        while inner.violations.len() > VIOLATION_LOG_CAP {
            for _ in 0..VIOLATION_LOG_TRIM {
                inner.violations.pop_front();
            }
        }
        tracing::warn!(plugin, detail, "sandbox violation");
        BotError::SandboxViolation {
            kind,
            plugin: plugin.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Required bits must all be granted.
    pub fn check_permission(&self, plugin: &str, required: Permissions) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(reg) = inner.plugins.get(plugin) else {
            return Err(BotError::SandboxViolation {
                kind: SandboxViolationKind::Permission,
                plugin: plugin.to_string(),
                detail: "plugin not registered".into(),
            });
        };
        if !reg.config.enabled {
            return Err(BotError::SandboxViolation {
                kind: SandboxViolationKind::Permission,
                plugin: plugin.to_string(),
                detail: "sandbox disabled".into(),
            });
        }
        if reg.config.permissions.contains(required) {
            Ok(())
        } else {
            Err(Self::violation(
                &mut inner,
                plugin,
                SandboxViolationKind::Permission,
                &format!("permission denied: {:#x}", required.bits()),
            ))
        }
    }

    /// Permission + request-count quota + host allow-list (substring).
    pub fn check_network(&self, plugin: &str, host: &str) -> Result<()> {
        self.check_permission(plugin, Permissions::NETWORK_ACCESS)?;
        let mut inner = self.inner.lock();
        let Some(reg) = inner.plugins.get(plugin) else {
            return Ok(());
        };
        if !reg.config.limits.allowed_hosts.is_empty()
            && !reg
                .config
                .limits
                .allowed_hosts
                .iter()
                .any(|allowed| host.contains(allowed.as_str()))
        {
            return Err(Self::violation(
                &mut inner,
                plugin,
                SandboxViolationKind::HostDenied,
                &format!("host not allowed: {host}"),
            ));
        }
        let reg = inner.plugins.get(plugin).expect("checked above");
        if reg.usage.network_requests >= reg.config.limits.max_network_requests {
            return Err(Self::violation(
                &mut inner,
                plugin,
                SandboxViolationKind::Quota,
                "network request limit exceeded",
            ));
        }
        if let Some(reg) = inner.plugins.get_mut(plugin) {
            reg.usage.network_requests += 1;
        }
        Ok(())
    }

    /// Permission + op-count quota + path-prefix allow-list.
    pub fn check_file(&self, plugin: &str, path: &str, is_write: bool) -> Result<()> {
        let required = if is_write {
            Permissions::FILE_WRITE
        } else {
            Permissions::FILE_READ
        };
        self.check_permission(plugin, required)?;
        let mut inner = self.inner.lock();
        let Some(reg) = inner.plugins.get(plugin) else {
            return Ok(());
        };
        if !reg.config.limits.allowed_paths.is_empty()
            && !reg
                .config
                .limits
                .allowed_paths
                .iter()
                .any(|allowed| path.starts_with(allowed.as_str()))
        {
            return Err(Self::violation(
                &mut inner,
                plugin,
                SandboxViolationKind::PathDenied,
                &format!("path not allowed: {path}"),
            ));
        }
        let reg = inner.plugins.get(plugin).expect("checked above");
        if reg.usage.file_operations >= reg.config.limits.max_file_operations {
            return Err(Self::violation(
                &mut inner,
                plugin,
                SandboxViolationKind::Quota,
                "file operation limit exceeded",
            ));
        }
        if let Some(reg) = inner.plugins.get_mut(plugin) {
            reg.usage.file_operations += 1;
        }
        Ok(())
    }

    /// Permission + per-minute message quota.
    pub fn check_send_message(&self, plugin: &str) -> Result<()> {
        self.check_permission(plugin, Permissions::SEND_MESSAGE)?;
        let mut inner = self.inner.lock();
        let Some(reg) = inner.plugins.get(plugin) else {
            return Ok(());
        };
        if reg.usage.messages_sent >= reg.config.limits.max_messages_per_minute {
            return Err(Self::violation(
                &mut inner,
                plugin,
                SandboxViolationKind::Quota,
                "message rate limit exceeded",
            ));
        }
        if let Some(reg) = inner.plugins.get_mut(plugin) {
            reg.usage.messages_sent += 1;
        }
        Ok(())
    }

    pub fn record_memory(&self, plugin: &str, bytes: i64) {
        let mut inner = self.inner.lock();
        let over = match inner.plugins.get_mut(plugin) {
            Some(reg) => {
                reg.usage.memory_bytes = bytes;
                bytes > reg.config.limits.max_memory_bytes
            }
            None => false,
        };
        if over {
            let _ = Self::violation(
                &mut inner,
                plugin,
                SandboxViolationKind::Quota,
                "memory limit exceeded",
            );
        }
    }

    pub fn record_cpu_us(&self, plugin: &str, delta_us: i64) {
        if let Some(reg) = self.inner.lock().plugins.get_mut(plugin) {
            reg.usage.cpu_time_us += delta_us;
        }
    }

    /// Run a plugin future under the execution deadline. `timeout_ms` of
    /// `None` uses the plugin's configured limit.
    pub async fn execute_with_timeout<F, T>(
        &self,
        plugin: &str,
        fut: F,
        timeout_ms: Option<u64>,
    ) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let limit = timeout_ms.unwrap_or_else(|| {
            self.inner
                .lock()
                .plugins
                .get(plugin)
                .map(|r| r.config.limits.max_execution_time_ms)
                .unwrap_or(30_000)
        });
        if limit == 0 {
            return Ok(fut.await);
        }
        match tokio::time::timeout(Duration::from_millis(limit), fut).await {
            Ok(value) => Ok(value),
            Err(_) => {
                let mut inner = self.inner.lock();
                Err(Self::violation(
                    &mut inner,
                    plugin,
                    SandboxViolationKind::Timeout,
                    &format!("execution exceeded {limit}ms"),
                ))
            }
        }
    }

    pub fn is_enabled(&self, plugin: &str) -> bool {
        self.inner
            .lock()
            .plugins
            .get(plugin)
            .map(|r| r.config.enabled)
            .unwrap_or(false)
    }

    pub fn all_stats(&self) -> Vec<PluginSandboxStats> {
        let inner = self.inner.lock();
        inner
            .plugins
            .iter()
            .map(|(name, reg)| PluginSandboxStats {
                plugin: name.clone(),
                enabled: reg.config.enabled,
                permissions: reg.config.permissions.bits(),
                usage: reg.usage.clone(),
            })
            .collect()
    }

    pub fn violation_log(&self, limit: usize) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        let skip = inner.violations.len().saturating_sub(limit);
        inner.violations.iter().skip(skip).cloned().collect()
    }

    /// Reset the per-minute counters; meant to run once a minute.
    pub fn reset_minute_counters(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        for reg in inner.plugins.values_mut() {
            if now.duration_since(reg.last_reset) >= Duration::from_secs(60) {
                reg.usage.messages_sent = 0;
                reg.usage.network_requests = 0;
                reg.usage.file_operations = 0;
                reg.last_reset = now;
            }
        }
    }

    pub fn start_monitor(
        self: &std::sync::Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let sandbox = std::sync::Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sandbox) = sandbox.upgrade() else { break };
                sandbox.reset_minute_counters();
            }
        })
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}
