//! Plugin registry and dispatch pipeline.

use super::native::NativePlugin;
use super::script::{ScriptRuntime, ScriptedPlugin};
use super::traits::{BotPlugin, PluginContext, PluginDescriptor, PluginOrigin};
use crate::error::{BotError, Result};
use crate::event::{MessageEvent, NoticeEvent, RequestEvent};
use crate::sandbox::{Sandbox, SandboxConfig};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

struct LoadedPlugin {
    descriptor: PluginDescriptor,
    handle: Arc<dyn BotPlugin>,
    load_seq: u64,
}

struct HostInner {
    plugins: Vec<LoadedPlugin>,
    next_seq: u64,
}

impl HostInner {
    fn find(&self, name: &str) -> Option<usize> {
        self.plugins
            .iter()
            .position(|p| p.descriptor.info.name == name)
    }

    /// Priority descending, load order breaking ties.
    fn sort(&mut self) {
        self.plugins.sort_by(|a, b| {
            b.descriptor
                .info
                .priority
                .cmp(&a.descriptor.info.priority)
                .then(a.load_seq.cmp(&b.load_seq))
        });
    }
}

pub struct PluginHost {
    inner: Mutex<HostInner>,
    ctx: PluginContext,
    sandbox: Arc<Sandbox>,
    script_runtime: Option<Arc<dyn ScriptRuntime>>,
}

impl PluginHost {
    pub fn new(
        ctx: PluginContext,
        sandbox: Arc<Sandbox>,
        script_runtime: Option<Arc<dyn ScriptRuntime>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HostInner {
                plugins: Vec::new(),
                next_seq: 0,
            }),
            ctx,
            sandbox,
            script_runtime,
        })
    }

    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    fn insert(
        &self,
        handle: Arc<dyn BotPlugin>,
        origin: PluginOrigin,
        script_path: Option<PathBuf>,
        file_mtime: Option<SystemTime>,
    ) -> Result<()> {
        let info = handle.info();
        if info.name.is_empty() {
            return Err(BotError::PluginLoad("plugin has no name".into()));
        }
        let mut inner = self.inner.lock();
        if inner.find(&info.name).is_some() {
            return Err(BotError::PluginLoad(format!(
                "duplicate plugin name: {}",
                info.name
            )));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        tracing::info!(
            plugin = %info.name,
            version = %info.version,
            priority = info.priority,
            ?origin,
            "plugin loaded"
        );
        inner.plugins.push(LoadedPlugin {
            descriptor: PluginDescriptor {
                info,
                enabled: true,
                origin,
                script_path,
                file_mtime,
            },
            handle,
            load_seq: seq,
        });
        inner.sort();
        Ok(())
    }

    /// Register a compiled-in plugin.
    pub async fn register_builtin(&self, plugin: Arc<dyn BotPlugin>) -> Result<()> {
        let name = plugin.info().name;
        plugin
            .on_load(&self.ctx)
            .await
            .map_err(|e| BotError::PluginLoad(format!("{name}: on_load: {e}")))?;
        if self.sandbox.config_of(&name).is_none() {
            self.sandbox.register(&name, SandboxConfig::default());
        }
        self.insert(plugin, PluginOrigin::Builtin, None, None)
    }

    /// Load one native shared-library plugin.
    pub async fn load_native(&self, path: &Path) -> Result<()> {
        let plugin = Arc::new(NativePlugin::load(path)?);
        let name = plugin.info().name;
        plugin
            .on_load(&self.ctx)
            .await
            .map_err(|e| BotError::PluginLoad(format!("{name}: on_load: {e}")))?;
        if self.sandbox.config_of(&name).is_none() {
            self.sandbox.register(&name, SandboxConfig::default());
        }
        self.insert(plugin, PluginOrigin::Native, None, None)
    }

    /// Load one scripted plugin through the configured runtime.
    pub async fn load_scripted(&self, path: &Path) -> Result<()> {
        let runtime = self
            .script_runtime
            .clone()
            .ok_or_else(|| BotError::PluginLoad("no script runtime configured".into()))?;
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let plugin = Arc::new(ScriptedPlugin::load(runtime, path, &self.ctx.masters)?);
        let name = plugin.info().name;
        if self.sandbox.config_of(&name).is_none() {
            self.sandbox.register(&name, SandboxConfig::default());
        }
        self.insert(
            plugin,
            PluginOrigin::Scripted,
            Some(path.to_path_buf()),
            mtime,
        )
    }

    /// Non-recursive directory scan: script-extension files go through
    /// the script runtime, platform dylibs through the native loader.
    pub async fn load_directory(&self, dir: &Path, scripted: bool, native: bool) -> Result<()> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            return Ok(());
        }
        let script_ext = self
            .script_runtime
            .as_ref()
            .map(|r| r.file_extension().to_string());

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        for path in entries {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            // Underscore-prefixed files are helpers, not plugins.
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if stem.starts_with('_') {
                continue;
            }
            if scripted && Some(ext.as_str()) == script_ext.as_deref() {
                if let Err(e) = self.load_scripted(&path).await {
                    tracing::error!(path = %path.display(), error = %e, "scripted plugin load failed");
                }
            } else if native && ext == std::env::consts::DLL_EXTENSION {
                if let Err(e) = self.load_native(&path).await {
                    tracing::error!(path = %path.display(), error = %e, "native plugin load failed");
                }
            }
        }
        Ok(())
    }

    /// Unload one plugin (runs `on_unload`). The sandbox registration is
    /// left in place so a reload keeps its descriptor.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let removed = {
            let mut inner = self.inner.lock();
            let idx = inner
                .find(name)
                .ok_or_else(|| BotError::PluginLoad(format!("no such plugin: {name}")))?;
            inner.plugins.remove(idx)
        };
        removed.handle.on_unload(&self.ctx).await;
        tracing::info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Shutdown path: `on_disable` then `on_unload` for every plugin.
    pub async fn unload_all(&self) {
        let drained: Vec<LoadedPlugin> = {
            let mut inner = self.inner.lock();
            inner.plugins.drain(..).collect()
        };
        for plugin in drained {
            if plugin.descriptor.enabled {
                plugin.handle.on_disable(&self.ctx).await;
            }
            plugin.handle.on_unload(&self.ctx).await;
            self.sandbox.unregister(&plugin.descriptor.info.name);
        }
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let handle = {
            let mut inner = self.inner.lock();
            let idx = inner
                .find(name)
                .ok_or_else(|| BotError::PluginLoad(format!("no such plugin: {name}")))?;
            let plugin = &mut inner.plugins[idx];
            if plugin.descriptor.enabled == enabled {
                return Ok(());
            }
            plugin.descriptor.enabled = enabled;
            plugin.handle.clone()
        };
        if enabled {
            handle.on_enable(&self.ctx).await;
        } else {
            handle.on_disable(&self.ctx).await;
        }
        tracing::info!(plugin = %name, enabled, "plugin toggled");
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .find(name)
            .map(|idx| inner.plugins[idx].descriptor.enabled)
            .unwrap_or(false)
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.inner
            .lock()
            .plugins
            .iter()
            .map(|p| p.descriptor.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().plugins.len()
    }

    fn enabled_snapshot(&self) -> Vec<(String, Arc<dyn BotPlugin>)> {
        self.inner
            .lock()
            .plugins
            .iter()
            .filter(|p| p.descriptor.enabled)
            .map(|p| (p.descriptor.info.name.clone(), p.handle.clone()))
            .collect()
    }

    /// Run one handler under the sandbox deadline with panic isolation.
    /// `Ok(true)` means the event was consumed.
    async fn run_handler<F>(&self, name: &str, fut: F) -> bool
    where
        F: std::future::Future<Output = anyhow::Result<bool>>,
    {
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        let outcome = self.sandbox.execute_with_timeout(name, guarded, None).await;
        match outcome {
            Ok(Ok(Ok(consumed))) => {
                self.ctx.metrics.record_plugin_execution(name, true);
                consumed
            }
            Ok(Ok(Err(e))) => {
                self.ctx.metrics.record_plugin_execution(name, false);
                tracing::error!(plugin = %name, error = %e, "plugin handler failed");
                false
            }
            Ok(Err(_panic)) => {
                self.ctx.metrics.record_plugin_execution(name, false);
                tracing::error!(plugin = %name, "plugin handler panicked");
                false
            }
            Err(e) => {
                self.ctx.metrics.record_plugin_execution(name, false);
                tracing::error!(plugin = %name, error = %e, "plugin handler timed out");
                false
            }
        }
    }

    /// Walk plugins by priority: `on_message`, then the private/group
    /// specialization. Any consumed result stops the walk.
    pub async fn dispatch_message(&self, event: &MessageEvent) -> bool {
        for (name, plugin) in self.enabled_snapshot() {
            if self
                .run_handler(&name, plugin.on_message(event, &self.ctx))
                .await
            {
                return true;
            }
            let consumed = if event.is_private() {
                self.run_handler(&name, plugin.on_private_message(event, &self.ctx))
                    .await
            } else {
                self.run_handler(&name, plugin.on_group_message(event, &self.ctx))
                    .await
            };
            if consumed {
                return true;
            }
        }
        false
    }

    pub async fn dispatch_notice(&self, event: &NoticeEvent) -> bool {
        for (name, plugin) in self.enabled_snapshot() {
            if self
                .run_handler(&name, plugin.on_notice(event, &self.ctx))
                .await
            {
                return true;
            }
        }
        false
    }

    pub async fn dispatch_request(&self, event: &RequestEvent) -> bool {
        for (name, plugin) in self.enabled_snapshot() {
            if self
                .run_handler(&name, plugin.on_request(event, &self.ctx))
                .await
            {
                return true;
            }
        }
        false
    }

    // ── hot reload ──────────────────────────────────────────────

    /// One reload pass over the plugin directory: new script files load,
    /// files whose mtime changed reload in place keeping their enabled
    /// state and sandbox descriptor.
    pub async fn check_reload(&self, dir: &Path) {
        let Some(runtime) = self.script_runtime.clone() else {
            return;
        };
        let ext = runtime.file_extension().to_string();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                != Some(ext.clone())
            {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if stem.starts_with('_') {
                continue;
            }
            let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

            let existing = {
                let inner = self.inner.lock();
                inner
                    .plugins
                    .iter()
                    .find(|p| p.descriptor.script_path.as_deref() == Some(path.as_path()))
                    .map(|p| (p.descriptor.info.name.clone(), p.descriptor.file_mtime))
            };

            match existing {
                None => {
                    tracing::info!(path = %path.display(), "new scripted plugin detected");
                    if let Err(e) = self.load_scripted(&path).await {
                        tracing::error!(path = %path.display(), error = %e, "hot load failed");
                    }
                }
                Some((name, old_mtime)) if old_mtime != mtime && mtime.is_some() => {
                    tracing::info!(plugin = %name, "scripted plugin modified, reloading");
                    if let Err(e) = self.reload_scripted(&name, &path).await {
                        tracing::error!(plugin = %name, error = %e, "hot reload failed");
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// In-place reload of one scripted plugin.
    async fn reload_scripted(&self, name: &str, path: &Path) -> Result<()> {
        let was_enabled = self.is_enabled(name);
        // Sandbox registration survives: unload() does not unregister.
        self.unload(name).await?;
        self.load_scripted(path).await?;
        if !was_enabled {
            // Re-disable quietly without running on_disable again.
            let mut inner = self.inner.lock();
            if let Some(idx) = inner.find(name) {
                inner.plugins[idx].descriptor.enabled = false;
            }
        }
        Ok(())
    }

    /// Force-reload every scripted plugin from disk (admin `/api/reload`).
    pub async fn reload_all_scripted(&self, dir: &Path) {
        let targets: Vec<(String, PathBuf)> = {
            let inner = self.inner.lock();
            inner
                .plugins
                .iter()
                .filter(|p| p.descriptor.origin == PluginOrigin::Scripted)
                .filter_map(|p| {
                    p.descriptor
                        .script_path
                        .clone()
                        .map(|path| (p.descriptor.info.name.clone(), path))
                })
                .collect()
        };
        for (name, path) in targets {
            if let Err(e) = self.reload_scripted(&name, &path).await {
                tracing::error!(plugin = %name, error = %e, "forced reload failed");
            }
        }
        self.check_reload(dir).await;
    }

    pub fn start_hot_reload(
        self: &Arc<Self>,
        dir: PathBuf,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let host = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(host) = host.upgrade() else { break };
                host.check_reload(&dir).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiClient;
    use crate::cache::ResponseCache;
    use crate::config::AiConfig;
    use crate::context::ContextStore;
    use crate::event::MessageKind;
    use crate::metrics::BotMetrics;
    use crate::outbound::OutboundQueue;
    use crate::permissions::PermissionStore;
    use crate::personality::PersonalitySystem;
    use crate::plugins::script::testing::FakeRuntime;
    use crate::plugins::script::ScriptReply;
    use crate::plugins::traits::PluginInfo;
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use crate::rpc::RpcGateway;
    use crate::stats::Statistics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_context(tmp: &TempDir) -> PluginContext {
        PluginContext {
            api: RpcGateway::new(Duration::from_secs(1)),
            history: Arc::new(ContextStore::open(&tmp.path().join("ctx.db")).unwrap()),
            personalities: Arc::new(PersonalitySystem::new(None)),
            ai: Arc::new(AiClient::new(&AiConfig::default())),
            cache: Arc::new(ResponseCache::new(1024 * 1024, 3600, None)),
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            metrics: Arc::new(BotMetrics::new()),
            stats: Arc::new(Statistics::new()),
            permissions: Arc::new(
                PermissionStore::open(&tmp.path().join("perms.json")).unwrap(),
            ),
            queue: OutboundQueue::new(tmp.path()).unwrap(),
            masters: vec![999],
        }
    }

    fn host_with(
        tmp: &TempDir,
        runtime: Option<Arc<dyn ScriptRuntime>>,
    ) -> Arc<PluginHost> {
        PluginHost::new(test_context(tmp), Arc::new(Sandbox::new()), runtime)
    }

    struct OrderedPlugin {
        name: String,
        priority: i32,
        consume: bool,
        calls: Arc<Mutex<Vec<String>>>,
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BotPlugin for OrderedPlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                name: self.name.clone(),
                priority: self.priority,
                ..Default::default()
            }
        }

        async fn on_message(
            &self,
            _event: &MessageEvent,
            _ctx: &PluginContext,
        ) -> anyhow::Result<bool> {
            self.calls.lock().push(self.name.clone());
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(self.consume)
        }
    }

    struct PanickyPlugin;

    #[async_trait]
    impl BotPlugin for PanickyPlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                name: "panicky".into(),
                priority: 100,
                ..Default::default()
            }
        }

        async fn on_message(
            &self,
            _event: &MessageEvent,
            _ctx: &PluginContext,
        ) -> anyhow::Result<bool> {
            panic!("intentional panic");
        }
    }

    fn group_event() -> MessageEvent {
        MessageEvent {
            kind: Some(MessageKind::Group),
            group_id: 7,
            user_id: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatch_walks_priority_order_and_stops_on_consume() {
        let tmp = TempDir::new().unwrap();
        let host = host_with(&tmp, None);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        let count_c = Arc::new(AtomicUsize::new(0));

        // Registered out of priority order on purpose.
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "b".into(),
            priority: 50,
            consume: true,
            calls: calls.clone(),
            invocations: count_b.clone(),
        }))
        .await
        .unwrap();
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "a".into(),
            priority: 100,
            consume: false,
            calls: calls.clone(),
            invocations: count_a.clone(),
        }))
        .await
        .unwrap();
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "c".into(),
            priority: 10,
            consume: false,
            calls: calls.clone(),
            invocations: count_c.clone(),
        }))
        .await
        .unwrap();

        let consumed = host.dispatch_message(&group_event()).await;
        assert!(consumed);
        assert_eq!(calls.lock().as_slice(), ["a", "b"]);
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(count_c.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn equal_priority_ties_break_by_load_order() {
        let tmp = TempDir::new().unwrap();
        let host = host_with(&tmp, None);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        for name in ["first", "second"] {
            host.register_builtin(Arc::new(OrderedPlugin {
                name: name.into(),
                priority: 42,
                consume: false,
                calls: calls.clone(),
                invocations: counter.clone(),
            }))
            .await
            .unwrap();
        }
        host.dispatch_message(&group_event()).await;
        assert_eq!(calls.lock().as_slice(), ["first", "second"]);
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let tmp = TempDir::new().unwrap();
        let host = host_with(&tmp, None);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "dup".into(),
            priority: 0,
            consume: false,
            calls: calls.clone(),
            invocations: counter.clone(),
        }))
        .await
        .unwrap();
        let err = host
            .register_builtin(Arc::new(OrderedPlugin {
                name: "dup".into(),
                priority: 0,
                consume: false,
                calls,
                invocations: counter,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::PluginLoad(_)));
        assert_eq!(host.count(), 1);
    }

    #[tokio::test]
    async fn panicking_plugin_does_not_stop_the_walk() {
        let tmp = TempDir::new().unwrap();
        let host = host_with(&tmp, None);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        host.register_builtin(Arc::new(PanickyPlugin)).await.unwrap();
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "survivor".into(),
            priority: 1,
            consume: false,
            calls: calls.clone(),
            invocations: counter.clone(),
        }))
        .await
        .unwrap();

        host.dispatch_message(&group_event()).await;
        assert_eq!(calls.lock().as_slice(), ["survivor"]);
    }

    #[tokio::test]
    async fn disabled_plugins_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let host = host_with(&tmp, None);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "toggle".into(),
            priority: 1,
            consume: false,
            calls: calls.clone(),
            invocations: counter.clone(),
        }))
        .await
        .unwrap();

        host.set_enabled("toggle", false).await.unwrap();
        host.dispatch_message(&group_event()).await;
        assert!(calls.lock().is_empty());

        host.set_enabled("toggle", true).await.unwrap();
        host.dispatch_message(&group_event()).await;
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn unload_then_load_keeps_count_stable() {
        let tmp = TempDir::new().unwrap();
        let host = host_with(&tmp, None);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let before = host.count();
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "transient".into(),
            priority: 0,
            consume: false,
            calls: calls.clone(),
            invocations: counter.clone(),
        }))
        .await
        .unwrap();
        let loaded = host.descriptors();
        host.unload("transient").await.unwrap();
        assert_eq!(host.count(), before);
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "transient".into(),
            priority: 0,
            consume: false,
            calls,
            invocations: counter,
        }))
        .await
        .unwrap();
        let reloaded = host.descriptors();
        let a = loaded.iter().find(|d| d.info.name == "transient").unwrap();
        let b = reloaded.iter().find(|d| d.info.name == "transient").unwrap();
        assert_eq!(a.info, b.info);
        assert_eq!(a.enabled, b.enabled);
    }

    #[tokio::test]
    async fn scripted_plugin_loads_from_directory_scan() {
        let tmp = TempDir::new().unwrap();
        let plugins_dir = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins_dir).unwrap();
        std::fs::write(plugins_dir.join("hello.py"), "priority=60\n").unwrap();
        std::fs::write(plugins_dir.join("_helper.py"), "not a plugin\n").unwrap();
        std::fs::write(plugins_dir.join("notes.txt"), "ignored\n").unwrap();

        let runtime = Arc::new(FakeRuntime::default());
        let host = host_with(&tmp, Some(runtime.clone()));
        host.load_directory(&plugins_dir, true, true).await.unwrap();

        assert_eq!(host.count(), 1);
        let descriptor = &host.descriptors()[0];
        assert_eq!(descriptor.info.name, "hello");
        assert_eq!(descriptor.info.priority, 60);
        assert_eq!(descriptor.origin, PluginOrigin::Scripted);
        assert!(descriptor.file_mtime.is_some());
    }

    #[tokio::test]
    async fn scripted_replies_reach_the_outbound_queue() {
        let tmp = TempDir::new().unwrap();
        let plugins_dir = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins_dir).unwrap();
        std::fs::write(plugins_dir.join("echoer.py"), "priority=50\n").unwrap();

        let runtime = Arc::new(FakeRuntime::default());
        let host = host_with(&tmp, Some(runtime.clone()));
        host.load_directory(&plugins_dir, true, false).await.unwrap();

        runtime.queue_reply(
            "echoer",
            ScriptReply {
                action: "send_group_msg".into(),
                target_id: 7,
                message: "scripted pong".into(),
            },
        );
        host.dispatch_message(&group_event()).await;

        let queue_text =
            std::fs::read_to_string(host.context().queue.path()).unwrap();
        assert!(queue_text.contains("scripted pong"));
        assert!(queue_text.contains("\"target_id\":7"));
    }

    // Hot reload: a new file loads, a modified file reloads in place with
    // its new priority taking effect in dispatch order.
    #[tokio::test]
    async fn hot_reload_detects_new_and_modified_files() {
        let tmp = TempDir::new().unwrap();
        let plugins_dir = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins_dir).unwrap();

        let runtime = Arc::new(FakeRuntime::default());
        let host = host_with(&tmp, Some(runtime.clone()));

        let calls = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        host.register_builtin(Arc::new(OrderedPlugin {
            name: "resident".into(),
            priority: 50,
            consume: false,
            calls,
            invocations: counter,
        }))
        .await
        .unwrap();

        // New file appears.
        let script = plugins_dir.join("p.py");
        std::fs::write(&script, "priority=10\n").unwrap();
        host.check_reload(&plugins_dir).await;
        assert_eq!(host.count(), 2);
        assert!(runtime
            .state
            .lock()
            .lifecycle_calls
            .contains(&("p".to_string(), "on_load".to_string())));
        let order: Vec<String> = host
            .descriptors()
            .iter()
            .map(|d| d.info.name.clone())
            .collect();
        assert_eq!(order, ["resident", "p"]);

        // Same file rewritten with a higher priority and a bumped mtime.
        std::fs::write(&script, "priority=90\n").unwrap();
        let bumped = std::time::SystemTime::now() + Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&script).unwrap();
        file.set_modified(bumped).unwrap();
        drop(file);

        host.check_reload(&plugins_dir).await;
        assert_eq!(host.count(), 2);
        let descriptors = host.descriptors();
        let p = descriptors.iter().find(|d| d.info.name == "p").unwrap();
        assert_eq!(p.info.priority, 90);
        let order: Vec<String> = descriptors.iter().map(|d| d.info.name.clone()).collect();
        assert_eq!(order, ["p", "resident"]);
    }

    #[tokio::test]
    async fn hot_reload_preserves_disabled_state() {
        let tmp = TempDir::new().unwrap();
        let plugins_dir = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins_dir).unwrap();
        let script = plugins_dir.join("sleepy.py");
        std::fs::write(&script, "priority=10\n").unwrap();

        let runtime = Arc::new(FakeRuntime::default());
        let host = host_with(&tmp, Some(runtime.clone()));
        host.check_reload(&plugins_dir).await;
        host.set_enabled("sleepy", false).await.unwrap();

        std::fs::write(&script, "priority=20\n").unwrap();
        let file = std::fs::File::options().write(true).open(&script).unwrap();
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);
        host.check_reload(&plugins_dir).await;

        assert!(!host.is_enabled("sleepy"));
        let descriptors = host.descriptors();
        let p = descriptors.iter().find(|d| d.info.name == "sleepy").unwrap();
        assert_eq!(p.info.priority, 20);
    }
}
