//! Native plugins: shared libraries exposing `plugin_create` /
//! `plugin_destroy`.
//!
//! The create symbol returns a raw `Box<dyn BotPlugin>` (double-boxed so
//! the fat pointer crosses the C ABI as one thin pointer); the destroy
//! symbol takes it back. The library handle outlives the instance and is
//! dropped only after `plugin_destroy` has run.

use super::traits::{BotPlugin, PluginContext, PluginInfo};
use crate::error::{BotError, Result};
use crate::event::{MessageEvent, NoticeEvent, RequestEvent};
use async_trait::async_trait;
use libloading::Library;
use std::path::Path;

pub type PluginCreateFn = unsafe extern "C" fn() -> *mut Box<dyn BotPlugin>;
pub type PluginDestroyFn = unsafe extern "C" fn(*mut Box<dyn BotPlugin>);

/// Emit the two exported symbols for a plugin crate built as a cdylib.
#[macro_export]
macro_rules! declare_plugin {
    ($plugin_type:ty, $constructor:expr) => {
        #[no_mangle]
        pub extern "C" fn plugin_create() -> *mut Box<dyn $crate::plugins::BotPlugin> {
            let plugin: Box<dyn $crate::plugins::BotPlugin> = Box::new($constructor);
            Box::into_raw(Box::new(plugin))
        }

        #[no_mangle]
        /// # Safety
        /// `raw` must come from `plugin_create` and not be used again.
        pub unsafe extern "C" fn plugin_destroy(raw: *mut Box<dyn $crate::plugins::BotPlugin>) {
            drop(Box::from_raw(raw));
        }
    };
}

#[derive(Debug)]
pub struct NativePlugin {
    raw: *mut Box<dyn BotPlugin>,
    destroy: PluginDestroyFn,
    // Declared last: the instance must die before the library unloads.
    _library: Library,
}

// The contract requires plugin instances to be Send + Sync (they are
// `dyn BotPlugin`); the raw pointer is only a stable address for them.
unsafe impl Send for NativePlugin {}
unsafe impl Sync for NativePlugin {}

impl NativePlugin {
    pub fn load(path: &Path) -> Result<Self> {
        let library = unsafe { Library::new(path) }
            .map_err(|e| BotError::PluginLoad(format!("{}: {e}", path.display())))?;

        let create: PluginCreateFn = unsafe {
            *library
                .get::<PluginCreateFn>(b"plugin_create\0")
                .map_err(|e| {
                    BotError::PluginLoad(format!("{}: missing plugin_create: {e}", path.display()))
                })?
        };
        let destroy: PluginDestroyFn = unsafe {
            *library
                .get::<PluginDestroyFn>(b"plugin_destroy\0")
                .map_err(|e| {
                    BotError::PluginLoad(format!(
                        "{}: missing plugin_destroy: {e}",
                        path.display()
                    ))
                })?
        };

        let raw = unsafe { create() };
        if raw.is_null() {
            return Err(BotError::PluginLoad(format!(
                "{}: plugin_create returned null",
                path.display()
            )));
        }

        Ok(Self {
            raw,
            destroy,
            _library: library,
        })
    }

    fn plugin(&self) -> &dyn BotPlugin {
        unsafe { (*self.raw).as_ref() }
    }
}

impl Drop for NativePlugin {
    fn drop(&mut self) {
        unsafe { (self.destroy)(self.raw) };
    }
}

#[async_trait]
impl BotPlugin for NativePlugin {
    fn info(&self) -> PluginInfo {
        self.plugin().info()
    }

    async fn on_load(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        self.plugin().on_load(ctx).await
    }

    async fn on_unload(&self, ctx: &PluginContext) {
        self.plugin().on_unload(ctx).await;
    }

    async fn on_enable(&self, ctx: &PluginContext) {
        self.plugin().on_enable(ctx).await;
    }

    async fn on_disable(&self, ctx: &PluginContext) {
        self.plugin().on_disable(ctx).await;
    }

    async fn on_message(&self, event: &MessageEvent, ctx: &PluginContext) -> anyhow::Result<bool> {
        self.plugin().on_message(event, ctx).await
    }

    async fn on_private_message(
        &self,
        event: &MessageEvent,
        ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        self.plugin().on_private_message(event, ctx).await
    }

    async fn on_group_message(
        &self,
        event: &MessageEvent,
        ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        self.plugin().on_group_message(event, ctx).await
    }

    async fn on_notice(&self, event: &NoticeEvent, ctx: &PluginContext) -> anyhow::Result<bool> {
        self.plugin().on_notice(event, ctx).await
    }

    async fn on_request(&self, event: &RequestEvent, ctx: &PluginContext) -> anyhow::Result<bool> {
        self.plugin().on_request(event, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_a_nonexistent_library_fails_cleanly() {
        let err = NativePlugin::load(Path::new("/nonexistent/libplugin.so")).unwrap_err();
        assert!(matches!(err, BotError::PluginLoad(_)));
    }

    #[test]
    fn loading_a_non_library_file_fails_cleanly() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("not_a_lib.so");
        std::fs::write(&path, b"definitely not ELF").unwrap();
        let err = NativePlugin::load(&path).unwrap_err();
        assert!(matches!(err, BotError::PluginLoad(_)));
    }
}
