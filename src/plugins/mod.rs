//! Plugin pipeline: registration, priority dispatch, hot reload, and the
//! native / scripted bridges.
//!
//! Three plugin origins share one trait:
//!
//! - **Builtin** — compiled in, registered programmatically
//! - **Native** — a shared library exposing `plugin_create` /
//!   `plugin_destroy`
//! - **Scripted** — source handed to a host-provided [`ScriptRuntime`];
//!   replies come back through the file-backed outbound queue
//!
//! Dispatch walks plugins by priority (descending, load order breaking
//! ties); a handler returning "consumed" stops the walk. Failures are
//! isolated per plugin and never abort the pipeline.

pub mod ai;
pub mod host;
pub mod native;
pub mod script;
pub mod traits;

pub use ai::AiChatPlugin;
pub use host::PluginHost;
pub use native::{NativePlugin, PluginCreateFn, PluginDestroyFn};
pub use script::{ScriptDescriptor, ScriptReply, ScriptRuntime, ScriptedPlugin};
pub use traits::{BotPlugin, PluginContext, PluginDescriptor, PluginInfo, PluginOrigin};
