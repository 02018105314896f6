//! Builtin AI chat plugin.
//!
//! Group messages engage only when the bot is @-mentioned; private
//! messages engage directly. `/`-prefixed input is a command, anything
//! else is a chat turn: history window + persona prompt to the upstream
//! endpoint, reply quoted back, assistant turn recorded into history.

use super::traits::{BotPlugin, PluginContext, PluginInfo};
use crate::ai;
use crate::cache::ResponseCache;
use crate::error::{user_message, Language};
use crate::event::MessageEvent;
use crate::ratelimit::RateLimitResult;
use async_trait::async_trait;
use std::time::Instant;

pub const PLUGIN_NAME: &str = "ai_chat";
const RATE_KEY: &str = "ai_chat";

pub struct AiChatPlugin;

impl AiChatPlugin {
    pub fn new() -> Self {
        Self
    }

    /// Strip the at-mention segment text out of the raw message. Returns
    /// `None` when the bot is not mentioned.
    fn mentioned_text(event: &MessageEvent) -> Option<String> {
        if !event.mentions(event.self_id) {
            return None;
        }
        let text = event.plain_text().trim().to_string();
        Some(text)
    }

    async fn handle_command(&self, event: &MessageEvent, ctx: &PluginContext, input: &str) -> bool {
        let (command, args) = match input.split_once(' ') {
            Some((cmd, rest)) => (cmd.to_ascii_lowercase(), rest.trim().to_string()),
            None => (input.to_ascii_lowercase(), String::new()),
        };

        let persona_name = if event.is_group() {
            ctx.personalities.name_for_group(event.group_id)
        } else {
            ctx.personalities.current_name()
        };

        match command.as_str() {
            "/help" => {
                let help = format!(
                    "=== {persona_name} ===\n\
                     /help - show this help\n\
                     /status - runtime status\n\
                     /clear - clear conversation context\n\
                     /persona - list personas\n\
                     /persona <id> - switch persona\n\
                     /about - about this bot\n\
                     \nChat: @ the bot followed by your message"
                );
                ctx.reply_quoted(event, &help);
                true
            }
            "/status" => {
                let status = format!(
                    "=== status ===\n\
                     state: running\n\
                     persona: {persona_name}\n\
                     model: {}\n\
                     protocol: OneBot 11",
                    ctx.ai.model
                );
                ctx.reply_quoted(event, &status);
                true
            }
            "/clear" => {
                let key = event.context_key();
                let _ = ctx.history.clear(&key);
                ctx.reply_quoted(event, "Context cleared (^^)");
                true
            }
            "/persona" => {
                if args.is_empty() {
                    let mut list = String::from("=== personas ===\n");
                    for (id, name) in ctx.personalities.list() {
                        list.push_str(&format!("  {id} - {name}\n"));
                    }
                    list.push_str("\nUse /persona <id> to switch");
                    ctx.reply_quoted(event, &list);
                } else {
                    let switched = if event.is_group() {
                        ctx.personalities.switch_for_group(event.group_id, &args)
                    } else {
                        ctx.personalities.switch(&args)
                    };
                    if switched {
                        let new_name = if event.is_group() {
                            ctx.personalities.name_for_group(event.group_id)
                        } else {
                            ctx.personalities.current_name()
                        };
                        // A persona switch starts a fresh conversation.
                        let _ = ctx.history.clear(&event.context_key());
                        ctx.reply_quoted(event, &format!("Persona switched to {new_name}"));
                    } else {
                        ctx.reply_quoted(event, "Unknown persona, see /persona");
                    }
                }
                true
            }
            "/about" => {
                let about = format!(
                    "=== about {persona_name} ===\n\
                     LCHBOT chat-bot runtime\n\
                     OneBot 11 protocol\n\
                     model: {}",
                    ctx.ai.model
                );
                ctx.reply_quoted(event, &about);
                true
            }
            _ => false,
        }
    }

    async fn handle_chat(&self, event: &MessageEvent, ctx: &PluginContext, content: &str) -> bool {
        if event.is_group() && !ctx.permissions.group_ai_enabled(event.group_id) {
            return false;
        }
        if event.is_group() && !ctx.permissions.consume_group_usage(event.group_id) {
            ctx.reply_quoted(event, "Daily limit reached for this group");
            return true;
        }

        match ctx.limiter.check(RATE_KEY) {
            RateLimitResult::Allowed => {}
            RateLimitResult::RateLimited | RateLimitResult::CircuitOpen => {
                ctx.metrics.record_rate_limited(RATE_KEY);
                let err = crate::error::BotError::AiApi {
                    kind: crate::error::AiApiErrorKind::RateLimit,
                    detail: String::new(),
                };
                ctx.reply_quoted(event, &user_message(&err, Language::Zh));
                return true;
            }
        }

        let context_key = event.context_key();
        let sender_name = event.sender.display_name().to_string();

        let persona_prompt = if event.is_group() {
            ctx.personalities.prompt_for_group(event.group_id)
        } else {
            ctx.personalities.current_prompt()
        };
        let window = ctx.history.build_window(&context_key, content).unwrap_or_default();
        let prompt = ai::build_chat_prompt(&persona_prompt, &window, &sender_name, content);

        let cache_key = ResponseCache::cache_key(content, &ctx.ai.model, &context_key);
        if let Some(cached) = ctx.cache.get(&cache_key) {
            ctx.reply_quoted(event, &cached);
            return true;
        }

        let started = Instant::now();
        let result = ctx.ai.chat(&prompt, None).await;
        let latency = started.elapsed().as_secs_f64();
        ctx.stats.record_api_call(event.group_id);

        match result {
            Ok(reply) => {
                ctx.limiter.record_success(RATE_KEY);
                ctx.metrics.record_ai_request(&ctx.ai.model, true, latency);
                ctx.cache.set(&cache_key, &reply, None);

                let persona_name = if event.is_group() {
                    ctx.personalities.name_for_group(event.group_id)
                } else {
                    ctx.personalities.current_name()
                };
                let _ = ctx
                    .history
                    .append(&context_key, "assistant", &reply, &persona_name, 0);
                ctx.reply_quoted(event, &reply);
            }
            Err(e) => {
                ctx.limiter.record_failure(RATE_KEY);
                ctx.metrics.record_ai_request(&ctx.ai.model, false, latency);
                let (module, code) = crate::error::error_code(&e);
                ctx.metrics.record_error(module, &code.to_string());
                tracing::error!(error = %e, "ai chat failed");
                ctx.reply_quoted(event, &user_message(&e, Language::Zh));
            }
        }
        true
    }
}

impl Default for AiChatPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BotPlugin for AiChatPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: PLUGIN_NAME.into(),
            version: "1.0.0".into(),
            author: "LCHBOT".into(),
            description: "AI chat with durable conversation context".into(),
            priority: 50,
        }
    }

    async fn on_message(&self, event: &MessageEvent, ctx: &PluginContext) -> anyhow::Result<bool> {
        if !event.is_group() {
            return Ok(false);
        }
        let Some(content) = Self::mentioned_text(event) else {
            return Ok(false);
        };
        if content.is_empty() {
            return Ok(false);
        }
        if content.starts_with('/') {
            return Ok(self.handle_command(event, ctx, &content).await);
        }
        Ok(self.handle_chat(event, ctx, &content).await)
    }

    async fn on_private_message(
        &self,
        event: &MessageEvent,
        ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        let content = event.plain_text();
        let content = if content.trim().is_empty() {
            event.raw_message.trim().to_string()
        } else {
            content.trim().to_string()
        };
        if content.is_empty() {
            return Ok(false);
        }
        if content.starts_with('/') {
            return Ok(self.handle_command(event, ctx, &content).await);
        }
        Ok(self.handle_chat(event, ctx, &content).await)
    }
}
