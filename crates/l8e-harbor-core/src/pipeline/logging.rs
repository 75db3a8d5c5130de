//! `logging` middleware: emits a per-request human log line distinct from
//! the structured observability event stream, honoring `exclude_paths`.

use super::{Middleware, MiddlewareContext, PreOutcome, RequestParts};
use crate::forwarder::ForwardOutcome;
use log::Level;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_level")]
    level: String,
    #[serde(default)]
    exclude_paths: Vec<String>,
    #[serde(default)]
    include_user_agent: bool,
    #[serde(default)]
    include_remote_addr: bool,
}

fn default_level() -> String {
    "info".to_string()
}

pub struct LoggingMiddleware {
    config: LoggingConfig,
    level: Level,
}

impl LoggingMiddleware {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, String> {
        let config: LoggingConfig = serde_json::from_value(value.clone())
            .map_err(|e| format!("logging middleware: {e}"))?;
        let level = Level::from_str(&config.level).unwrap_or(Level::Info);
        Ok(Self { config, level })
    }

    fn excluded(&self, path: &str) -> bool {
        self.config.exclude_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

impl Middleware for LoggingMiddleware {
    fn pre_request(&self, ctx: &mut MiddlewareContext, parts: &mut RequestParts) -> PreOutcome {
        if !self.excluded(&parts.path) {
            ctx.attachments
                .insert("logging.started_at".to_string(), serde_json::json!(now_nanos()));
        }
        PreOutcome::Continue
    }

    fn post_response(
        &self,
        ctx: &mut MiddlewareContext,
        parts: &RequestParts,
        resp: ForwardOutcome,
    ) -> ForwardOutcome {
        if self.excluded(&parts.path) {
            return resp;
        }
        let mut line = format!(
            "{} {} {} -> {}",
            parts.request_id, parts.method, parts.path, resp.status
        );
        if self.config.include_remote_addr {
            if let Some(ip) = &parts.client_ip {
                line.push_str(&format!(" remote={ip}"));
            }
        }
        if self.config.include_user_agent {
            if let Some(ua) = parts.headers.get("user-agent") {
                line.push_str(&format!(" ua=\"{ua}\""));
            }
        }
        // The pre_request timestamp is attached for callers that want
        // precise latency; this line itself only reports pass/fail shape.
        let _ = ctx.attachments.get("logging.started_at");
        log::log!(self.level, "{line}");
        resp
    }
}

fn now_nanos() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
