//! `header-rewrite` middleware: sets, adds, and removes request headers
//! before the forwarder builds the upstream request.

use super::{Middleware, MiddlewareContext, PreOutcome, RequestParts};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Default)]
struct HeaderRewriteConfig {
    #[serde(default)]
    set: HashMap<String, String>,
    #[serde(default)]
    add: HashMap<String, String>,
    #[serde(default)]
    remove: Vec<String>,
}

pub struct HeaderRewriteMiddleware {
    config: HeaderRewriteConfig,
}

impl HeaderRewriteMiddleware {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, String> {
        let config: HeaderRewriteConfig = serde_json::from_value(value.clone())
            .map_err(|e| format!("header-rewrite middleware: {e}"))?;
        Ok(Self { config })
    }
}

impl Middleware for HeaderRewriteMiddleware {
    fn pre_request(&self, _ctx: &mut MiddlewareContext, parts: &mut RequestParts) -> PreOutcome {
        for name in &self.config.remove {
            parts.headers.remove(&name.to_ascii_lowercase());
        }
        for (name, value) in &self.config.set {
            parts.headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        for (name, value) in &self.config.add {
            let key = name.to_ascii_lowercase();
            match parts.headers.get_mut(&key) {
                Some(existing) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                None => {
                    parts.headers.insert(key, value.clone());
                }
            }
        }
        PreOutcome::Continue
    }
}
