//! `rate-limit` middleware: per-route token bucket keyed by IP, user, or an
//! arbitrary header, grounded in this codebase's existing token-bucket
//! rate limiter but simplified to the config surface the route schema
//! exposes.

use super::{Middleware, MiddlewareContext, PreOutcome, RequestParts};
use crate::error::MiddlewareError;
use crate::observability::RateLimitEvent;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Deserialize)]
struct RateLimitConfig {
    requests_per_minute: u64,
    #[serde(default)]
    burst_size: u64,
    #[serde(default = "default_key_by")]
    key_by: String,
    #[serde(default)]
    whitelist: Vec<String>,
}

fn default_key_by() -> String {
    "ip".to_string()
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimitMiddleware {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, String> {
        let config: RateLimitConfig = serde_json::from_value(value.clone())
            .map_err(|e| format!("rate-limit middleware: {e}"))?;
        Ok(Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    fn bucket_key(&self, ctx: &MiddlewareContext, parts: &RequestParts) -> Option<String> {
        if let Some(rest) = self.config.key_by.strip_prefix("header:") {
            return parts.headers.get(&rest.to_ascii_lowercase()).cloned();
        }
        match self.config.key_by.as_str() {
            "user" => ctx
                .attachments
                .get("auth.user")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => parts.client_ip.clone(),
        }
    }

    fn capacity(&self) -> f64 {
        (self.config.requests_per_minute + self.config.burst_size) as f64
    }

    fn refill_rate_per_sec(&self) -> f64 {
        self.config.requests_per_minute as f64 / 60.0
    }

    fn try_consume(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limit bucket lock poisoned");
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity(),
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate_per_sec()).min(self.capacity());
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Middleware for RateLimitMiddleware {
    fn pre_request(&self, ctx: &mut MiddlewareContext, parts: &mut RequestParts) -> PreOutcome {
        let key = match self.bucket_key(ctx, parts) {
            Some(k) => k,
            None => return PreOutcome::Continue,
        };
        if self.config.whitelist.iter().any(|w| w == &key) {
            return PreOutcome::Continue;
        }
        if self.try_consume(&key) {
            PreOutcome::Continue
        } else {
            if let Some(obs) = &ctx.observability {
                obs.emit_rate_limit(&RateLimitEvent {
                    route_id: &ctx.route_id,
                    key: &key,
                    outcome: "limited",
                });
            }
            PreOutcome::Fail(MiddlewareError::RateLimited)
        }
    }
}
