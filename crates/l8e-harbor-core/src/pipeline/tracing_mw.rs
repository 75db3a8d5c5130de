//! `tracing` middleware: propagates or originates a trace span per request,
//! attaching `traceparent`/`X-Trace-Id`/`X-Span-Id` to both the outbound
//! request and, for locally-generated spans, the response.

use super::{Middleware, MiddlewareContext, PreOutcome, RequestParts};
use crate::forwarder::ForwardOutcome;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize, Default)]
struct TracingConfig {
    #[serde(default = "default_true")]
    create_spans: bool,
    #[serde(default)]
    span_name_template: Option<String>,
    #[serde(default)]
    span_attributes: std::collections::HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

pub struct TracingMiddleware {
    config: TracingConfig,
}

impl TracingMiddleware {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, String> {
        let config: TracingConfig = serde_json::from_value(value.clone())
            .map_err(|e| format!("tracing middleware: {e}"))?;
        Ok(Self { config })
    }
}

impl Middleware for TracingMiddleware {
    fn pre_request(&self, ctx: &mut MiddlewareContext, parts: &mut RequestParts) -> PreOutcome {
        if parts.headers.contains_key("traceparent") {
            return PreOutcome::Continue;
        }
        if !self.config.create_spans {
            return PreOutcome::Continue;
        }

        let trace_id = Uuid::new_v4().simple().to_string();
        let span_id = Uuid::new_v4().simple().to_string()[..16].to_string();
        let traceparent = format!("00-{trace_id}-{span_id}-01");
        parts.headers.insert("traceparent".to_string(), traceparent.clone());
        parts.headers.insert("x-trace-id".to_string(), trace_id.clone());
        parts.headers.insert("x-span-id".to_string(), span_id.clone());

        let span_name = self
            .config
            .span_name_template
            .clone()
            .unwrap_or_else(|| format!("{} {}", parts.method, parts.path));
        ctx.attachments
            .insert("tracing.span_name".to_string(), serde_json::json!(span_name));
        ctx.attachments
            .insert("tracing.trace_id".to_string(), serde_json::json!(trace_id));
        for (k, v) in &self.config.span_attributes {
            ctx.attachments.insert(format!("tracing.attr.{k}"), serde_json::json!(v));
        }
        PreOutcome::Continue
    }

    fn post_response(
        &self,
        ctx: &mut MiddlewareContext,
        _parts: &RequestParts,
        mut resp: ForwardOutcome,
    ) -> ForwardOutcome {
        if let Some(trace_id) = ctx.attachments.get("tracing.trace_id").and_then(|v| v.as_str()) {
            if let (Ok(name), Ok(val)) = (
                actix_web::http::header::HeaderName::from_static("x-trace-id"),
                actix_web::http::header::HeaderValue::from_str(trace_id),
            ) {
                resp.headers.insert(name, val);
            }
        }
        resp
    }
}
