use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The unit of dispatch: a declarative mapping from request predicates to a
/// backend set plus processing policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Route {
    /// Stable identifier, must match `^[a-z0-9-]+$`.
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Path prefix; must begin with `/`.
    pub path: String,

    /// HTTP methods this route accepts. Empty means "any".
    #[serde(default)]
    pub methods: Vec<String>,

    /// Lower value wins on ties. Stable tie-break on `id` ascending.
    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub strip_prefix: bool,

    #[serde(default)]
    pub add_prefix: Option<String>,

    /// Total budget for one upstream attempt, not the whole retry envelope.
    pub timeout_ms: u64,

    #[serde(default)]
    pub sticky_session: bool,

    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Ordered list of additional predicates; ALL must hold.
    #[serde(default)]
    pub matchers: Vec<Matcher>,

    pub backends: Vec<Backend>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerPolicy,

    /// Ordered list of `{name, config}` middleware entries.
    #[serde(default)]
    pub middleware: Vec<MiddlewareEntry>,

    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Route-level opt-in allowing otherwise-unsafe methods (POST, PATCH)
    /// to be retried without an `Idempotency-Key` header.
    #[serde(default)]
    pub idempotent: bool,
}

fn default_session_cookie() -> String {
    "sid".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MiddlewareEntry {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Route {
    /// `id` syntax, non-empty path/backends, and matcher/retry/breaker
    /// sub-validation. Does not check cross-route invariants (tie-break,
    /// duplicate detection) — that is the Route Store's job at `apply` time.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(format!("route id '{}' must match ^[a-z0-9-]+$", self.id));
        }
        if !self.path.starts_with('/') {
            return Err(format!("route {} path must start with /", self.id));
        }
        if self.backends.is_empty() {
            return Err(format!("route {} has no backends", self.id));
        }
        for b in &self.backends {
            b.validate().map_err(|e| format!("route {}: {e}", self.id))?;
        }
        for m in &self.matchers {
            m.validate().map_err(|e| format!("route {}: {e}", self.id))?;
        }
        self.retry_policy
            .validate()
            .map_err(|e| format!("route {}: {e}", self.id))?;
        self.circuit_breaker
            .validate()
            .map_err(|e| format!("route {}: {e}", self.id))?;
        crate::pipeline::validate_entries(&self.middleware)
            .map_err(|e| format!("route {}: {e}", self.id))?;
        Ok(())
    }

    pub fn methods_allow(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatcherSource {
    Header,
    Query,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatcherOp {
    Equals,
    Contains,
    Regex,
    Prefix,
    Suffix,
    Exists,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Matcher {
    pub source: MatcherSource,
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub op: MatcherOp,
}

impl Matcher {
    pub fn validate(&self) -> Result<(), String> {
        if self.op == MatcherOp::Regex {
            regex::Regex::new(&anchored_pattern(&self.value))
                .map_err(|e| format!("invalid matcher regex '{}': {e}", self.value))?;
        }
        Ok(())
    }
}

/// Anchors a matcher's regex pattern at both ends unless it already carries
/// explicit anchors, per the Router's matcher contract.
pub fn anchored_pattern(pattern: &str) -> String {
    let starts = pattern.starts_with('^');
    let ends = pattern.ends_with('$');
    match (starts, ends) {
        (true, true) => pattern.to_string(),
        (true, false) => format!("{pattern}$"),
        (false, true) => format!("^{pattern}"),
        (false, false) => format!("^{pattern}$"),
    }
}

/// An upstream destination.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Backend {
    /// Absolute HTTP/HTTPS URL with host and optional port.
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

fn default_weight() -> u32 {
    100
}

impl Backend {
    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!("backend url must be http(s): {}", self.url));
        }
        if !(1..=1000).contains(&self.weight) {
            return Err(format!("backend weight must be in [1, 1000]: {}", self.weight));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_expected_status")]
    pub expected_status: HashSet<u16>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

fn default_interval_ms() -> u64 {
    10_000
}
fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_threshold() -> u32 {
    2
}
fn default_expected_status() -> HashSet<u16> {
    [200].into_iter().collect()
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub client_cert: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retry_on")]
    pub retry_on: HashSet<String>,
}

fn default_max_retries() -> u32 {
    0
}
fn default_backoff_ms() -> u64 {
    100
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_retry_on() -> HashSet<String> {
    ["5xx".to_string(), "gateway-error".to_string()]
        .into_iter()
        .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > 10 {
            return Err("max_retries must be 0-10".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        if self.backoff_ms > self.max_backoff_ms {
            return Err("backoff_ms cannot exceed max_backoff_ms".to_string());
        }
        Ok(())
    }

    /// `min(backoff_ms * multiplier^attempt, max_backoff_ms)`, the base delay
    /// before jitter is applied by the retry engine.
    pub fn base_backoff_ms(&self, attempt: u32) -> u64 {
        let backoff = self.backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        backoff.min(self.max_backoff_ms as f64) as u64
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CircuitBreakerPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold_percent: u8,
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

fn default_failure_threshold() -> u8 {
    50
}
fn default_minimum_requests() -> u32 {
    10
}
fn default_window_ms() -> u64 {
    10_000
}
fn default_open_timeout_ms() -> u64 {
    30_000
}
fn default_half_open_max_probes() -> u32 {
    1
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold_percent: default_failure_threshold(),
            minimum_requests: default_minimum_requests(),
            window_ms: default_window_ms(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl CircuitBreakerPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.failure_threshold_percent) {
            return Err("failure_threshold_percent must be 1-100".to_string());
        }
        if self.minimum_requests == 0 {
            return Err("minimum_requests must be >= 1".to_string());
        }
        Ok(())
    }
}
