//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GatehouseError, Result};

/// Top-level Gatehouse configuration.
///
/// Every block is optional; accessors fall back to documented defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupts: Option<InterruptsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokensConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,

    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "none", "token", or "password". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Reject handshakes that do not carry a valid device signature.
    #[serde(default)]
    pub require_device: bool,
}

impl GatewayAuthConfig {
    /// Resolve the shared auth token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    /// Resolve the auth password from direct value or env var.
    pub fn resolve_password(&self) -> Option<String> {
        resolve_secret_field(&self.password, &self.password_env)
    }

    /// Get the effective auth mode.
    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

/// Limits advertised to clients in `hello-ok` and enforced per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Maximum inbound frame size in bytes (default: 1 MiB).
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,

    /// Maximum bytes queued for one connection before it is closed (default: 10 MiB).
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,

    /// Interval of the `tick` liveness event (default: 30s).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Number of events retained for replay after reconnect (default: 512).
    #[serde(default = "default_backlog_size")]
    pub backlog_size: usize,

    /// Time allowed between socket open and a successful `hello` (default: 10s).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_max_payload() -> usize {
    1_048_576
}

fn default_max_buffered_bytes() -> usize {
    10_485_760
}

fn default_tick_interval_ms() -> u64 {
    30_000
}

fn default_backlog_size() -> usize {
    512
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
            max_buffered_bytes: default_max_buffered_bytes(),
            tick_interval_ms: default_tick_interval_ms(),
            backlog_size: default_backlog_size(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Gate on concurrent backend task execution.
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Gate on concurrent subagent spawns.
    #[serde(default = "default_spawn_governor")]
    pub spawn_governor: GovernorConfig,
}

/// Token bucket parameters: `refill_rate` tokens are added every `interval_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_rate: f64,
    #[serde(default = "default_bucket_interval_ms")]
    pub interval_ms: u64,
}

fn default_bucket_interval_ms() -> u64 {
    60_000
}

impl BucketConfig {
    pub const fn per_minute(n: f64) -> Self {
        Self {
            capacity: n,
            refill_rate: n,
            interval_ms: 60_000,
        }
    }
}

/// One bucket configuration per traffic class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_http_bucket")]
    pub http: BucketConfig,

    #[serde(default = "default_agent_bucket")]
    pub agent: BucketConfig,

    #[serde(default = "default_webhook_bucket")]
    pub webhook: BucketConfig,

    #[serde(default = "default_static_bucket")]
    pub static_assets: BucketConfig,

    #[serde(default = "default_tool_bucket")]
    pub tool: BucketConfig,

    /// How often idle buckets are swept (default: 60s).
    #[serde(default = "default_idle_sweep_ms")]
    pub idle_sweep_ms: u64,
}

fn default_http_bucket() -> BucketConfig {
    BucketConfig::per_minute(120.0)
}

fn default_agent_bucket() -> BucketConfig {
    BucketConfig::per_minute(30.0)
}

fn default_webhook_bucket() -> BucketConfig {
    BucketConfig::per_minute(60.0)
}

fn default_static_bucket() -> BucketConfig {
    BucketConfig::per_minute(300.0)
}

fn default_tool_bucket() -> BucketConfig {
    BucketConfig::per_minute(60.0)
}

fn default_idle_sweep_ms() -> u64 {
    60_000
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            http: default_http_bucket(),
            agent: default_agent_bucket(),
            webhook: default_webhook_bucket(),
            static_assets: default_static_bucket(),
            tool: default_tool_bucket(),
            idle_sweep_ms: default_idle_sweep_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum entries queued across all priorities (default: 1000).
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,

    /// Queued entries older than this are dropped (default: 60s).
    #[serde(default = "default_scheduler_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Background workers draining the queue (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_max_queued() -> usize {
    1_000
}

fn default_scheduler_timeout_ms() -> u64 {
    60_000
}

fn default_workers() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queued: default_max_queued(),
            queue_timeout_ms: default_scheduler_timeout_ms(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Global ceiling on live permits (default: 8).
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,

    /// Longest a caller may wait for a permit (default: 30s).
    #[serde(default = "default_governor_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Permits held longer than this are reclaimed (default: 10 min).
    #[serde(default = "default_permit_ttl_ms")]
    pub permit_ttl_ms: u64,

    /// Waiters beyond this are rejected as saturated (default: 256).
    #[serde(default = "default_max_waiters")]
    pub max_waiters: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_slots() -> usize {
    8
}

fn default_governor_timeout_ms() -> u64 {
    30_000
}

fn default_permit_ttl_ms() -> u64 {
    600_000
}

fn default_max_waiters() -> usize {
    256
}

fn default_spawn_governor() -> GovernorConfig {
    GovernorConfig {
        max_slots: 4,
        ..GovernorConfig::default()
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_slots: default_max_slots(),
            queue_timeout_ms: default_governor_timeout_ms(),
            permit_ttl_ms: default_permit_ttl_ms(),
            max_waiters: default_max_waiters(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptsConfig {
    /// Interrupt store file (default: `~/.gatehouse/interrupts.json`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Timeout applied when `emit` is called without one (default: 5 min).
    #[serde(default = "default_interrupt_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Upper clamp for caller-supplied timeouts (default: 24h).
    #[serde(default = "default_interrupt_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Resolved records are kept this long before garbage collection (default: 24h).
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    #[serde(default = "default_interrupt_sweep_ms")]
    pub sweep_interval_ms: u64,
}

fn default_interrupt_timeout_ms() -> u64 {
    300_000
}

fn default_interrupt_max_timeout_ms() -> u64 {
    86_400_000
}

fn default_retention_ms() -> u64 {
    86_400_000
}

fn default_interrupt_sweep_ms() -> u64 {
    60_000
}

impl Default for InterruptsConfig {
    fn default() -> Self {
        Self {
            path: None,
            default_timeout_ms: default_interrupt_timeout_ms(),
            max_timeout_ms: default_interrupt_max_timeout_ms(),
            retention_ms: default_retention_ms(),
            sweep_interval_ms: default_interrupt_sweep_ms(),
        }
    }
}

/// Lock-file behavior for the durable JSON stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// A lock older than this is assumed abandoned (default: 30s).
    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: u64,

    /// Give up acquiring a lock after this long (default: 5s).
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_stale_ms() -> u64 {
    30_000
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_stale_ms: default_lock_stale_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokensConfig {
    /// Token store file (default: `~/.gatehouse/tokens.json`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "gatehouse_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| GatehouseError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned())
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw)?;

        let config: Config =
            json5::from_str(&substituted).map_err(|e| GatehouseError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    /// Interface to bind (default: loopback only).
    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn auth(&self) -> GatewayAuthConfig {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.clone())
            .unwrap_or_default()
    }

    pub fn auth_mode(&self) -> String {
        self.auth().effective_mode().to_string()
    }

    pub fn policy(&self) -> PolicyConfig {
        self.gateway
            .as_ref()
            .map(|g| g.policy.clone())
            .unwrap_or_default()
    }

    pub fn admission(&self) -> AdmissionConfig {
        self.admission.clone().unwrap_or_default()
    }

    pub fn interrupts(&self) -> InterruptsConfig {
        self.interrupts.clone().unwrap_or_default()
    }

    pub fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }

    pub fn interrupts_path(&self) -> PathBuf {
        self.interrupts
            .as_ref()
            .and_then(|i| i.path.as_deref())
            .map(expand_home)
            .unwrap_or_else(|| data_dir().join("interrupts.json"))
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.tokens
            .as_ref()
            .and_then(|t| t.path.as_deref())
            .map(expand_home)
            .unwrap_or_else(|| data_dir().join("tokens.json"))
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if gw.policy.max_payload == 0 {
                errors.push("gateway.policy.max_payload must be positive".to_string());
            }
            if gw.policy.tick_interval_ms == 0 {
                errors.push("gateway.policy.tick_interval_ms must be positive".to_string());
            }
        }

        let auth = self.auth();
        match auth.effective_mode() {
            "none" => {
                if auth.require_device {
                    warnings.push(
                        "Auth mode is 'none' but require_device is set; only device proof is checked"
                            .to_string(),
                    );
                }
            }
            "token" => {
                if auth.resolve_token().is_none() {
                    warnings.push(
                        "Auth mode is 'token' without a shared token; only issued tokens will work"
                            .to_string(),
                    );
                }
            }
            "password" => {
                if auth.resolve_password().is_none() {
                    errors.push("Auth mode is 'password' but no password is configured".to_string());
                }
            }
            other => errors.push(format!("Unknown auth mode: {other}")),
        }

        let admission = self.admission();
        let rl = &admission.rate_limits;
        for (class, bucket) in [
            ("http", &rl.http),
            ("agent", &rl.agent),
            ("webhook", &rl.webhook),
            ("static_assets", &rl.static_assets),
            ("tool", &rl.tool),
        ] {
            if bucket.capacity < 1.0 {
                errors.push(format!("rate_limits.{class}.capacity must be at least 1"));
            }
            if bucket.refill_rate <= 0.0 || bucket.interval_ms == 0 {
                errors.push(format!("rate_limits.{class} must refill at a positive rate"));
            }
        }
        for (name, gov) in [
            ("governor", &admission.governor),
            ("spawn_governor", &admission.spawn_governor),
        ] {
            if gov.enabled && gov.max_slots == 0 {
                errors.push(format!("admission.{name}.max_slots must be positive"));
            }
        }
        if admission.scheduler.workers == 0 {
            warnings.push("admission.scheduler.workers is 0; queued tasks will never run".to_string());
        }

        if let Some(logging) = &self.logging {
            if logging.format != "plain" && logging.format != "json" {
                warnings.push(format!(
                    "Unknown logging format '{}', falling back to plain",
                    logging.format
                ));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Gatehouse data: `~/.gatehouse/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gatehouse")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name is unique to this test
        unsafe { std::env::set_var("TEST_GH_TOKEN", "tok-123") };
        let input = r#"{"key": "${TEST_GH_TOKEN}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("tok-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_GH_TOKEN") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_GH_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 18790);
        assert_eq!(config.auth_mode(), "none");
        assert_eq!(config.policy().max_payload, 1_048_576);
        assert_eq!(config.admission().governor.max_slots, 8);
        assert_eq!(config.admission().spawn_governor.max_slots, 4);
        assert_eq!(config.admission().rate_limits.agent.capacity, 30.0);
    }

    #[test]
    fn test_partial_admission_block_keeps_defaults() {
        let config: Config = json5::from_str(
            r#"{
                admission: {
                    governor: { max_slots: 2 },
                    rate_limits: { tool: { capacity: 5, refill_rate: 1, interval_ms: 1000 } },
                },
            }"#,
        )
        .unwrap();
        let admission = config.admission();
        assert_eq!(admission.governor.max_slots, 2);
        assert!(admission.governor.enabled);
        assert_eq!(admission.governor.queue_timeout_ms, 30_000);
        assert_eq!(admission.rate_limits.tool.capacity, 5.0);
        assert_eq!(admission.rate_limits.http.capacity, 120.0);
        assert_eq!(admission.spawn_governor.max_slots, 4);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                gateway: { port: 9000, auth: { mode: "token", token: "abc" } },
                interrupts: { path: "/tmp/gh-interrupts.json" },
            }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 9000);
        assert_eq!(config.auth().resolve_token().as_deref(), Some("abc"));
        assert_eq!(
            config.interrupts_path(),
            PathBuf::from("/tmp/gh-interrupts.json")
        );
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_password_mode_without_password() {
        let config = Config {
            gateway: Some(GatewayConfig {
                port: 18790,
                bind: None,
                auth: Some(GatewayAuthConfig {
                    mode: Some("password".into()),
                    ..Default::default()
                }),
                policy: PolicyConfig::default(),
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("password")),
            "Expected an error about missing password, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_zero_refill_rate() {
        let mut admission = AdmissionConfig::default();
        admission.rate_limits.webhook.refill_rate = 0.0;
        let config = Config {
            admission: Some(admission),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("webhook")));
    }
}
