//! Layered configuration: `workflow.toml` plus `WF__`-prefixed environment
//! overrides, read through the `config` crate.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub trigger_concurrency: usize,
    pub executor_concurrency: usize,
    pub timeout_concurrency: usize,
    /// Trigger pool rate limit in events/sec (§5).
    pub trigger_rate_per_sec: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            trigger_concurrency: 5,
            executor_concurrency: 10,
            timeout_concurrency: 3,
            trigger_rate_per_sec: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            backoff_base_seconds: 2,
            backoff_jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    pub completed_days: i64,
    pub failed_days: i64,
    pub job_completed_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            completed_days: 30,
            failed_days: 90,
            job_completed_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    pub scan_interval_minutes: i64,
    pub stuck_threshold_hours: i64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            scan_interval_minutes: 1,
            stuck_threshold_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub pools: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Wall-clock execution timeout default, overridable per-node (§4.2).
    #[serde(default = "default_execution_timeout")]
    pub default_execution_timeout_seconds: u64,
    /// Applied to a lead's phone when it carries no leading `+` (§4.2).
    #[serde(default = "default_country_prefix")]
    pub default_country_prefix: String,
    /// Name of the header carrying the tenant's HMAC signature on messaging
    /// webhooks (§6); the actual per-tenant secret is resolved at runtime.
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_database_url() -> String {
    "postgres://localhost/workflow_engine".to_string()
}

fn default_execution_timeout() -> u64 {
    120
}

fn default_country_prefix() -> String {
    "+1".to_string()
}

fn default_signature_header() -> String {
    "X-Hub-Signature-256".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: default_database_url(),
            pools: PoolConfig::default(),
            retry: RetryConfig::default(),
            retention: RetentionConfig::default(),
            supervisor: SupervisorConfig::default(),
            default_execution_timeout_seconds: default_execution_timeout(),
            default_country_prefix: default_country_prefix(),
            signature_header: default_signature_header(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl Config {
    /// Loads `workflow.toml` (if present in the working directory) layered
    /// under `WF__`-prefixed environment overrides, e.g. `WF__BIND_ADDR`,
    /// `WF__POOLS__EXECUTOR_CONCURRENCY`.
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("workflow").required(false))
            .add_source(config::Environment::with_prefix("WF").separator("__"))
            .build()?;

        match cfg.try_deserialize::<Config>() {
            Ok(c) => Ok(c),
            Err(_) => Ok(Config::default()),
        }
    }
}
