//! Configuration loading and validation.
//!
//! All tunables are read once from a TOML file at startup; there is no
//! runtime reconfiguration. Every field has a default, so an empty file (or
//! an absent section) yields a working configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level configuration for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Scheduling and timeout settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Controller login settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Device-session connection pool settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Check discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Device-session transport settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Result streaming and report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Scheduling limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Concurrency bound for API checks.
    #[serde(default = "default_max_api_concurrency")]
    pub max_api_concurrency: usize,

    /// Concurrency bound for device-to-device checks. Device sessions are
    /// expensive; keep this low.
    #[serde(default = "default_max_device_concurrency")]
    pub max_device_concurrency: usize,

    /// Per-check timeout in seconds.
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    /// Optional whole-run deadline in seconds. Unset means no deadline.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,

    /// Enables debug-level logging.
    #[serde(default)]
    pub debug: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_api_concurrency: default_max_api_concurrency(),
            max_device_concurrency: default_max_device_concurrency(),
            check_timeout_secs: default_check_timeout_secs(),
            run_timeout_secs: None,
            debug: false,
        }
    }
}

/// Controller login via an external subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Session lifetime in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Timeout for one login attempt in seconds.
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,

    /// Interpreter invoked with the login script path appended.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Login script template. The `{identity}` placeholder is replaced with
    /// the controller identity; the script's last stdout line must be the
    /// credential JSON.
    #[serde(default = "default_login_script")]
    pub script: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            login_timeout_secs: default_login_timeout_secs(),
            interpreter: default_interpreter(),
            script: default_login_script(),
        }
    }
}

/// Per-identity connection pool bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum live connections per controller identity.
    #[serde(default = "default_max_per_identity")]
    pub max_per_identity: usize,

    /// How long an acquirer waits for a slot before erroring, in seconds.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_identity: default_max_per_identity(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

/// Where and how check files are discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Roots walked for check files.
    #[serde(default = "default_discovery_paths")]
    pub paths: Vec<PathBuf>,

    /// When true, a check file outside the api/device_to_device convention
    /// aborts the run instead of defaulting to the API class.
    #[serde(default)]
    pub strict: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            paths: default_discovery_paths(),
            strict: false,
        }
    }
}

/// External processes bridging device sessions and check execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Connector command establishing device sessions.
    #[serde(default = "default_connector")]
    pub connector: String,

    /// Command executing one check file; the check file path is appended.
    #[serde(default = "default_check_command")]
    pub check_command: String,

    /// Working directory for spawned connector and check processes.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Timeout for one connector invocation in seconds.
    #[serde(default = "default_transport_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connector: default_connector(),
            check_command: default_check_command(),
            working_dir: None,
            timeout_secs: default_transport_timeout_secs(),
        }
    }
}

/// Result stream and report output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Root of the output tree. API results land here; device-to-device
    /// results are nested under `device_to_device/`.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Retain command executions only for units whose final status is a
    /// failure. Results are always retained.
    #[serde(default)]
    pub failed_only: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            failed_only: false,
        }
    }
}

fn default_max_api_concurrency() -> usize {
    8
}

fn default_max_device_concurrency() -> usize {
    2
}

fn default_check_timeout_secs() -> u64 {
    900
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_login_timeout_secs() -> u64 {
    60
}

fn default_interpreter() -> String {
    "/bin/sh".to_string()
}

fn default_login_script() -> String {
    "netverify-login {identity}".to_string()
}

fn default_max_per_identity() -> usize {
    4
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_discovery_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("checks")]
}

fn default_connector() -> String {
    "netverify-connector".to_string()
}

fn default_check_command() -> String {
    "netverify-check".to_string()
}

fn default_transport_timeout_secs() -> u64 {
    3600
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("verify-results")
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// A starting-point config file, written by `netverify init`.
pub fn example_config() -> &'static str {
    r#"# netverify configuration

[runner]
max_api_concurrency = 8
max_device_concurrency = 2
check_timeout_secs = 900
# run_timeout_secs = 7200

[auth]
ttl_secs = 1800
login_timeout_secs = 60
interpreter = "/bin/sh"
script = "netverify-login {identity}"

[pool]
max_per_identity = 4
acquire_timeout_secs = 30

[discovery]
paths = ["checks"]
strict = false

[transport]
connector = "netverify-connector"
check_command = "netverify-check"
timeout_secs = 3600

[report]
output_dir = "verify-results"
failed_only = false
"#
}
