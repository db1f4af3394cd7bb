use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::SyncFamily;

pub const ENV_POSTGRES_DSN: &str = "CINESYNC_POSTGRES_DSN";
pub const ENV_ELASTIC_URL: &str = "CINESYNC_ELASTIC_URL";
pub const ENV_ELASTIC_USERNAME: &str = "CINESYNC_ELASTIC_USERNAME";
pub const ENV_ELASTIC_PASSWORD: &str = "CINESYNC_ELASTIC_PASSWORD";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub elasticsearch: ElasticConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub indices: IndicesConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    /// Connection string; may instead come from `CINESYNC_POSTGRES_DSN`.
    #[serde(default)]
    pub dsn: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            schema: default_schema(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_schema() -> String {
    "content".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticConfig {
    #[serde(default = "default_elastic_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: default_elastic_url(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_elastic_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// `json` (single file, atomic rename) or `sqlite` (checkpoints table).
    #[serde(default = "default_state_backend")]
    pub backend: String,
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            path: default_state_path(),
        }
    }
}

fn default_state_backend() -> String {
    "json".to_string()
}
fn default_state_path() -> PathBuf {
    PathBuf::from("./data/state.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_families")]
    pub families: Vec<String>,
    /// Rows per change-detection query (ties at the boundary may exceed it).
    #[serde(default = "default_extract_limit")]
    pub extract_limit: i64,
    #[serde(default = "default_load_batch_size")]
    pub load_batch_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    /// Upper bound for any single store or index call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            families: default_families(),
            extract_limit: default_extract_limit(),
            load_batch_size: default_load_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_families() -> Vec<String> {
    SyncFamily::ALL.iter().map(|f| f.as_str().to_string()).collect()
}
fn default_extract_limit() -> i64 {
    100
}
fn default_load_batch_size() -> usize {
    200
}
fn default_poll_interval_secs() -> f64 {
    2.0
}
fn default_call_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Attempts allowed for the connectivity probes at startup.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            startup_attempts: default_startup_attempts(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    100
}
fn default_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_startup_attempts() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndicesConfig {
    #[serde(default = "default_movies_index")]
    pub movies: IndexConfig,
    #[serde(default = "default_genres_index")]
    pub genres: IndexConfig,
    #[serde(default = "default_persons_index")]
    pub persons: IndexConfig,
}

impl Default for IndicesConfig {
    fn default() -> Self {
        Self {
            movies: default_movies_index(),
            genres: default_genres_index(),
            persons: default_persons_index(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub name: String,
    /// JSON file with `settings` and `mappings`; built-in schema when absent.
    #[serde(default)]
    pub schema: Option<PathBuf>,
}

fn default_movies_index() -> IndexConfig {
    IndexConfig {
        name: "movies".to_string(),
        schema: None,
    }
}
fn default_genres_index() -> IndexConfig {
    IndexConfig {
        name: "genres".to_string(),
        schema: None,
    }
}
fn default_persons_index() -> IndexConfig {
    IndexConfig {
        name: "persons".to_string(),
        schema: None,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn index_for(&self, family: SyncFamily) -> &IndexConfig {
        match family {
            SyncFamily::Movies => &self.indices.movies,
            SyncFamily::Genres => &self.indices.genres,
            SyncFamily::Persons => &self.indices.persons,
        }
    }

    /// Families enabled in `sync.families`, in declaration order.
    pub fn enabled_families(&self) -> Result<Vec<SyncFamily>> {
        self.sync
            .families
            .iter()
            .map(|name| {
                name.parse::<SyncFamily>()
                    .map_err(|e| anyhow::anyhow!("sync.families: {}", e))
            })
            .collect()
    }

    /// The Postgres DSN, or an error naming both places it can come from.
    pub fn postgres_dsn(&self) -> Result<&str> {
        self.postgres.dsn.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "postgres.dsn is required (set it in the config file or via {})",
                ENV_POSTGRES_DSN
            )
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sync.poll_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.call_timeout_secs)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dsn) = std::env::var(ENV_POSTGRES_DSN) {
            if !dsn.trim().is_empty() {
                self.postgres.dsn = Some(dsn);
            }
        }
        if let Ok(url) = std::env::var(ENV_ELASTIC_URL) {
            if !url.trim().is_empty() {
                self.elasticsearch.url = url;
            }
        }
        if let Ok(user) = std::env::var(ENV_ELASTIC_USERNAME) {
            self.elasticsearch.username = Some(user);
        }
        if let Ok(password) = std::env::var(ENV_ELASTIC_PASSWORD) {
            self.elasticsearch.password = Some(password);
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env_overrides();
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Sync
    if config.sync.extract_limit < 1 {
        bail!("sync.extract_limit must be >= 1");
    }
    if config.sync.load_batch_size == 0 {
        bail!("sync.load_batch_size must be > 0");
    }
    if !(config.sync.poll_interval_secs.is_finite() && config.sync.poll_interval_secs >= 0.0) {
        bail!("sync.poll_interval_secs must be a non-negative number");
    }
    if config.sync.call_timeout_secs == 0 {
        bail!("sync.call_timeout_secs must be > 0");
    }
    let families = config.enabled_families()?;
    if families.is_empty() {
        bail!("sync.families must name at least one family");
    }
    for (i, family) in families.iter().enumerate() {
        if families[..i].contains(family) {
            bail!("sync.families lists '{}' twice", family.as_str());
        }
    }

    // Retry
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.startup_attempts == 0 {
        bail!("retry.startup_attempts must be >= 1");
    }
    if !(config.retry.factor.is_finite() && config.retry.factor >= 1.0) {
        bail!("retry.factor must be >= 1.0");
    }
    if config.retry.max_delay_ms < config.retry.initial_delay_ms {
        bail!("retry.max_delay_ms must be >= retry.initial_delay_ms");
    }

    // State
    match config.state.backend.as_str() {
        "json" | "sqlite" => {}
        other => bail!(
            "Unknown state backend: '{}'. Must be json or sqlite.",
            other
        ),
    }

    // Indices: every family, since `run --family` may select one outside
    // sync.families.
    for family in SyncFamily::ALL {
        let name = &config.index_for(family).name;
        if !is_valid_index_name(name) {
            bail!(
                "indices.{}.name '{}' is not a valid index name",
                family.as_str(),
                name
            );
        }
    }

    match config.log.format.as_str() {
        "text" | "json" => {}
        other => bail!("Unknown log format: '{}'. Must be text or json.", other),
    }

    if config.postgres.max_connections == 0 {
        bail!("postgres.max_connections must be > 0");
    }

    Ok(())
}

/// Lowercase, non-empty, and free of characters that would change the URL path.
fn is_valid_index_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(['-', '_', '+'])
        && name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')
        })
        && name != "."
        && name != ".."
}
