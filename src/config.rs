use crate::errors::{RelayError, RelayResult};
use crate::services::{
    chunker::{DEFAULT_CHUNK_SIZE, DEFAULT_SPLIT_THRESHOLD},
    heartbeat::MAX_HEARTBEAT_HOURS,
};
use clap::Parser;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

const REQUIRED_VARS: [&str; 5] = [
    "RELAY_STORAGE_ENDPOINT",
    "RELAY_STORAGE_ACCESS_KEY",
    "RELAY_STORAGE_SECRET_KEY",
    "RELAY_TELEGRAM_BOT_TOKEN",
    "RELAY_TELEGRAM_CHAT_ID",
];

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub staging_dir: PathBuf,

    pub storage_endpoint: String,
    pub storage_access_key: String,
    pub storage_secret_key: String,
    pub storage_region: String,

    pub telegram_api_url: String,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,

    pub poll_interval_minutes: u32,
    pub split_threshold: u64,
    pub chunk_size: u64,
    pub send_interval: Duration,
    pub request_timeout: Duration,
    pub heartbeat_hours: u64,
    pub verify_etag: bool,
    pub alert_on_error: bool,
}

// Credentials never reach the logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("staging_dir", &self.staging_dir)
            .field("storage_endpoint", &self.storage_endpoint)
            .field("storage_region", &self.storage_region)
            .field("telegram_api_url", &self.telegram_api_url)
            .field("telegram_chat_id", &self.telegram_chat_id)
            .field("poll_interval_minutes", &self.poll_interval_minutes)
            .field("split_threshold", &self.split_threshold)
            .field("chunk_size", &self.chunk_size)
            .field("send_interval", &self.send_interval)
            .field("request_timeout", &self.request_timeout)
            .field("heartbeat_hours", &self.heartbeat_hours)
            .field("verify_etag", &self.verify_etag)
            .field("alert_on_error", &self.alert_on_error)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
///
/// Credentials are read from the environment only.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Relays new S3 objects to a Telegram chat")]
pub struct Args {
    /// Host to bind the health server to (overrides RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind the health server to (overrides RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides RELAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory for downloads and chunks (overrides RELAY_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// S3-compatible endpoint URL (overrides RELAY_STORAGE_ENDPOINT)
    #[arg(long)]
    pub storage_endpoint: Option<String>,

    /// Minutes between poll cycles, 1-1440 (overrides RELAY_POLL_INTERVAL_MINUTES)
    #[arg(long)]
    pub poll_interval: Option<u32>,

    /// Hours between status messages, 0 disables (overrides RELAY_HEARTBEAT_HOURS)
    #[arg(long)]
    pub heartbeat_hours: Option<u64>,

    /// Check downloads against MD5 etags (overrides RELAY_VERIFY_ETAG)
    #[arg(long)]
    pub verify_etag: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> RelayResult<(Self, bool)> {
        let args = Args::parse();
        Self::resolve(args, |name| env::var(name).ok())
    }

    /// Merge `args` over the variables visible through `lookup`.
    pub fn resolve<F>(args: Args, lookup: F) -> RelayResult<(Self, bool)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // --- Required (migrations only touch the database) ---
        let missing: Vec<&str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|&name| {
                let from_args = name == "RELAY_STORAGE_ENDPOINT" && args.storage_endpoint.is_some();
                !from_args && var(name).is_none()
            })
            .collect();
        if !missing.is_empty() && !args.migrate {
            return Err(RelayError::Configuration(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }
        let required = |name: &str| var(name).unwrap_or_default();

        // --- Environment fallback ---
        let env_host = var("RELAY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&var, "RELAY_PORT", 3000u16)?;
        let env_db = var("RELAY_DATABASE_URL").unwrap_or_else(|| "sqlite://./data/relay.db".into());
        let env_staging = var("RELAY_STAGING_DIR").unwrap_or_else(|| "./tmp/backups".into());
        let env_interval = parse_var(&var, "RELAY_POLL_INTERVAL_MINUTES", 5u32)?;
        let env_heartbeat = parse_var(&var, "RELAY_HEARTBEAT_HOURS", 0u64)?;
        let env_verify = parse_flag(&var, "RELAY_VERIFY_ETAG", false)?;

        let split_threshold = parse_var(&var, "RELAY_SPLIT_THRESHOLD_BYTES", DEFAULT_SPLIT_THRESHOLD)?;
        let chunk_size = parse_var(&var, "RELAY_CHUNK_SIZE_BYTES", DEFAULT_CHUNK_SIZE)?;
        let send_interval_ms = parse_var(&var, "RELAY_SEND_INTERVAL_MS", 100u64)?;
        let timeout_secs = parse_var(&var, "RELAY_REQUEST_TIMEOUT_SECS", 30u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            staging_dir: args.staging_dir.unwrap_or_else(|| PathBuf::from(env_staging)),
            storage_endpoint: args
                .storage_endpoint
                .unwrap_or_else(|| required("RELAY_STORAGE_ENDPOINT")),
            storage_access_key: required("RELAY_STORAGE_ACCESS_KEY"),
            storage_secret_key: required("RELAY_STORAGE_SECRET_KEY"),
            storage_region: var("RELAY_STORAGE_REGION").unwrap_or_else(|| "us-east-1".into()),
            telegram_api_url: var("RELAY_TELEGRAM_API_URL")
                .unwrap_or_else(|| "https://api.telegram.org".into()),
            telegram_bot_token: required("RELAY_TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: required("RELAY_TELEGRAM_CHAT_ID"),
            poll_interval_minutes: args.poll_interval.unwrap_or(env_interval),
            split_threshold,
            chunk_size,
            send_interval: Duration::from_millis(send_interval_ms),
            request_timeout: Duration::from_secs(timeout_secs),
            heartbeat_hours: args.heartbeat_hours.unwrap_or(env_heartbeat),
            verify_etag: args.verify_etag || env_verify,
            alert_on_error: parse_flag(&var, "RELAY_ALERT_ON_ERROR", false)?,
        };

        cfg.validate()?;
        Ok((cfg, args.migrate))
    }

    fn validate(&self) -> RelayResult<()> {
        if !(1..=1440).contains(&self.poll_interval_minutes) {
            return Err(RelayError::validation(format!(
                "poll interval must be between 1 and 1440 minutes, got {}",
                self.poll_interval_minutes
            )));
        }
        if self.split_threshold == 0 {
            return Err(RelayError::validation("RELAY_SPLIT_THRESHOLD_BYTES must be greater than zero"));
        }
        if self.chunk_size == 0 {
            return Err(RelayError::validation("RELAY_CHUNK_SIZE_BYTES must be greater than zero"));
        }
        if self.heartbeat_hours > MAX_HEARTBEAT_HOURS {
            return Err(RelayError::validation(format!(
                "heartbeat interval must be at most {} hours, got {}",
                MAX_HEARTBEAT_HOURS, self.heartbeat_hours
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(RelayError::validation("RELAY_REQUEST_TIMEOUT_SECS must be greater than zero"));
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> RelayResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|err| RelayError::validation(format!("parsing {} value `{}`: {}", name, value, err))),
        None => Ok(default),
    }
}

fn parse_flag<F>(var: &F, name: &str, default: bool) -> RelayResult<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(RelayError::validation(format!("parsing {} value `{}`: expected a boolean", name, v))),
    }
}
