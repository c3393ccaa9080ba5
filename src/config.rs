//! Runtime configuration, read from the environment.
//!
//! Secrets may be given directly (`SHKEEPER_API_KEY=...`) or through a file
//! (`SHKEEPER_API_KEY_FILE=/run/secrets/api_key`); the file wins when it can
//! be read.

use crate::application::outbox::RetryPolicy;
use crate::error::{ReconcileError, Result};
use crate::interfaces::http::signature::SignatureVerifier;
use crate::interfaces::shkeeper::ShkeeperConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SHKEEPER_URL: &str = "http://shkeeper:5000";
const DEFAULT_REQUESTS_TIMEOUT: u64 = 10;
const DEFAULT_REQUESTS_NOTIFICATION_TIMEOUT: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 7;
const DEFAULT_NOTIFICATION_TASK_DELAY: u64 = 60;
const DEFAULT_SWEEP_INTERVAL: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Skips webhook signature checks and raises the default log level.
    pub dev_mode: bool,
    pub webhook_secret: Option<String>,
    pub shkeeper: ShkeeperConfig,
    pub db_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub sweep_interval: Duration,
    /// `None` disables background status polling.
    pub sync_interval: Option<Duration>,
    pub bot_notify_url: Option<String>,
    /// Per-request timeout for side-effect notifications to the bot.
    pub notification_timeout: Duration,
    /// Key required on the order API; without one the API only opens in dev mode.
    pub orders_api_key: Option<String>,
    /// Externally reachable base URL, used to build invoice callback URLs.
    pub public_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads only `DEV_MODE`, so logging can be set up before the rest of the
    /// configuration is loaded.
    pub fn dev_mode_from_env() -> bool {
        read_bool(&|name: &str| std::env::var(name).ok(), "DEV_MODE")
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dev_mode = read_bool(&lookup, "DEV_MODE");
        let port = read_parsed(&lookup, "PORT")?.unwrap_or(DEFAULT_PORT);
        let timeout = Duration::from_secs(
            read_parsed(&lookup, "REQUESTS_TIMEOUT")?.unwrap_or(DEFAULT_REQUESTS_TIMEOUT),
        );

        let webhook_secret = load_secret(&lookup, "SHKEEPER_WEBHOOK_SECRET")
            .or_else(|| load_secret(&lookup, "SECRET_KEY"))
            .or_else(|| load_secret(&lookup, "SHKEEPER_SECRET_KEY"));

        let shkeeper = ShkeeperConfig {
            base_url: read_string(&lookup, "SHKEEPER_URL")
                .unwrap_or_else(|| DEFAULT_SHKEEPER_URL.to_string()),
            api_key: load_secret(&lookup, "SHKEEPER_API_KEY").unwrap_or_default(),
            timeout,
        };

        let db_path = read_string(&lookup, "DATABASE_URL").map(|url| {
            PathBuf::from(url.strip_prefix("rocksdb://").unwrap_or(&url))
        });

        let retry = RetryPolicy {
            max_retries: read_parsed(&lookup, "MAX_RETRIES")?.unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay: Duration::from_secs(
                read_parsed(&lookup, "NOTIFICATION_TASK_DELAY")?
                    .unwrap_or(DEFAULT_NOTIFICATION_TASK_DELAY),
            ),
        };

        let notification_timeout = Duration::from_secs(
            read_parsed(&lookup, "REQUESTS_NOTIFICATION_TIMEOUT")?
                .unwrap_or(DEFAULT_REQUESTS_NOTIFICATION_TIMEOUT),
        );

        let sweep_interval: u64 =
            read_parsed(&lookup, "SWEEP_INTERVAL")?.unwrap_or(DEFAULT_SWEEP_INTERVAL);
        if sweep_interval == 0 {
            return Err(ReconcileError::ConfigError(
                "SWEEP_INTERVAL must be at least 1 second".to_string(),
            ));
        }
        let sync_interval = read_parsed::<u64, _>(&lookup, "SYNC_INTERVAL")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let public_url = read_string(&lookup, "PUBLIC_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            port,
            dev_mode,
            webhook_secret,
            shkeeper,
            db_path,
            retry,
            sweep_interval: Duration::from_secs(sweep_interval),
            sync_interval,
            bot_notify_url: read_string(&lookup, "BOT_NOTIFY_URL"),
            notification_timeout,
            orders_api_key: load_secret(&lookup, "ORDERS_API_KEY"),
            public_url,
        })
    }

    /// Builds the webhook signature verifier. Outside dev mode a secret is required.
    pub fn verifier(&self) -> Result<SignatureVerifier> {
        match (&self.webhook_secret, self.dev_mode) {
            (Some(secret), dev_mode) => Ok(SignatureVerifier::new(secret.as_bytes(), dev_mode)),
            (None, true) => Ok(SignatureVerifier::new(Vec::<u8>::new(), true)),
            (None, false) => Err(ReconcileError::ConfigError(
                "SHKEEPER_WEBHOOK_SECRET (or SECRET_KEY) must be set unless DEV_MODE is enabled"
                    .to_string(),
            )),
        }
    }

    pub fn callback_url(&self, path: &str) -> String {
        format!("{}{path}", self.public_url)
    }

    pub fn requests_timeout(&self) -> Duration {
        self.shkeeper.timeout
    }
}

fn read_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_parsed<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    read_string(lookup, name)
        .map(|raw| {
            raw.parse().map_err(|e| {
                ReconcileError::ConfigError(format!("{name}: invalid value '{raw}': {e}"))
            })
        })
        .transpose()
}

/// `1`, `true`, `yes` and `on` (any case) are true; anything else, or unset, is false.
fn read_bool<F>(lookup: &F, name: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    read_string(lookup, name).is_some_and(|raw| {
        matches!(
            raw.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Reads `<name>_FILE` if set and readable, otherwise `<name>`.
fn load_secret<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let file_var = format!("{name}_FILE");
    if let Some(path) = read_string(lookup, &file_var) {
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let content = content.trim().to_string();
                if !content.is_empty() {
                    return Some(content);
                }
                tracing::warn!(variable = %file_var, %path, "secret file is empty");
            }
            Err(e) => {
                tracing::warn!(variable = %file_var, %path, error = %e, "cannot read secret file");
            }
        }
    }
    read_string(lookup, name)
}
