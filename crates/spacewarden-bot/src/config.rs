//! Bot configuration loaded from environment variables.
//!
//! Credentials are required; everything else has a default so the bot can
//! start with just `MATRIX_HOMESERVER`, `MATRIX_USER`, and
//! `MATRIX_PASSWORD` set.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context};
use spacewarden_shared::constants::{DEFAULT_COMMAND_PREFIX, DEFAULT_MIN_POWER_LEVEL};
use spacewarden_shared::UserId;

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Homeserver base URL, e.g. `https://matrix.example.com`.
    /// Env: `MATRIX_HOMESERVER` (required)
    pub homeserver: String,

    /// The bot's full user ID, e.g. `@warden:example.com`.
    /// Env: `MATRIX_USER` (required)
    pub user_id: UserId,

    /// Password for the bot account.
    /// Env: `MATRIX_PASSWORD` (required)
    pub password: String,

    /// SQLite database path.  Empty means the per-user data directory.
    /// Env: `SPACEWARDEN_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Command prefix.
    /// Env: `SPACEWARDEN_COMMAND_PREFIX`
    /// Default: `!!`
    pub command_prefix: String,

    /// Minimum power level for restricted commands.
    /// Env: `SPACEWARDEN_MIN_POWER_LEVEL`
    /// Default: `50`
    pub min_power_level: i64,

    /// Retry ceiling for retryable invite failures.
    /// Env: `SPACEWARDEN_INVITE_MAX_ATTEMPTS`
    /// Default: `3`
    pub invite_max_attempts: u32,

    /// Seconds an issued invite may wait for acceptance (0 disables
    /// expiry).
    /// Env: `SPACEWARDEN_INVITE_ACCEPT_TIMEOUT_SECS`
    /// Default: `0`
    pub invite_accept_timeout_secs: u64,

    /// Run a full reconciliation every this many sync cycles (0 disables
    /// the periodic trigger).
    /// Env: `SPACEWARDEN_RECONCILE_INTERVAL_CYCLES`
    /// Default: `20`
    pub reconcile_interval_cycles: u64,

    /// Login retries when the homeserver rate-limits (0 = unlimited).
    /// Env: `SPACEWARDEN_LOGIN_MAX_RETRIES`
    /// Default: `5`
    pub login_max_retries: u32,
}

impl BotConfig {
    /// Load configuration from environment variables.
    ///
    /// Missing credentials are a hard error; malformed optional values fall
    /// back to their defaults with a warning.
    pub fn from_env() -> anyhow::Result<Self> {
        let homeserver = require("MATRIX_HOMESERVER")?
            .trim_end_matches('/')
            .to_owned();
        let raw_user = require("MATRIX_USER")?;
        let user_id = match UserId::from_str(&raw_user) {
            Ok(user_id) => user_id,
            Err(e) => bail!("MATRIX_USER is not a valid user ID: {e}"),
        };
        let password = require("MATRIX_PASSWORD")?;

        let mut config = Self {
            homeserver,
            user_id,
            password,
            db_path: None,
            command_prefix: DEFAULT_COMMAND_PREFIX.to_owned(),
            min_power_level: DEFAULT_MIN_POWER_LEVEL,
            invite_max_attempts: 3,
            invite_accept_timeout_secs: 0,
            reconcile_interval_cycles: 20,
            login_max_retries: 5,
        };

        if let Ok(path) = std::env::var("SPACEWARDEN_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(prefix) = std::env::var("SPACEWARDEN_COMMAND_PREFIX") {
            if prefix.is_empty() {
                bail!("SPACEWARDEN_COMMAND_PREFIX must not be empty");
            }
            config.command_prefix = prefix;
        }

        parse_var("SPACEWARDEN_MIN_POWER_LEVEL", &mut config.min_power_level);
        parse_var(
            "SPACEWARDEN_INVITE_MAX_ATTEMPTS",
            &mut config.invite_max_attempts,
        );
        parse_var(
            "SPACEWARDEN_INVITE_ACCEPT_TIMEOUT_SECS",
            &mut config.invite_accept_timeout_secs,
        );
        parse_var(
            "SPACEWARDEN_RECONCILE_INTERVAL_CYCLES",
            &mut config.reconcile_interval_cycles,
        );
        parse_var("SPACEWARDEN_LOGIN_MAX_RETRIES", &mut config.login_max_retries);

        Ok(config)
    }
}

fn require(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

/// Overwrite `target` with a parsed env value, keeping the default on a
/// parse failure.
fn parse_var<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "invalid value, using default");
            }
        }
    }
}
