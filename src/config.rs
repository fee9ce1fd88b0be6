use std::env;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use tokio::time::Duration;
use zeroize::Zeroizing;

use crate::check::CheckOptions;
use crate::crypto::{CipherError, InviteCipher};
use crate::queue::QueueConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    pub retention_days: u32,
    pub batch: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention_days: 30,
            batch: 100,
        }
    }
}

/// Everything read from the environment at startup.
pub struct AppConfig {
    pub discord_token: Zeroizing<String>,
    /// `None` runs on the in-memory engine.
    pub db_path: Option<PathBuf>,
    encryption_key: Zeroizing<String>,
    retired_keys: Zeroizing<String>,
    pub check: CheckOptions,
    pub queue: QueueConfig,
    pub maintenance: MaintenanceConfig,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("db_path", &self.db_path)
            .field("check", &self.check)
            .field("queue", &self.queue)
            .field("maintenance", &self.maintenance)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, anyhow::Error> {
        let discord_token = get("DISCORD_TOKEN").ok_or_else(|| anyhow!("DISCORD_TOKEN is not set"))?;
        let encryption_key =
            get("INVITE_ENCRYPTION_KEY").ok_or_else(|| anyhow!("INVITE_ENCRYPTION_KEY is not set"))?;

        let db_path = get("INVITE_DB_PATH")
            .filter(|path| !path.trim().is_empty() && !path.eq_ignore_ascii_case("memory"))
            .map(PathBuf::from);

        let cooldown = duration(&get, "INVITE_CHECK_COOLDOWN", Duration::from_secs(24 * 60 * 60))?;
        let rate_per_second: u32 = number(&get, "LOOKUP_RATE_PER_SECOND", 5)?;
        let concurrency: usize = number(&get, "LOOKUP_CONCURRENCY", 3)?;
        if concurrency == 0 {
            return Err(anyhow!("LOOKUP_CONCURRENCY must be at least 1"));
        }

        let defaults = MaintenanceConfig::default();
        let config = Self {
            discord_token: Zeroizing::new(discord_token),
            db_path,
            encryption_key: Zeroizing::new(encryption_key),
            retired_keys: Zeroizing::new(get("INVITE_ENCRYPTION_KEY_PREVIOUS").unwrap_or_default()),
            check: CheckOptions {
                cooldown: chrono::Duration::from_std(cooldown)
                    .context("INVITE_CHECK_COOLDOWN is out of range")?,
                message_window: number(&get, "INVITE_MESSAGE_WINDOW", 10)?,
            },
            queue: QueueConfig {
                concurrency,
                rate_per_second: NonZeroU32::new(rate_per_second)
                    .ok_or_else(|| anyhow!("LOOKUP_RATE_PER_SECOND must be at least 1"))?,
                timeout: duration(&get, "LOOKUP_TIMEOUT", Duration::from_secs(15))?,
            },
            maintenance: MaintenanceConfig {
                interval: duration(&get, "MAINTENANCE_INTERVAL", defaults.interval)?,
                retention_days: number(&get, "RECYCLE_RETENTION_DAYS", defaults.retention_days)?,
                batch: number(&get, "MAINTENANCE_BATCH", defaults.batch)?,
            },
        };

        if !(1..=100).contains(&config.check.message_window) {
            return Err(anyhow!("INVITE_MESSAGE_WINDOW must be between 1 and 100"));
        }
        Ok(config)
    }

    /// Builds the cipher from the current key plus any retired ones.
    pub fn cipher(&self) -> Result<InviteCipher, CipherError> {
        self.retired_keys
            .split(',')
            .filter(|key| !key.trim().is_empty())
            .try_fold(InviteCipher::from_hex(&self.encryption_key)?, |cipher, key| {
                cipher.with_retired_hex(key)
            })
    }
}

fn duration(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, anyhow::Error> {
    match get(key) {
        Some(raw) => humantime::parse_duration(raw.trim()).with_context(|| format!("{key} is not a valid duration")),
        None => Ok(default),
    }
}

fn number<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, anyhow::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("{key} is not a valid number")),
        None => Ok(default),
    }
}
