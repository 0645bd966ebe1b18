use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use tracing::warn;

pub const DEFAULT_RECHECK_SECS: u64 = 60;

/// Optional dotenv file holding the generated database credentials.
pub const ENV_FILE_NAME: &str = "postgres.env";

#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

/// Delay before the next pass. A clean pass always waits `base_delay`;
/// consecutive failures double it up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::flat(Duration::from_secs(DEFAULT_RECHECK_SECS))
    }
}

impl RetryPolicy {
    pub fn flat(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_after_failures(&self, consecutive_failures: u32) -> Duration {
        let doublings = consecutive_failures.saturating_sub(1);
        let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay.max(self.base_delay))
    }
}

#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub database: DatabaseConfig,
    pub data_dir: PathBuf,
    pub recheck_every: Duration,
    pub retry: RetryPolicy,
}

impl FeederConfig {
    /// Process environment, falling back to `postgres.env` in the working
    /// directory when it exists.
    pub fn from_env() -> Self {
        Self::from_env_file(ENV_FILE_NAME)
    }

    pub fn from_env_file(path: impl AsRef<Path>) -> Self {
        Self::layered(|key| std::env::var(key).ok(), path.as_ref())
    }

    fn layered(lookup: impl Fn(&str) -> Option<String>, env_file: &Path) -> Self {
        let file = read_env_file(env_file);
        Self::from_lookup(|key| lookup(key).or_else(|| file.get(key).cloned()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let recheck_secs = lookup("FEEDER_RECHECK_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RECHECK_SECS);
        let retry_max_secs = lookup("FEEDER_RETRY_MAX_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(recheck_secs);
        let recheck_every = Duration::from_secs(recheck_secs);

        Self {
            database: DatabaseConfig {
                host: string("POSTGRES_HOST", "db"),
                port: lookup("POSTGRES_PORT")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5432),
                user: string("POSTGRES_USER", "vacancy"),
                password: string("POSTGRES_PASSWORD", "psql"),
                database: string("POSTGRES_DB", "vacancy"),
            },
            data_dir: PathBuf::from(string("FEEDER_DATA_DIR", "data")),
            recheck_every,
            retry: RetryPolicy {
                base_delay: recheck_every,
                max_delay: Duration::from_secs(retry_max_secs),
            },
        }
    }
}

fn read_env_file(path: &Path) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(err) if err.not_found() => return vars,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable env file");
            return vars;
        }
    };
    for entry in entries {
        match entry {
            Ok((key, value)) => {
                vars.insert(key, value);
            }
            Err(err) => warn!(path = %path.display(), error = %err, "skipping env file entry"),
        }
    }
    vars
}
