//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

/// Read an environment variable and parse it, falling back to a default on missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,

    /// Log level filter (used when RUST_LOG is unset)
    pub log_level: String,

    /// Controller data directory (database, database snapshots)
    pub data_dir: PathBuf,

    /// Default backup root, used until the `backup_root` setting is written
    pub backups_dir: PathBuf,

    /// Controller-wide cap on concurrent upload slots
    pub max_concurrent_global: usize,

    /// Per-agent cap on concurrent upload slots
    pub max_concurrent_per_server: usize,

    /// Fallback controller IP handed to deployed agents when source-IP
    /// detection over SSH yields nothing usable
    pub backup_server_ip: Option<String>,

    /// Path to the agent binary served to remote hosts
    pub agent_binary_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 3000),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".into())),
            backups_dir: PathBuf::from(
                env::var("BACKUPS_DIR").unwrap_or_else(|_| "backups".into()),
            ),
            max_concurrent_global: env_parse("MAX_CONCURRENT_GLOBAL", 8),
            max_concurrent_per_server: env_parse("MAX_CONCURRENT_PER_SERVER", 4),
            backup_server_ip: env::var("BACKUP_SERVER_IP").ok(),
            agent_binary_path: PathBuf::from(
                env::var("AGENT_BINARY_PATH").unwrap_or_else(|_| "bin/backup-agent".into()),
            ),
        }
    }

    /// Path of the SQLite database file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("backup-server.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        env::set_var("TEST_ENV_PARSE_PORT", "not-a-number");
        assert_eq!(env_parse("TEST_ENV_PARSE_PORT", 42u16), 42);
        env::remove_var("TEST_ENV_PARSE_PORT");
    }

    #[test]
    fn db_path_lives_under_data_dir() {
        let config = Config {
            port: 3000,
            log_level: "info".into(),
            data_dir: PathBuf::from("/srv/data"),
            backups_dir: PathBuf::from("/srv/backups"),
            max_concurrent_global: 8,
            max_concurrent_per_server: 4,
            backup_server_ip: None,
            agent_binary_path: PathBuf::from("bin/backup-agent"),
        };
        assert_eq!(config.db_path(), PathBuf::from("/srv/data/backup-server.db"));
    }
}
