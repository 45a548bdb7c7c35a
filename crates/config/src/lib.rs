use std::env;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Cannot create directory {path}: {reason}")]
    Directory { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: String,
    pub download_dir: String,
    pub api_host: String,
    pub api_port: u16,
    pub peer_port: u16,
    pub max_peers: usize,
    pub max_global_connections: usize,
    pub piece_timeout_seconds: u64,
    pub connection_timeout_seconds: u64,
    pub seed_after_complete: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: "torrents.db".to_string(),
            download_dir: "downloads".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8080,
            peer_port: 6881,
            max_peers: 50,
            max_global_connections: 200,
            piece_timeout_seconds: 30,
            connection_timeout_seconds: 10,
            seed_after_complete: true,
            log_level: "info".to_string(),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("'{}' ({})", raw, e),
        }),
        None => Ok(default),
    }
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds and validates a configuration from any key source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let config = Config {
            database_path: lookup("DATABASE_PATH").unwrap_or(defaults.database_path),
            download_dir: lookup("DOWNLOAD_DIR").unwrap_or(defaults.download_dir),
            api_host: lookup("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse(&lookup, "API_PORT", defaults.api_port)?,
            peer_port: parse(&lookup, "PEER_PORT", defaults.peer_port)?,
            max_peers: parse(&lookup, "MAX_PEERS", defaults.max_peers)?,
            max_global_connections: parse(&lookup, "MAX_GLOBAL_CONNECTIONS", defaults.max_global_connections)?,
            piece_timeout_seconds: parse(&lookup, "PIECE_TIMEOUT_SECONDS", defaults.piece_timeout_seconds)?,
            connection_timeout_seconds: parse(
                &lookup,
                "CONNECTION_TIMEOUT_SECONDS",
                defaults.connection_timeout_seconds,
            )?,
            seed_after_complete: parse(&lookup, "SEED_AFTER_COMPLETE", defaults.seed_after_complete)?,
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| ConfigError::Invalid {
            key,
            reason: reason.to_string(),
        };
        if self.database_path.trim().is_empty() {
            return Err(invalid("DATABASE_PATH", "must not be empty"));
        }
        if self.download_dir.trim().is_empty() {
            return Err(invalid("DOWNLOAD_DIR", "must not be empty"));
        }
        if self.api_port == 0 {
            return Err(invalid("API_PORT", "must be non-zero"));
        }
        if self.peer_port == 0 {
            return Err(invalid("PEER_PORT", "must be non-zero"));
        }
        if self.max_peers == 0 {
            return Err(invalid("MAX_PEERS", "must be greater than zero"));
        }
        if self.max_global_connections == 0 {
            return Err(invalid("MAX_GLOBAL_CONNECTIONS", "must be greater than zero"));
        }
        if self.max_peers > self.max_global_connections {
            return Err(invalid("MAX_PEERS", "must not exceed MAX_GLOBAL_CONNECTIONS"));
        }
        if self.piece_timeout_seconds == 0 {
            return Err(invalid("PIECE_TIMEOUT_SECONDS", "must be greater than zero"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(invalid("CONNECTION_TIMEOUT_SECONDS", "must be greater than zero"));
        }
        Ok(())
    }

    /// Creates the download directory and the database's parent directory.
    pub fn prepare_directories(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![Path::new(&self.download_dir)];
        if let Some(parent) = Path::new(&self.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                dirs.push(parent);
            }
        }
        for dir in dirs {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Directory {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.api_address(), "0.0.0.0:8080");
    }

    #[test]
    fn values_are_read_and_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("PEER_PORT", "51413"),
            ("MAX_PEERS", "20"),
            ("SEED_AFTER_COMPLETE", "false"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.peer_port, 51413);
        assert_eq!(config.max_peers, 20);
        assert!(!config.seed_after_complete);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn bad_values_name_their_key() {
        let err = Config::from_lookup(lookup(&[("API_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "API_PORT", .. }));

        let err = Config::from_lookup(lookup(&[("PEER_PORT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PEER_PORT", .. }));

        let err = Config::from_lookup(lookup(&[("MAX_PEERS", "300")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_PEERS", .. }));

        let err = Config::from_lookup(lookup(&[("PIECE_TIMEOUT_SECONDS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PIECE_TIMEOUT_SECONDS", .. }));
    }

    #[test]
    fn prepare_directories_creates_both_paths() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: root.path().join("db/engine.db").display().to_string(),
            download_dir: root.path().join("payload").display().to_string(),
            ..Config::default()
        };
        config.prepare_directories().unwrap();
        assert!(root.path().join("db").is_dir());
        assert!(root.path().join("payload").is_dir());
    }
}
