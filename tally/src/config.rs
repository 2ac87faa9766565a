//! Server configuration.
//!
//! A [`ServerConfig`] is read from a JSON file, every field optional:
//!
//! ```json
//! {
//!   "database": "/var/lib/tally/metrics.db",
//!   "listen": "unix:///run/tally.sock",
//!   "flush_interval_ms": 1000,
//!   "flush_threshold": 1000,
//!   "periods": ["day", "hour", "minute"],
//!   "allow_remote_shutdown": true,
//!   "requeue_on_failure": false
//! }
//! ```
//!
//! The CLI applies its flags on top of the file and then calls
//! [`ServerConfig::validate`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::flush::{DEFAULT_FLUSH_THRESHOLD, FlushOptions};
use crate::period::Period;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "tcp://127.0.0.1:8765";

/// Default database file.
pub const DEFAULT_DATABASE: &str = "tally.db";

/// Default timer interval in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Where the ingestion server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ListenAddr {
    /// `tcp://host:port`
    Tcp(String),
    /// `unix:///path/to/socket`
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidListen(s.to_string());

        if let Some(addr) = s.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(invalid());
            }
            Ok(Self::Tcp(addr.to_string()))
        } else if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid());
            }
            Ok(Self::Unix(PathBuf::from(path)))
        } else {
            Err(invalid())
        }
    }
}

impl TryFrom<String> for ListenAddr {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ListenAddr> for String {
    fn from(addr: ListenAddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl Default for ListenAddr {
    fn default() -> Self {
        Self::Tcp(DEFAULT_LISTEN.trim_start_matches("tcp://").to_string())
    }
}

/// Settings for `tally serve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// SQLite database file.
    pub database: PathBuf,
    /// Listen address.
    pub listen: ListenAddr,
    /// Timer-triggered flush interval in milliseconds.
    pub flush_interval_ms: u64,
    /// A flush is triggered every this many received events; 0 disables.
    pub flush_threshold: usize,
    /// Periods rolled up by every flush.
    pub periods: Vec<Period>,
    /// Honour the shutdown sentinel sent by clients.
    pub allow_remote_shutdown: bool,
    /// Put events back into the buffer when committing them fails.
    pub requeue_on_failure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            listen: ListenAddr::default(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            periods: Period::DEFAULT.to_vec(),
            allow_remote_shutdown: true,
            requeue_on_failure: false,
        }
    }
}

impl ServerConfig {
    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Read`] if the file cannot be read
    /// - [`ConfigError::Parse`] if it is not a valid config
    /// - any error from [`ServerConfig::validate`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "database",
                reason: "path cannot be empty".to_string(),
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "flush_interval_ms",
                reason: "interval cannot be zero".to_string(),
            });
        }
        if self.periods.is_empty() {
            return Err(ConfigError::Invalid {
                field: "periods",
                reason: "at least one period is required".to_string(),
            });
        }
        Ok(())
    }

    /// The timer interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Options for the flush coordinator.
    pub fn flush_options(&self) -> FlushOptions {
        FlushOptions {
            periods: self.periods.clone(),
            threshold: self.flush_threshold,
            requeue_on_failure: self.requeue_on_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
        assert_eq!(config.flush_threshold, 1000);
        assert_eq!(config.periods, Period::DEFAULT.to_vec());
        assert!(config.allow_remote_shutdown);
        assert!(!config.requeue_on_failure);
        config.validate().unwrap();
    }

    #[test]
    fn test_listen_addr_parse() {
        assert_eq!(
            "tcp://0.0.0.0:9000".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("0.0.0.0:9000".to_string())
        );
        assert_eq!(
            "unix:///tmp/tally.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/tally.sock"))
        );
        for bad in ["127.0.0.1:9000", "tcp://nohost", "tcp://:80", "tcp://h:99999", "unix://", "http://x:1"] {
            assert!(
                matches!(bad.parse::<ListenAddr>(), Err(ConfigError::InvalidListen(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen": "unix:///tmp/t.sock", "periods": ["minute", "day"], "requeue_on_failure": true}}"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.listen, ListenAddr::Unix(PathBuf::from("/tmp/t.sock")));
        assert_eq!(config.periods, vec![Period::Minute, Period::Day]);
        assert!(config.requeue_on_failure);
        assert_eq!(config.flush_interval_ms, DEFAULT_FLUSH_INTERVAL_MS);
    }

    #[test]
    fn test_load_rejects_bad_input() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"listen": "nowhere"}}"#).unwrap();
        assert!(matches!(
            ServerConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"flush_interval_ms": 0}}"#).unwrap();
        assert!(matches!(
            ServerConfig::load(file.path()),
            Err(ConfigError::Invalid {
                field: "flush_interval_ms",
                ..
            })
        ));

        assert!(matches!(
            ServerConfig::load("/nonexistent/tally.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
