//! Configuration for the SFTP server
//!
//! Built once at startup (from a TOML file, CLI flags, or both), validated,
//! then shared read-only with every component.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default authorized keys location, consulted only if it exists
pub const DEFAULT_AUTHORIZED_KEYS: &str = "~/.ssh/authorized_keys";

/// Largest read served in one SSH_FXP_DATA packet
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// Upper bound on authentication attempts per connection
pub const AUTH_ATTEMPTS_LIMIT: usize = 6;

/// SFTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on, `host:port`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// SSH host key path; generated and cached when unset
    #[serde(default)]
    pub host_key: Option<PathBuf>,

    /// Directory holding the generated host key
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Authorized keys file path (`~` is expanded)
    #[serde(default = "default_authorized_keys")]
    pub authorized_keys: Option<PathBuf>,

    /// Single user name for password authentication
    #[serde(default)]
    pub user: Option<String>,

    /// Password for `user`
    #[serde(default)]
    pub pass: Option<String>,

    /// Accept every connection without authentication
    #[serde(default)]
    pub no_auth: bool,

    /// Authentication attempts allowed per connection before disconnecting
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,

    /// Idle connections are closed after this many seconds, 0 disables
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Largest SFTP packet accepted from a client
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Open handles allowed per SFTP session
    #[serde(default = "default_max_open_handles")]
    pub max_open_handles: usize,

    /// Entries returned per SSH_FXP_READDIR
    #[serde(default = "default_readdir_batch_size")]
    pub readdir_batch_size: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            host_key: None,
            cache_dir: None,
            authorized_keys: default_authorized_keys(),
            user: None,
            pass: None,
            no_auth: false,
            max_auth_attempts: default_max_auth_attempts(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            max_packet_size: default_max_packet_size(),
            max_open_handles: default_max_open_handles(),
            readdir_batch_size: default_readdir_batch_size(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    ///
    /// Only checks the values themselves; whether an authentication policy
    /// actually results is decided by [`crate::Authenticator::from_config`].
    pub fn validate(&self) -> crate::Result<()> {
        let port = self
            .listen_addr
            .rsplit_once(':')
            .and_then(|(host, port)| (!host.is_empty()).then_some(port))
            .ok_or_else(|| {
                crate::Error::Config(format!(
                    "listen_addr must be host:port, got {:?}",
                    self.listen_addr
                ))
            })?;
        port.parse::<u16>().map_err(|_| {
            crate::Error::Config(format!("Invalid port in listen_addr: {:?}", port))
        })?;

        match (&self.user, &self.pass) {
            (Some(_), None) => {
                return Err(crate::Error::Config(
                    "user is set but pass is missing".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(crate::Error::Config(
                    "pass is set but user is missing".to_string(),
                ));
            }
            (Some(user), Some(_)) if user.is_empty() => {
                return Err(crate::Error::Config("user must not be empty".to_string()));
            }
            _ => {}
        }

        if !(1..=AUTH_ATTEMPTS_LIMIT).contains(&self.max_auth_attempts) {
            return Err(crate::Error::Config(format!(
                "max_auth_attempts must be between 1 and {AUTH_ATTEMPTS_LIMIT}"
            )));
        }

        if self.max_packet_size < 65536 {
            return Err(crate::Error::Config(
                "max_packet_size must be at least 65536 bytes".to_string(),
            ));
        }

        if self.max_open_handles == 0 {
            return Err(crate::Error::Config(
                "max_open_handles must be greater than 0".to_string(),
            ));
        }

        if self.readdir_batch_size == 0 {
            return Err(crate::Error::Config(
                "readdir_batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory used for generated state, `<platform cache dir>/owlfs` by default
    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("owlfs")))
    }

    /// Authorized keys path with `~` expanded
    pub fn authorized_keys_path(&self) -> Option<PathBuf> {
        self.authorized_keys.as_deref().map(expand_home)
    }

    /// True when the authorized keys path was left at its default
    pub fn authorized_keys_is_default(&self) -> bool {
        self.authorized_keys.as_deref() == Some(Path::new(DEFAULT_AUTHORIZED_KEYS))
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn default_listen_addr() -> String {
    "localhost:2022".to_string()
}

fn default_authorized_keys() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_AUTHORIZED_KEYS))
}

fn default_max_auth_attempts() -> usize {
    3
}

fn default_inactivity_timeout() -> u64 {
    600
}

fn default_max_packet_size() -> u32 {
    // Room for a full 256 KiB read or write plus its header
    MAX_READ_LEN + 1024
}

fn default_max_open_handles() -> usize {
    1024
}

fn default_readdir_batch_size() -> usize {
    128
}
