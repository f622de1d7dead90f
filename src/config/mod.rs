//! Typed configuration.
//!
//! Process settings come from environment variables and are loaded once at
//! startup. Service options (retry timing, worker count, rule lists) come
//! from an optional TOML file named by `FRESHET_CONFIG_FILE`. Both fail fast
//! on anything missing or malformed.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::rules::{RawRuleTable, RuleLists};
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug)]
pub struct Config {
    /// Required by every command that touches Postgres.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            config_file: optional_var("FRESHET_CONFIG_FILE").map(PathBuf::from),
        })
    }

    /// The database URL, or a configuration error naming the variable.
    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }

    /// Service options from the configured file, or defaults without one.
    pub fn options(&self) -> Result<Options> {
        match &self.config_file {
            Some(path) => Options::from_file(path),
            None => Ok(Options::default()),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Where inbound events come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Messaging {
    /// The pgmq ingress queue in Postgres.
    #[default]
    Pgmq,
    /// Events are dispatched in-process as they are submitted.
    InMemory,
}

/// Service options, read from TOML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Seconds a collaborator call is retried before giving up.
    pub net_timeout: u64,
    /// Seconds between retries.
    pub net_retry_interval: u64,
    pub max_workers: usize,
    /// Seconds between queue polls when no notification arrives.
    pub polling_interval: u64,
    /// Seconds a read message stays invisible to other workers.
    pub visibility_timeout: u64,
    pub dry_run: bool,
    pub messaging: Messaging,
    /// Appended to the release of rebuilt image NVRs, e.g. ".fm".
    pub rebuilt_nvr_release_suffix: String,
    pub handler_build_allowlist: RawRuleTable,
    pub handler_build_blocklist: RawRuleTable,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            net_timeout: 120,
            net_retry_interval: 30,
            max_workers: 10,
            polling_interval: 60,
            visibility_timeout: 60,
            dry_run: false,
            messaging: Messaging::Pgmq,
            rebuilt_nvr_release_suffix: String::new(),
            handler_build_allowlist: RawRuleTable::new(),
            handler_build_blocklist: RawRuleTable::new(),
        }
    }
}

impl Options {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Parse and validate options.
    pub fn from_toml(text: &str) -> Result<Self> {
        let options: Options =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("net_timeout", self.net_timeout),
            ("net_retry_interval", self.net_retry_interval),
            ("polling_interval", self.polling_interval),
            ("visibility_timeout", self.visibility_timeout),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be positive")));
        }
        if self.net_retry_interval > self.net_timeout {
            return Err(Error::Config(format!(
                "net_retry_interval ({}) exceeds net_timeout ({})",
                self.net_retry_interval, self.net_timeout
            )));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be positive".to_string()));
        }
        if i32::try_from(self.visibility_timeout).is_err() {
            return Err(Error::Config("visibility_timeout is too large".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.net_timeout),
            Duration::from_secs(self.net_retry_interval),
        )
    }

    /// Compile the allow/block lists. Malformed rules are an error.
    pub fn rules(&self) -> Result<RuleLists> {
        RuleLists::from_config(&self.handler_build_allowlist, &self.handler_build_blocklist)
    }
}
