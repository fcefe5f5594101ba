// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_BATCH_LIMIT, DEFAULT_IDLE_TIMEOUT, DEFAULT_INDEX_PATTERN,
    DEFAULT_PARTITION_LOOKBACK_DAYS, DEFAULT_READER_FILE, DEFAULT_READER_POLL,
    DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_CEILING, DEFAULT_SHUTDOWN_DEADLINE, DEFAULT_SPOOL_DIR,
    DEFAULT_STORE_HOST, DEFAULT_STORE_TIMEOUT, DEFAULT_TIMEZONE, MAX_BATCH_LIMIT,
};
use crate::coordinator::CoordinatorConfig;
use crate::elastic::ElasticConfig;
use crate::errors::ConfigError;
use crate::partition::PartitionScheme;
use chrono_tz::Tz;
use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Shipper configuration, read from an optional YAML file and `LOGSHIP_*`
/// environment variables
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Elasticsearch base URLs, tried in order
    pub store_hosts: Vec<String>,
    /// strftime pattern naming the time-based indices
    pub index_pattern: String,
    pub store_timeout: Duration,
    pub partition_lookback_days: u32,
    /// Pending records that force a batch cycle
    pub batch_limit: usize,
    /// Pause after each committed batch before reading resumes
    pub batch_delay: Duration,
    pub retry_ceiling: u32,
    pub retry_backoff: Duration,
    pub idle_timeout: Duration,
    pub shutdown_deadline: Duration,
    /// Zone the syslog timestamps were written in
    pub timezone: String,
    pub reader_file: PathBuf,
    pub reader_follow: bool,
    pub reader_poll: Duration,
    pub spool_dir: PathBuf,
    pub https_proxy: Option<String>,
    pub log_level: String,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            store_hosts: vec![DEFAULT_STORE_HOST.to_string()],
            index_pattern: DEFAULT_INDEX_PATTERN.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            partition_lookback_days: DEFAULT_PARTITION_LOOKBACK_DAYS,
            batch_limit: DEFAULT_BATCH_LIMIT,
            batch_delay: Duration::ZERO,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            timezone: DEFAULT_TIMEZONE.to_string(),
            reader_file: PathBuf::from(DEFAULT_READER_FILE),
            reader_follow: true,
            reader_poll: DEFAULT_READER_POLL,
            spool_dir: PathBuf::from(DEFAULT_SPOOL_DIR),
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

/// Shape of `log-ship-elastic-postfix.yaml`. Every key is optional; missing
/// keys keep their defaults.
///
/// ```yaml
/// main:
///   spool: /var/spool/log-ship
/// elastic:
///   hosts: http://es1:9200, http://es2:9200
///   batch: 1024
/// parser:
///   timezone: America/Phoenix
/// reader:
///   file: /var/log/maillog
/// ```
#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub main: MainSection,
    pub elastic: ElasticSection,
    pub parser: ParserSection,
    pub reader: ReaderSection,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MainSection {
    pub spool: Option<PathBuf>,
    pub log_level: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub shutdown_deadline_secs: Option<u64>,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ElasticSection {
    pub hosts: Option<HostList>,
    pub index_pattern: Option<String>,
    pub timeout_secs: Option<u64>,
    pub lookback_days: Option<u32>,
    pub batch: Option<usize>,
    pub batch_delay_secs: Option<u64>,
    pub retry_ceiling: Option<u32>,
    pub retry_backoff_secs: Option<u64>,
    pub https_proxy: Option<String>,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParserSection {
    pub timezone: Option<String>,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReaderSection {
    pub file: Option<PathBuf>,
    pub follow: Option<bool>,
    pub poll_ms: Option<u64>,
}

/// Hosts as a list or as one comma/space separated string
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HostList {
    Many(Vec<String>),
    One(String),
}

impl HostList {
    fn into_hosts(self) -> Vec<String> {
        match self {
            HostList::Many(hosts) => hosts,
            HostList::One(hosts) => split_hosts(&hosts),
        }
    }
}

fn split_hosts(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn seconds_or(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|val| val.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

/// Config file locations in lookup order, without duplicates
pub fn config_candidates(config_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    let dirs = [config_dir, Some(Path::new("/etc")), Some(Path::new("."))];
    for dir in dirs.into_iter().flatten() {
        let path = dir.join(CONFIG_FILE_NAME);
        if !candidates.contains(&path) {
            candidates.push(path);
        }
    }
    candidates
}

impl ShipperConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from the first config file found (see
    /// [`config_candidates`]), with environment variables taking precedence.
    pub fn load(config_dir: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(config_dir, |key| env::var(key).ok())
    }

    pub fn load_with<F>(config_dir: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = match config_candidates(config_dir)
            .into_iter()
            .find(|path| path.is_file())
        {
            Some(path) => Self::default().with_file(&path)?,
            None => Self::default(),
        };
        let config = base.with_lookup(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Create configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::default().with_lookup(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Applies the values set in the YAML file at `path`.
    pub fn with_file(self, path: &Path) -> Result<Self, ConfigError> {
        let file: FileConfig = Figment::new()
            .merge(Yaml::file(path))
            .extract()
            .map_err(|e| ConfigError::File {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(self.with_file_config(file))
    }

    fn with_file_config(self, file: FileConfig) -> Self {
        let FileConfig {
            main,
            elastic,
            parser,
            reader,
        } = file;
        Self {
            store_hosts: elastic
                .hosts
                .map_or(self.store_hosts, HostList::into_hosts),
            index_pattern: elastic.index_pattern.unwrap_or(self.index_pattern),
            store_timeout: elastic
                .timeout_secs
                .map_or(self.store_timeout, Duration::from_secs),
            partition_lookback_days: elastic
                .lookback_days
                .unwrap_or(self.partition_lookback_days),
            batch_limit: elastic.batch.unwrap_or(self.batch_limit),
            batch_delay: elastic
                .batch_delay_secs
                .map_or(self.batch_delay, Duration::from_secs),
            retry_ceiling: elastic.retry_ceiling.unwrap_or(self.retry_ceiling),
            retry_backoff: elastic
                .retry_backoff_secs
                .map_or(self.retry_backoff, Duration::from_secs),
            idle_timeout: main
                .idle_timeout_secs
                .map_or(self.idle_timeout, Duration::from_secs),
            shutdown_deadline: main
                .shutdown_deadline_secs
                .map_or(self.shutdown_deadline, Duration::from_secs),
            timezone: parser.timezone.unwrap_or(self.timezone),
            reader_file: reader.file.unwrap_or(self.reader_file),
            reader_follow: reader.follow.unwrap_or(self.reader_follow),
            reader_poll: reader
                .poll_ms
                .map_or(self.reader_poll, Duration::from_millis),
            spool_dir: main.spool.unwrap_or(self.spool_dir),
            https_proxy: elastic.https_proxy.or(self.https_proxy),
            log_level: main
                .log_level
                .map_or(self.log_level, |level| level.to_lowercase()),
        }
    }

    /// Overrides with `LOGSHIP_*` values from `lookup`. Unparseable numbers
    /// keep the current value.
    fn with_lookup<F>(self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            store_hosts: lookup("LOGSHIP_ES_HOSTS")
                .map_or(self.store_hosts, |val| split_hosts(&val)),
            index_pattern: lookup("LOGSHIP_ES_INDEX_PATTERN").unwrap_or(self.index_pattern),
            store_timeout: seconds_or(lookup("LOGSHIP_ES_TIMEOUT_SECS"), self.store_timeout),
            partition_lookback_days: parse_or(
                lookup("LOGSHIP_PARTITION_LOOKBACK_DAYS"),
                self.partition_lookback_days,
            ),
            batch_limit: parse_or(lookup("LOGSHIP_BATCH_LIMIT"), self.batch_limit),
            batch_delay: seconds_or(lookup("LOGSHIP_BATCH_DELAY_SECS"), self.batch_delay),
            retry_ceiling: parse_or(lookup("LOGSHIP_RETRY_CEILING"), self.retry_ceiling),
            retry_backoff: seconds_or(lookup("LOGSHIP_RETRY_BACKOFF_SECS"), self.retry_backoff),
            idle_timeout: seconds_or(lookup("LOGSHIP_IDLE_TIMEOUT_SECS"), self.idle_timeout),
            shutdown_deadline: seconds_or(
                lookup("LOGSHIP_SHUTDOWN_DEADLINE_SECS"),
                self.shutdown_deadline,
            ),
            timezone: lookup("LOGSHIP_TIMEZONE").unwrap_or(self.timezone),
            reader_file: lookup("LOGSHIP_READER_FILE").map_or(self.reader_file, PathBuf::from),
            reader_follow: lookup("LOGSHIP_READER_FOLLOW")
                .map_or(self.reader_follow, |val| val.to_lowercase() != "false"),
            reader_poll: lookup("LOGSHIP_READER_POLL_MS")
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map_or(self.reader_poll, Duration::from_millis),
            spool_dir: lookup("LOGSHIP_SPOOL_DIR").map_or(self.spool_dir, PathBuf::from),
            https_proxy: lookup("LOGSHIP_PROXY_HTTPS")
                .or_else(|| lookup("HTTPS_PROXY"))
                .or(self.https_proxy),
            log_level: lookup("LOGSHIP_LOG_LEVEL")
                .map_or(self.log_level, |val| val.to_lowercase()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_hosts.is_empty() {
            return Err(ConfigError::Invalid(
                "LOGSHIP_ES_HOSTS cannot be empty".to_string(),
            ));
        }
        if let Some(host) = self
            .store_hosts
            .iter()
            .find(|host| !host.starts_with("http://") && !host.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "Store host '{host}' must start with http:// or https://"
            )));
        }

        if self.batch_limit == 0 || self.batch_limit > MAX_BATCH_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "LOGSHIP_BATCH_LIMIT must be between 1 and {MAX_BATCH_LIMIT}, got {}",
                self.batch_limit
            )));
        }

        self.timezone()?;
        self.partition_scheme()?;

        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "LOGSHIP_IDLE_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        let deadline = self.shutdown_deadline.as_secs();
        if !(1..=120).contains(&deadline) {
            return Err(ConfigError::Invalid(format!(
                "LOGSHIP_SHUTDOWN_DEADLINE_SECS must be between 1 and 120, got {deadline}"
            )));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone.parse::<Tz>().map_err(|_| {
            ConfigError::Invalid(format!("Unknown timezone '{}'", self.timezone))
        })
    }

    pub fn partition_scheme(&self) -> Result<PartitionScheme, ConfigError> {
        PartitionScheme::new(
            self.index_pattern.clone(),
            self.timezone()?,
            self.partition_lookback_days,
        )
    }

    pub fn elastic(&self) -> ElasticConfig {
        ElasticConfig {
            hosts: self.store_hosts.clone(),
            timeout: self.store_timeout,
            https_proxy: self.https_proxy.clone(),
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            retry_ceiling: self.retry_ceiling,
            retry_backoff: self.retry_backoff,
            inter_batch_delay: self.batch_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ShipperConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ShipperConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ShipperConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_limit, 1024);
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.retry_backoff, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, Duration::from_secs(21600));
        assert_eq!(config.timezone().unwrap(), chrono_tz::America::Phoenix);
    }

    #[test]
    fn test_reads_overrides() {
        let config = from_pairs(&[
            ("LOGSHIP_ES_HOSTS", "http://es1:9200, https://es2:9200"),
            ("LOGSHIP_BATCH_LIMIT", "50"),
            ("LOGSHIP_RETRY_BACKOFF_SECS", "5"),
            ("LOGSHIP_READER_FOLLOW", "FALSE"),
            ("LOGSHIP_READER_POLL_MS", "250"),
            ("LOGSHIP_TIMEZONE", "UTC"),
            ("LOGSHIP_LOG_LEVEL", "DEBUG"),
            ("HTTPS_PROXY", "http://proxy:3128"),
        ])
        .unwrap();

        assert_eq!(
            config.store_hosts,
            vec!["http://es1:9200".to_string(), "https://es2:9200".to_string()]
        );
        assert_eq!(config.batch_limit, 50);
        assert_eq!(config.coordinator().retry_backoff, Duration::from_secs(5));
        assert!(!config.reader_follow);
        assert_eq!(config.reader_poll, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.elastic().https_proxy.as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn test_unparseable_numbers_fall_back() {
        let config = from_pairs(&[("LOGSHIP_BATCH_LIMIT", "lots")]).unwrap();
        assert_eq!(config.batch_limit, 1024);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(from_pairs(&[("LOGSHIP_ES_HOSTS", " , ")]).is_err());
        assert!(from_pairs(&[("LOGSHIP_ES_HOSTS", "es1:9200")]).is_err());
        assert!(from_pairs(&[("LOGSHIP_BATCH_LIMIT", "0")]).is_err());
        assert!(from_pairs(&[("LOGSHIP_BATCH_LIMIT", "3334")]).is_err());
        assert!(from_pairs(&[("LOGSHIP_TIMEZONE", "Mars/Olympus")]).is_err());
        assert!(from_pairs(&[("LOGSHIP_ES_INDEX_PATTERN", "postfix-%")]).is_err());
        assert!(from_pairs(&[("LOGSHIP_IDLE_TIMEOUT_SECS", "0")]).is_err());
        assert!(from_pairs(&[("LOGSHIP_SHUTDOWN_DEADLINE_SECS", "600")]).is_err());
        assert!(from_pairs(&[("LOGSHIP_LOG_LEVEL", "verbose")]).is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var("LOGSHIP_BATCH_LIMIT", "7");
        env::set_var("LOGSHIP_SPOOL_DIR", "/tmp/log-ship");
        let config = ShipperConfig::from_env().unwrap();
        env::remove_var("LOGSHIP_BATCH_LIMIT");
        env::remove_var("LOGSHIP_SPOOL_DIR");

        assert_eq!(config.batch_limit, 7);
        assert_eq!(config.spool_dir, PathBuf::from("/tmp/log-ship"));
    }

    #[test]
    fn test_batch_limit_fits_result_window() {
        let config = from_pairs(&[("LOGSHIP_BATCH_LIMIT", "3333")]).unwrap();
        assert_eq!(config.batch_limit, MAX_BATCH_LIMIT);
        assert!(config.batch_limit * 3 <= crate::elastic::MAX_RESULT_WINDOW);
    }

    fn write_config(contents: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), contents).unwrap();
        dir
    }

    #[test]
    fn test_config_candidates_order() {
        let candidates = config_candidates(Some(Path::new("/opt/log-ship")));
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/opt/log-ship").join(CONFIG_FILE_NAME),
                PathBuf::from("/etc").join(CONFIG_FILE_NAME),
                PathBuf::from(".").join(CONFIG_FILE_NAME),
            ]
        );

        let candidates = config_candidates(Some(Path::new("/etc")));
        assert_eq!(candidates.len(), 2);
        assert_eq!(config_candidates(None).len(), 2);
    }

    #[test]
    fn test_load_reads_file_sections() {
        let dir = write_config(
            r"
main:
  spool: /var/spool/log-ship
  log_level: DEBUG
elastic:
  hosts: http://es1:9200, http://es2:9200
  index_pattern: mail-%Y-%m
  batch: 200
  retry_backoff_secs: 5
parser:
  timezone: UTC
reader:
  file: /var/log/mail.log
  follow: false
  poll_ms: 250
",
        );
        let config = ShipperConfig::load_with(Some(dir.path()), |_| None).unwrap();

        assert_eq!(
            config.store_hosts,
            vec!["http://es1:9200".to_string(), "http://es2:9200".to_string()]
        );
        assert_eq!(config.index_pattern, "mail-%Y-%m");
        assert_eq!(config.batch_limit, 200);
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
        assert_eq!(config.timezone().unwrap(), chrono_tz::UTC);
        assert_eq!(config.reader_file, PathBuf::from("/var/log/mail.log"));
        assert!(!config.reader_follow);
        assert_eq!(config.reader_poll, Duration::from_millis(250));
        assert_eq!(config.spool_dir, PathBuf::from("/var/spool/log-ship"));
        assert_eq!(config.log_level, "debug");
        // untouched keys keep their defaults
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(21600));
    }

    #[test]
    fn test_load_accepts_host_list() {
        let dir = write_config(
            r"
elastic:
  hosts:
    - https://es1:9200
    - https://es2:9200
",
        );
        let config = ShipperConfig::load_with(Some(dir.path()), |_| None).unwrap();
        assert_eq!(
            config.store_hosts,
            vec!["https://es1:9200".to_string(), "https://es2:9200".to_string()]
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = write_config("elastic:\n  batch: 200\nparser:\n  timezone: UTC\n");
        let map = HashMap::from([("LOGSHIP_BATCH_LIMIT".to_string(), "50".to_string())]);
        let config = ShipperConfig::load_with(Some(dir.path()), |key| map.get(key).cloned()).unwrap();

        assert_eq!(config.batch_limit, 50);
        assert_eq!(config.timezone, "UTC");
    }

    #[test]
    fn test_missing_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ShipperConfig::load_with(Some(dir.path()), |_| None).unwrap();
        assert_eq!(config.batch_limit, 1024);
        assert_eq!(config.store_hosts, vec![DEFAULT_STORE_HOST.to_string()]);
    }

    #[test]
    fn test_malformed_file_names_path() {
        let dir = write_config("elastic:\n  batch: many\n");
        let error = ShipperConfig::load_with(Some(dir.path()), |_| None).unwrap_err();
        match error {
            ConfigError::File { path, .. } => {
                assert_eq!(path, dir.path().join(CONFIG_FILE_NAME));
            }
            other => panic!("expected a file error, got {other:?}"),
        }
    }

    #[test]
    fn test_file_values_are_validated() {
        let dir = write_config("elastic:\n  batch: 5000\n");
        let error = ShipperConfig::load_with(Some(dir.path()), |_| None).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));
    }
}
