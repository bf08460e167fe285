//! Configuration for Harvest
//!
//! Loaded from a TOML file (default `~/.config/harvest/config.toml`). Every
//! section and field is optional; anything missing takes its default.

use crate::error::{HarvestError, Result};
use harvest_scanner::crawler::DEFAULT_EXCLUDED_DOMAINS;
use harvest_scanner::extractor::DEFAULT_SEPARATOR;
use harvest_scanner::resolver::{DEFAULT_ARCHIVE_BASE, DEFAULT_CDX_ENDPOINT};
use harvest_scanner::transport::DEFAULT_USER_AGENT;
use harvest_scanner::{ArchiveBase, DedupPolicy, SnapshotCrawler, TextExtractor, TransportConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/harvest/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub archive: ArchiveConfig,
    pub transport: TransportSection,
    pub crawl: CrawlConfig,
    pub harvest: HarvestSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub cdx_endpoint: String,
    pub archive_base: String,
    pub dedup_policy: DedupPolicy,
    pub user_agent: String,
    /// Upper bound on rows requested from the index per query.
    pub index_limit: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            cdx_endpoint: DEFAULT_CDX_ENDPOINT.to_string(),
            archive_base: DEFAULT_ARCHIVE_BASE.to_string(),
            dedup_policy: DedupPolicy::Day,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            index_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub min_delay_ms: u64,
    pub max_delay_secs: u64,
    pub backoff_factor: f64,
    pub recovery_successes: u32,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub connection_failure_threshold: u32,
    pub max_retries: u32,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_secs: 360,
            backoff_factor: 2.0,
            recovery_successes: 5,
            request_timeout_secs: 90,
            connect_timeout_secs: 30,
            connection_failure_threshold: 3,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub max_frame_depth: usize,
    pub max_link_depth: usize,
    pub max_subpages: usize,
    pub exclude_domains: Vec<String>,
    /// Pages with less visible text than this are treated as empty.
    pub min_page_chars: usize,
    pub text_separator: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_frame_depth: 3,
            max_link_depth: 1,
            max_subpages: 50,
            exclude_domains: DEFAULT_EXCLUDED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            min_page_chars: 25,
            text_separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    File,
    Sqlite,
}

impl CheckpointBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointBackend::File => "file",
            CheckpointBackend::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for CheckpointBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(CheckpointBackend::File),
            "sqlite" | "db" => Ok(CheckpointBackend::Sqlite),
            other => Err(format!(
                "unknown checkpoint backend '{}' (expected file or sqlite)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestSection {
    pub workers: usize,
    /// Extra attempts for a unit that failed with a transient error.
    pub unit_retries: u32,
    pub retry_delay_secs: u64,
    pub output_dir: PathBuf,
    pub progress_dir: PathBuf,
    pub roster_dir: PathBuf,
    pub checkpoint_backend: CheckpointBackend,
}

impl Default for HarvestSection {
    fn default() -> Self {
        Self {
            workers: 8,
            unit_retries: 2,
            retry_delay_secs: 5,
            output_dir: PathBuf::from("data/snapshots"),
            progress_dir: PathBuf::from("data/progress"),
            roster_dir: PathBuf::from("data/rosters"),
            checkpoint_backend: CheckpointBackend::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Expand `~` and environment variables in a user-supplied path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(path).map(|p| p.into_owned()).unwrap_or_else(|_| path.to_string()))
}

impl HarvestConfig {
    /// Load and validate a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: HarvestConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field and report all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if ArchiveBase::parse(&self.archive.archive_base).is_err() {
            errors.push(format!(
                "archive.archive_base is not a valid URL: '{}'",
                self.archive.archive_base
            ));
        }
        if url::Url::parse(&self.archive.cdx_endpoint).is_err() {
            errors.push(format!(
                "archive.cdx_endpoint is not a valid URL: '{}'",
                self.archive.cdx_endpoint
            ));
        }
        if self.archive.user_agent.trim().is_empty() {
            errors.push("archive.user_agent must not be empty".to_string());
        }
        if self.archive.index_limit == 0 {
            errors.push("archive.index_limit must be positive".to_string());
        }

        let t = &self.transport;
        if t.max_delay_secs.saturating_mul(1000) < t.min_delay_ms {
            errors.push(format!(
                "transport.max_delay_secs ({}s) is below min_delay_ms ({}ms)",
                t.max_delay_secs, t.min_delay_ms
            ));
        }
        if t.backoff_factor < 1.0 {
            errors.push("transport.backoff_factor must be >= 1.0".to_string());
        }
        if t.recovery_successes == 0 {
            errors.push("transport.recovery_successes must be positive".to_string());
        }
        if t.request_timeout_secs == 0 {
            errors.push("transport.request_timeout_secs must be positive".to_string());
        }
        if t.connect_timeout_secs == 0 {
            errors.push("transport.connect_timeout_secs must be positive".to_string());
        }
        if t.connection_failure_threshold == 0 {
            errors.push("transport.connection_failure_threshold must be positive".to_string());
        }

        if self.crawl.text_separator.is_empty() {
            errors.push("crawl.text_separator must not be empty".to_string());
        }

        if self.harvest.workers == 0 {
            errors.push("harvest.workers must be positive".to_string());
        }
        if self.harvest.workers > 64 {
            errors.push("harvest.workers must be <= 64".to_string());
        }

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            errors.push(format!("logging.level '{}' is not a level", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HarvestError::Config(errors))
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        let t = &self.transport;
        TransportConfig {
            min_delay: Duration::from_millis(t.min_delay_ms),
            max_delay: Duration::from_secs(t.max_delay_secs),
            backoff_factor: t.backoff_factor,
            recovery_successes: t.recovery_successes,
            request_timeout: Duration::from_secs(t.request_timeout_secs),
            connect_timeout: Duration::from_secs(t.connect_timeout_secs),
            connection_failure_threshold: t.connection_failure_threshold,
            max_retries: t.max_retries,
            user_agent: self.archive.user_agent.clone(),
        }
    }

    pub fn snapshot_crawler(&self) -> Result<SnapshotCrawler> {
        let base = ArchiveBase::parse(&self.archive.archive_base)?;
        Ok(SnapshotCrawler::new(base)
            .with_extractor(TextExtractor::new(self.crawl.text_separator.clone()))
            .with_max_frame_depth(self.crawl.max_frame_depth)
            .with_max_link_depth(self.crawl.max_link_depth)
            .with_max_subpages(self.crawl.max_subpages)
            .with_min_page_chars(self.crawl.min_page_chars)
            .with_exclude_domains(self.crawl.exclude_domains.clone()))
    }

    /// Default config as TOML, with a header, for `harvest init`.
    pub fn default_toml() -> Result<String> {
        let body = toml::to_string_pretty(&HarvestConfig::default())?;
        Ok(format!(
            "# Harvest configuration\n\
             # dedup_policy: \"day\" keeps the latest capture per URL and day,\n\
             # \"month\" the latest per URL and month.\n\
             # checkpoint_backend: \"file\" or \"sqlite\".\n\n{}",
            body
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarvestConfig::default();
        assert_eq!(config.archive.dedup_policy, DedupPolicy::Day);
        assert_eq!(config.harvest.workers, 8);
        assert_eq!(config.transport.max_delay_secs, 360);
        assert_eq!(config.crawl.text_separator, "#+#");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = HarvestConfig::from_toml(
            r#"
            [archive]
            dedup_policy = "month"

            [harvest]
            workers = 2
            checkpoint_backend = "sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(config.archive.dedup_policy, DedupPolicy::Month);
        assert_eq!(config.harvest.workers, 2);
        assert_eq!(config.harvest.checkpoint_backend, CheckpointBackend::Sqlite);
        assert_eq!(config.crawl.max_subpages, 50);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = HarvestConfig::default();
        config.harvest.workers = 0;
        config.transport.backoff_factor = 0.5;
        config.transport.min_delay_ms = 10_000;
        config.transport.max_delay_secs = 1;
        let Err(HarvestError::Config(errors)) = config.validate() else {
            panic!("expected config errors");
        };
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let err = HarvestConfig::from_toml("[archive]\ndedup_policy = \"week\"\n").unwrap_err();
        assert!(matches!(err, HarvestError::ConfigParse(_)));
    }

    #[test]
    fn test_default_toml_round_trips() {
        let text = HarvestConfig::default_toml().unwrap();
        let config = HarvestConfig::from_toml(&text).unwrap();
        assert_eq!(config.harvest.workers, 8);
        assert_eq!(config.crawl.exclude_domains, CrawlConfig::default().exclude_domains);
    }

    #[test]
    fn test_transport_config_conversion() {
        let t = HarvestConfig::default().transport_config();
        assert_eq!(t.min_delay, Duration::from_millis(100));
        assert_eq!(t.max_delay, Duration::from_secs(360));
        assert_eq!(t.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("SQLite".parse::<CheckpointBackend>(), Ok(CheckpointBackend::Sqlite));
        assert!("redis".parse::<CheckpointBackend>().is_err());
    }
}
