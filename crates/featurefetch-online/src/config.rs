//! Fetcher configuration
//!
//! Loaded from a YAML file (for example `featurefetch.yaml`); every field has
//! a default, so an empty or missing file yields a working configuration.
//!
//! ```yaml
//! lookup_timeout_ms: 100
//! batch_deadline_ms: 1000     # null disables the batch deadline
//! max_in_flight: 32
//! max_keys_per_call: 100
//! metadata:
//!   ttl_secs: 300
//!   refresh_interval_secs: 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level fetcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Timeout handed to every store `multi_get` call
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    /// Cap on the wall time of a whole batch
    #[serde(default = "default_batch_deadline_ms")]
    pub batch_deadline_ms: Option<u64>,

    /// Maximum concurrent store calls, shared by all batches
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Keys sent per `multi_get` call
    #[serde(default = "default_max_keys_per_call")]
    pub max_keys_per_call: usize,

    #[serde(default)]
    pub metadata: MetadataConfig,
}

/// Plan cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// How long a resolved plan is served before a refresh is triggered
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Period of the background refresh loop
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_lookup_timeout_ms() -> u64 {
    100
}

fn default_batch_deadline_ms() -> Option<u64> {
    Some(1000)
}

fn default_max_in_flight() -> usize {
    32
}

fn default_max_keys_per_call() -> usize {
    100
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_refresh_interval_secs() -> u64 {
    60
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout_ms(),
            batch_deadline_ms: default_batch_deadline_ms(),
            max_in_flight: default_max_in_flight(),
            max_keys_per_call: default_max_keys_per_call(),
            metadata: MetadataConfig::default(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl FetcherConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn batch_deadline(&self) -> Option<Duration> {
        self.batch_deadline_ms.map(Duration::from_millis)
    }

    /// Rejects settings the dispatcher cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.lookup_timeout_ms > 0, "lookup_timeout_ms must be positive");
        anyhow::ensure!(self.max_in_flight > 0, "max_in_flight must be positive");
        anyhow::ensure!(
            self.max_keys_per_call > 0,
            "max_keys_per_call must be positive"
        );
        if let Some(deadline) = self.batch_deadline_ms {
            anyhow::ensure!(deadline > 0, "batch_deadline_ms must be positive when set");
        }
        Ok(())
    }
}

impl MetadataConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Load configuration from a YAML file
///
/// A missing file is not an error: defaults are returned and a warning is
/// logged. An unreadable, unparsable or invalid file is an error.
///
/// # Example
///
/// ```rust,ignore
/// let config = load("featurefetch.yaml")?;
/// println!("Per-call timeout: {:?}", config.lookup_timeout());
/// ```
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<FetcherConfig> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!("Configuration file '{}' not found, using defaults", path.display());
        return Ok(FetcherConfig::default());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: FetcherConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;

    tracing::info!("Loaded configuration from {}", path.display());

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = FetcherConfig::default();
        assert_eq!(config.lookup_timeout(), Duration::from_millis(100));
        assert_eq!(config.batch_deadline(), Some(Duration::from_secs(1)));
        assert_eq!(config.max_in_flight, 32);
        assert_eq!(config.max_keys_per_call, 100);
        assert_eq!(config.metadata.ttl(), Duration::from_secs(300));
        assert_eq!(config.metadata.refresh_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
lookup_timeout_ms: 25
batch_deadline_ms: null
metadata:
  ttl_secs: 10
"#;

        let config: FetcherConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.lookup_timeout_ms, 25);
        assert_eq!(config.batch_deadline(), None);
        assert_eq!(config.max_in_flight, 32);
        assert_eq!(config.metadata.ttl_secs, 10);
        assert_eq!(config.metadata.refresh_interval_secs, 60);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let config = load("nonexistent_featurefetch.yaml").unwrap();
        assert_eq!(config, FetcherConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_in_flight: 4\nmax_keys_per_call: 10").unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.max_keys_per_call, 10);
    }

    #[test]
    fn test_load_rejects_zero_concurrency() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_in_flight: 0").unwrap();

        assert!(load(file.path()).is_err());
    }
}
