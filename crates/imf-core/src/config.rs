//! Run configuration.
//!
//! A [`RefreshSpec`] is built once per run (YAML file plus `IMF__*`
//! environment overrides) and handed to every component by reference.
//! Components never read the process environment themselves.
//!
//! ```yaml
//! name: weo-refresh
//! catalog:
//!   base_url: https://www.imf.org/external/datamapper/api/v1
//!   dataset: WEO
//!   timeout_secs: 120
//! destination:
//!   table_name: IMF_DATAMAPPER_INDICATORS
//! commit:
//!   poll_attempts: 30
//!   poll_interval_ms: 1000
//! store:
//!   type: parquet_dir
//!   path: ./warehouse
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RefreshError;

pub const DEFAULT_BASE_URL: &str = "https://www.imf.org/external/datamapper/api/v1";
pub const DEFAULT_DATASET: &str = "WEO";
pub const DEFAULT_TABLE_NAME: &str = "IMF_DATAMAPPER_INDICATORS";

/// Environment variable prefix for overrides, e.g. `IMF__CATALOG__DATASET`.
pub const ENV_PREFIX: &str = "IMF";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSpec {
    /// Human-readable name used in logs
    pub name: String,
    pub catalog: CatalogSpec,
    pub destination: DestinationSpec,
    pub commit: CommitSpec,
    pub store: StoreSpec,
}

impl Default for RefreshSpec {
    fn default() -> Self {
        Self {
            name: "imf-datamapper".to_string(),
            catalog: CatalogSpec::default(),
            destination: DestinationSpec::default(),
            commit: CommitSpec::default(),
            store: StoreSpec::default(),
        }
    }
}

/// Remote indicator catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSpec {
    pub base_url: String,

    /// Only indicators whose metadata `dataset` equals this tag are loaded
    pub dataset: String,

    /// Per-request timeout; a request exceeding it fails the run
    pub timeout_secs: u64,

    /// Upper bound on in-flight indicator fetches
    pub max_concurrent_fetches: usize,
}

impl Default for CatalogSpec {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            timeout_secs: 120,
            max_concurrent_fetches: 8,
        }
    }
}

impl CatalogSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationSpec {
    /// Production table read by consumers
    pub table_name: String,

    /// Staging table; defaults to `<table_name>_STAGING`
    pub staging_table_name: Option<String>,
}

impl Default for DestinationSpec {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            staging_table_name: None,
        }
    }
}

impl DestinationSpec {
    pub fn production(&self) -> &str {
        &self.table_name
    }

    pub fn staging(&self) -> String {
        self.staging_table_name
            .clone()
            .unwrap_or_else(|| format!("{}_STAGING", self.table_name))
    }
}

/// Bounds of the commit acknowledgement wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSpec {
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for CommitSpec {
    fn default() -> Self {
        Self {
            poll_attempts: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl CommitSpec {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Destination store backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreSpec {
    /// In-process tables, lost on exit. Useful for dry runs and tests.
    #[serde(rename = "memory")]
    Memory {
        #[serde(default)]
        ack_delay_ms: u64,
    },
    /// Parquet segment files under `path` with a JSON table manifest.
    #[serde(rename = "parquet_dir")]
    ParquetDir {
        path: PathBuf,
        #[serde(default = "default_flush_rows")]
        flush_rows: usize,
        #[serde(default = "default_flush_interval_ms")]
        flush_interval_ms: u64,
    },
}

impl Default for StoreSpec {
    fn default() -> Self {
        StoreSpec::ParquetDir {
            path: PathBuf::from("warehouse"),
            flush_rows: default_flush_rows(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_flush_rows() -> usize {
    65536
}

fn default_flush_interval_ms() -> u64 {
    200
}

impl RefreshSpec {
    /// Load from an optional YAML file, then apply `IMF__SECTION__KEY`
    /// environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let spec: RefreshSpec = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: RefreshSpec = serde_yaml::from_str(yaml).context("parse refresh spec")?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), RefreshError> {
        let production = self.destination.production();
        let staging = self.destination.staging();
        if production.trim().is_empty() || staging.trim().is_empty() {
            return Err(RefreshError::Config("table names must not be empty".into()));
        }
        for name in [production, staging.as_str()] {
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(RefreshError::Config(format!(
                    "table name {name:?} may only contain ASCII letters, digits and '_'"
                )));
            }
        }
        if production == staging {
            return Err(RefreshError::Config(format!(
                "staging table must differ from production table {production}"
            )));
        }
        if self.commit.poll_attempts == 0 {
            return Err(RefreshError::Config("commit.poll_attempts must be > 0".into()));
        }
        if self.catalog.max_concurrent_fetches == 0 {
            return Err(RefreshError::Config(
                "catalog.max_concurrent_fetches must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_weo_deployment() {
        let spec = RefreshSpec::default();
        assert_eq!(spec.catalog.dataset, "WEO");
        assert_eq!(spec.catalog.timeout(), Duration::from_secs(120));
        assert_eq!(spec.destination.staging(), "IMF_DATAMAPPER_INDICATORS_STAGING");
        assert_eq!(spec.commit.poll_attempts, 30);
        assert_eq!(spec.commit.poll_interval(), Duration::from_secs(1));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_and_store_tag() {
        let spec = RefreshSpec::from_yaml(
            r#"
name: test
destination:
  table_name: GDP
  staging_table_name: GDP_NEXT
commit:
  poll_attempts: 5
  poll_interval_ms: 10
store:
  type: memory
  ack_delay_ms: 3
"#,
        )
        .unwrap();
        assert_eq!(spec.destination.production(), "GDP");
        assert_eq!(spec.destination.staging(), "GDP_NEXT");
        assert_eq!(spec.commit.poll_attempts, 5);
        assert_eq!(spec.store, StoreSpec::Memory { ack_delay_ms: 3 });
        // untouched sections keep their defaults
        assert_eq!(spec.catalog.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn rejects_staging_equal_to_production() {
        let err = RefreshSpec::from_yaml(
            "destination:\n  table_name: T\n  staging_table_name: T\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("staging table must differ"));
    }

    #[test]
    fn rejects_table_names_outside_identifier_charset() {
        for bad in ["../GDP", "GDP STAGING", "gdp/x"] {
            let mut spec = RefreshSpec::default();
            spec.destination.table_name = bad.to_string();
            assert!(matches!(spec.validate(), Err(RefreshError::Config(_))), "{bad}");
        }
        let mut spec = RefreshSpec::default();
        spec.destination.table_name = "WEO_2024".to_string();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_zero_poll_attempts() {
        let mut spec = RefreshSpec::default();
        spec.commit.poll_attempts = 0;
        assert!(matches!(spec.validate(), Err(RefreshError::Config(_))));
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "catalog:\n  dataset: FM\n  timeout_secs: 5").unwrap();
        let spec = RefreshSpec::load(Some(file.path())).unwrap();
        assert_eq!(spec.catalog.dataset, "FM");
        assert_eq!(spec.catalog.timeout_secs, 5);
        assert_eq!(spec.destination.production(), DEFAULT_TABLE_NAME);
    }
}
