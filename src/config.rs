use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::DEFAULT_WORKERS;
use crate::domain::{RegionClass, default_regions};
use crate::error::KiraError;
use crate::retry::RetryPolicy;
use crate::store::PathTemplates;

pub const DEFAULT_CONFIG_FILE: &str = "kira-rdb.json";

/// On-disk shape of `kira-rdb.json`. Every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    #[serde(default)]
    pub save_sequences: Option<bool>,
    #[serde(default)]
    pub save_alignments: Option<bool>,
    #[serde(default)]
    pub alignments_only: Option<bool>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub item_timeout_secs: Option<u64>,
    #[serde(default)]
    pub item_attempts: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub page_retry: Option<RetryPolicy>,
    #[serde(default)]
    pub paths: Option<PathTemplates>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub schema_version: u32,
    pub regions: Vec<RegionClass>,
    pub save_sequences: bool,
    pub save_alignments: bool,
    pub alignments_only: bool,
    pub workers: usize,
    pub item_timeout: Option<Duration>,
    pub item_retry: RetryPolicy,
    pub page_retry: RetryPolicy,
    pub max_pages: Option<usize>,
    pub paths: PathTemplates,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            regions: default_regions(),
            save_sequences: true,
            save_alignments: true,
            alignments_only: false,
            workers: DEFAULT_WORKERS,
            item_timeout: Some(Duration::from_secs(60)),
            item_retry: RetryPolicy::single_attempt(),
            page_retry: RetryPolicy::default(),
            max_pages: None,
            paths: PathTemplates::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `kira-rdb.json` when present. Without either the
    /// defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<PipelineConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<PipelineConfig, KiraError> {
        let defaults = PipelineConfig::default();

        let regions = match config.regions {
            Some(values) => parse_regions(&values)?,
            None => defaults.regions,
        };

        let workers = config.workers.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(KiraError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }

        let paths = config.paths.unwrap_or(defaults.paths);
        paths.validate()?;

        let item_timeout = match config.item_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.item_timeout,
        };

        let item_retry = match config.item_attempts {
            Some(attempts) => RetryPolicy::new(attempts, Duration::from_secs(2)),
            None => defaults.item_retry,
        };

        Ok(PipelineConfig {
            schema_version: config.schema_version.unwrap_or(1),
            regions,
            save_sequences: config.save_sequences.unwrap_or(defaults.save_sequences),
            save_alignments: config.save_alignments.unwrap_or(defaults.save_alignments),
            alignments_only: config.alignments_only.unwrap_or(defaults.alignments_only),
            workers,
            item_timeout,
            item_retry,
            page_retry: config
                .page_retry
                .map(|policy| RetryPolicy::new(policy.max_attempts, policy.base_delay))
                .unwrap_or(defaults.page_retry),
            max_pages: config.max_pages.or(defaults.max_pages),
            paths,
        })
    }
}

/// Parses region tokens, dropping repeats while keeping the given order.
pub fn parse_regions(values: &[String]) -> Result<Vec<RegionClass>, KiraError> {
    let mut regions: Vec<RegionClass> = Vec::new();
    for value in values {
        let region: RegionClass = value.parse()?;
        if !regions.contains(&region) {
            regions.push(region);
        }
    }
    if regions.is_empty() {
        return Err(KiraError::InvalidConfig(
            "at least one region class is required".to_string(),
        ));
    }
    Ok(regions)
}
