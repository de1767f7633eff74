//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.aggregator.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Aggregation settings.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default report output path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "aggregation_report.md".to_string()
}

/// Aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Aggregation names whose records are persisted.
    ///
    /// Aggregator blocks with other names are summed but never stored.
    #[serde(default = "default_registered_aggregators")]
    pub registered_aggregators: Vec<String>,

    /// Rewrite every registered aggregator regardless of timestamps.
    #[serde(default)]
    pub force: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            registered_aggregators: default_registered_aggregators(),
            force: false,
        }
    }
}

fn default_registered_aggregators() -> Vec<String> {
    crate::store::DEFAULT_REGISTERED
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Include per-user aggregate tables in the report.
    #[serde(default = "default_true")]
    pub include_users: bool,

    /// Leave records below this percent out of the per-user tables.
    #[serde(default)]
    pub min_percent: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            include_users: true,
            min_percent: 0.0,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but
    /// can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(".aggregator.toml");

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings. Optional
    /// arguments only override when explicitly provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }

        if let Some(ref aggregators) = args.aggregators {
            self.aggregation.registered_aggregators = aggregators.clone();
        }

        // Flags always override
        if args.force {
            self.aggregation.force = true;
        }
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
