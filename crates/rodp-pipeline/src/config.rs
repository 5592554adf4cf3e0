use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rodp_adapters::SourceFiles;
use rodp_storage::DatabaseConfig;
use rodp_transform::{MergePolicy, OrphanFixScope};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "rodp.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub sources: SourceFiles,
    pub pipeline: PipelineOptions,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub reports_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/input"),
            output_dir: PathBuf::from("data/output"),
            reports_dir: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub incremental: bool,
    pub quality_check: bool,
    pub merge_policy: MergePolicy,
    pub orphan_fix_scope: OrphanFixScope,
    /// Truncates the exported top-items file only; persisted rows are never truncated.
    pub top_items_limit: Option<usize>,
    pub export_csv: bool,
    pub export_parquet: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            incremental: false,
            quality_check: true,
            merge_policy: MergePolicy::default(),
            orphan_fix_scope: OrphanFixScope::default(),
            top_items_limit: None,
            export_csv: false,
            export_parquet: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub crons: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            crons: vec!["0 0 6 * * *".to_string(), "0 0 18 * * *".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reads `path` and applies environment overrides.
    ///
    /// A missing file yields the defaults silently; logging is not set up yet when this
    /// runs, so reporting the fallback is left to the caller.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("deserializing pipeline config")
    }

    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        } else if let (Some(host), Some(db), Some(user)) =
            (lookup("POSTGRES_HOST"), lookup("POSTGRES_DB"), lookup("POSTGRES_USER"))
        {
            let port = lookup("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string());
            let credentials = match lookup("POSTGRES_PASSWORD") {
                Some(password) => format!("{user}:{password}"),
                None => user,
            };
            self.database.url = format!("postgres://{credentials}@{host}:{port}/{db}");
        }

        if let Some(dir) = lookup("RODP_INPUT_DIR") {
            self.paths.input_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RODP_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RODP_REPORTS_DIR") {
            self.paths.reports_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("RODP_INCREMENTAL").and_then(|v| parse_flag(&v)) {
            self.pipeline.incremental = flag;
        }
        if let Some(flag) = lookup("RODP_QUALITY_CHECK").and_then(|v| parse_flag(&v)) {
            self.pipeline.quality_check = flag;
        }
        if let Some(raw) = lookup("RODP_MERGE_POLICY") {
            match serde_yaml::from_str::<MergePolicy>(raw.trim()) {
                Ok(policy) => self.pipeline.merge_policy = policy,
                Err(_) => warn!(value = %raw, "ignoring unknown RODP_MERGE_POLICY"),
            }
        }
        if let Some(level) = lookup("RODP_LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" => Some(false),
        _ => None,
    }
}

/// Per-run switches from the command line; `None` keeps the configured value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub incremental: Option<bool>,
    pub quality_check: Option<bool>,
    pub export_csv: Option<bool>,
    pub export_parquet: Option<bool>,
}

impl RunOverrides {
    pub fn applied_to(&self, options: &PipelineOptions) -> PipelineOptions {
        let mut options = options.clone();
        if let Some(v) = self.incremental {
            options.incremental = v;
        }
        if let Some(v) = self.quality_check {
            options.quality_check = v;
        }
        if let Some(v) = self.export_csv {
            options.export_csv = v;
        }
        if let Some(v) = self.export_parquet {
            options.export_parquet = v;
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = PipelineConfig::from_yaml_str(
            concat!(
                "pipeline:\n  incremental: true\n  merge_policy: reaggregate\n",
                "sources:\n  orders: o.csv\n",
            ),
        )
        .unwrap();
        assert!(config.pipeline.incremental);
        assert!(config.pipeline.quality_check);
        assert_eq!(config.pipeline.merge_policy, MergePolicy::Reaggregate);
        assert_eq!(config.pipeline.orphan_fix_scope, OrphanFixScope::Full);
        assert_eq!(config.sources.orders, "o.csv");
        assert_eq!(config.sources.order_items, "order_item.csv");
        assert_eq!(config.scheduler.crons.len(), 2);
        assert_eq!(config.database.max_connections, 1);
        assert_eq!(config.database.connect_timeout_secs, 30);
    }

    #[test]
    fn postgres_parts_compose_a_url() {
        let mut config = PipelineConfig::default();
        config.apply_env_overrides_from(lookup(&[
            ("POSTGRES_HOST", "db"),
            ("POSTGRES_DB", "orders"),
            ("POSTGRES_USER", "etl"),
            ("POSTGRES_PASSWORD", "secret"),
        ]));
        assert_eq!(config.database.url, "postgres://etl:secret@db:5432/orders");
    }

    #[test]
    fn database_url_wins_over_parts() {
        let mut config = PipelineConfig::default();
        config.apply_env_overrides_from(lookup(&[
            ("DATABASE_URL", "postgres://a@b/c"),
            ("POSTGRES_HOST", "db"),
            ("POSTGRES_DB", "orders"),
            ("POSTGRES_USER", "etl"),
        ]));
        assert_eq!(config.database.url, "postgres://a@b/c");
    }

    #[test]
    fn env_flags_and_policy_override_file_values() {
        let mut config = PipelineConfig::default();
        config.apply_env_overrides_from(lookup(&[
            ("RODP_INCREMENTAL", "true"),
            ("RODP_QUALITY_CHECK", "0"),
            ("RODP_MERGE_POLICY", "reaggregate"),
            ("RODP_INPUT_DIR", "/tmp/in"),
            ("RODP_LOG_LEVEL", "debug"),
        ]));
        assert!(config.pipeline.incremental);
        assert!(!config.pipeline.quality_check);
        assert_eq!(config.pipeline.merge_policy, MergePolicy::Reaggregate);
        assert_eq!(config.paths.input_dir, PathBuf::from("/tmp/in"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn unknown_env_values_are_ignored() {
        let mut config = PipelineConfig::default();
        config.apply_env_overrides_from(lookup(&[
            ("RODP_INCREMENTAL", "maybe"),
            ("RODP_MERGE_POLICY", "sum"),
        ]));
        assert!(!config.pipeline.incremental);
        assert_eq!(config.pipeline.merge_policy, MergePolicy::ReplaceByKey);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.sources, SourceFiles::default());
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn sample_config_parses() {
        let config = PipelineConfig::from_yaml_str(include_str!("../../../rodp.yaml")).unwrap();
        assert_eq!(config.pipeline.top_items_limit, Some(10));
        assert!(config.pipeline.export_csv);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn cli_overrides_win() {
        let overrides = RunOverrides {
            incremental: Some(true),
            export_csv: Some(true),
            ..Default::default()
        };
        let options = overrides.applied_to(&PipelineOptions::default());
        assert!(options.incremental);
        assert!(options.export_csv);
        assert!(options.quality_check);
    }
}
