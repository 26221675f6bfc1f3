use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::{
    dataset::ScaleMode,
    trainer::{HyperparameterGrid, Hyperparameters},
};

/// Engine configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Default trainer hyperparameters.
    pub hyperparameters: Hyperparameters,
    /// Tuning settings.
    pub cross_validation: CrossValidationSettings,
    /// Data preparation settings.
    pub data: DataSettings,
    /// Log and event sinks.
    pub telemetry: TelemetrySettings,
}

impl EngineConfig {
    /// Loads and validates a TOML file. Relative telemetry paths resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let mut config =
            Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for slot in [&mut config.telemetry.log_path, &mut config.telemetry.event_log] {
            if let Some(target) = slot.as_mut() {
                if target.is_relative() {
                    *target = source_dir.join(&*target);
                }
            }
        }
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and grid names.
    pub fn validate(&self) -> Result<()> {
        self.hyperparameters
            .validate()
            .context("invalid [hyperparameters]")?;
        let cv = &self.cross_validation;
        if cv.folds < 2 {
            bail!("cross_validation.folds must be at least 2, got {}", cv.folds);
        }
        if cv.top_k == 0 {
            bail!("cross_validation.top_k must be at least 1");
        }
        if let Some(name) = cv.grid.names().find(|name| !Hyperparameters::accepts(name)) {
            bail!(
                "cross_validation.grid names unknown hyperparameter {name}; accepted: {}",
                Hyperparameters::ACCEPTED.join(", ")
            );
        }
        Ok(())
    }
}

/// Cross-validation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrossValidationSettings {
    /// Folds used when a tune request does not name a count.
    pub folds: usize,
    /// Relevance and recommendation depth used when scoring.
    pub top_k: usize,
    /// Fold shuffle seed.
    pub seed: u64,
    /// Grid used when a tune request carries none.
    pub grid: HyperparameterGrid,
}

impl Default for CrossValidationSettings {
    fn default() -> Self {
        Self {
            folds: 3,
            top_k: 10,
            seed: 0,
            grid: HyperparameterGrid::new()
                .with("rank", [5, 10])
                .with("reg_param", [0.01, 0.1]),
        }
    }
}

/// Data preparation settings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DataSettings {
    /// Rescale ratings before training unless a request says otherwise.
    pub scale: bool,
    /// Rescaling mode applied when scaling is requested.
    pub scale_mode: ScaleMode,
}

impl DataSettings {
    /// Scale mode for a request flag.
    #[must_use]
    pub const fn mode_for(&self, scale: bool) -> Option<ScaleMode> {
        if scale {
            Some(self.scale_mode)
        } else {
            None
        }
    }
}

/// Telemetry sink settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetrySettings {
    /// JSON-lines log file.
    pub log_path: Option<PathBuf>,
    /// JSON-lines event file.
    pub event_log: Option<PathBuf>,
    /// Lowest level written to the log.
    pub min_level: LogLevel,
    /// Source name stamped on logs and events.
    pub module: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_path: None,
            event_log: None,
            min_level: LogLevel::Info,
            module: "recommend-engine".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::ParamValue;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cross_validation.grid.combinations(), 4);
        assert!(config.hyperparameters.implicit_prefs);
    }

    #[test]
    fn parses_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [hyperparameters]
            rank = 4
            implicit_prefs = false

            [cross_validation]
            folds = 5
            grid = { rank = [2, 3], alpha = [0.5] }

            [data]
            scale = true
            scale_mode = "per_user"

            [telemetry]
            min_level = "warn"
            "#,
        )
        .unwrap();
        assert_eq!(config.hyperparameters.rank, 4);
        assert_eq!(config.hyperparameters.max_iter, 10);
        assert_eq!(config.cross_validation.folds, 5);
        assert_eq!(
            config.cross_validation.grid.get("alpha").unwrap(),
            &[ParamValue::Float(0.5)]
        );
        assert_eq!(config.data.mode_for(true), Some(ScaleMode::PerUser));
        assert_eq!(config.data.mode_for(false), None);
        assert_eq!(config.telemetry.min_level, LogLevel::Warn);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(EngineConfig::from_toml_str("[cross_validation]\nfolds = 1").is_err());
        assert!(EngineConfig::from_toml_str("[cross_validation]\ntop_k = 0").is_err());
        assert!(EngineConfig::from_toml_str("[hyperparameters]\nrank = 0").is_err());
        assert!(
            EngineConfig::from_toml_str("[cross_validation.grid]\ndepth = [1, 2]").is_err()
        );
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "[telemetry]\nlog_path = \"logs/engine.log\"\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(
            config.telemetry.log_path.unwrap(),
            dir.path().join("logs/engine.log")
        );
        assert!(EngineConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
