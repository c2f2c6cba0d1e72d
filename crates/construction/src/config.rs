use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blueprint::{ValidationLimits, DEFAULT_MAX_EXTENT};

pub const DEFAULT_ADMIT_INTERVAL_TICKS: u32 = 4;
pub const DEFAULT_PLACEMENTS_PER_TICK: u32 = 1;
pub const DEFAULT_MAX_DEFERRALS: u32 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConstructionConfig {
    /// The scheduler drains queues on every Nth world tick.
    pub admit_interval_ticks: u32,
    /// Per-building cap on attempted entries per admitted tick.
    pub placements_per_tick: u32,
    pub global_placements_per_tick: Option<u32>,
    /// Consecutive deferrals of one entry before it is abandoned. `None`
    /// retries forever.
    pub max_deferrals: Option<u32>,
    pub revert_on_cancel: bool,
    pub max_blueprint_extent: i32,
    pub min_build_y: i32,
    pub max_build_y: i32,
}

impl Default for ConstructionConfig {
    fn default() -> Self {
        Self {
            admit_interval_ticks: DEFAULT_ADMIT_INTERVAL_TICKS,
            placements_per_tick: DEFAULT_PLACEMENTS_PER_TICK,
            global_placements_per_tick: None,
            max_deferrals: Some(DEFAULT_MAX_DEFERRALS),
            revert_on_cancel: false,
            max_blueprint_extent: DEFAULT_MAX_EXTENT,
            min_build_y: -64,
            max_build_y: 320,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config json at {field}: {message}")]
    Parse { field: String, message: String },
    #[error("invalid config value {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConstructionConfig {
    pub fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_extent: self.max_blueprint_extent,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut deserializer = serde_json::Deserializer::from_str(raw);
        let config = serde_path_to_error::deserialize::<_, Self>(&mut deserializer).map_err(
            |error| {
                let field = match error.path().to_string() {
                    path if path.is_empty() || path == "." => "<root>".to_string(),
                    path => path,
                };
                ConfigError::Parse {
                    field,
                    message: error.into_inner().to_string(),
                }
            },
        )?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file means defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admit_interval_ticks == 0 {
            return Err(ConfigError::Invalid {
                field: "admit_interval_ticks",
                message: "must be at least 1".to_string(),
            });
        }
        if self.placements_per_tick == 0 {
            return Err(ConfigError::Invalid {
                field: "placements_per_tick",
                message: "must be at least 1".to_string(),
            });
        }
        if self.global_placements_per_tick == Some(0) {
            return Err(ConfigError::Invalid {
                field: "global_placements_per_tick",
                message: "must be at least 1 when set".to_string(),
            });
        }
        if self.max_blueprint_extent <= 0 {
            return Err(ConfigError::Invalid {
                field: "max_blueprint_extent",
                message: "must be positive".to_string(),
            });
        }
        if self.min_build_y > self.max_build_y {
            return Err(ConfigError::Invalid {
                field: "min_build_y",
                message: format!(
                    "{} is above max_build_y {}",
                    self.min_build_y, self.max_build_y
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = ConstructionConfig::parse("{}").expect("parse");
        assert_eq!(config, ConstructionConfig::default());
        assert_eq!(config.admit_interval_ticks, 4);
        assert_eq!(config.placements_per_tick, 1);
        assert_eq!(config.max_deferrals, Some(600));
        assert!(!config.revert_on_cancel);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config = ConstructionConfig::parse(
            r#"{ "placements_per_tick": 3, "revert_on_cancel": true, "max_deferrals": null }"#,
        )
        .expect("parse");
        assert_eq!(config.placements_per_tick, 3);
        assert!(config.revert_on_cancel);
        assert_eq!(config.max_deferrals, None);
        assert_eq!(config.admit_interval_ticks, 4);
    }

    #[test]
    fn type_errors_name_the_field() {
        let error = ConstructionConfig::parse(r#"{ "admit_interval_ticks": "often" }"#)
            .expect_err("wrong type");
        assert!(error.to_string().contains("admit_interval_ticks"));

        let unknown = ConstructionConfig::parse(r#"{ "tick_rate": 20 }"#).expect_err("unknown");
        assert!(unknown.to_string().contains("tick_rate"));
    }

    #[test]
    fn semantic_validation() {
        let error = ConstructionConfig::parse(r#"{ "admit_interval_ticks": 0 }"#)
            .expect_err("zero interval");
        assert!(matches!(
            error,
            ConfigError::Invalid {
                field: "admit_interval_ticks",
                ..
            }
        ));
        assert!(ConstructionConfig::parse(r#"{ "min_build_y": 10, "max_build_y": 0 }"#).is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let temp = TempDir::new().expect("temp");
        let config =
            ConstructionConfig::load_or_default(&temp.path().join("config.json")).expect("load");
        assert_eq!(config, ConstructionConfig::default());
    }
}
