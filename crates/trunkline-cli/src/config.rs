//! CLI configuration management.

use anyhow::{Context, anyhow, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use trunkline_scheduler::OrchestratorConfig;

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Default fan-out limit for matrix stages.
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Give up on a busy concurrency group after this many seconds.
    #[serde(default)]
    pub gate_timeout_secs: Option<u64>,
    /// sccache binary.
    #[serde(default = "default_sccache_path")]
    pub sccache_path: PathBuf,
    /// Output format.
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Directory steps run in. Defaults to the current directory.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            gate_timeout_secs: None,
            sccache_path: default_sccache_path(),
            output_format: OutputFormat::default(),
            workspace: None,
        }
    }
}

fn default_sccache_path() -> PathBuf {
    PathBuf::from("sccache")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "trunkline", "trunkline")
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let cleared = value.eq_ignore_ascii_case("none") || value.is_empty();
        match key {
            "max_parallel" => {
                self.max_parallel = if cleared {
                    None
                } else {
                    let n: usize = value
                        .parse()
                        .with_context(|| format!("Invalid max_parallel: {}", value))?;
                    if n == 0 {
                        bail!("max_parallel must be at least 1");
                    }
                    Some(n)
                };
            }
            "gate_timeout_secs" => {
                self.gate_timeout_secs = if cleared {
                    None
                } else {
                    Some(
                        value
                            .parse()
                            .with_context(|| format!("Invalid gate_timeout_secs: {}", value))?,
                    )
                };
            }
            "sccache_path" => {
                self.sccache_path = if cleared {
                    default_sccache_path()
                } else {
                    PathBuf::from(value)
                };
            }
            "workspace" => {
                self.workspace = if cleared { None } else { Some(PathBuf::from(value)) };
            }
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    _ => bail!("Invalid output format: {}", value),
                };
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_parallel: self.max_parallel,
            gate_timeout: self.gate_timeout_secs.map(Duration::from_secs),
        }
    }
}
