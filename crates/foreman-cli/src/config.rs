use anyhow::Context;
use foreman_orchestrator::{CommandConfig, OrchestratorConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The `foreman.toml` file: orchestrator settings plus where the queue lives
/// and which program does the work.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Only required by `foreman run`.
    #[serde(default)]
    pub executor: Option<CommandConfig>,
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl CliConfig {
    /// Parse and validate, resolving relative paths against `base`.
    pub fn parse(s: &str, base: &Path) -> anyhow::Result<Self> {
        let mut config: CliConfig = toml::from_str(s)?;
        config.orchestrator.validate()?;

        if config.data_dir.is_relative() {
            config.data_dir = base.join(&config.data_dir);
        }
        if config.orchestrator.workspace.is_relative() {
            config.orchestrator.workspace = base.join(&config.orchestrator.workspace);
        }
        if let Some(executor) = config.executor.as_mut() {
            if let Some(dir) = executor.working_dir.as_mut() {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
        }
        Ok(config)
    }

    /// Read `path`. A missing file yields the defaults so task administration
    /// works without any configuration.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file '{}'", path.display()))
            }
        };
        Self::parse(&raw, base)
            .with_context(|| format!("invalid config file '{}'", path.display()))
    }
}
