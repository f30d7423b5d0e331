//! traitforge configuration loaded from `traitforge.toml`.
//!
//! [`ForgeConfig`] holds every tunable. Fields missing from the file use
//! defaults. `TRAITFORGE_SCENE` and `TRAITFORGE_BIND` take precedence over the
//! file; command-line flags take precedence over both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::exporter::ExporterCommand;
use crate::jobs::{Backoff, JobSpec};
use crate::results::ResultStore;

pub const DEFAULT_CONFIG_FILE: &str = "traitforge.toml";

/// Top-level configuration loaded from `traitforge.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ForgeConfig {
    /// Address the HTTP server listens on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Base URL written into `rendered_file_url`.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Scene description (`.json` or `.toml`).
    #[serde(default)]
    pub scene: Option<PathBuf>,

    /// Where the broker snapshot lives.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "ResultStore::default_dir")]
    pub results_dir: PathBuf,

    #[serde(default = "default_queue")]
    pub default_queue: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fixed seed for reproducible generation; random when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Worker count per queue.
    #[serde(default = "default_workers")]
    pub workers: BTreeMap<String, usize>,

    /// External exporter per format name (`glb`, `jpeg`, ...).
    #[serde(default)]
    pub exporters: BTreeMap<String, ExporterCommand>,
}

fn default_bind() -> String {
    "127.0.0.1:8118".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8118".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".traitforge")
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    600_000
}

fn default_workers() -> BTreeMap<String, usize> {
    BTreeMap::from([(default_queue(), 1)])
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
            scene: None,
            state_dir: default_state_dir(),
            results_dir: ResultStore::default_dir(),
            default_queue: default_queue(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            seed: None,
            workers: default_workers(),
            exporters: BTreeMap::new(),
        }
    }
}

impl ForgeConfig {
    /// Loads `path`, or `traitforge.toml` in the current directory, then
    /// applies environment overrides. A missing default file means defaults;
    /// a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(scene) = var("TRAITFORGE_SCENE")
            && !scene.is_empty()
        {
            self.scene = Some(PathBuf::from(scene));
        }
        if let Some(bind) = var("TRAITFORGE_BIND")
            && !bind.is_empty()
        {
            self.bind = bind;
        }
    }

    /// Retry policy applied to every submitted job.
    pub fn job_spec(&self) -> JobSpec {
        JobSpec {
            queue: None,
            max_retries: self.max_retries,
            backoff: Backoff {
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_values() {
        let config = ForgeConfig::default();
        assert_eq!(config.bind, "127.0.0.1:8118");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 600_000);
        assert_eq!(config.workers.get("default"), Some(&1));
        assert!(config.scene.is_none());
        assert!(config.exporters.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            scene = "demos/character.toml"
            max_retries = 2
            seed = 7

            [workers]
            default = 2
            render = 1

            [exporters.glb]
            program = "blender"
            args = ["--background", "--python", "export.py", "--", "{metadata}", "{dest}"]
        "#;
        let config: ForgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scene, Some(PathBuf::from("demos/character.toml")));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.exporters["glb"].program, "blender");
        assert_eq!(config.exporters["glb"].args.len(), 6);
        assert_eq!(config.default_queue, "default");
        assert_eq!(config.base_delay_ms, 1000);
    }

    #[test]
    fn env_overrides_file() {
        let mut config: ForgeConfig = toml::from_str(r#"bind = "0.0.0.0:1""#).unwrap();
        let env: HashMap<&str, &str> =
            HashMap::from([("TRAITFORGE_BIND", "127.0.0.1:9"), ("TRAITFORGE_SCENE", "")]);
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind, "127.0.0.1:9");
        assert!(config.scene.is_none());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ForgeConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn job_spec_carries_retry_policy() {
        let config = ForgeConfig {
            max_retries: 1,
            base_delay_ms: 10,
            max_delay_ms: 40,
            ..Default::default()
        };
        let spec = config.job_spec();
        assert_eq!(spec.max_retries, 1);
        assert_eq!(spec.backoff.delay_for_attempt(5).as_millis(), 40);
    }
}
