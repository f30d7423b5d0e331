//! Local subcommands: generation, schema dump and metadata validation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use traitforge::config::ForgeConfig;
use traitforge::error::TaskError;
use traitforge::exporter::ExporterRegistry;
use traitforge::hooks::NoHooks;
use traitforge::metadata_store::MetadataStore;
use traitforge::model::Metadata;
use traitforge::resolver::TraitSchema;
use traitforge::results::ResultStore;
use traitforge::scene::InMemoryScene;
use traitforge::worker::{RunnerEnv, TaskRunner};

use crate::ui::BatchProgress;

pub fn load_scene(config: &ForgeConfig) -> Result<InMemoryScene> {
    let path = config
        .scene
        .as_deref()
        .context("no scene configured; set `scene` in traitforge.toml or pass --scene")?;
    InMemoryScene::load(path).with_context(|| format!("failed to load scene {}", path.display()))
}

/// Result of a local generation run.
pub struct Generated {
    pub metadata: Vec<Metadata>,
    pub failures: Vec<(u64, TaskError)>,
}

/// Generates ids `start_id .. start_id + count` on one local runner.
pub fn generate(config: &ForgeConfig, count: u64, start_id: u64, progress: &BatchProgress) -> Result<Generated> {
    let scene = load_scene(config)?;
    let env = RunnerEnv {
        schema: Arc::new(TraitSchema::from_scene(&scene)),
        exporters: Arc::new(ExporterRegistry::new()),
        results: ResultStore::open(&config.results_dir)?,
        metadata: Arc::new(MetadataStore::new()),
        hooks: Arc::new(NoHooks),
        public_url: config.public_url.clone(),
        seed: config.seed,
    };
    let mut runner = TaskRunner::new(Box::new(scene), env);

    let mut generated = Generated {
        metadata: Vec::new(),
        failures: Vec::new(),
    };
    for id in start_id..start_id.saturating_add(count) {
        match runner.generate(&format!("local-{id}"), id) {
            Ok(metadata) => {
                progress.advance(id);
                generated.metadata.push(metadata);
            }
            Err(e) => {
                tracing::debug!(metadata_id = id, error = %e, "generation failed");
                progress.failed(id, &e.to_string());
                generated.failures.push((id, e));
            }
        }
    }
    progress.finish(generated.metadata.len(), generated.failures.len());
    Ok(generated)
}

pub fn write_output(metadata: &[Metadata], output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    match output {
        Some(path) => std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

pub fn schema(config: &ForgeConfig) -> Result<String> {
    let scene = load_scene(config)?;
    Ok(serde_json::to_string_pretty(&TraitSchema::from_scene(&scene))?)
}

/// Validates every metadata in `path`, returning one error per invalid entry.
pub fn validate(config: &ForgeConfig, path: &Path) -> Result<Vec<(u64, Result<(), TaskError>)>> {
    let scene = load_scene(config)?;
    let schema = TraitSchema::from_scene(&scene);
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    let list: Vec<Metadata> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(list
        .iter()
        .map(|metadata| (metadata.id, schema.validate(metadata).map(|_| ())))
        .collect())
}
