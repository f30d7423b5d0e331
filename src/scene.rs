//! Scene collaborator seam.
//!
//! [`AssetPoolRegistry`] is the read-only view the resolver samples from;
//! [`SceneAssetProvider`] adds the mutable side used by workers to apply
//! attributes, plus checkpoint/revert. [`InMemoryScene`] is the provider the
//! binary loads from a JSON or TOML scene description.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SceneError;
use crate::model::{AssetPool, Candidate, TraitKind, TraitSpec, TraitValue};

/// Read-only access to named pools of candidates.
pub trait AssetPoolRegistry {
    fn list_pools(&self) -> Vec<&AssetPool>;

    fn pool(&self, name: &str) -> Option<&AssetPool> {
        self.list_pools().into_iter().find(|p| p.name == name)
    }

    fn get_candidates(&self, pool: &str) -> Option<&[Candidate]> {
        self.pool(pool).map(|p| p.candidates.as_slice())
    }
}

/// The mutable document both generate and render act on.
///
/// One provider is owned by exactly one worker; it is never shared.
pub trait SceneAssetProvider: AssetPoolRegistry + Send {
    /// Source reference written into metadata.
    fn filename(&self) -> &str;

    /// Authored root trait set.
    fn root_traits(&self) -> &[TraitSpec];

    fn apply_attribute(&mut self, trait_name: &str, value: &TraitValue) -> Result<(), SceneError>;

    /// Current input value of a trait, if one has been applied.
    fn attribute(&self, trait_name: &str) -> Option<TraitValue>;

    fn checkpoint(&mut self);

    fn revert(&mut self) -> Result<(), SceneError>;
}

/// Checkpoints a scene on creation and reverts it on drop, whether the body
/// returned normally, returned an error, or panicked.
pub struct SceneGuard<'a, S: SceneAssetProvider + ?Sized> {
    scene: &'a mut S,
}

impl<'a, S: SceneAssetProvider + ?Sized> SceneGuard<'a, S> {
    pub fn new(scene: &'a mut S) -> Self {
        scene.checkpoint();
        Self { scene }
    }
}

impl<S: SceneAssetProvider + ?Sized> Deref for SceneGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.scene
    }
}

impl<S: SceneAssetProvider + ?Sized> DerefMut for SceneGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.scene
    }
}

impl<S: SceneAssetProvider + ?Sized> Drop for SceneGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.scene.revert() {
            tracing::error!(error = %e, "failed to revert scene to checkpoint");
        }
    }
}

/// On-disk scene description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneDocument {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub root: Vec<TraitSpec>,
    #[serde(default)]
    pub pools: Vec<AssetPool>,
}

/// Scene held entirely in memory; applied inputs are a flat map.
#[derive(Debug, Clone)]
pub struct InMemoryScene {
    document: SceneDocument,
    known_traits: HashMap<String, TraitSpec>,
    inputs: BTreeMap<String, TraitValue>,
    checkpoint: Option<BTreeMap<String, TraitValue>>,
}

impl InMemoryScene {
    pub fn new(document: SceneDocument) -> Result<Self, SceneError> {
        for pool in &document.pools {
            for candidate in &pool.candidates {
                if !candidate.weight.is_finite() || candidate.weight < 0.0 {
                    return Err(SceneError::Load(format!(
                        "candidate `{}` in pool `{}` has invalid weight {}",
                        candidate.name, pool.name, candidate.weight
                    )));
                }
            }
        }

        let mut known_traits = HashMap::new();
        let nested = document
            .pools
            .iter()
            .flat_map(|p| p.candidates.iter())
            .flat_map(|c| c.traits.iter());
        for spec in document.root.iter().chain(nested) {
            known_traits
                .entry(spec.name.clone())
                .or_insert_with(|| spec.clone());
        }

        Ok(Self {
            document,
            known_traits,
            inputs: BTreeMap::new(),
            checkpoint: None,
        })
    }

    /// Loads a scene from `.json` or `.toml`.
    pub fn load(path: &Path) -> Result<Self, SceneError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SceneError::Load(format!("{}: {e}", path.display())))?;
        let mut document: SceneDocument = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents).map_err(|e| SceneError::Load(e.to_string()))?,
            _ => serde_json::from_str(&contents).map_err(|e| SceneError::Load(e.to_string()))?,
        };
        if document.filename.is_empty() {
            document.filename = path.display().to_string();
        }
        Self::new(document)
    }

    pub fn document(&self) -> &SceneDocument {
        &self.document
    }

    /// Every trait the scene declares, root and nested.
    pub fn known_traits(&self) -> &HashMap<String, TraitSpec> {
        &self.known_traits
    }

    pub fn inputs(&self) -> &BTreeMap<String, TraitValue> {
        &self.inputs
    }
}

impl AssetPoolRegistry for InMemoryScene {
    fn list_pools(&self) -> Vec<&AssetPool> {
        self.document.pools.iter().collect()
    }
}

impl SceneAssetProvider for InMemoryScene {
    fn filename(&self) -> &str {
        &self.document.filename
    }

    fn root_traits(&self) -> &[TraitSpec] {
        &self.document.root
    }

    fn apply_attribute(&mut self, trait_name: &str, value: &TraitValue) -> Result<(), SceneError> {
        let spec = self
            .known_traits
            .get(trait_name)
            .ok_or_else(|| SceneError::UnknownTrait(trait_name.to_string()))?;
        let fits = match (&spec.kind, value) {
            (TraitKind::Scalar { .. }, TraitValue::Scalar(_) | TraitValue::Integer(_)) => true,
            (TraitKind::Integer { .. }, TraitValue::Integer(_)) => true,
            (
                TraitKind::Reference { .. } | TraitKind::MultiReference { .. },
                TraitValue::Reference(_) | TraitValue::Text(_),
            ) => true,
            (TraitKind::String { .. }, _) => true,
            _ => false,
        };
        if !fits {
            return Err(SceneError::Apply {
                trait_name: trait_name.to_string(),
                value: value.to_string(),
            });
        }
        self.inputs.insert(trait_name.to_string(), value.clone());
        Ok(())
    }

    fn attribute(&self, trait_name: &str) -> Option<TraitValue> {
        self.inputs.get(trait_name).cloned()
    }

    fn checkpoint(&mut self) {
        self.checkpoint = Some(self.inputs.clone());
    }

    fn revert(&mut self) -> Result<(), SceneError> {
        let saved = self.checkpoint.take().ok_or(SceneError::NoCheckpoint)?;
        self.inputs = saved;
        Ok(())
    }
}
