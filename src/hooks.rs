//! Extension points around a generation pass.

use crate::error::TaskError;
use crate::model::Metadata;
use crate::scene::SceneAssetProvider;

/// What a hook can see about the pass it wraps.
pub struct HookContext<'a> {
    pub metadata_id: u64,
    pub job_id: &'a str,
    pub scene: &'a mut dyn SceneAssetProvider,
}

/// Callbacks run by the worker before and after resolving a variant. Both run
/// inside the scene checkpoint, so anything they apply is reverted with it.
pub trait GenerationHooks: Send + Sync {
    fn pre_generation(&self, _ctx: &mut HookContext<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    fn post_generation(&self, _ctx: &mut HookContext<'_>, _metadata: &mut Metadata) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Runs nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl GenerationHooks for NoHooks {}
