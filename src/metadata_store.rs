use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ForgeError;
use crate::model::Metadata;

/// Generated metadata per id, plus the id allocator for unnumbered generate
/// requests. Render output is never stored here.
#[derive(Debug)]
pub struct MetadataStore {
    entries: RwLock<HashMap<u64, Metadata>>,
    next_id: AtomicU64,
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns a fresh id above every id reserved so far.
    pub fn allocate_id(&self) -> Result<u64, ForgeError> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| next.checked_add(1))
            .map_err(|_| ForgeError::IdsExhausted)
    }

    /// Makes sure later allocations never reuse ids `<= id`. The allocator is
    /// left untouched when `id` is the last representable one.
    pub fn reserve_through(&self, id: u64) -> Result<(), ForgeError> {
        let next = id.checked_add(1).ok_or(ForgeError::IdsExhausted)?;
        self.next_id.fetch_max(next, Ordering::SeqCst);
        Ok(())
    }

    /// Records generated metadata. Ids come from [`Self::allocate_id`] or a
    /// reserved range, so this never moves the allocator.
    pub fn put(&self, metadata: Metadata) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(metadata.id, metadata);
    }

    pub fn get(&self, id: u64) -> Option<Metadata> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
