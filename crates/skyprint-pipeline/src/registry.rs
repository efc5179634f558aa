//! Process-wide cache of live cutout generators keyed by uuid.
//!
//! Records restored from disk that name the same generator uuid share one
//! `Arc<CutoutGenerator>` instead of each building their own. The
//! registry is a cache: it never keeps a generator alive on behalf of a
//! caller. Entries whose only remaining reference is the registry itself
//! are pruned on lookup, or explicitly with
//! [`evict_unused`](GeneratorRegistry::evict_unused).

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::cutout::CutoutGenerator;
use crate::types::PipelineError;

#[derive(Debug, Default)]
pub struct GeneratorRegistry {
    entries: DashMap<Uuid, Arc<CutoutGenerator>>,
}

impl GeneratorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared process-wide registry.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<GeneratorRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Insert a generator, returning the live instance for its uuid.
    ///
    /// If a generator with the same uuid is already registered, that
    /// instance is returned and `generator` is discarded.
    pub fn register(&self, generator: CutoutGenerator) -> Arc<CutoutGenerator> {
        Arc::clone(
            self.entries
                .entry(generator.uuid())
                .or_insert_with(|| Arc::new(generator))
                .value(),
        )
    }

    /// Live generator for `uuid`, if any.
    pub fn lookup(&self, uuid: &Uuid) -> Option<Arc<CutoutGenerator>> {
        self.evict_unused();
        self.entries.get(uuid).map(|entry| Arc::clone(entry.value()))
    }

    /// Restore a generator from its saved dictionary, reusing a live
    /// instance with the same uuid when one exists.
    ///
    /// # Errors
    ///
    /// Propagates [`CutoutGenerator::load`] errors.
    pub fn resolve(&self, value: &Value) -> Result<Arc<CutoutGenerator>, PipelineError> {
        let generator = CutoutGenerator::load(value)?;
        if let Some(live) = self.lookup(&generator.uuid()) {
            tracing::debug!(uuid = %live.uuid(), "reusing live cutout generator");
            return Ok(live);
        }
        Ok(self.register(generator))
    }

    /// Remove the entry for `uuid`. Returns whether one was present.
    pub fn evict(&self, uuid: &Uuid) -> bool {
        self.entries.remove(uuid).is_some()
    }

    /// Drop every entry no caller still holds.
    pub fn evict_unused(&self) {
        self.entries.retain(|_, generator| Arc::strong_count(generator) > 1);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
