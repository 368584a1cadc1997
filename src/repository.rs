//! Wiring of one store, its environment cache and the engines working on them.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::logic::{ContentEngine, StructureEngine};
use crate::model::Environment;
use crate::seed::{load_seed_data, SystemIds};
use crate::store::{EnvironmentCache, MemoryStore, Store};

pub struct Repository<S: Store> {
    store: Arc<S>,
    cache: Arc<EnvironmentCache>,
    system: SystemIds,
    pub structure: StructureEngine<S>,
    pub content: ContentEngine<S>,
}

impl<S: Store> Repository<S> {
    /// Install the system structure into an empty `store` and set up the engines.
    pub fn open(store: S, config: &EngineConfig) -> Result<Self> {
        let store = Arc::new(store);
        let cache = Arc::new(EnvironmentCache::new());
        let (system, _) = load_seed_data(store.as_ref(), &cache)?;
        Ok(Self {
            structure: StructureEngine::new(store.clone(), cache.clone(), config.structure.clone()),
            content: ContentEngine::new(store.clone(), cache.clone(), config.content.clone()),
            store,
            cache,
            system,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn environment(&self) -> Arc<Environment> {
        self.cache.snapshot()
    }

    pub fn system(&self) -> &SystemIds {
        &self.system
    }
}

impl Repository<MemoryStore> {
    /// Seeded in-memory repository with default configuration.
    pub fn in_memory() -> Result<Self> {
        Self::open(MemoryStore::new(), &EngineConfig::default())
    }
}
