use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Message, Result};
use crate::model::Environment;
use crate::store::traits::StructureStore;

/// Process-wide compiled environment, swapped atomically after structural commits.
#[derive(Debug)]
pub struct EnvironmentCache {
    current: RwLock<Arc<Environment>>,
}

impl EnvironmentCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Environment::empty())),
        }
    }

    /// Handle on the snapshot readers should use; never observes a partial reload.
    pub fn snapshot(&self) -> Arc<Environment> {
        self.current.read().clone()
    }

    /// Compile the rows currently visible in the store without publishing them.
    pub fn compile<S: StructureStore + ?Sized>(&self, store: &S) -> Result<Environment> {
        let rows = store
            .load_structure()
            .map_err(|e| e.into_load(Message::new("ex.structure.load")))?;
        Environment::compile(self.snapshot().version() + 1, rows)
    }

    /// Swap in `env` unless its content equals the current snapshot.
    pub fn publish(&self, env: Environment) -> Arc<Environment> {
        let mut current = self.current.write();
        if current.fingerprint() == env.fingerprint() {
            log::debug!("environment unchanged (v{})", current.version());
            return current.clone();
        }
        log::debug!(
            "publishing environment v{} ({})",
            env.version(),
            &env.fingerprint()[..12.min(env.fingerprint().len())]
        );
        *current = Arc::new(env);
        current.clone()
    }

    /// Recompile from the store and publish.
    pub fn reload<S: StructureStore + ?Sized>(&self, store: &S) -> Result<Arc<Environment>> {
        let env = self
            .compile(store)
            .map_err(|e| Error::Cache(Message::new("ex.cache.reload").arg(e)))?;
        Ok(self.publish(env))
    }
}

impl Default for EnvironmentCache {
    fn default() -> Self {
        Self::new()
    }
}
