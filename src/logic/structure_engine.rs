//! Shared plumbing of the structural operations.
//!
//! `StructureEngine` owns the store handle and the environment cache. The
//! operations themselves live in `assignment_engine` (properties, groups and
//! their assignments) and `type_engine` (types); both run every write inside
//! one store transaction and publish a freshly compiled environment once it
//! committed.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::StructureConfig;
use crate::error::{Error, Message, Result};
use crate::logic::position;
use crate::model::{
    Assignment, ContentType, Environment, HistoryEntry, Id, IdSpace,
};
use crate::store::environment_cache::EnvironmentCache;
use crate::store::traits::{in_transaction, Store, StoreError};

pub struct StructureEngine<S: Store> {
    pub(crate) store: Arc<S>,
    pub(crate) cache: Arc<EnvironmentCache>,
    pub(crate) config: StructureConfig,
}

impl<S: Store> StructureEngine<S> {
    pub fn new(store: Arc<S>, cache: Arc<EnvironmentCache>, config: StructureConfig) -> Self {
        Self { store, cache, config }
    }

    /// Snapshot readers should use.
    pub fn environment(&self) -> Arc<Environment> {
        self.cache.snapshot()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Compile what the current transaction sees without publishing it.
    pub(crate) fn working_environment(&self) -> Result<Environment> {
        self.cache.compile(self.store.as_ref())
    }

    pub(crate) fn next_id(&self, space: IdSpace) -> Result<Id> {
        self.store.next_id(space).map_err(|e| {
            e.into_create(Message::new("ex.db.sequence").arg(format!("{:?}", space)))
        })
    }

    /// History is best effort: a failing sink never blocks the structural write.
    pub(crate) fn record(&self, entry: HistoryEntry) {
        let key = entry.key.clone();
        if let Err(e) = self.store.record(entry) {
            log::warn!("history entry {} dropped: {}", key, e);
        }
    }

    /// Run `f` in a transaction and publish the resulting environment after commit.
    ///
    /// A reload failure after the commit leaves the write in place and the old
    /// snapshot published; it is reported as a `Cache` error.
    pub(crate) fn transact<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let value = in_transaction(self.store.as_ref(), f)?;
        if let Err(e) = self.cache.reload(self.store.as_ref()) {
            log::error!("{} committed but the environment reload failed: {}", operation, e);
            return Err(e);
        }
        Ok(value)
    }

    /// Insert a named entity, retrying with `_1`, `_2`, ... suffixes when `auto_unique` is set.
    pub(crate) fn insert_unique<T>(
        &self,
        auto_unique: bool,
        name: &str,
        exists_key: &str,
        insert: impl Fn(&str) -> std::result::Result<T, StoreError>,
    ) -> Result<T> {
        let first = match insert(name) {
            Ok(value) => return Ok(value),
            Err(StoreError::UniqueViolation(_)) if auto_unique => None,
            Err(e) => Some(e),
        };
        if let Some(e) = first {
            return Err(e.into_create(Message::new(exists_key).arg(name)));
        }
        for suffix in 1..=self.config.auto_unique_attempts {
            let candidate = format!("{}_{}", name, suffix);
            match insert(&candidate) {
                Ok(value) => {
                    log::debug!("name {} taken, using {}", name, candidate);
                    return Ok(value);
                }
                Err(StoreError::UniqueViolation(_)) => continue,
                Err(e) => return Err(e.into_create(Message::new(exists_key).arg(&candidate))),
            }
        }
        Err(Error::EntryExists(Message::new(exists_key).arg(name)))
    }

    /// Create a derived copy of `source` (and its whole subtree) on `target`.
    ///
    /// Returns the id of the copy of `source`. Sub-assignments get their own
    /// copies with `base` pointing at the matching source sub-assignment.
    pub(crate) fn derive_subtree(
        &self,
        env: &Environment,
        source: &Assignment,
        target: &ContentType,
        parent_group: Option<Id>,
        enabled: bool,
    ) -> Result<Id> {
        let id = self.next_id(IdSpace::Assignment)?;
        let mut derived = source.derive_for(id, target.id, &target.name, parent_group);
        derived.enabled = source.enabled && enabled;
        // below a fresh group copy the source order is always free
        derived.position = position::valid_position(env, target.id, parent_group, Some(source.position));
        self.store.insert_assignment(&derived).map_err(|e| {
            e.into_create(Message::new("ex.structure.assignment.exists").arg(&derived.xpath))
        })?;
        for sub in env.sub_assignments(source.id, true) {
            self.derive_subtree(env, sub, target, Some(id), enabled)?;
        }
        Ok(id)
    }

    /// Copy a freshly created assignment onto every type inheriting from its type, transitively.
    pub(crate) fn propagate(&self, assignment_id: Id) -> Result<usize> {
        let env = self.working_environment()?;
        let source = env.assignment(assignment_id)?;
        let parent_path = match source.parent_group {
            Some(group) => Some(env.assignment(group)?.relative_xpath()),
            None => None,
        };
        let mut created = 0;
        for child in env.derived_types(source.type_id) {
            let parent_group = match &parent_path {
                Some(path) => match env.assignment_by_xpath(child.id, path) {
                    Ok(group) => Some(group.id),
                    Err(_) => {
                        log::debug!("type {} lacks {}, not inheriting {}", child.name, path, source.xpath);
                        continue;
                    }
                },
                None => None,
            };
            let derived = self.derive_subtree(&env, source, child, parent_group, true)?;
            log::debug!("inherited {} into {}", source.xpath, child.name);
            created += 1 + self.propagate(derived)?;
        }
        Ok(created)
    }

    /// Delete `ids` in an order the store's references accept.
    pub(crate) fn delete_assignments(&self, ids: &[Id]) -> Result<()> {
        let mut pending: Vec<Id> = ids.to_vec();
        while !pending.is_empty() {
            let before = pending.len();
            let mut blocked = Vec::new();
            for id in pending {
                match self.store.delete_assignment(id) {
                    Ok(()) => {}
                    Err(StoreError::ForeignKeyViolation(_)) => blocked.push(id),
                    Err(e) => {
                        return Err(e.into_remove(Message::new("ex.structure.assignment.delete").arg(id)))
                    }
                }
            }
            if blocked.len() == before {
                let id = blocked[0];
                return Err(Error::remove(
                    Message::new("ex.structure.assignment.delete.referenced").arg(id),
                ));
            }
            pending = blocked;
        }
        Ok(())
    }

    /// Drop properties and groups no assignment refers to anymore.
    pub(crate) fn collect_orphans(&self, properties: &BTreeSet<Id>, groups: &BTreeSet<Id>) -> Result<()> {
        let env = self.working_environment()?;
        for id in properties {
            if env.property(*id).is_ok() && env.property_assignments(*id).is_empty() {
                self.store.delete_property(*id).map_err(|e| {
                    e.into_remove(Message::new("ex.structure.property.delete").arg(id))
                })?;
                log::info!("removed orphaned property {}", id);
            }
        }
        for id in groups {
            if env.group(*id).is_ok() && env.group_assignments(*id).is_empty() {
                self.store
                    .delete_group(*id)
                    .map_err(|e| e.into_remove(Message::new("ex.structure.group.delete").arg(id)))?;
                log::info!("removed orphaned group {}", id);
            }
        }
        Ok(())
    }
}
