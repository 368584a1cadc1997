//! Initializing, saving, loading and removing content instances.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ContentConfig;
use crate::error::{Error, Message, Result};
use crate::logic::delta::DeltaEngine;
use crate::logic::permission::{PermissionEvaluator, PermissionSet, SecurityInfo};
use crate::model::{
    CallerIdentity, Content, ContentVersionInfo, Environment, Id, IdSpace, LanguageId, LifeCycleInfo,
    Permission, PrimaryKey, VersionEntry,
};
use crate::store::environment_cache::EnvironmentCache;
use crate::store::traits::{in_transaction, DataRow, Store};
use crate::store::version_cache::CachedContentContainer;

/// Where a new instance goes; unset ACL and step fall back to the type's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewInstance {
    pub type_id: Id,
    pub mandator: Id,
    pub acl: Option<Id>,
    pub step: Option<Id>,
    pub main_language: LanguageId,
}

impl NewInstance {
    pub fn of_type(type_id: Id, mandator: Id) -> Self {
        Self {
            type_id,
            mandator,
            acl: None,
            step: None,
            main_language: 1,
        }
    }
}

pub struct ContentEngine<S: Store> {
    store: Arc<S>,
    cache: Arc<EnvironmentCache>,
    config: ContentConfig,
    /// Version containers, tagged with the environment version they were filled under
    containers: RwLock<HashMap<Id, (u64, Arc<CachedContentContainer>)>>,
}

impl<S: Store> ContentEngine<S> {
    pub fn new(store: Arc<S>, cache: Arc<EnvironmentCache>, config: ContentConfig) -> Self {
        Self {
            store,
            cache,
            config,
            containers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ContentConfig {
        &self.config
    }

    /// Cached versions of one instance; structural changes since the fill invalidate them.
    fn container(&self, info: &ContentVersionInfo) -> Arc<CachedContentContainer> {
        let env_version = self.cache.snapshot().version();
        if let Some((filled_under, container)) = self.containers.read().get(&info.id) {
            if *filled_under == env_version {
                return container.clone();
            }
        }
        let mut containers = self.containers.write();
        let entry = containers.entry(info.id).or_insert_with(|| {
            (
                env_version,
                Arc::new(CachedContentContainer::new(info.clone(), self.config.max_cached_versions)),
            )
        });
        if entry.0 != env_version {
            log::debug!("dropping cached versions of content {} after a structure change", info.id);
            *entry = (
                env_version,
                Arc::new(CachedContentContainer::new(info.clone(), self.config.max_cached_versions)),
            );
        }
        entry.1.clone()
    }

    fn version_info(&self, id: Id) -> Result<ContentVersionInfo> {
        self.store
            .version_info(id)
            .map_err(|e| e.into_load(Message::new("ex.content.load").arg(id)))?
            .ok_or_else(|| Error::not_found(Message::new("ex.content.notFound").arg(id)))
    }

    /// Stored copy of a concrete version, through the version cache.
    fn load_raw(&self, info: &ContentVersionInfo, pk: &PrimaryKey) -> Result<Content> {
        let container = self.container(info);
        if let Some(content) = container.get(pk) {
            return Ok(content);
        }
        let version = info.distinct_version(pk)?;
        let content = self
            .store
            .load_version(info.id, version)
            .map_err(|e| e.into_load(Message::new("ex.content.load").arg(pk)))?
            .ok_or_else(|| Error::not_found(Message::new("ex.content.version.notFound").arg(pk)))?;
        container.add(content.clone())?;
        Ok(content)
    }

    /// First step of the type's workflow.
    fn default_step(env: &Environment, workflow: Id) -> Result<Id> {
        env.rows()
            .steps
            .values()
            .find(|s| s.workflow == workflow)
            .map(|s| s.id)
            .ok_or_else(|| Error::not_found(Message::new("ex.workflow.step.notFound.workflow").arg(workflow)))
    }

    /// Empty instance of a type, ready to be filled and saved.
    pub fn initialize(&self, caller: &dyn CallerIdentity, new: NewInstance) -> Result<Content> {
        let env = self.cache.snapshot();
        let t = env.content_type(new.type_id)?;
        PermissionEvaluator::check_type_available(t, false)?;
        let acl = new.acl.unwrap_or(t.acl);
        let step = match new.step {
            Some(step) => step,
            None => Self::default_step(&env, t.workflow)?,
        };
        let info = SecurityInfo::for_type(&env, t.id, Some(step), Some(acl))?;
        PermissionEvaluator::check(caller, Permission::Create, &info, &env)?;

        let mut content = Content::initialize(
            &env,
            t.id,
            new.mandator,
            acl,
            step,
            new.main_language,
            caller.user_id(),
        )?;
        PermissionEvaluator::wrap_no_access_values(caller, &env, &mut content)?;
        Ok(content)
    }

    /// Store `content` as a new instance, as a new version, or over its current version.
    pub fn save(&self, caller: &dyn CallerIdentity, mut content: Content, new_version: bool) -> Result<PrimaryKey> {
        let env = self.cache.snapshot();
        let t = env.content_type(content.type_id)?;
        PermissionEvaluator::check_type_available(t, false)?;

        let (mut info, version, lifecycle) = if content.pk.is_new() {
            let info = SecurityInfo::for_type(&env, t.id, Some(content.step), Some(content.acl))?;
            PermissionEvaluator::check(caller, Permission::Create, &info, &env)?;
            let id = self
                .store
                .next_id(IdSpace::Content)
                .map_err(|e| e.into_create(Message::new("ex.db.sequence").arg("content")))?;
            content.compact()?;
            content.check_validity()?;
            (ContentVersionInfo::new(id), 1, LifeCycleInfo::created_by(caller.user_id()))
        } else {
            let info = self.version_info(content.pk.id)?;
            let stored = self.load_raw(&info, &PrimaryKey::max(info.id))?;
            if stored.type_id != content.type_id {
                return Err(Error::invalid(
                    Message::new("ex.content.save.typeChanged")
                        .arg(content.pk)
                        .arg(stored.type_id),
                ));
            }
            PermissionEvaluator::unwrap_no_access_values(&mut content, &stored)?;
            PermissionEvaluator::check(caller, Permission::Edit, &SecurityInfo::for_content(&env, &stored)?, &env)?;
            content.compact()?;
            content.check_validity()?;

            let delta = DeltaEngine::process(&stored, &content)?;
            PermissionEvaluator::check_property_permissions(caller, &env, t.id, &delta)?;
            let header_changed = stored.acl != content.acl
                || stored.step != content.step
                || stored.active != content.active
                || stored.main_language != content.main_language;
            if !delta.changes() && !header_changed && !new_version {
                log::debug!("content {} unchanged, nothing saved", content.pk);
                return Ok(stored.pk);
            }
            log::debug!("saving content {}:\n{}", content.pk, delta.dump());

            let max = info.max_version().unwrap_or(0);
            let version = if new_version {
                max + 1
            } else {
                info.distinct_version(&content.pk)?
            };
            let lifecycle = stored.lifecycle.modified_by(caller.user_id());
            (info, version, lifecycle)
        };

        let pk = PrimaryKey::new(info.id, version);
        content.pk = pk;
        content.lifecycle = lifecycle.clone();
        info.add_version(
            version,
            VersionEntry {
                lifecycle,
                step: content.step,
            },
            false,
        );
        content.max_version = info.max_version();
        content.live_version = info.live_version;
        content.init_system_properties()?;
        let rows = DataRow::collect(&content)?;

        in_transaction(self.store.as_ref(), || {
            self.store
                .store_version(&content, &info, rows)
                .map_err(|e| e.into_create(Message::new("ex.content.save").arg(pk)))
        })?;

        let container = self.container(&info);
        container.update_info(info);
        container.add(content)?;
        log::info!("saved content {} (type {})", pk, t.name);
        Ok(pk)
    }

    /// Load a version (MAX and LIVE resolve) with unreadable values wrapped.
    pub fn load(&self, caller: &dyn CallerIdentity, pk: &PrimaryKey) -> Result<Content> {
        let env = self.cache.snapshot();
        let info = self.version_info(pk.id)?;
        let mut content = self.load_raw(&info, pk)?;
        PermissionEvaluator::check(caller, Permission::Read, &SecurityInfo::for_content(&env, &content)?, &env)?;
        PermissionEvaluator::wrap_no_access_values(caller, &env, &mut content)?;
        Ok(content)
    }

    /// What the caller may do with an instance besides reading it.
    pub fn permissions(&self, caller: &dyn CallerIdentity, pk: &PrimaryKey) -> Result<PermissionSet> {
        let env = self.cache.snapshot();
        let info = self.version_info(pk.id)?;
        let content = self.load_raw(&info, pk)?;
        PermissionEvaluator::permission_set(caller, &SecurityInfo::for_content(&env, &content)?, &env)
    }

    /// Remove every version of an instance plus the binaries it referenced.
    pub fn remove(&self, caller: &dyn CallerIdentity, id: Id) -> Result<()> {
        let env = self.cache.snapshot();
        let info = self.version_info(id)?;
        let current = self.load_raw(&info, &PrimaryKey::max(id))?;
        PermissionEvaluator::check(caller, Permission::Delete, &SecurityInfo::for_content(&env, &current)?, &env)?;

        let mut binaries = Vec::new();
        for version in info.versions.keys() {
            let content = self.load_raw(&info, &PrimaryKey::new(id, *version))?;
            binaries.extend(content.binary_ids()?);
        }
        binaries.sort_unstable();
        binaries.dedup();

        in_transaction(self.store.as_ref(), || {
            self.store
                .remove_content(id)
                .map_err(|e| e.into_remove(Message::new("ex.content.remove").arg(id)))?;
            if !binaries.is_empty() {
                self.store
                    .remove_binaries(&binaries)
                    .map_err(|e| e.into_remove(Message::new("ex.content.remove.binaries").arg(id)))?;
            }
            Ok(())
        })?;
        self.containers.write().remove(&id);
        log::info!("removed content {} ({} versions)", id, info.versions.len());
        Ok(())
    }
}
