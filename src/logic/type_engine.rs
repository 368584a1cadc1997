//! Creating, updating and removing types.

use std::collections::BTreeSet;

use crate::error::{Error, Message, Result};
use crate::logic::permission::PermissionEvaluator;
use crate::logic::structure_engine::StructureEngine;
use crate::model::{
    xpath, AssignmentKind, CallerIdentity, ContentType, ContentTypeUpdate, Environment, HistoryEntry,
    Id, IdSpace, NewContentType, Role, TypeMode, TypeRelation, ROOT_TYPE_ID,
};
use crate::store::traits::Store;

/// Both ends of every relation pair must be existing, non-relation types.
fn check_relations(env: &Environment, relations: &[TypeRelation], own_id: Option<Id>) -> Result<()> {
    for relation in relations {
        for end in [relation.source, relation.destination] {
            if Some(end) == own_id {
                return Err(Error::invalid(
                    Message::new("ex.structure.type.relation.self").arg(end),
                ));
            }
            let t = env.content_type(end)?;
            if t.is_relation() {
                return Err(Error::invalid(
                    Message::new("ex.structure.type.relation.invalid")
                        .arg(&t.name)
                        .arg(relation.source)
                        .arg(relation.destination),
                ));
            }
        }
    }
    Ok(())
}

/// Order in which a type's assignments can be deleted: an assignment only after
/// its sub-assignments and everything in the set inheriting from it.
fn removal_stack(env: &Environment, ids: &BTreeSet<Id>) -> Result<Vec<Id>> {
    let mut remaining = ids.clone();
    let mut stack = Vec::with_capacity(ids.len());
    while !remaining.is_empty() {
        let free: Vec<Id> = remaining
            .iter()
            .copied()
            .filter(|id| {
                let blocked_by_child = env
                    .sub_assignments(*id, true)
                    .iter()
                    .any(|s| remaining.contains(&s.id));
                let blocked_by_derived = env
                    .derived_assignments(*id)
                    .iter()
                    .any(|d| remaining.contains(&d.id));
                !blocked_by_child && !blocked_by_derived
            })
            .collect();
        if free.is_empty() {
            return Err(Error::remove(
                Message::new("ex.structure.type.delete.cycle").arg(remaining.len()),
            ));
        }
        for id in free {
            remaining.remove(&id);
            stack.push(id);
        }
    }
    Ok(stack)
}

impl<S: Store> StructureEngine<S> {
    /// Create a type; root assignments are inherited from the parent, or the
    /// system-internal ones from the ROOT type when there is no parent.
    pub fn create_type(&self, caller: &dyn CallerIdentity, new: &NewContentType) -> Result<Id> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let name = new.name.to_uppercase();
        if !xpath::is_valid_alias(&name) {
            return Err(Error::invalid(Message::new("ex.structure.type.name.invalid").arg(&new.name)));
        }
        if env.content_type_by_name(&name).is_ok() {
            return Err(Error::EntryExists(Message::new("ex.structure.type.exists").arg(&name)));
        }
        let parent = match new.parent {
            Some(parent) => Some(env.content_type(parent)?),
            None => None,
        };
        env.acl(new.acl)?;
        if !new.relations.is_empty() && new.mode != TypeMode::Relation {
            return Err(Error::invalid(
                Message::new("ex.structure.type.relation.notRelationType").arg(&name),
            ));
        }
        check_relations(&env, &new.relations, None)?;

        self.transact("createType", || {
            let id = self.next_id(IdSpace::Type)?;
            let t = ContentType::from_new(id, new, caller.user_id());
            self.store
                .insert_type(&t)
                .map_err(|e| e.into_create(Message::new("ex.structure.type.exists").arg(&t.name)))?;

            let inherited = match parent {
                Some(parent) => env.root_assignments(parent.id, true),
                None => env
                    .root_assignments(ROOT_TYPE_ID, true)
                    .into_iter()
                    .filter(|a| a.is_system_internal())
                    .collect(),
            };
            for source in &inherited {
                let enabled = new.enable_parent_assignments || source.is_system_internal();
                self.derive_subtree(&env, source, &t, None, enabled)?;
            }

            self.record(
                HistoryEntry::new(caller.user_id(), "history.type.create")
                    .arg(&t.name)
                    .for_type(id),
            );
            log::info!(
                "created type {} (id {}, {} inherited root assignments)",
                t.name,
                id,
                inherited.len()
            );
            Ok(id)
        })
    }

    /// Apply a partial update; every accepted field change gets a history entry.
    pub fn update_type(&self, caller: &dyn CallerIdentity, type_id: Id, update: &ContentTypeUpdate) -> Result<()> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let original = env.content_type(type_id)?;
        if let Some(name) = &update.name {
            let name = name.to_uppercase();
            if !xpath::is_valid_alias(&name) {
                return Err(Error::invalid(Message::new("ex.structure.type.name.invalid").arg(&name)));
            }
            if env.content_type_by_name(&name).map_or(false, |t| t.id != type_id) {
                return Err(Error::EntryExists(Message::new("ex.structure.type.exists").arg(&name)));
            }
        }
        if let Some(acl) = update.acl {
            env.acl(acl)?;
        }
        if let Some(relations) = &update.relations {
            if !relations.is_empty() && !original.is_relation() {
                return Err(Error::invalid(
                    Message::new("ex.structure.type.relation.notRelationType").arg(&original.name),
                ));
            }
            check_relations(&env, relations, Some(type_id))?;
        }

        let mut updated = original.clone();
        updated.apply_update(update, caller.user_id());
        let mut changes: Vec<(&str, String, String)> = Vec::new();
        let mut note = |field: &'static str, old: String, new: String| {
            if old != new {
                changes.push((field, old, new));
            }
        };
        note("name", original.name.clone(), updated.name.clone());
        note("label", format!("{:?}", original.label), format!("{:?}", updated.label));
        note("acl", original.acl.to_string(), updated.acl.to_string());
        note("workflow", original.workflow.to_string(), updated.workflow.to_string());
        note("permissions", original.permissions.to_string(), updated.permissions.to_string());
        note("state", format!("{:?}", original.state), format!("{:?}", updated.state));
        note("category", format!("{:?}", original.category), format!("{:?}", updated.category));
        note(
            "languageMode",
            format!("{:?}", original.language_mode),
            format!("{:?}", updated.language_mode),
        );
        note("history", format!("{:?}", original.history), format!("{:?}", updated.history));
        note("maxVersions", original.max_versions.to_string(), updated.max_versions.to_string());
        note(
            "maxRelSource",
            original.max_rel_source.to_string(),
            updated.max_rel_source.to_string(),
        );
        note(
            "maxRelDestination",
            original.max_rel_destination.to_string(),
            updated.max_rel_destination.to_string(),
        );
        note(
            "relations",
            format!("{:?}", original.relations),
            format!("{:?}", updated.relations),
        );
        if changes.is_empty() {
            return Ok(());
        }
        let renamed = updated.name != original.name;

        self.transact("updateType", || {
            self.store.update_type(&updated).map_err(|e| {
                e.into_update(Message::new("ex.structure.type.update").arg(&original.name))
            })?;
            if renamed {
                // assignment XPaths carry the type name
                for a in env.type_assignments(type_id) {
                    let mut row = a.clone();
                    row.xpath = format!("{}{}", updated.name, a.relative_xpath());
                    self.store.update_assignment(&row).map_err(|e| {
                        e.into_update(Message::new("ex.structure.assignment.update").arg(&a.xpath))
                    })?;
                }
            }
            Ok(())
        })?;
        for (field, old, new) in &changes {
            self.record(
                HistoryEntry::new(caller.user_id(), "history.type.update")
                    .arg(&original.name)
                    .arg(field)
                    .arg(old)
                    .arg(new)
                    .for_type(type_id),
            );
        }
        log::info!("updated type {} ({} fields)", updated.name, changes.len());
        Ok(())
    }

    /// Remove a type without instances or derived types, with all its assignments.
    ///
    /// Assignments of other types inheriting from this one are detached first.
    pub fn remove_type(&self, caller: &dyn CallerIdentity, type_id: Id) -> Result<()> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let t = env.content_type(type_id)?;
        if type_id == ROOT_TYPE_ID {
            return Err(Error::remove(Message::new("ex.structure.type.delete.root")));
        }
        if let Some(child) = env.derived_types(type_id).first() {
            return Err(Error::remove(
                Message::new("ex.structure.type.inUse.derived")
                    .arg(&t.name)
                    .arg(&child.name),
            ));
        }
        let instances = self
            .store
            .instance_count(type_id)
            .map_err(|e| e.into_remove(Message::new("ex.structure.type.delete").arg(&t.name)))?;
        if instances > 0 {
            return Err(Error::remove(
                Message::new("ex.structure.type.inUse")
                    .arg(&t.name)
                    .arg(instances),
            ));
        }

        let own: BTreeSet<Id> = env.type_assignments(type_id).iter().map(|a| a.id).collect();
        let stack = removal_stack(&env, &own)?;
        let foreign_derived: Vec<Id> = own
            .iter()
            .flat_map(|id| env.derived_assignments(*id))
            .filter(|d| d.type_id != type_id)
            .map(|d| d.id)
            .collect();
        let mut properties = BTreeSet::new();
        let mut groups = BTreeSet::new();
        for id in &own {
            match env.assignment(*id)?.kind {
                AssignmentKind::Property { property_id, .. } => {
                    properties.insert(property_id);
                }
                AssignmentKind::Group { group_id, .. } => {
                    groups.insert(group_id);
                }
            }
        }

        self.transact("removeType", || {
            for id in &foreign_derived {
                let mut row = env.assignment(*id)?.clone();
                row.base = None;
                self.store.update_assignment(&row).map_err(|e| {
                    e.into_remove(Message::new("ex.structure.assignment.detach").arg(&row.xpath))
                })?;
            }
            self.delete_assignments(&stack)?;
            self.collect_orphans(&properties, &groups)?;
            self.store
                .delete_type(type_id)
                .map_err(|e| e.into_remove(Message::new("ex.structure.type.delete").arg(&t.name)))
        })?;
        self.record(HistoryEntry::new(caller.user_id(), "history.type.remove").arg(&t.name));
        log::info!("removed type {} ({} assignments)", t.name, stack.len());
        Ok(())
    }
}
