//! Properties, groups and their assignments.

use std::collections::BTreeSet;
use std::fmt::Debug;

use crate::error::{Error, Message, Result};
use crate::logic::permission::{PermissionEvaluator, SecurityInfo};
use crate::logic::position;
use crate::logic::structure_engine::StructureEngine;
use crate::model::{
    find_option, xpath, Assignment, AssignmentKind, CallerIdentity, Environment, GroupMode, Group,
    HistoryEntry, Id, IdSpace, Multiplicity, NewGroup, NewProperty, Permission, Property, Role,
    StructureOption, NEW_ID,
};
use crate::store::traits::Store;

/// How far `remove_assignment` reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove the children of a group assignment too; without it a non-empty group cannot go
    pub remove_sub_assignments: bool,
    /// Remove assignments inherited from the removed ones; otherwise they are detached
    pub remove_derived_assignments: bool,
    /// Allow removing an assignment that is itself inherited
    pub allow_derived_removal: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            remove_sub_assignments: true,
            remove_derived_assignments: true,
            allow_derived_removal: false,
        }
    }
}

impl RemoveOptions {
    /// Keep inherited copies alive as independent assignments.
    pub fn break_inheritance() -> Self {
        Self {
            remove_derived_assignments: false,
            ..Self::default()
        }
    }
}

/// Assignments a removal deletes, plus the inherited ones it only detaches.
#[derive(Debug, Default)]
struct Removal {
    delete: Vec<Id>,
    detach: Vec<Id>,
    properties: BTreeSet<Id>,
    groups: BTreeSet<Id>,
}

type FieldChange = (&'static str, String, String);

fn diff<T: PartialEq + Debug>(changes: &mut Vec<FieldChange>, field: &'static str, old: &T, new: &T) {
    if old != new {
        changes.push((field, format!("{:?}", old), format!("{:?}", new)));
    }
}

fn not_supported(field: &str, what: &str) -> Error {
    Error::update(
        Message::new("ex.structure.modification.notSupported")
            .arg(field)
            .arg(what),
    )
}

fn is_narrowing(old: &Multiplicity, new: &Multiplicity) -> bool {
    new.min > old.min
        || match (old.max, new.max) {
            (None, Some(_)) => true,
            (Some(old), Some(new)) => new < old,
            _ => false,
        }
}

/// Assignment options may only differ from the entity's where it marks them overridable.
fn check_option_overrides(entity: &[StructureOption], assignment: &[StructureOption], xpath: &str) -> Result<()> {
    for option in assignment {
        if let Some(base) = find_option(entity, &option.key) {
            if !base.overridable && base.value != option.value {
                return Err(Error::update(
                    Message::new("ex.structure.assignment.overrideNotAllowed.option")
                        .arg(&option.key)
                        .arg(xpath),
                ));
            }
        }
    }
    Ok(())
}

fn check_multiplicity_override(
    may_override: bool,
    entity: &Multiplicity,
    assignment: &Assignment,
) -> Result<()> {
    if !may_override && !assignment.multiplicity.is_within(entity) {
        return Err(Error::update(
            Message::new("ex.structure.assignment.overrideNotAllowed.multiplicity")
                .arg(&assignment.xpath)
                .arg(assignment.multiplicity)
                .arg(entity),
        ));
    }
    if let Some(max) = assignment.multiplicity.max {
        if assignment.default_multiplicity > max {
            return Err(Error::invalid(
                Message::new("ex.structure.assignment.defaultMultiplicity")
                    .arg(&assignment.xpath)
                    .arg(assignment.default_multiplicity),
            ));
        }
    }
    Ok(())
}

fn require_supervisor(caller: &dyn CallerIdentity, what: &str) -> Result<()> {
    if caller.is_supervisor() || caller.is_running_as_system() {
        return Ok(());
    }
    Err(Error::no_access(
        Message::new("ex.structure.systemInternal.supervisorOnly")
            .arg(what)
            .arg(caller.user_id()),
    ))
}

/// Parent group assignment and relative parent path for `parent_xpath` in a type.
fn resolve_parent(env: &Environment, type_id: Id, parent_xpath: &str) -> Result<(Option<Id>, String)> {
    let path = xpath::to_xpath_no_mult(parent_xpath)?;
    if path == "/" {
        return Ok((None, path));
    }
    let parent = env.assignment_by_xpath(type_id, &path)?;
    if !parent.is_group() {
        return Err(Error::invalid(
            Message::new("ex.structure.assignment.noGroup")
                .arg(&parent.xpath)
                .xpath(&path),
        ));
    }
    Ok((Some(parent.id), parent.relative_xpath()))
}

impl<S: Store> StructureEngine<S> {
    /// Create a property and attach it to `type_id` below `parent_xpath`.
    ///
    /// Returns the id of the new assignment. The alias defaults to the property name.
    pub fn create_property(
        &self,
        caller: &dyn CallerIdentity,
        type_id: Id,
        new: &NewProperty,
        parent_xpath: &str,
        alias: Option<&str>,
    ) -> Result<Id> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        if new.system_internal {
            require_supervisor(caller, &new.name)?;
        }
        let env = self.environment();
        let t = env.content_type(type_id)?;
        let (parent_group, parent_path) = resolve_parent(&env, type_id, parent_xpath)?;
        let alias = alias.unwrap_or(&new.name).to_uppercase();
        if !xpath::is_valid_alias(&new.name.to_uppercase()) || !xpath::is_valid_alias(&alias) {
            return Err(Error::invalid(
                Message::new("ex.structure.property.name.invalid")
                    .arg(&new.name)
                    .arg(&alias),
            ));
        }

        let assignment_id = self.transact("createProperty", || {
            let property_id = self.next_id(IdSpace::Property)?;
            let property = self.insert_unique(new.auto_unique_name, &new.name, "ex.structure.property.exists", |name| {
                let property = Property::from_new(property_id, name, new);
                self.store.insert_property(&property).map(|_| property)
            })?;

            let id = self.next_id(IdSpace::Assignment)?;
            let mut assignment = Assignment::new(
                id,
                type_id,
                &t.name,
                &parent_path,
                &alias,
                parent_group,
                new.multiplicity,
                new.acl,
                AssignmentKind::Property {
                    property_id: property.id,
                    default_value: new.default_value.clone(),
                    default_language: None,
                },
            )?;
            assignment.default_multiplicity = new.multiplicity.default_count(new.default_multiplicity);
            assignment.label = new.label.clone();
            assignment.hint = new.hint.clone();
            assignment.set_system_internal(new.system_internal)?;
            assignment.position = position::valid_position(&env, type_id, parent_group, None);
            self.store.insert_assignment(&assignment).map_err(|e| {
                e.into_create(Message::new("ex.structure.assignment.exists").arg(&assignment.xpath))
            })?;

            self.record(
                HistoryEntry::new(caller.user_id(), "history.assignment.createProperty")
                    .arg(&property.name)
                    .arg(&assignment.xpath)
                    .for_type(type_id),
            );
            let inherited = self.propagate(id)?;
            log::info!(
                "created property {} at {} ({} inherited copies)",
                property.name,
                assignment.xpath,
                inherited
            );
            Ok(id)
        })?;
        Ok(assignment_id)
    }

    /// Create a group and attach it to `type_id` below `parent_xpath`.
    pub fn create_group(
        &self,
        caller: &dyn CallerIdentity,
        type_id: Id,
        new: &NewGroup,
        parent_xpath: &str,
        alias: Option<&str>,
    ) -> Result<Id> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let t = env.content_type(type_id)?;
        let (parent_group, parent_path) = resolve_parent(&env, type_id, parent_xpath)?;
        let alias = alias.unwrap_or(&new.name).to_uppercase();
        if !xpath::is_valid_alias(&new.name.to_uppercase()) || !xpath::is_valid_alias(&alias) {
            return Err(Error::invalid(
                Message::new("ex.structure.group.name.invalid")
                    .arg(&new.name)
                    .arg(&alias),
            ));
        }

        self.transact("createGroup", || {
            let group_id = self.next_id(IdSpace::Group)?;
            let group = self.insert_unique(new.auto_unique_name, &new.name, "ex.structure.group.exists", |name| {
                let group = Group::from_new(group_id, name, new);
                self.store.insert_group(&group).map(|_| group)
            })?;

            let id = self.next_id(IdSpace::Assignment)?;
            let mut assignment = Assignment::new(
                id,
                type_id,
                &t.name,
                &parent_path,
                &alias,
                parent_group,
                new.multiplicity,
                t.acl,
                AssignmentKind::Group {
                    group_id: group.id,
                    mode: new.mode,
                },
            )?;
            assignment.default_multiplicity = new.multiplicity.default_count(new.default_multiplicity);
            assignment.label = new.label.clone();
            assignment.hint = new.hint.clone();
            assignment.position = position::valid_position(&env, type_id, parent_group, None);
            self.store.insert_assignment(&assignment).map_err(|e| {
                e.into_create(Message::new("ex.structure.assignment.exists").arg(&assignment.xpath))
            })?;

            self.record(
                HistoryEntry::new(caller.user_id(), "history.assignment.createGroup")
                    .arg(&group.name)
                    .arg(&assignment.xpath)
                    .arg(new.mode)
                    .for_type(type_id),
            );
            let inherited = self.propagate(id)?;
            log::info!(
                "created group {} ({}) at {} ({} inherited copies)",
                group.name,
                new.mode,
                assignment.xpath,
                inherited
            );
            Ok(id)
        })
    }

    /// Create `assignment` if it has no persistent id yet, otherwise apply its changes.
    pub fn save_assignment(&self, caller: &dyn CallerIdentity, assignment: &Assignment) -> Result<Id> {
        if assignment.id == NEW_ID || self.environment().assignment(assignment.id).is_err() {
            return self.create_assignment(caller, assignment);
        }
        match assignment.kind {
            AssignmentKind::Property { .. } => self.update_property_assignment(caller, assignment)?,
            AssignmentKind::Group { .. } => self.update_group_assignment(caller, assignment)?,
        }
        Ok(assignment.id)
    }

    /// Attach an existing property or group to a type.
    ///
    /// When `base` points at a group assignment, its sub-assignments are copied
    /// below the new one as inherited assignments.
    fn create_assignment(&self, caller: &dyn CallerIdentity, new: &Assignment) -> Result<Id> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        if new.is_system_internal() {
            require_supervisor(caller, &new.alias)?;
        }
        let env = self.environment();
        let t = env.content_type(new.type_id)?;
        let parent_path = match new.parent_group {
            Some(group) => {
                let parent = env.assignment(group)?;
                if !parent.is_group() || parent.type_id != new.type_id {
                    return Err(Error::invalid(
                        Message::new("ex.structure.assignment.noGroup").arg(&parent.xpath),
                    ));
                }
                parent.relative_xpath()
            }
            None => "/".to_string(),
        };
        match new.kind {
            AssignmentKind::Property { property_id, .. } => {
                let property = env.property(property_id)?;
                check_multiplicity_override(property.may_override_multiplicity, &property.multiplicity, new)?;
                check_option_overrides(&property.options, &new.options, &new.alias)?;
                if !property.may_override_acl && new.acl != property.acl {
                    return Err(Error::update(
                        Message::new("ex.structure.assignment.overrideNotAllowed.acl").arg(&new.alias),
                    ));
                }
            }
            AssignmentKind::Group { group_id, .. } => {
                let group = env.group(group_id)?;
                check_multiplicity_override(group.may_override_multiplicity, &group.multiplicity, new)?;
                check_option_overrides(&group.options, &new.options, &new.alias)?;
            }
        }
        let base = match new.base {
            Some(base) => Some(env.assignment(base)?),
            None => None,
        };

        self.transact("createAssignment", || {
            let id = self.next_id(IdSpace::Assignment)?;
            let mut row = new.clone();
            row.id = id;
            row.alias = new.alias.to_uppercase();
            row.xpath = format!("{}{}", t.name, xpath::child_of(&parent_path, &row.alias)?);
            row.position = position::valid_position(&env, t.id, new.parent_group, Some(new.position));
            self.store.insert_assignment(&row).map_err(|e| {
                e.into_create(Message::new("ex.structure.assignment.exists").arg(&row.xpath))
            })?;
            if let Some(base) = base.filter(|b| b.is_group()) {
                for sub in env.sub_assignments(base.id, true) {
                    self.derive_subtree(&env, sub, t, Some(id), true)?;
                }
            }
            self.record(
                HistoryEntry::new(caller.user_id(), "history.assignment.create")
                    .arg(&row.xpath)
                    .for_type(t.id),
            );
            let inherited = self.propagate(id)?;
            log::info!("created assignment {} ({} inherited copies)", row.xpath, inherited);
            Ok(id)
        })
    }

    /// Fail when stored instance data of `ids` violates the narrower `new` bound.
    fn check_narrowing(&self, ids: &[Id], old: &Multiplicity, new: &Multiplicity, what: &str) -> Result<()> {
        if !is_narrowing(old, new) {
            return Ok(());
        }
        let bounds = self.store.occurrence_bounds(ids).map_err(|e| {
            e.into_update(Message::new("ex.structure.modification.contentCheck").arg(what))
        })?;
        let Some(bounds) = bounds else {
            return Ok(());
        };
        if bounds.min < new.min {
            return Err(Error::update(
                Message::new("ex.structure.modification.contentExists.minMultiplicity")
                    .arg(what)
                    .arg(new.min)
                    .arg(bounds.min),
            ));
        }
        if let Some(max) = new.max {
            if bounds.max > max {
                return Err(Error::update(
                    Message::new("ex.structure.modification.contentExists.maxMultiplicity")
                        .arg(what)
                        .arg(max)
                        .arg(bounds.max),
                ));
            }
        }
        Ok(())
    }

    fn has_instance_data(&self, ids: &[Id]) -> Result<bool> {
        let bounds = self
            .store
            .occurrence_bounds(ids)
            .map_err(|e| e.into_update(Message::new("ex.structure.modification.contentCheck")))?;
        Ok(bounds.map_or(false, |b| b.max > 0))
    }

    /// Drop the instance data of an assignment subtree and flag its rows disabled.
    fn disable_subtree(&self, env: &Environment, assignment: &Assignment) -> Result<()> {
        let mut ids = vec![assignment.id];
        ids.extend(env.all_sub_assignments(assignment.id).iter().map(|a| a.id));
        let binaries = self.store.remove_assignment_data(&ids).map_err(|e| {
            e.into_update(Message::new("ex.structure.assignment.disable").arg(&assignment.xpath))
        })?;
        if !binaries.is_empty() {
            self.store.remove_binaries(&binaries).map_err(|e| {
                e.into_update(Message::new("ex.structure.assignment.disable").arg(&assignment.xpath))
            })?;
        }
        self.set_enabled(env, &ids, false)
    }

    fn set_enabled(&self, env: &Environment, ids: &[Id], enabled: bool) -> Result<()> {
        for id in ids {
            let mut row = env.assignment(*id)?.clone();
            row.enabled = enabled;
            self.store.update_assignment(&row).map_err(|e| {
                e.into_update(Message::new("ex.structure.assignment.update").arg(&row.xpath))
            })?;
        }
        Ok(())
    }

    /// Checks and changes shared by property and group assignments.
    fn common_assignment_checks(
        &self,
        caller: &dyn CallerIdentity,
        original: &Assignment,
        updated: &Assignment,
        changes: &mut Vec<FieldChange>,
    ) -> Result<()> {
        if updated.type_id != original.type_id {
            return Err(not_supported("type", &original.xpath));
        }
        if updated.parent_group != original.parent_group {
            return Err(not_supported("parentGroupAssignment", &original.xpath));
        }
        if updated.base != original.base {
            return Err(not_supported("baseAssignment", &original.xpath));
        }
        if updated.is_system_internal() != original.is_system_internal() {
            if original.is_system_internal() {
                return Err(Error::update(
                    Message::new("ex.structure.systemInternal.unset").arg(&original.xpath),
                ));
            }
            require_supervisor(caller, &original.xpath)?;
            diff(changes, "systemInternal", &false, &true);
        }
        diff(changes, "enabled", &original.enabled, &updated.enabled);
        diff(changes, "multiplicity", &original.multiplicity, &updated.multiplicity);
        diff(
            changes,
            "defaultMultiplicity",
            &original.default_multiplicity,
            &updated.default_multiplicity,
        );
        diff(changes, "position", &original.position, &updated.position);
        diff(changes, "acl", &original.acl, &updated.acl);
        diff(changes, "label", &original.label, &updated.label);
        diff(changes, "hint", &original.hint, &updated.hint);
        diff(changes, "options", &original.options, &updated.options);
        Ok(())
    }

    /// Write `row` plus the enable/disable and position side effects.
    fn write_assignment_update(
        &self,
        env: &Environment,
        original: &Assignment,
        row: &Assignment,
    ) -> Result<()> {
        match (original.enabled, row.enabled) {
            (true, false) => self.disable_subtree(env, original)?,
            (false, true) => {
                let subs: Vec<Id> = env.all_sub_assignments(original.id).iter().map(|a| a.id).collect();
                self.set_enabled(env, &subs, true)?;
            }
            _ => {}
        }
        let mut stored = row.clone();
        stored.position = original.position;
        self.store.update_assignment(&stored).map_err(|e| {
            e.into_update(Message::new("ex.structure.assignment.update").arg(&row.xpath))
        })?;
        if row.position != original.position {
            let working = self.working_environment()?;
            let assigned = position::set_assignment_position(
                self.store.as_ref(),
                &working,
                row.id,
                row.position,
                self.config.position_sparse_base,
            )?;
            if assigned != row.position {
                log::debug!("{} requested position {}, got {}", row.xpath, row.position, assigned);
            }
        }
        Ok(())
    }

    fn record_changes(&self, caller: &dyn CallerIdentity, key: &str, what: &str, type_id: Option<Id>, changes: &[FieldChange]) {
        for (field, old, new) in changes {
            let mut entry = HistoryEntry::new(caller.user_id(), key)
                .arg(what)
                .arg(field)
                .arg(old)
                .arg(new);
            if let Some(type_id) = type_id {
                entry = entry.for_type(type_id);
            }
            self.record(entry);
        }
    }

    /// Apply the mutable field changes of a property assignment.
    pub fn update_property_assignment(&self, caller: &dyn CallerIdentity, updated: &Assignment) -> Result<()> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let original = env.assignment(updated.id)?;
        let (
            AssignmentKind::Property { property_id, default_value, default_language },
            AssignmentKind::Property {
                property_id: new_property,
                default_value: new_default,
                default_language: new_language,
            },
        ) = (&original.kind, &updated.kind)
        else {
            return Err(Error::invalid(
                Message::new("ex.structure.assignment.notProperty").arg(&original.xpath),
            ));
        };
        if property_id != new_property {
            return Err(not_supported("property", &original.xpath));
        }
        if updated.alias != original.alias || updated.xpath != original.xpath {
            return Err(not_supported("alias", &original.xpath));
        }
        let property = env.property(*property_id)?;

        let mut changes = Vec::new();
        self.common_assignment_checks(caller, original, updated, &mut changes)?;
        diff(&mut changes, "defaultValue", default_value, new_default);
        diff(&mut changes, "defaultLanguage", default_language, new_language);
        if changes.is_empty() {
            return Ok(());
        }
        check_multiplicity_override(property.may_override_multiplicity, &property.multiplicity, updated)?;
        check_option_overrides(&property.options, &updated.options, &updated.xpath)?;
        if updated.acl != original.acl && !property.may_override_acl {
            return Err(Error::update(
                Message::new("ex.structure.assignment.overrideNotAllowed.acl").arg(&updated.xpath),
            ));
        }
        self.check_narrowing(&[original.id], &original.multiplicity, &updated.multiplicity, &original.xpath)?;

        self.transact("updatePropertyAssignment", || {
            self.write_assignment_update(&env, original, updated)
        })?;
        self.record_changes(caller, "history.assignment.update", &original.xpath, Some(original.type_id), &changes);
        log::info!("updated {} ({} fields)", original.xpath, changes.len());
        Ok(())
    }

    /// Apply the mutable field changes of a group assignment, including an alias rename.
    pub fn update_group_assignment(&self, caller: &dyn CallerIdentity, updated: &Assignment) -> Result<()> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let original = env.assignment(updated.id)?;
        let (
            AssignmentKind::Group { group_id, mode },
            AssignmentKind::Group {
                group_id: new_group,
                mode: new_mode,
            },
        ) = (&original.kind, &updated.kind)
        else {
            return Err(Error::invalid(
                Message::new("ex.structure.assignment.notGroup").arg(&original.xpath),
            ));
        };
        if group_id != new_group {
            return Err(not_supported("group", &original.xpath));
        }
        let group = env.group(*group_id)?;

        let mut changes = Vec::new();
        self.common_assignment_checks(caller, original, updated, &mut changes)?;
        diff(&mut changes, "mode", mode, new_mode);

        let alias = updated.alias.to_uppercase();
        let renamed = alias != original.alias;
        if !renamed && updated.xpath != original.xpath {
            return Err(not_supported("xpath", &original.xpath));
        }
        let mut row = updated.clone();
        let descendants = env.all_sub_assignments(original.id);
        if renamed {
            if !xpath::is_valid_alias(&alias) {
                return Err(Error::invalid(Message::new("ex.structure.assignment.alias.invalid").arg(&alias)));
            }
            let parent_path = xpath::strip_last_element(&original.relative_xpath())?;
            let new_path = xpath::child_of(&parent_path, &alias)?;
            if env.assignment_by_xpath(original.type_id, &new_path).is_ok() {
                return Err(Error::EntryExists(
                    Message::new("ex.structure.assignment.exists").arg(&new_path),
                ));
            }
            let t = env.content_type(original.type_id)?;
            row.alias = alias.clone();
            row.xpath = format!("{}{}", t.name, new_path);
            diff(&mut changes, "alias", &original.alias, &row.alias);
        }
        if changes.is_empty() {
            return Ok(());
        }

        check_multiplicity_override(group.may_override_multiplicity, &group.multiplicity, &row)?;
        check_option_overrides(&group.options, &row.options, &row.xpath)?;
        self.check_narrowing(&[original.id], &original.multiplicity, &row.multiplicity, &original.xpath)?;
        if *mode == GroupMode::AnyOf && *new_mode == GroupMode::OneOf {
            let ids: Vec<Id> = descendants.iter().map(|a| a.id).collect();
            if !ids.is_empty() && self.has_instance_data(&ids)? {
                return Err(Error::update(
                    Message::new("ex.structure.assignment.group.mode.contentExists").arg(&original.xpath),
                ));
            }
        }

        self.transact("updateGroupAssignment", || {
            if renamed {
                for sub in &descendants {
                    let mut moved = (*sub).clone();
                    moved.xpath = format!("{}{}", row.xpath, &sub.xpath[original.xpath.len()..]);
                    self.store.update_assignment(&moved).map_err(|e| {
                        e.into_update(Message::new("ex.structure.assignment.update").arg(&sub.xpath))
                    })?;
                }
                let touched = self.store.update_xpath(&original.xpath, &row.xpath).map_err(|e| {
                    e.into_update(Message::new("ex.structure.assignment.xpath.update").arg(&original.xpath))
                })?;
                log::debug!("renamed {} to {} in {} instance nodes", original.xpath, row.xpath, touched);
            }
            self.write_assignment_update(&env, original, &row)
        })?;
        self.record_changes(caller, "history.assignment.update", &original.xpath, Some(original.type_id), &changes);
        log::info!("updated {} ({} fields)", original.xpath, changes.len());
        Ok(())
    }

    /// Apply the mutable field changes of a property.
    pub fn update_property(&self, caller: &dyn CallerIdentity, updated: &Property) -> Result<()> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let original = env.property(updated.id)?;
        if !updated.name.eq_ignore_ascii_case(&original.name) {
            return Err(not_supported("name", &original.name));
        }
        if updated.data_type != original.data_type {
            return Err(not_supported("dataType", &original.name));
        }
        let assignments = env.property_assignments(original.id);
        let ids: Vec<Id> = assignments.iter().map(|a| a.id).collect();

        let mut changes = Vec::new();
        if updated.system_internal != original.system_internal {
            if original.system_internal {
                return Err(Error::update(
                    Message::new("ex.structure.systemInternal.unset").arg(&original.name),
                ));
            }
            require_supervisor(caller, &original.name)?;
            diff(&mut changes, "systemInternal", &false, &true);
        }
        if updated.multilingual != original.multilingual {
            if self.has_instance_data(&ids)? {
                return Err(Error::update(
                    Message::new("ex.structure.property.multilang.contentExists").arg(&original.name),
                ));
            }
            diff(&mut changes, "multilingual", &original.multilingual, &updated.multilingual);
        }
        diff(&mut changes, "multiplicity", &original.multiplicity, &updated.multiplicity);
        diff(
            &mut changes,
            "mayOverrideMultiplicity",
            &original.may_override_multiplicity,
            &updated.may_override_multiplicity,
        );
        diff(&mut changes, "acl", &original.acl, &updated.acl);
        diff(&mut changes, "mayOverrideAcl", &original.may_override_acl, &updated.may_override_acl);
        diff(&mut changes, "fulltext", &original.fulltext, &updated.fulltext);
        diff(&mut changes, "referencedType", &original.referenced_type, &updated.referenced_type);
        diff(&mut changes, "referencedList", &original.referenced_list, &updated.referenced_list);
        diff(&mut changes, "uniqueMode", &original.unique_mode, &updated.unique_mode);
        diff(&mut changes, "label", &original.label, &updated.label);
        diff(&mut changes, "hint", &original.hint, &updated.hint);
        diff(&mut changes, "defaultValue", &original.default_value, &updated.default_value);
        diff(&mut changes, "options", &original.options, &updated.options);
        if changes.is_empty() {
            return Ok(());
        }

        if !updated.may_override_multiplicity {
            if let Some(a) = assignments.iter().find(|a| !a.multiplicity.is_within(&updated.multiplicity)) {
                return Err(Error::update(
                    Message::new("ex.structure.property.override.inUse")
                        .arg(&original.name)
                        .arg(&a.xpath),
                ));
            }
            let old = if original.may_override_multiplicity {
                Multiplicity::ZERO_OR_MORE
            } else {
                original.multiplicity
            };
            self.check_narrowing(&ids, &old, &updated.multiplicity, &original.name)?;
        }
        if !updated.may_override_acl {
            if let Some(a) = assignments.iter().find(|a| a.acl != updated.acl) {
                return Err(Error::update(
                    Message::new("ex.structure.property.acl.overridden")
                        .arg(&original.name)
                        .arg(&a.xpath),
                ));
            }
        }
        for a in &assignments {
            check_option_overrides(&updated.options, &a.options, &a.xpath).map_err(|_| {
                Error::update(
                    Message::new("ex.structure.property.option.overridden")
                        .arg(&original.name)
                        .arg(&a.xpath),
                )
            })?;
        }

        let mut row = updated.clone();
        row.name = original.name.clone();
        self.transact("updateProperty", || {
            self.store.update_property(&row).map_err(|e| {
                e.into_update(Message::new("ex.structure.property.update").arg(&row.name))
            })
        })?;
        self.record_changes(caller, "history.property.update", &original.name, None, &changes);
        log::info!("updated property {} ({} fields)", original.name, changes.len());
        Ok(())
    }

    /// Apply the mutable field changes of a group.
    pub fn update_group(&self, caller: &dyn CallerIdentity, updated: &Group) -> Result<()> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let original = env.group(updated.id)?;
        if !updated.name.eq_ignore_ascii_case(&original.name) {
            return Err(not_supported("name", &original.name));
        }
        let assignments = env.group_assignments(original.id);
        let ids: Vec<Id> = assignments.iter().map(|a| a.id).collect();

        let mut changes = Vec::new();
        diff(&mut changes, "multiplicity", &original.multiplicity, &updated.multiplicity);
        diff(
            &mut changes,
            "mayOverrideMultiplicity",
            &original.may_override_multiplicity,
            &updated.may_override_multiplicity,
        );
        diff(&mut changes, "label", &original.label, &updated.label);
        diff(&mut changes, "hint", &original.hint, &updated.hint);
        diff(&mut changes, "options", &original.options, &updated.options);
        if changes.is_empty() {
            return Ok(());
        }

        if !updated.may_override_multiplicity {
            if let Some(a) = assignments.iter().find(|a| !a.multiplicity.is_within(&updated.multiplicity)) {
                return Err(Error::update(
                    Message::new("ex.structure.group.override.inUse")
                        .arg(&original.name)
                        .arg(&a.xpath),
                ));
            }
            let old = if original.may_override_multiplicity {
                Multiplicity::ZERO_OR_MORE
            } else {
                original.multiplicity
            };
            self.check_narrowing(&ids, &old, &updated.multiplicity, &original.name)?;
        }
        for a in &assignments {
            check_option_overrides(&updated.options, &a.options, &a.xpath)?;
        }

        let mut row = updated.clone();
        row.name = original.name.clone();
        self.transact("updateGroup", || {
            self.store
                .update_group(&row)
                .map_err(|e| e.into_update(Message::new("ex.structure.group.update").arg(&row.name)))
        })?;
        self.record_changes(caller, "history.group.update", &original.name, None, &changes);
        log::info!("updated group {} ({} fields)", original.name, changes.len());
        Ok(())
    }

    /// Everything removing `roots` touches.
    fn collect_removal(&self, env: &Environment, roots: &[Id], options: RemoveOptions) -> Result<Removal> {
        let mut removal = Removal::default();
        let mut seen = BTreeSet::new();
        let mut work: Vec<Id> = roots.iter().rev().copied().collect();
        while let Some(id) = work.pop() {
            if !seen.insert(id) {
                continue;
            }
            let a = env.assignment(id)?;
            removal.delete.push(id);
            match a.kind {
                AssignmentKind::Property { property_id, .. } => {
                    removal.properties.insert(property_id);
                }
                AssignmentKind::Group { group_id, .. } => {
                    removal.groups.insert(group_id);
                    let subs = env.sub_assignments(id, true);
                    if !subs.is_empty() && !options.remove_sub_assignments {
                        return Err(Error::remove(
                            Message::new("ex.structure.assignment.delete.hasChildren").arg(&a.xpath),
                        ));
                    }
                    work.extend(subs.iter().map(|s| s.id));
                }
            }
            if options.remove_derived_assignments {
                work.extend(env.derived_assignments(id).iter().map(|d| d.id));
            }
        }
        if !options.remove_derived_assignments {
            for id in &removal.delete {
                for derived in env.derived_assignments(*id) {
                    if !seen.contains(&derived.id) {
                        removal.detach.push(derived.id);
                    }
                }
            }
        }
        Ok(removal)
    }

    /// DELETE on every removed property assignment and on every instance holding its data.
    fn check_removal_permissions(&self, caller: &dyn CallerIdentity, env: &Environment, ids: &[Id]) -> Result<()> {
        if caller.is_supervisor() || caller.is_running_as_system() {
            return Ok(());
        }
        for id in ids {
            let a = env.assignment(*id)?;
            if !a.is_property() || !env.content_type(a.type_id)?.permissions.uses_property() {
                continue;
            }
            if !caller.permission(a.acl).grants(Permission::Delete) {
                let name = env.acl_name(a.acl);
                return Err(Error::NoAccess {
                    message: Message::new("ex.acl.noAccess.property.delete").arg(&name).xpath(&a.xpath),
                    acls: vec![name],
                });
            }
        }
        let instances = self.store.affected_instances(ids).map_err(|e| {
            e.into_remove(Message::new("ex.structure.assignment.delete.instances"))
        })?;
        for instance in instances {
            let info = SecurityInfo::for_type(env, instance.type_id, Some(instance.step), Some(instance.acl))?;
            PermissionEvaluator::check(caller, Permission::Delete, &info, env)?;
        }
        Ok(())
    }

    /// Remove assignments, the data stored for them, and properties/groups left unreferenced.
    fn remove_batch(&self, caller: &dyn CallerIdentity, env: &Environment, roots: &[Id], options: RemoveOptions) -> Result<usize> {
        for id in roots {
            let a = env.assignment(*id)?;
            if a.is_system_internal() && !caller.is_running_as_system() {
                return Err(Error::remove(
                    Message::new("ex.structure.assignment.delete.systemInternal").arg(&a.xpath),
                ));
            }
            if a.is_derived() && !options.allow_derived_removal {
                return Err(Error::remove(
                    Message::new("ex.structure.assignment.delete.derived").arg(&a.xpath),
                ));
            }
        }
        let removal = self.collect_removal(env, roots, options)?;
        self.check_removal_permissions(caller, env, &removal.delete)?;

        self.transact("removeAssignment", || {
            for id in &removal.detach {
                let mut row = env.assignment(*id)?.clone();
                row.base = None;
                self.store.update_assignment(&row).map_err(|e| {
                    e.into_remove(Message::new("ex.structure.assignment.detach").arg(&row.xpath))
                })?;
                log::debug!("{} no longer inherits", row.xpath);
            }
            let binaries = self.store.remove_assignment_data(&removal.delete).map_err(|e| {
                e.into_remove(Message::new("ex.structure.assignment.delete.data"))
            })?;
            if !binaries.is_empty() {
                self.store.remove_binaries(&binaries).map_err(|e| {
                    e.into_remove(Message::new("ex.structure.assignment.delete.binaries"))
                })?;
            }
            self.delete_assignments(&removal.delete)?;
            self.collect_orphans(&removal.properties, &removal.groups)
        })?;

        for id in &removal.delete {
            if let Ok(a) = env.assignment(*id) {
                self.record(
                    HistoryEntry::new(caller.user_id(), "history.assignment.remove")
                        .arg(&a.xpath)
                        .for_type(a.type_id),
                );
            }
        }
        log::info!(
            "removed {} assignments, detached {}",
            removal.delete.len(),
            removal.detach.len()
        );
        Ok(removal.delete.len())
    }

    /// Remove one assignment; returns how many assignments were deleted in total.
    pub fn remove_assignment(&self, caller: &dyn CallerIdentity, id: Id, options: RemoveOptions) -> Result<usize> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        self.remove_batch(caller, &env, &[id], options)
    }

    /// Disable an assignment: its instance data goes, the rows stay flagged disabled.
    pub fn disable_assignment(&self, caller: &dyn CallerIdentity, id: Id) -> Result<()> {
        let mut row = self.environment().assignment(id)?.clone();
        row.enabled = false;
        self.save_assignment(caller, &row).map(|_| ())
    }

    pub fn enable_assignment(&self, caller: &dyn CallerIdentity, id: Id) -> Result<()> {
        let mut row = self.environment().assignment(id)?.clone();
        row.enabled = true;
        self.save_assignment(caller, &row).map(|_| ())
    }

    /// Remove every assignment of a property, then the property.
    pub fn remove_property(&self, caller: &dyn CallerIdentity, property_id: Id) -> Result<usize> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        let property = env.property(property_id)?;
        if property.system_internal && !caller.is_running_as_system() {
            return Err(Error::remove(
                Message::new("ex.structure.property.delete.systemInternal").arg(&property.name),
            ));
        }
        let roots: Vec<Id> = env
            .property_assignments(property_id)
            .iter()
            .map(|a| a.id)
            .collect();
        let removed = self.remove_batch(
            caller,
            &env,
            &roots,
            RemoveOptions {
                allow_derived_removal: true,
                ..RemoveOptions::default()
            },
        )?;
        if roots.is_empty() {
            self.transact("removeProperty", || {
                self.collect_orphans(&BTreeSet::from([property_id]), &BTreeSet::new())
            })?;
        }
        Ok(removed)
    }

    /// Remove every assignment of a group (with their subtrees), then the group.
    pub fn remove_group(&self, caller: &dyn CallerIdentity, group_id: Id) -> Result<usize> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        env.group(group_id)?;
        let roots: Vec<Id> = env.group_assignments(group_id).iter().map(|a| a.id).collect();
        let removed = self.remove_batch(
            caller,
            &env,
            &roots,
            RemoveOptions {
                allow_derived_removal: true,
                ..RemoveOptions::default()
            },
        )?;
        if roots.is_empty() {
            self.transact("removeGroup", || {
                self.collect_orphans(&BTreeSet::new(), &BTreeSet::from([group_id]))
            })?;
        }
        Ok(removed)
    }

    /// Move an assignment among its siblings; returns the position actually assigned.
    pub fn set_assignment_position(&self, caller: &dyn CallerIdentity, id: Id, desired: i32) -> Result<i32> {
        PermissionEvaluator::check_role(caller, Role::StructureManagement)?;
        let env = self.environment();
        env.assignment(id)?;
        self.transact("setAssignmentPosition", || {
            position::set_assignment_position(
                self.store.as_ref(),
                &env,
                id,
                desired,
                self.config.position_sparse_base,
            )
        })
    }
}
