//! Four-layer permission evaluation.
//!
//! Every enabled layer (type, step, instance, property) must grant the
//! requested permission; a disabled layer counts as granted. Supervisors and
//! callers running as system skip all checks.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Message, Result};
use crate::model::common::Id;
use crate::model::content::{system_alias, Content};
use crate::model::delta::{Delta, DeltaChangeType};
use crate::model::environment::Environment;
use crate::model::security::{CallerIdentity, Permission, PermissionMask, Role};
use crate::model::structure::{ContentType, TypeState};
use crate::model::value::ValueAccess;
use crate::model::xpath::XPathElement;

/// ACLs guarding one instance, grouped by layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub mask: PermissionMask,
    pub type_acl: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_acl: Option<Id>,
    #[serde(default)]
    pub instance_acls: Vec<Id>,
    #[serde(default)]
    pub property_acls: Vec<Id>,
}

impl SecurityInfo {
    /// Layer ACLs of a type without any instance yet (e.g. for CREATE).
    pub fn for_type(env: &Environment, type_id: Id, step: Option<Id>, instance_acl: Option<Id>) -> Result<Self> {
        let t = env.content_type(type_id)?;
        let step_acl = match step {
            Some(step) => Some(env.step(step)?.acl),
            None => None,
        };
        Ok(Self {
            mask: t.permissions,
            type_acl: t.acl,
            step_acl,
            instance_acls: instance_acl.into_iter().collect(),
            property_acls: Vec::new(),
        })
    }

    /// Layer ACLs of a content instance; property ACLs come from the assignments of its values.
    pub fn for_content(env: &Environment, content: &Content) -> Result<Self> {
        let mut info = Self::for_type(env, content.type_id, Some(content.step), Some(content.acl))?;

        let tree = content.data();
        let mut index = 1;
        while let Some(node) = tree.find_child(tree.root(), &XPathElement::new(system_alias::ACL, index, true))? {
            let acl = tree
                .node(node)?
                .value()
                .and_then(|v| v.default_translation())
                .and_then(serde_json::Value::as_i64);
            if let Some(acl) = acl {
                info.instance_acls.push(acl);
            }
            index += 1;
        }
        info.instance_acls = info.instance_acls.into_iter().unique().collect();

        if info.mask.uses_property() {
            let mut acls = Vec::new();
            for node in content.property_nodes()? {
                let n = tree.node(node)?;
                if n.system_internal {
                    continue;
                }
                acls.push(env.assignment(n.assignment_id)?.acl);
            }
            info.property_acls = acls.into_iter().unique().collect();
        }
        Ok(info)
    }
}

/// Secondary permissions a caller holds on an instance it may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    pub edit: bool,
    pub relate: bool,
    pub delete: bool,
    pub export: bool,
    pub create: bool,
}

pub struct PermissionEvaluator;

impl PermissionEvaluator {
    fn bypass(caller: &dyn CallerIdentity) -> bool {
        caller.is_supervisor() || caller.is_running_as_system()
    }

    /// AND over all enabled layers, plus every ACL that withheld the permission.
    fn evaluate(caller: &dyn CallerIdentity, permission: Permission, info: &SecurityInfo) -> (bool, Vec<Id>) {
        if Self::bypass(caller) {
            return (true, Vec::new());
        }
        let grants = |acl: Id| caller.permission(acl).grants(permission);
        let mut withheld = Vec::new();

        let type_ok = !info.mask.uses_type() || grants(info.type_acl);
        if !type_ok {
            withheld.push(info.type_acl);
        }

        let step_ok = match (info.mask.uses_step(), info.step_acl) {
            (false, _) => true,
            (true, Some(acl)) => grants(acl),
            (true, None) => false,
        };
        if !step_ok {
            withheld.extend(info.step_acl);
        }

        let instance_ok = !info.mask.uses_instance() || info.instance_acls.iter().any(|a| grants(*a));
        if !instance_ok {
            withheld.extend(info.instance_acls.iter().copied());
        }

        // only ACLs the caller is assigned to can withhold DELETE on the property layer
        let mut property_ok = true;
        if permission == Permission::Delete && info.mask.uses_property() {
            for acl in &info.property_acls {
                let assigned = caller.acl_assignments().iter().any(|a| a.acl_id == *acl);
                if assigned && !grants(*acl) {
                    property_ok = false;
                    withheld.push(*acl);
                }
            }
        }

        let granted = type_ok && step_ok && instance_ok && property_ok;
        (granted, withheld.into_iter().unique().collect())
    }

    pub fn is_granted(caller: &dyn CallerIdentity, permission: Permission, info: &SecurityInfo) -> bool {
        Self::evaluate(caller, permission, info).0
    }

    /// Fail with `NoAccess` naming every ACL that withheld `permission`.
    pub fn check(
        caller: &dyn CallerIdentity,
        permission: Permission,
        info: &SecurityInfo,
        env: &Environment,
    ) -> Result<()> {
        let (granted, withheld) = Self::evaluate(caller, permission, info);
        if granted {
            return Ok(());
        }
        let acls: Vec<String> = withheld.iter().map(|acl| env.acl_name(*acl)).collect();
        log::debug!(
            "user {} denied {} (layers {}), withheld by {:?}",
            caller.user_id(),
            permission,
            info.mask,
            acls
        );
        let message = acls.iter().fold(
            Message::new(format!("ex.acl.noAccess.extended.{}", acls.len())).arg(permission),
            |message, acl| message.arg(acl),
        );
        Err(Error::NoAccess { message, acls })
    }

    /// Requires READ, then reports the remaining permissions without failing.
    pub fn permission_set(
        caller: &dyn CallerIdentity,
        info: &SecurityInfo,
        env: &Environment,
    ) -> Result<PermissionSet> {
        Self::check(caller, Permission::Read, info, env)?;
        Ok(PermissionSet {
            edit: Self::is_granted(caller, Permission::Edit, info),
            relate: Self::is_granted(caller, Permission::Relate, info),
            delete: Self::is_granted(caller, Permission::Delete, info),
            export: Self::is_granted(caller, Permission::Export, info),
            create: Self::is_granted(caller, Permission::Create, info),
        })
    }

    /// Replace unreadable values by placeholders and freeze values the caller may not edit.
    pub fn wrap_no_access_values(caller: &dyn CallerIdentity, env: &Environment, content: &mut Content) -> Result<()> {
        if Self::bypass(caller) || !env.content_type(content.type_id)?.permissions.uses_property() {
            return Ok(());
        }
        for node in content.property_nodes()? {
            let n = content.node(node)?;
            if n.system_internal {
                continue;
            }
            let bits = caller.permission(env.assignment(n.assignment_id)?.acl);
            let value = content.value_mut(node)?;
            if !bits.grants(Permission::Read) {
                *value = value.no_access_placeholder();
            } else if !bits.grants(Permission::Edit) {
                value.access = ValueAccess::ReadOnly;
            }
        }
        Ok(())
    }

    /// Put the stored values back in place of placeholders before saving.
    pub fn unwrap_no_access_values(content: &mut Content, stored: &Content) -> Result<()> {
        for node in content.property_nodes()? {
            let access = match content.node(node)?.value() {
                Some(value) => value.access,
                None => continue,
            };
            match access {
                ValueAccess::Full => {}
                ValueAccess::ReadOnly => content.value_mut(node)?.access = ValueAccess::Full,
                ValueAccess::NoAccess => {
                    let path = content.xpath_full(node)?;
                    let original = stored.value(&path).map_err(|e| {
                        Error::no_access(
                            Message::new("ex.content.value.noAccess.unwrap")
                                .arg(&path)
                                .arg(e.key())
                                .xpath(&path),
                        )
                    })?;
                    *content.value_mut(node)? = original.clone();
                }
            }
        }
        Ok(())
    }

    /// Property-layer check of the EDIT/CREATE/DELETE rights a delta needs.
    pub fn check_property_permissions(
        caller: &dyn CallerIdentity,
        env: &Environment,
        type_id: Id,
        delta: &Delta,
    ) -> Result<()> {
        if Self::bypass(caller) || !env.content_type(type_id)?.permissions.uses_property() {
            return Ok(());
        }
        for change in delta.all_changes() {
            if !change.is_property() || change.is_internal() {
                continue;
            }
            let permission = match change.change_type {
                DeltaChangeType::Add => Permission::Create,
                DeltaChangeType::Remove => Permission::Delete,
                DeltaChangeType::Update if change.data_change => Permission::Edit,
                DeltaChangeType::Update => continue,
            };
            let Some(assignment_id) = change.assignment_id() else {
                continue;
            };
            let acl = env.assignment(assignment_id)?.acl;
            if !caller.permission(acl).grants(permission) {
                let name = env.acl_name(acl);
                return Err(Error::NoAccess {
                    message: Message::new(format!(
                        "ex.acl.noAccess.property.{}",
                        permission.to_string().to_lowercase()
                    ))
                    .arg(&name)
                    .xpath(&change.xpath),
                    acls: vec![name],
                });
            }
        }
        Ok(())
    }

    pub fn check_role(caller: &dyn CallerIdentity, role: Role) -> Result<()> {
        if Self::bypass(caller) || caller.is_in_role(role) {
            return Ok(());
        }
        Err(Error::no_access(
            Message::new("ex.acl.role.missing")
                .arg(format!("{:?}", role))
                .arg(caller.user_id()),
        ))
    }

    pub fn check_type_available(t: &ContentType, allow_locked: bool) -> Result<()> {
        match t.state {
            TypeState::Available => Ok(()),
            TypeState::Locked if allow_locked => Ok(()),
            TypeState::Locked => Err(Error::no_access(
                Message::new("ex.structure.type.locked").arg(&t.name),
            )),
            TypeState::Unavailable => Err(Error::not_found(
                Message::new("ex.structure.type.unavailable").arg(&t.name),
            )),
        }
    }
}
