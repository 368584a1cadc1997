use std::sync::Arc;

use crate::error::{Message, Result};
use crate::model::content::system_alias::*;
use crate::model::{
    Acl, AclCategory, Assignment, AssignmentKind, ContentType, DataType, Environment, Id, IdSpace,
    Label, Multiplicity, NewContentType, NewProperty, PermissionMask, Property, Step, TypeCategory,
    ROOT_TYPE_ID, ROOT_TYPE_NAME, SYSTEM_USER_ID,
};
use crate::store::environment_cache::EnvironmentCache;
use crate::store::traits::{in_transaction, Store};

/// Ids of the built-in security and workflow entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemIds {
    pub structure_acl: Id,
    pub instance_acl: Id,
    pub workflow_acl: Id,
    pub workflow: Id,
    pub default_step: Id,
}

pub const DEFAULT_WORKFLOW: Id = 1;

/// The system-internal root properties in their fixed order.
const SYSTEM_PROPERTIES: [(&str, DataType, Multiplicity); 20] = [
    (ID, DataType::LargeNumber, Multiplicity::ONE),
    (VERSION, DataType::Number, Multiplicity::ONE),
    (TYPEDEF, DataType::Number, Multiplicity::ONE),
    (MANDATOR, DataType::Number, Multiplicity::ONE),
    (ACL, DataType::Number, Multiplicity::ONE_OR_MORE),
    (STEP, DataType::Number, Multiplicity::ONE),
    (MAX_VER, DataType::Number, Multiplicity::ZERO_OR_ONE),
    (LIVE_VER, DataType::Number, Multiplicity::ZERO_OR_ONE),
    (ISMAX_VER, DataType::Boolean, Multiplicity::ZERO_OR_ONE),
    (ISLIVE_VER, DataType::Boolean, Multiplicity::ZERO_OR_ONE),
    (ISACTIVE, DataType::Boolean, Multiplicity::ONE),
    (MAINLANG, DataType::Number, Multiplicity::ONE),
    (CREATED_BY, DataType::Number, Multiplicity::ONE),
    (CREATED_AT, DataType::DateTime, Multiplicity::ONE),
    (MODIFIED_BY, DataType::Number, Multiplicity::ONE),
    (MODIFIED_AT, DataType::DateTime, Multiplicity::ONE),
    (RELSRC, DataType::Reference, Multiplicity::ZERO_OR_ONE),
    (RELDST, DataType::Reference, Multiplicity::ZERO_OR_ONE),
    (RELPOS_SRC, DataType::Number, Multiplicity::ZERO_OR_ONE),
    (RELPOS_DST, DataType::Number, Multiplicity::ZERO_OR_ONE),
];

/// Install the system structure into an empty store and publish it.
pub fn load_seed_data<S: Store>(store: &S, cache: &EnvironmentCache) -> Result<(SystemIds, Arc<Environment>)> {
    let ids = in_transaction(store, || {
        let ids = create_security(store)?;
        create_root_type(store, &ids)?;
        Ok(ids)
    })?;
    let env = cache.reload(store)?;
    log::info!(
        "system structure installed ({} system properties on {})",
        env.system_internal_root_count(),
        ROOT_TYPE_NAME
    );
    Ok((ids, env))
}

fn next_id<S: Store>(store: &S, space: IdSpace) -> Result<Id> {
    store
        .next_id(space)
        .map_err(|e| e.into_create(Message::new("ex.db.sequence").arg(format!("{:?}", space))))
}

fn create_acl<S: Store>(store: &S, name: &str, category: AclCategory) -> Result<Id> {
    let acl = Acl {
        id: next_id(store, IdSpace::Acl)?,
        name: name.to_string(),
        category,
        label: Label::new(name),
    };
    store
        .insert_acl(&acl)
        .map_err(|e| e.into_create(Message::new("ex.acl.create").arg(name)))?;
    Ok(acl.id)
}

fn create_security<S: Store>(store: &S) -> Result<SystemIds> {
    let structure_acl = create_acl(store, "Default Structure ACL", AclCategory::Structure)?;
    let instance_acl = create_acl(store, "Default Instance ACL", AclCategory::Instance)?;
    let workflow_acl = create_acl(store, "Default Workflow ACL", AclCategory::Workflow)?;

    let step = Step {
        id: 1,
        name: "EDIT".to_string(),
        workflow: DEFAULT_WORKFLOW,
        acl: workflow_acl,
    };
    store
        .insert_step(&step)
        .map_err(|e| e.into_create(Message::new("ex.workflow.step.create").arg(&step.name)))?;

    Ok(SystemIds {
        structure_acl,
        instance_acl,
        workflow_acl,
        workflow: DEFAULT_WORKFLOW,
        default_step: step.id,
    })
}

fn create_root_type<S: Store>(store: &S, ids: &SystemIds) -> Result<()> {
    let mut new = NewContentType::new(ROOT_TYPE_NAME, ids.structure_acl, ids.workflow);
    new.category = TypeCategory::System;
    new.permissions = PermissionMask::NONE;
    let root = ContentType::from_new(ROOT_TYPE_ID, &new, SYSTEM_USER_ID);
    store
        .insert_type(&root)
        .map_err(|e| e.into_create(Message::new("ex.structure.type.exists").arg(&root.name)))?;

    for (position, (alias, data_type, multiplicity)) in SYSTEM_PROPERTIES.iter().enumerate() {
        let mut property = NewProperty::new(alias, *data_type, *multiplicity, ids.structure_acl);
        property.system_internal = true;
        property.may_override_multiplicity = false;
        property.may_override_acl = false;
        let property = Property::from_new(next_id(store, IdSpace::Property)?, alias, &property);
        store
            .insert_property(&property)
            .map_err(|e| e.into_create(Message::new("ex.structure.property.exists").arg(alias)))?;

        let mut assignment = Assignment::new(
            next_id(store, IdSpace::Assignment)?,
            ROOT_TYPE_ID,
            ROOT_TYPE_NAME,
            "/",
            alias,
            None,
            *multiplicity,
            ids.structure_acl,
            AssignmentKind::Property {
                property_id: property.id,
                default_value: None,
                default_language: None,
            },
        )?;
        assignment.position = position as i32;
        assignment.set_system_internal(true)?;
        store.insert_assignment(&assignment).map_err(|e| {
            e.into_create(Message::new("ex.structure.assignment.exists").arg(&assignment.xpath))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn test_seed_installs_root_with_system_properties() {
        let store = MemoryStore::new();
        let cache = EnvironmentCache::new();
        let (ids, env) = load_seed_data(&store, &cache).unwrap();

        let root = env.content_type(ROOT_TYPE_ID).unwrap();
        assert_eq!(root.name, ROOT_TYPE_NAME);
        assert_eq!(env.system_internal_root_count(), 20);

        let positions: Vec<i32> = env
            .root_assignments(ROOT_TYPE_ID, true)
            .iter()
            .map(|a| a.position)
            .collect();
        assert_eq!(positions, (0..20).collect::<Vec<_>>());

        let acl = env.assignment_by_xpath(ROOT_TYPE_ID, "/ACL").unwrap();
        assert_eq!(acl.multiplicity, Multiplicity::ONE_OR_MORE);
        assert!(env.property_by_name("CREATED_AT").unwrap().system_internal);
        assert_eq!(env.step(ids.default_step).unwrap().workflow, DEFAULT_WORKFLOW);
        assert_eq!(env.acl(ids.instance_acl).unwrap().category, AclCategory::Instance);
    }

    #[test]
    fn test_seeding_twice_fails() {
        let store = MemoryStore::new();
        let cache = EnvironmentCache::new();
        load_seed_data(&store, &cache).unwrap();
        assert!(load_seed_data(&store, &cache).is_err());
        // the failed attempt rolled back, the first seed stays published
        assert_eq!(cache.snapshot().system_internal_root_count(), 20);
    }
}
