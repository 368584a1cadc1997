use std::collections::HashMap;

use crate::error::Result;
use crate::model::content::Content;
use crate::model::data::NodeId;
use crate::model::delta::{DataSnapshot, Delta, DeltaChange};

/// Marker appended to group XPaths so groups and properties never collide.
pub const GROUP_POSTFIX: &str = "/";

/// Computes update/add/remove sets between two content instances
pub struct DeltaEngine;

impl DeltaEngine {
    /// Diff `original` against `compare`; both are expected to be compacted.
    pub fn process(original: &Content, compare: &Content) -> Result<Delta> {
        let from = Self::indexed(original)?;
        let to = Self::indexed(compare)?;

        let from_ids: HashMap<&str, NodeId> = from.iter().map(|(p, id)| (p.as_str(), *id)).collect();
        let to_ids: HashMap<&str, NodeId> = to.iter().map(|(p, id)| (p.as_str(), *id)).collect();

        let mut updates = Vec::new();
        let mut removes = Vec::new();
        for (path, id) in &from {
            let before = DataSnapshot::of(original.node(*id)?);
            match to_ids.get(path.as_str()) {
                Some(other) => {
                    let after = DataSnapshot::of(compare.node(*other)?);
                    if let Some(change) = DeltaChange::update(path, before, after) {
                        updates.push(change);
                    }
                }
                None => removes.push(DeltaChange::remove(path, before)),
            }
        }

        let mut adds = Vec::new();
        for (path, id) in &to {
            if !from_ids.contains_key(path.as_str()) {
                adds.push(DeltaChange::add(path, DataSnapshot::of(compare.node(*id)?)));
            }
        }

        let delta = Delta::new(updates, adds, removes);
        log::trace!(
            "delta {} -> {}: {} updates, {} adds, {} removes",
            original.pk,
            compare.pk,
            delta.updates.len(),
            delta.adds.len(),
            delta.removes.len()
        );
        Ok(delta)
    }

    /// Every node's XPath in document order, group paths postfixed.
    fn indexed(content: &Content) -> Result<Vec<(String, NodeId)>> {
        let tree = content.data();
        let mut out = Vec::new();
        for id in tree.descendants(tree.root())? {
            let mut path = tree.xpath_full(id)?;
            if tree.node(id)?.is_group() {
                path.push_str(GROUP_POSTFIX);
            }
            out.push((path, id));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DataType, DeltaChangeType, Id, Multiplicity, NewContentType, NewGroup, NewProperty, UserContext,
    };
    use crate::repository::Repository;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn note() -> (Repository<MemoryStore>, Content) {
        let repo = Repository::in_memory().unwrap();
        let system = UserContext::system();
        let ids = *repo.system();
        let type_id: Id = repo
            .structure
            .create_type(&system, &NewContentType::new("NOTE", ids.structure_acl, ids.workflow))
            .unwrap();
        let text = |name: &str| {
            NewProperty::new(name, DataType::String, Multiplicity::ZERO_OR_ONE, ids.structure_acl)
        };
        repo.structure
            .create_property(&system, type_id, &text("TEXT"), "/", None)
            .unwrap();
        repo.structure
            .create_group(&system, type_id, &NewGroup::new("TAG", Multiplicity::ZERO_OR_MORE), "/", None)
            .unwrap();
        repo.structure
            .create_property(&system, type_id, &text("LABEL"), "/TAG", None)
            .unwrap();
        let env = repo.environment();
        let content = Content::initialize(&env, type_id, 1, ids.instance_acl, ids.default_step, 1, 3).unwrap();
        (repo, content)
    }

    #[test]
    fn test_identical_contents_have_no_changes() {
        let (_repo, content) = note();
        let delta = DeltaEngine::process(&content, &content.clone()).unwrap();
        assert!(!delta.changes());
        assert!(delta.updates.is_empty());
    }

    #[test]
    fn test_value_change_is_a_data_update() {
        let (repo, original) = note();
        let mut changed = original.clone();
        changed.set_json(&repo.environment(), "/TEXT", json!("hello")).unwrap();

        let delta = DeltaEngine::process(&original, &changed).unwrap();
        assert!(delta.changes());
        assert!(delta.adds.is_empty() && delta.removes.is_empty());
        assert_eq!(delta.updates.len(), 1);
        let update = &delta.updates[0];
        assert_eq!(update.change_type, DeltaChangeType::Update);
        assert!(update.data_change);
        assert!(!update.position_change);
        assert!(update.is_property());
    }

    #[test]
    fn test_new_occurrence_is_an_add_and_mirrors_as_remove() {
        let (repo, original) = note();
        let mut grown = original.clone();
        grown.create_xpath(&repo.environment(), "/TAG[2]/LABEL").unwrap();

        let delta = DeltaEngine::process(&original, &grown).unwrap();
        assert!(delta.removes.is_empty());
        assert!(delta.adds.iter().all(|c| c.change_type == DeltaChangeType::Add));
        assert!(delta.adds.iter().any(|c| c.xpath == format!("/TAG[2]{}", GROUP_POSTFIX)));

        let back = DeltaEngine::process(&grown, &original).unwrap();
        assert!(back.adds.is_empty());
        assert_eq!(back.removes.len(), delta.adds.len());
    }
}
