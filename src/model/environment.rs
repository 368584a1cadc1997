//! Compiled, immutable view of the whole schema.
//!
//! An `Environment` is built from the raw structure rows of the store and
//! never mutated afterwards; structural writes publish a new one.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Message, Result};
use crate::model::common::Id;
use crate::model::security::{Acl, Step};
use crate::model::structure::{Assignment, ContentType, Group, Property};
use crate::model::xpath;

/// Id of the built-in type every other root type copies its system properties from.
pub const ROOT_TYPE_ID: Id = 0;
pub const ROOT_TYPE_NAME: &str = "ROOT";

/// Raw structure rows as kept by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureRows {
    pub types: BTreeMap<Id, ContentType>,
    pub properties: BTreeMap<Id, Property>,
    pub groups: BTreeMap<Id, Group>,
    pub assignments: BTreeMap<Id, Assignment>,
    pub acls: BTreeMap<Id, Acl>,
    pub steps: BTreeMap<Id, Step>,
}

#[derive(Debug, Clone, Default)]
pub struct Environment {
    version: u64,
    rows: StructureRows,
    /// (type id, xpath without type and indices) -> assignment id
    by_xpath: HashMap<(Id, String), Id>,
    fingerprint: String,
}

fn inconsistent(what: &str, id: Id, detail: &str) -> Error {
    Error::Load(
        Message::new("ex.structure.load.inconsistent")
            .arg(what)
            .arg(id)
            .arg(detail),
    )
}

impl Environment {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate referential integrity of `rows` and index them.
    pub fn compile(version: u64, rows: StructureRows) -> Result<Self> {
        for t in rows.types.values() {
            if let Some(parent) = t.parent {
                if !rows.types.contains_key(&parent) {
                    return Err(inconsistent("type", t.id, "parent type missing"));
                }
            }
        }

        let mut by_xpath = HashMap::new();
        for a in rows.assignments.values() {
            if !rows.types.contains_key(&a.type_id) {
                return Err(inconsistent("assignment", a.id, "type missing"));
            }
            let target_exists = match (a.property_id(), a.group_id()) {
                (Some(p), _) => rows.properties.contains_key(&p),
                (_, Some(g)) => rows.groups.contains_key(&g),
                _ => false,
            };
            if !target_exists {
                return Err(inconsistent("assignment", a.id, "property or group missing"));
            }
            if let Some(parent) = a.parent_group {
                match rows.assignments.get(&parent) {
                    Some(p) if p.is_group() && p.type_id == a.type_id => {}
                    _ => return Err(inconsistent("assignment", a.id, "parent group invalid")),
                }
            }
            if let Some(base) = a.base {
                if !rows.assignments.contains_key(&base) {
                    return Err(inconsistent("assignment", a.id, "base assignment missing"));
                }
            }
            let key = (a.type_id, a.relative_xpath());
            if by_xpath.insert(key, a.id).is_some() {
                return Err(inconsistent("assignment", a.id, "duplicate xpath"));
            }
        }

        let fingerprint = fingerprint(&rows)?;
        Ok(Self {
            version,
            rows,
            by_xpath,
            fingerprint,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// SHA-256 over the serialized structure rows.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn rows(&self) -> &StructureRows {
        &self.rows
    }

    pub fn content_type(&self, id: Id) -> Result<&ContentType> {
        self.rows.types.get(&id).ok_or_else(|| {
            Error::not_found(Message::new("ex.structure.type.notFound").arg(id))
        })
    }

    pub fn content_type_by_name(&self, name: &str) -> Result<&ContentType> {
        self.rows
            .types
            .values()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::not_found(Message::new("ex.structure.type.notFound").arg(name)))
    }

    pub fn types(&self) -> impl Iterator<Item = &ContentType> {
        self.rows.types.values()
    }

    /// Direct child types of `type_id`.
    pub fn derived_types(&self, type_id: Id) -> Vec<&ContentType> {
        self.rows
            .types
            .values()
            .filter(|t| t.parent == Some(type_id))
            .collect()
    }

    pub fn property(&self, id: Id) -> Result<&Property> {
        self.rows.properties.get(&id).ok_or_else(|| {
            Error::not_found(Message::new("ex.structure.property.notFound").arg(id))
        })
    }

    pub fn property_by_name(&self, name: &str) -> Result<&Property> {
        self.rows
            .properties
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                Error::not_found(Message::new("ex.structure.property.notFound").arg(name))
            })
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.rows.properties.values()
    }

    pub fn group(&self, id: Id) -> Result<&Group> {
        self.rows.groups.get(&id).ok_or_else(|| {
            Error::not_found(Message::new("ex.structure.group.notFound").arg(id))
        })
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.rows.groups.values()
    }

    pub fn assignment(&self, id: Id) -> Result<&Assignment> {
        self.rows.assignments.get(&id).ok_or_else(|| {
            Error::not_found(Message::new("ex.structure.assignment.notFound").arg(id))
        })
    }

    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.rows.assignments.values()
    }

    /// Assignment at `xpath` of a type; indices and a type prefix are ignored.
    pub fn assignment_by_xpath(&self, type_id: Id, path: &str) -> Result<&Assignment> {
        let key = (type_id, xpath::to_xpath_no_mult(path)?);
        self.by_xpath
            .get(&key)
            .and_then(|id| self.rows.assignments.get(id))
            .ok_or_else(|| {
                Error::not_found(
                    Message::new("ex.structure.assignment.notFound.xpath")
                        .arg(path)
                        .xpath(path),
                )
            })
    }

    /// Assignment by full XPath including the type name (`DOCUMENT/TITLE`).
    pub fn assignment_by_full_xpath(&self, full_xpath: &str) -> Result<&Assignment> {
        let type_name = xpath::type_name(full_xpath).ok_or_else(|| {
            Error::invalid(Message::new("ex.xpath.invalid").arg(full_xpath))
        })?;
        let t = self.content_type_by_name(&type_name)?;
        self.assignment_by_xpath(t.id, full_xpath)
    }

    /// True when every element of `path` resolves to an enabled assignment of the type.
    pub fn is_valid_xpath(&self, type_id: Id, path: &str) -> bool {
        let Ok(elements) = xpath::split(path) else {
            return false;
        };
        !elements.is_empty()
            && (1..=elements.len()).all(|n| {
                self.assignment_by_xpath(type_id, &xpath::build(&elements[..n], false))
                    .map_or(false, |a| a.enabled)
            })
    }

    /// Every assignment of a type, in XPath order.
    pub fn type_assignments(&self, type_id: Id) -> Vec<&Assignment> {
        self.rows
            .assignments
            .values()
            .filter(|a| a.type_id == type_id)
            .sorted_by(|a, b| a.xpath.cmp(&b.xpath))
            .collect()
    }

    /// Assignments attached directly to the type root, in position order.
    pub fn root_assignments(&self, type_id: Id, include_disabled: bool) -> Vec<&Assignment> {
        self.rows
            .assignments
            .values()
            .filter(|a| a.type_id == type_id && a.parent_group.is_none())
            .filter(|a| include_disabled || a.enabled)
            .sorted_by_key(|a| (a.position, a.id))
            .collect()
    }

    /// Direct children of a group assignment, in position order.
    pub fn sub_assignments(&self, group_assignment: Id, include_disabled: bool) -> Vec<&Assignment> {
        self.rows
            .assignments
            .values()
            .filter(|a| a.parent_group == Some(group_assignment))
            .filter(|a| include_disabled || a.enabled)
            .sorted_by_key(|a| (a.position, a.id))
            .collect()
    }

    /// Children of a group assignment, or of the type root when `group` is `None`.
    pub fn children_of(&self, type_id: Id, group: Option<Id>, include_disabled: bool) -> Vec<&Assignment> {
        match group {
            Some(g) => self.sub_assignments(g, include_disabled),
            None => self.root_assignments(type_id, include_disabled),
        }
    }

    /// Every assignment below a group assignment, depth first.
    pub fn all_sub_assignments(&self, group_assignment: Id) -> Vec<&Assignment> {
        let mut out = Vec::new();
        for child in self.sub_assignments(group_assignment, true) {
            out.push(child);
            if child.is_group() {
                out.extend(self.all_sub_assignments(child.id));
            }
        }
        out
    }

    /// Assignments whose base is `assignment_id`.
    pub fn derived_assignments(&self, assignment_id: Id) -> Vec<&Assignment> {
        self.rows
            .assignments
            .values()
            .filter(|a| a.base == Some(assignment_id))
            .collect()
    }

    pub fn property_assignments(&self, property_id: Id) -> Vec<&Assignment> {
        self.rows
            .assignments
            .values()
            .filter(|a| a.property_id() == Some(property_id))
            .collect()
    }

    pub fn group_assignments(&self, group_id: Id) -> Vec<&Assignment> {
        self.rows
            .assignments
            .values()
            .filter(|a| a.group_id() == Some(group_id))
            .collect()
    }

    /// Number of system-internal properties attached to the root of the ROOT type.
    pub fn system_internal_root_count(&self) -> usize {
        self.rows
            .assignments
            .values()
            .filter(|a| {
                a.type_id == ROOT_TYPE_ID
                    && a.parent_group.is_none()
                    && a.is_property()
                    && a.is_system_internal()
            })
            .count()
    }

    pub fn acl(&self, id: Id) -> Result<&Acl> {
        self.rows
            .acls
            .get(&id)
            .ok_or_else(|| Error::not_found(Message::new("ex.acl.notFound").arg(id)))
    }

    /// Display name of an ACL; unknown ids render as `#id`.
    pub fn acl_name(&self, id: Id) -> String {
        self.rows
            .acls
            .get(&id)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| format!("#{}", id))
    }

    pub fn step(&self, id: Id) -> Result<&Step> {
        self.rows
            .steps
            .get(&id)
            .ok_or_else(|| Error::not_found(Message::new("ex.workflow.step.notFound").arg(id)))
    }
}

fn fingerprint(rows: &StructureRows) -> Result<String> {
    let bytes = serde_json::to_vec(rows).map_err(|e| {
        Error::Load(Message::new("ex.structure.load.serialize").arg(e))
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::common::{DataType, Multiplicity};
    use crate::model::structure::{AssignmentKind, NewContentType, NewProperty};

    fn rows() -> StructureRows {
        let mut rows = StructureRows::default();
        let t = ContentType::from_new(1, &NewContentType::new("doc", 1, 1), 0);
        rows.types.insert(1, t);
        let p = Property::from_new(
            2,
            "title",
            &NewProperty::new("title", DataType::String, Multiplicity::ONE, 1),
        );
        rows.properties.insert(2, p);
        let a = Assignment::new(
            3,
            1,
            "doc",
            "/",
            "title",
            None,
            Multiplicity::ONE,
            1,
            AssignmentKind::Property {
                property_id: 2,
                default_value: None,
                default_language: None,
            },
        )
        .unwrap();
        rows.assignments.insert(3, a);
        rows
    }

    #[test]
    fn test_compile_indexes_xpaths() {
        let env = Environment::compile(1, rows()).unwrap();
        assert_eq!(env.assignment_by_xpath(1, "/title[1]").unwrap().id, 3);
        assert_eq!(env.assignment_by_full_xpath("DOC/TITLE").unwrap().id, 3);
        assert!(env.assignment_by_xpath(1, "/missing").is_err());
        assert_eq!(env.root_assignments(1, false).len(), 1);
        assert_eq!(env.fingerprint().len(), 64);
    }

    #[test]
    fn test_compile_rejects_dangling_references() {
        let mut broken = rows();
        broken.properties.clear();
        assert!(matches!(
            Environment::compile(1, broken),
            Err(Error::Load(_))
        ));

        let mut broken = rows();
        if let Some(a) = broken.assignments.get_mut(&3) {
            a.base = Some(99);
        }
        assert!(Environment::compile(1, broken).is_err());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let base = rows();
        let a = Environment::compile(1, base.clone()).unwrap();
        let b = Environment::compile(2, base.clone()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let mut changed = base;
        if let Some(p) = changed.properties.get_mut(&2) {
            p.fulltext = true;
        }
        let c = Environment::compile(3, changed).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_disabled_assignments_are_not_valid_xpaths() {
        let env = Environment::compile(1, rows()).unwrap();
        assert!(env.is_valid_xpath(1, "/TITLE[1]"));
        assert!(!env.is_valid_xpath(1, "/"));
        assert!(!env.is_valid_xpath(1, "/MISSING"));

        let mut disabled = rows();
        if let Some(a) = disabled.assignments.get_mut(&3) {
            a.enabled = false;
        }
        let env = Environment::compile(2, disabled).unwrap();
        assert!(env.assignment_by_xpath(1, "/TITLE").is_ok());
        assert!(!env.is_valid_xpath(1, "/TITLE"));
    }

    #[test]
    fn test_acl_name_fallback() {
        let env = Environment::compile(1, rows()).unwrap();
        assert_eq!(env.acl_name(42), "#42");
    }
}
