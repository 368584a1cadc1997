//! In-memory implementation of every store collaborator.
//!
//! Constraint checks mirror what a relational schema would enforce: unique
//! names and XPaths, and foreign keys between types, assignments and
//! properties/groups. Transactions snapshot the whole state on the outermost
//! `begin` and restore it on rollback.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};

use crate::model::{
    xpath, Acl, Assignment, Content, ContentType, ContentVersionInfo, DataType, Group, HistoryEntry, Id,
    IdSpace, NodeId, Property, Step, StructureRows,
};
use crate::store::traits::{
    DataRow, HistorySink, InstanceRef, InstanceStore, OccurrenceBounds, SequenceGenerator, Store,
    StoreError, StoreResult, StructureStore, Transactional,
};

#[derive(Debug, Clone, Default)]
struct State {
    rows: StructureRows,
    versions: BTreeMap<Id, ContentVersionInfo>,
    contents: BTreeMap<(Id, i32), Content>,
    data_rows: BTreeMap<(Id, i32), Vec<DataRow>>,
    binaries: BTreeMap<Id, Vec<u8>>,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Default)]
struct TxState {
    depth: usize,
    rollback_only: bool,
    checkpoint: Option<State>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    tx: Mutex<TxState>,
    /// Sequences are not transactional, like database sequences
    sequences: Mutex<BTreeMap<IdSpace, Id>>,
    fail_history: AtomicBool,
    fail_reload: AtomicBool,
}

fn unique(what: &str, key: impl std::fmt::Display) -> StoreError {
    StoreError::UniqueViolation(format!("{} {}", what, key))
}

fn foreign_key(what: &str, id: Id, detail: &str) -> StoreError {
    StoreError::ForeignKeyViolation(format!("{} {}: {}", what, id, detail))
}

fn missing(what: &str, id: Id) -> StoreError {
    StoreError::Missing(format!("{} {}", what, id))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following history write fail (the engines must shrug it off).
    pub fn set_history_failure(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Make structure loads outside a transaction fail, i.e. the snapshot reload after a commit.
    pub fn set_reload_failure(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.read().history.clone()
    }

    pub fn binary_ids(&self) -> Vec<Id> {
        self.state.read().binaries.keys().copied().collect()
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.lock().depth > 0
    }

    fn check_assignment_refs(rows: &StructureRows, a: &Assignment) -> StoreResult<()> {
        if !rows.types.contains_key(&a.type_id) {
            return Err(foreign_key("assignment", a.id, "type missing"));
        }
        if let Some(parent) = a.parent_group {
            if !rows.assignments.contains_key(&parent) {
                return Err(foreign_key("assignment", a.id, "parent group missing"));
            }
        }
        if let Some(base) = a.base {
            if !rows.assignments.contains_key(&base) {
                return Err(foreign_key("assignment", a.id, "base assignment missing"));
            }
        }
        if let Some(property) = a.property_id() {
            if !rows.properties.contains_key(&property) {
                return Err(foreign_key("assignment", a.id, "property missing"));
            }
        }
        if let Some(group) = a.group_id() {
            if !rows.groups.contains_key(&group) {
                return Err(foreign_key("assignment", a.id, "group missing"));
            }
        }
        Ok(())
    }

    fn check_assignment_unique(rows: &StructureRows, a: &Assignment) -> StoreResult<()> {
        let clash = rows
            .assignments
            .values()
            .any(|other| other.id != a.id && other.type_id == a.type_id && other.xpath == a.xpath);
        if clash {
            return Err(unique("assignment xpath", &a.xpath));
        }
        Ok(())
    }

    fn rebuild_rows(state: &mut State, key: (Id, i32)) -> StoreResult<()> {
        if let Some(content) = state.contents.get(&key) {
            let rows = DataRow::collect(content).map_err(|e| StoreError::Other(anyhow!(e)))?;
            state.data_rows.insert(key, rows);
        }
        Ok(())
    }
}

impl StructureStore for MemoryStore {
    fn load_structure(&self) -> StoreResult<StructureRows> {
        if self.fail_reload.load(Ordering::SeqCst) && !self.in_transaction() {
            return Err(StoreError::Other(anyhow!("structure cache unavailable")));
        }
        Ok(self.state.read().rows.clone())
    }

    fn insert_type(&self, t: &ContentType) -> StoreResult<()> {
        let mut state = self.state.write();
        let rows = &mut state.rows;
        if rows.types.contains_key(&t.id) {
            return Err(unique("type id", t.id));
        }
        if rows.types.values().any(|o| o.name.eq_ignore_ascii_case(&t.name)) {
            return Err(unique("type name", &t.name));
        }
        if let Some(parent) = t.parent {
            if !rows.types.contains_key(&parent) {
                return Err(foreign_key("type", t.id, "parent type missing"));
            }
        }
        rows.types.insert(t.id, t.clone());
        Ok(())
    }

    fn update_type(&self, t: &ContentType) -> StoreResult<()> {
        let mut state = self.state.write();
        let rows = &mut state.rows;
        if !rows.types.contains_key(&t.id) {
            return Err(missing("type", t.id));
        }
        if rows
            .types
            .values()
            .any(|o| o.id != t.id && o.name.eq_ignore_ascii_case(&t.name))
        {
            return Err(unique("type name", &t.name));
        }
        rows.types.insert(t.id, t.clone());
        Ok(())
    }

    fn delete_type(&self, id: Id) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.rows.assignments.values().any(|a| a.type_id == id) {
            return Err(foreign_key("type", id, "assignments remain"));
        }
        if state.rows.types.values().any(|t| t.parent == Some(id)) {
            return Err(foreign_key("type", id, "derived types remain"));
        }
        if state.contents.values().any(|c| c.type_id == id) {
            return Err(foreign_key("type", id, "instances remain"));
        }
        for t in state.rows.types.values_mut() {
            t.relations.retain(|r| r.source != id && r.destination != id);
        }
        state
            .rows
            .types
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing("type", id))
    }

    fn insert_property(&self, property: &Property) -> StoreResult<()> {
        let mut state = self.state.write();
        let rows = &mut state.rows;
        if rows.properties.contains_key(&property.id) {
            return Err(unique("property id", property.id));
        }
        if rows
            .properties
            .values()
            .any(|p| p.name.eq_ignore_ascii_case(&property.name))
        {
            return Err(unique("property name", &property.name));
        }
        rows.properties.insert(property.id, property.clone());
        Ok(())
    }

    fn update_property(&self, property: &Property) -> StoreResult<()> {
        let mut state = self.state.write();
        match state.rows.properties.get_mut(&property.id) {
            Some(slot) => {
                *slot = property.clone();
                Ok(())
            }
            None => Err(missing("property", property.id)),
        }
    }

    fn delete_property(&self, id: Id) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.rows.assignments.values().any(|a| a.property_id() == Some(id)) {
            return Err(foreign_key("property", id, "still assigned"));
        }
        state
            .rows
            .properties
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing("property", id))
    }

    fn insert_group(&self, group: &Group) -> StoreResult<()> {
        let mut state = self.state.write();
        let rows = &mut state.rows;
        if rows.groups.contains_key(&group.id) {
            return Err(unique("group id", group.id));
        }
        if rows.groups.values().any(|g| g.name.eq_ignore_ascii_case(&group.name)) {
            return Err(unique("group name", &group.name));
        }
        rows.groups.insert(group.id, group.clone());
        Ok(())
    }

    fn update_group(&self, group: &Group) -> StoreResult<()> {
        let mut state = self.state.write();
        match state.rows.groups.get_mut(&group.id) {
            Some(slot) => {
                *slot = group.clone();
                Ok(())
            }
            None => Err(missing("group", group.id)),
        }
    }

    fn delete_group(&self, id: Id) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.rows.assignments.values().any(|a| a.group_id() == Some(id)) {
            return Err(foreign_key("group", id, "still assigned"));
        }
        state
            .rows
            .groups
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing("group", id))
    }

    fn insert_assignment(&self, assignment: &Assignment) -> StoreResult<()> {
        let mut state = self.state.write();
        let rows = &mut state.rows;
        if rows.assignments.contains_key(&assignment.id) {
            return Err(unique("assignment id", assignment.id));
        }
        Self::check_assignment_unique(rows, assignment)?;
        Self::check_assignment_refs(rows, assignment)?;
        rows.assignments.insert(assignment.id, assignment.clone());
        Ok(())
    }

    fn update_assignment(&self, assignment: &Assignment) -> StoreResult<()> {
        let mut state = self.state.write();
        let rows = &mut state.rows;
        if !rows.assignments.contains_key(&assignment.id) {
            return Err(missing("assignment", assignment.id));
        }
        Self::check_assignment_unique(rows, assignment)?;
        Self::check_assignment_refs(rows, assignment)?;
        rows.assignments.insert(assignment.id, assignment.clone());
        Ok(())
    }

    fn delete_assignment(&self, id: Id) -> StoreResult<()> {
        let mut state = self.state.write();
        let rows = &mut state.rows;
        if let Some(child) = rows.assignments.values().find(|a| a.parent_group == Some(id)) {
            return Err(foreign_key("assignment", id, &format!("parent of {}", child.id)));
        }
        if let Some(derived) = rows.assignments.values().find(|a| a.base == Some(id)) {
            return Err(foreign_key("assignment", id, &format!("base of {}", derived.id)));
        }
        rows.assignments
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing("assignment", id))
    }

    fn insert_acl(&self, acl: &Acl) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.rows.acls.contains_key(&acl.id) {
            return Err(unique("acl id", acl.id));
        }
        state.rows.acls.insert(acl.id, acl.clone());
        Ok(())
    }

    fn insert_step(&self, step: &Step) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.rows.steps.contains_key(&step.id) {
            return Err(unique("step id", step.id));
        }
        if !state.rows.acls.contains_key(&step.acl) {
            return Err(foreign_key("step", step.id, "acl missing"));
        }
        state.rows.steps.insert(step.id, step.clone());
        Ok(())
    }
}

impl InstanceStore for MemoryStore {
    fn version_info(&self, id: Id) -> StoreResult<Option<ContentVersionInfo>> {
        Ok(self.state.read().versions.get(&id).cloned())
    }

    fn load_version(&self, id: Id, version: i32) -> StoreResult<Option<Content>> {
        Ok(self.state.read().contents.get(&(id, version)).cloned())
    }

    fn store_version(&self, content: &Content, info: &ContentVersionInfo, rows: Vec<DataRow>) -> StoreResult<()> {
        let version = match content.pk.version {
            crate::model::Version::Number(n) => n,
            other => {
                return Err(StoreError::Other(anyhow!(
                    "cannot store content {} under version {}",
                    content.pk.id,
                    other
                )))
            }
        };
        let mut state = self.state.write();
        if !state.rows.types.contains_key(&content.type_id) {
            return Err(foreign_key("content", content.pk.id, "type missing"));
        }
        let key = (content.pk.id, version);
        state.contents.insert(key, content.clone());
        state.data_rows.insert(key, rows);
        state.versions.insert(info.id, info.clone());
        Ok(())
    }

    fn remove_content(&self, id: Id) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.versions.remove(&id).is_none() {
            return Err(missing("content", id));
        }
        state.contents.retain(|(cid, _), _| *cid != id);
        state.data_rows.retain(|(cid, _), _| *cid != id);
        Ok(())
    }

    fn occurrence_bounds(&self, assignment_ids: &[Id]) -> StoreResult<Option<OccurrenceBounds>> {
        let state = self.state.read();
        let mut counts: HashMap<(Id, i32, &str, Id), u32> = HashMap::new();
        for ((id, version), rows) in &state.data_rows {
            for row in rows.iter().filter(|r| assignment_ids.contains(&r.assignment_id)) {
                // a parent holding only empty occurrences still counts, with 0
                let count = counts
                    .entry((*id, *version, row.parent_xpath.as_str(), row.assignment_id))
                    .or_default();
                if !row.empty {
                    *count += 1;
                }
            }
        }
        let min = counts.values().copied().min();
        let max = counts.values().copied().max();
        Ok(min.zip(max).map(|(min, max)| OccurrenceBounds { min, max }))
    }

    fn affected_instances(&self, assignment_ids: &[Id]) -> StoreResult<Vec<InstanceRef>> {
        let state = self.state.read();
        let mut out = Vec::new();
        for (key, rows) in &state.data_rows {
            if !rows.iter().any(|r| assignment_ids.contains(&r.assignment_id)) {
                continue;
            }
            if let Some(content) = state.contents.get(key) {
                out.push(InstanceRef {
                    pk: content.pk,
                    type_id: content.type_id,
                    acl: content.acl,
                    step: content.step,
                });
            }
        }
        Ok(out)
    }

    fn instance_count(&self, type_id: Id) -> StoreResult<usize> {
        let state = self.state.read();
        let count = state
            .versions
            .keys()
            .filter(|id| {
                state
                    .contents
                    .iter()
                    .any(|((cid, _), c)| cid == *id && c.type_id == type_id)
            })
            .count();
        Ok(count)
    }

    fn remove_assignment_data(&self, assignment_ids: &[Id]) -> StoreResult<Vec<Id>> {
        let mut state = self.state.write();
        let mut binaries = Vec::new();
        let keys: Vec<(Id, i32)> = state.contents.keys().copied().collect();
        for key in keys {
            let Some(content) = state.contents.get_mut(&key) else {
                continue;
            };
            let tree = content.data_mut();
            let targets: Vec<NodeId> = tree
                .descendants(tree.root())
                .map_err(|e| StoreError::Other(anyhow!(e)))?
                .into_iter()
                .filter(|id| {
                    tree.node(*id)
                        .map_or(false, |n| assignment_ids.contains(&n.assignment_id))
                })
                .collect();
            if targets.is_empty() {
                continue;
            }
            for target in targets {
                // already gone with an ancestor
                let Ok(node) = tree.node(target) else {
                    continue;
                };
                let (parent, assignment) = (node.parent, node.assignment_id);
                let mut subtree = vec![target];
                subtree.extend(tree.descendants(target).map_err(|e| StoreError::Other(anyhow!(e)))?);
                for id in subtree {
                    if let Some(value) = tree.node(id).ok().and_then(|n| n.value()) {
                        if value.data_type == DataType::Binary {
                            binaries.extend(value.translations.values().filter_map(serde_json::Value::as_i64));
                        }
                    }
                }
                tree.remove_subtree(target)
                    .map_err(|e| StoreError::Other(anyhow!(e)))?;
                if let Some(parent) = parent {
                    tree.compact_assignment(parent, assignment)
                        .map_err(|e| StoreError::Other(anyhow!(e)))?;
                }
            }
            Self::rebuild_rows(&mut state, key)?;
        }
        Ok(binaries)
    }

    fn update_xpath(&self, old_prefix: &str, new_prefix: &str) -> StoreResult<usize> {
        let type_name = xpath::type_name(old_prefix)
            .ok_or_else(|| StoreError::Other(anyhow!("xpath {} lacks a type", old_prefix)))?;
        let old_path = xpath::strip_type(old_prefix);
        let new_alias = xpath::last_element(new_prefix)
            .map_err(|e| StoreError::Other(anyhow!(e)))?
            .alias;

        let mut state = self.state.write();
        let type_id = state
            .rows
            .types
            .values()
            .find(|t| t.name.eq_ignore_ascii_case(&type_name))
            .map(|t| t.id)
            .ok_or_else(|| StoreError::Missing(format!("type {}", type_name)))?;

        let mut changed = 0;
        let keys: Vec<(Id, i32)> = state.contents.keys().copied().collect();
        for key in keys {
            let Some(content) = state.contents.get_mut(&key) else {
                continue;
            };
            if content.type_id != type_id {
                continue;
            }
            let tree = content.data_mut();
            let nodes = tree
                .descendants(tree.root())
                .map_err(|e| StoreError::Other(anyhow!(e)))?;
            let mut touched = false;
            for id in nodes {
                if tree.xpath(id).map_or(false, |p| p == old_path) {
                    tree.node_mut(id)
                        .map_err(|e| StoreError::Other(anyhow!(e)))?
                        .alias = new_alias.clone();
                    touched = true;
                    changed += 1;
                }
            }
            if touched {
                Self::rebuild_rows(&mut state, key)?;
            }
        }
        Ok(changed)
    }

    fn store_binary(&self, id: Id, bytes: Vec<u8>) -> StoreResult<()> {
        self.state.write().binaries.insert(id, bytes);
        Ok(())
    }

    fn remove_binaries(&self, ids: &[Id]) -> StoreResult<()> {
        let mut state = self.state.write();
        for id in ids {
            state.binaries.remove(id);
        }
        Ok(())
    }
}

impl Transactional for MemoryStore {
    fn begin(&self) -> StoreResult<()> {
        let mut tx = self.tx.lock();
        if tx.depth == 0 {
            tx.checkpoint = Some(self.state.read().clone());
            tx.rollback_only = false;
        }
        tx.depth += 1;
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        let mut tx = self.tx.lock();
        if tx.depth == 0 {
            return Err(StoreError::Other(anyhow!("commit without transaction")));
        }
        tx.depth -= 1;
        if tx.depth > 0 {
            return Ok(());
        }
        let checkpoint = tx.checkpoint.take();
        if tx.rollback_only {
            if let Some(snapshot) = checkpoint {
                *self.state.write() = snapshot;
            }
            return Err(StoreError::Other(anyhow!("transaction was marked rollback-only")));
        }
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        let mut tx = self.tx.lock();
        if tx.depth == 0 {
            return Err(StoreError::Other(anyhow!("rollback without transaction")));
        }
        tx.depth -= 1;
        tx.rollback_only = true;
        if tx.depth == 0 {
            if let Some(snapshot) = tx.checkpoint.take() {
                *self.state.write() = snapshot;
            }
            log::debug!("memory store rolled back");
        }
        Ok(())
    }
}

impl SequenceGenerator for MemoryStore {
    fn next_id(&self, space: IdSpace) -> StoreResult<Id> {
        let mut sequences = self.sequences.lock();
        let next = sequences.entry(space).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

impl HistorySink for MemoryStore {
    fn record(&self, entry: HistoryEntry) -> StoreResult<()> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(StoreError::Other(anyhow!("history sink unavailable")));
        }
        self.state.write().history.push(entry);
        Ok(())
    }
}

impl Store for MemoryStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssignmentKind, Multiplicity, NewContentType, NewProperty};

    fn store_with_type() -> (MemoryStore, ContentType) {
        let store = MemoryStore::new();
        let t = ContentType::from_new(1, &NewContentType::new("DOC", 1, 1), 0);
        store.insert_type(&t).unwrap();
        (store, t)
    }

    fn property(id: Id, name: &str) -> Property {
        Property::from_new(id, name, &NewProperty::new(name, DataType::String, Multiplicity::ONE, 1))
    }

    fn assignment(id: Id, property_id: Id, alias: &str) -> Assignment {
        Assignment::new(
            id,
            1,
            "DOC",
            "/",
            alias,
            None,
            Multiplicity::ONE,
            1,
            AssignmentKind::Property {
                property_id,
                default_value: None,
                default_language: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_unique_names_and_xpaths() {
        let (store, _) = store_with_type();
        store.insert_property(&property(1, "TITLE")).unwrap();
        assert!(matches!(
            store.insert_property(&property(2, "title")),
            Err(StoreError::UniqueViolation(_))
        ));
        store.insert_assignment(&assignment(10, 1, "TITLE")).unwrap();
        assert!(matches!(
            store.insert_assignment(&assignment(11, 1, "TITLE")),
            Err(StoreError::UniqueViolation(_))
        ));
    }

    #[test]
    fn test_foreign_keys_block_deletes() {
        let (store, _) = store_with_type();
        store.insert_property(&property(1, "TITLE")).unwrap();
        store.insert_assignment(&assignment(10, 1, "TITLE")).unwrap();
        let mut derived = assignment(11, 1, "COPY");
        derived.base = Some(10);
        store.insert_assignment(&derived).unwrap();

        assert!(matches!(
            store.delete_assignment(10),
            Err(StoreError::ForeignKeyViolation(_))
        ));
        assert!(matches!(
            store.delete_property(1),
            Err(StoreError::ForeignKeyViolation(_))
        ));
        store.delete_assignment(11).unwrap();
        store.delete_assignment(10).unwrap();
        store.delete_property(1).unwrap();
    }

    #[test]
    fn test_rollback_restores_outermost_snapshot() {
        let (store, _) = store_with_type();
        store.begin().unwrap();
        store.insert_property(&property(1, "A")).unwrap();
        store.begin().unwrap();
        store.insert_property(&property(2, "B")).unwrap();
        store.rollback().unwrap();
        assert!(store.in_transaction());
        assert!(store.commit().is_err());
        assert!(store.load_structure().unwrap().properties.is_empty());
    }

    #[test]
    fn test_nested_commit() {
        let (store, _) = store_with_type();
        store.begin().unwrap();
        store.begin().unwrap();
        store.insert_property(&property(1, "A")).unwrap();
        store.commit().unwrap();
        store.commit().unwrap();
        assert_eq!(store.load_structure().unwrap().properties.len(), 1);
        assert!(store.rollback().is_err());
    }

    #[test]
    fn test_sequences_are_disjoint_and_survive_rollback() {
        let store = MemoryStore::new();
        store.begin().unwrap();
        assert_eq!(store.next_id(IdSpace::Property).unwrap(), 1);
        store.rollback().unwrap();
        assert_eq!(store.next_id(IdSpace::Property).unwrap(), 2);
        assert_eq!(store.next_id(IdSpace::Group).unwrap(), 1);
    }
}
