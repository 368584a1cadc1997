//! Arena holding the data tree of one content instance.
//!
//! Nodes live in a slot vector owned by the tree and refer to each other by
//! index; a parent link is just the parent's slot. Freed slots are left as
//! `None` so indices of live nodes never move.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Message, Result};
use crate::model::common::{GroupMode, Id, Multiplicity};
use crate::model::value::FieldValue;
use crate::model::xpath::XPathElement;

/// Index of a node inside its `DataTree`.
pub type NodeId = usize;

/// Assignment id carried by the virtual root group.
pub const ROOT_ASSIGNMENT: Id = -1;

/// Where `create_new` places a new sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Top,
    Bottom,
    At(i32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataKind {
    Property {
        property_id: Id,
        value: FieldValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    Group {
        mode: GroupMode,
        children: Vec<NodeId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    pub alias: String,
    /// 1-based occurrence index among siblings of the same assignment
    pub index: u32,
    pub assignment_id: Id,
    /// Copy of the assignment's multiplicity at creation time
    pub multiplicity: Multiplicity,
    pub pos: i32,
    pub parent: Option<NodeId>,
    pub system_internal: bool,
    #[serde(flatten)]
    pub kind: DataKind,
}

impl DataNode {
    pub fn is_property(&self) -> bool {
        matches!(self.kind, DataKind::Property { .. })
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, DataKind::Group { .. })
    }

    pub fn value(&self) -> Option<&FieldValue> {
        match &self.kind {
            DataKind::Property { value, .. } => Some(value),
            DataKind::Group { .. } => None,
        }
    }

    pub fn property_id(&self) -> Option<Id> {
        match &self.kind {
            DataKind::Property { property_id, .. } => Some(*property_id),
            DataKind::Group { .. } => None,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            DataKind::Group { children, .. } => children,
            DataKind::Property { .. } => &[],
        }
    }

    pub fn group_mode(&self) -> Option<GroupMode> {
        match &self.kind {
            DataKind::Group { mode, .. } => Some(*mode),
            DataKind::Property { .. } => None,
        }
    }

    pub fn element(&self) -> XPathElement {
        XPathElement::new(&self.alias, self.index, true)
    }

    /// Value hidden or frozen for the current caller.
    pub fn is_protected(&self) -> bool {
        self.value()
            .map_or(false, |v| v.is_no_access() || v.is_read_only())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTree {
    nodes: Vec<Option<DataNode>>,
    root: NodeId,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

fn dangling(id: NodeId) -> Error {
    Error::Load(Message::new("ex.content.data.dangling").arg(id))
}

impl DataTree {
    pub fn new() -> Self {
        let root = DataNode {
            alias: String::new(),
            index: 1,
            assignment_id: ROOT_ASSIGNMENT,
            multiplicity: Multiplicity::ONE,
            pos: 0,
            parent: None,
            system_internal: false,
            kind: DataKind::Group {
                mode: GroupMode::AnyOf,
                children: Vec::new(),
            },
        };
        Self {
            nodes: vec![Some(root)],
            root: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        id == self.root
    }

    pub fn node(&self, id: NodeId) -> Result<&DataNode> {
        self.nodes
            .get(id)
            .and_then(Option::as_ref)
            .ok_or_else(|| dangling(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut DataNode> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| dangling(id))
    }

    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>> {
        Ok(self.node(id)?.children().to_vec())
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.node(id)?.parent)
    }

    fn children_mut(&mut self, id: NodeId) -> Result<&mut Vec<NodeId>> {
        match &mut self.node_mut(id)?.kind {
            DataKind::Group { children, .. } => Ok(children),
            DataKind::Property { .. } => Err(Error::invalid(
                Message::new("ex.xpath.element.noGroup").arg(id),
            )),
        }
    }

    /// Store a detached node and return its slot.
    pub fn insert(&mut self, node: DataNode) -> NodeId {
        self.nodes.push(Some(node));
        self.nodes.len() - 1
    }

    /// Link `child` under `parent` and keep the child list in position order.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.node_mut(child)?.parent = Some(parent);
        self.children_mut(parent)?.push(child);
        self.sort_children(parent)
    }

    /// Stable sort of a group's children by `pos`.
    pub fn sort_children(&mut self, group: NodeId) -> Result<()> {
        let mut keyed = Vec::new();
        for child in self.children(group)? {
            keyed.push((self.node(child)?.pos, child));
        }
        keyed.sort_by_key(|(pos, _)| *pos);
        *self.children_mut(group)? = keyed.into_iter().map(|(_, c)| c).collect();
        Ok(())
    }

    /// Unlink `child` from its parent and free its whole subtree.
    pub fn remove_subtree(&mut self, child: NodeId) -> Result<()> {
        if let Some(parent) = self.node(child)?.parent {
            self.children_mut(parent)?.retain(|c| *c != child);
        }
        let mut stack = vec![child];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(id).and_then(Option::take) {
                stack.extend(node.children().iter().copied());
            }
        }
        Ok(())
    }

    /// Replace the child order of `group`.
    pub(crate) fn set_children(&mut self, group: NodeId, order: Vec<NodeId>) -> Result<()> {
        *self.children_mut(group)? = order;
        Ok(())
    }

    pub fn find_child(&self, group: NodeId, element: &XPathElement) -> Result<Option<NodeId>> {
        for child in self.node(group)?.children() {
            let node = self.node(*child)?;
            if node.alias == element.alias && node.index == element.index {
                return Ok(Some(*child));
            }
        }
        Ok(None)
    }

    /// Siblings (including `id` itself) instantiating the same assignment.
    pub fn same_assignment_siblings(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.node(id)?;
        let Some(parent) = node.parent else {
            return Ok(vec![id]);
        };
        self.children_with_assignment(parent, node.assignment_id)
    }

    pub fn children_with_assignment(&self, group: NodeId, assignment_id: Id) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        for child in self.node(group)?.children() {
            if self.node(*child)?.assignment_id == assignment_id {
                out.push(*child);
            }
        }
        Ok(out)
    }

    /// XPath with indices, e.g. `/ADDRESS[2]/STREET[1]`; the root is `/`.
    pub fn xpath_full(&self, id: NodeId) -> Result<String> {
        let mut parts = Vec::new();
        let mut current = id;
        loop {
            let node = self.node(current)?;
            match node.parent {
                Some(parent) => {
                    parts.push(format!("{}[{}]", node.alias, node.index));
                    current = parent;
                }
                None => break,
            }
        }
        if parts.is_empty() {
            return Ok("/".to_string());
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// XPath without indices, e.g. `/ADDRESS/STREET`.
    pub fn xpath(&self, id: NodeId) -> Result<String> {
        let mut parts = Vec::new();
        let mut current = id;
        while let Some(parent) = self.node(current)?.parent {
            parts.push(self.node(current)?.alias.clone());
            current = parent;
        }
        if parts.is_empty() {
            return Ok("/".to_string());
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// A property is empty when its value is; a group when all its children are.
    pub fn is_empty(&self, id: NodeId) -> Result<bool> {
        let node = self.node(id)?;
        match &node.kind {
            DataKind::Property { value, .. } => Ok(value.is_empty()),
            DataKind::Group { children, .. } => {
                for child in children {
                    if !self.is_empty(*child)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Renumber positions of all siblings from 0 and indices of same-assignment siblings from 1.
    pub fn compact(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let (assignment, parent) = (node.assignment_id, node.parent);
        match parent {
            Some(parent) => self.compact_assignment(parent, assignment),
            None => Ok(()),
        }
    }

    /// Renumber `group`'s child positions and the indices of one assignment's children.
    pub fn compact_assignment(&mut self, group: NodeId, assignment_id: Id) -> Result<()> {
        let mut index = 1;
        for (pos, child) in self.children(group)?.into_iter().enumerate() {
            let node = self.node_mut(child)?;
            node.pos = pos as i32;
            if node.assignment_id == assignment_id {
                node.index = index;
                index += 1;
            }
        }
        Ok(())
    }

    /// Renumber child positions of `group` from 0, optionally for every nested group.
    pub fn compact_positions(&mut self, group: NodeId, recursive: bool) -> Result<()> {
        for (pos, child) in self.children(group)?.into_iter().enumerate() {
            let node = self.node_mut(child)?;
            node.pos = pos as i32;
            if recursive && node.is_group() {
                self.compact_positions(child, true)?;
            }
        }
        Ok(())
    }

    /// Live nodes below `id` in document order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        for child in self.node(id)?.children() {
            out.push(*child);
            if self.node(*child)?.is_group() {
                out.extend(self.descendants(*child)?);
            }
        }
        Ok(out)
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty_tree(&self) -> bool {
        self.node(self.root)
            .map(|root| root.children().is_empty())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::common::DataType;

    fn property(alias: &str, index: u32, assignment: Id, pos: i32) -> DataNode {
        DataNode {
            alias: alias.to_string(),
            index,
            assignment_id: assignment,
            multiplicity: Multiplicity::ZERO_OR_MORE,
            pos,
            parent: None,
            system_internal: false,
            kind: DataKind::Property {
                property_id: 1,
                value: FieldValue::empty(DataType::String, false),
                max_length: None,
            },
        }
    }

    fn group(alias: &str, index: u32, assignment: Id, pos: i32) -> DataNode {
        DataNode {
            alias: alias.to_string(),
            index,
            assignment_id: assignment,
            multiplicity: Multiplicity::ZERO_OR_MORE,
            pos,
            parent: None,
            system_internal: false,
            kind: DataKind::Group {
                mode: GroupMode::AnyOf,
                children: Vec::new(),
            },
        }
    }

    #[test]
    fn test_attach_orders_by_pos_and_builds_xpaths() {
        let mut tree = DataTree::new();
        let root = tree.root();
        let b = tree.insert(property("B", 1, 2, 5));
        let a = tree.insert(group("A", 2, 1, 1));
        tree.attach(root, b).unwrap();
        tree.attach(root, a).unwrap();
        assert_eq!(tree.children(root).unwrap(), vec![a, b]);

        let c = tree.insert(property("C", 1, 3, 0));
        tree.attach(a, c).unwrap();
        assert_eq!(tree.xpath_full(c).unwrap(), "/A[2]/C[1]");
        assert_eq!(tree.xpath(c).unwrap(), "/A/C");
        assert_eq!(tree.xpath_full(root).unwrap(), "/");
    }

    #[test]
    fn test_compact_renumbers_positions_and_indices() {
        let mut tree = DataTree::new();
        let root = tree.root();
        let x3 = tree.insert(property("X", 3, 7, 10));
        let y = tree.insert(property("Y", 1, 8, 20));
        let x5 = tree.insert(property("X", 5, 7, 30));
        for id in [x3, y, x5] {
            tree.attach(root, id).unwrap();
        }
        tree.compact(x3).unwrap();
        assert_eq!(tree.node(x3).unwrap().index, 1);
        assert_eq!(tree.node(x5).unwrap().index, 2);
        assert_eq!(tree.node(y).unwrap().pos, 1);
        assert_eq!(tree.node(x5).unwrap().pos, 2);
    }

    #[test]
    fn test_remove_subtree_frees_slots() {
        let mut tree = DataTree::new();
        let root = tree.root();
        let g = tree.insert(group("G", 1, 1, 0));
        tree.attach(root, g).unwrap();
        let p = tree.insert(property("P", 1, 2, 0));
        tree.attach(g, p).unwrap();
        assert_eq!(tree.len(), 3);
        tree.remove_subtree(g).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.node(p).is_err());
        assert!(tree.is_empty_tree());
    }

    #[test]
    fn test_clone_keeps_parent_links() {
        let mut tree = DataTree::new();
        let root = tree.root();
        let g = tree.insert(group("G", 1, 1, 0));
        tree.attach(root, g).unwrap();
        let p = tree.insert(property("P", 1, 2, 0));
        tree.attach(g, p).unwrap();
        let copy = tree.clone();
        assert_eq!(copy.parent(p).unwrap(), Some(g));
        assert_eq!(copy.xpath_full(p).unwrap(), "/G[1]/P[1]");
    }
}
