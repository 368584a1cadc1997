//! Content instance: header fields plus a data tree built against one type.

use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{Error, Message, Result};
use crate::model::common::{GroupMode, Id, LanguageId};
use crate::model::data::{DataKind, DataNode, DataTree, InsertPosition, NodeId};
use crate::model::environment::Environment;
use crate::model::pk::{LifeCycleInfo, PrimaryKey, Version};
use crate::model::structure::{Assignment, AssignmentKind};
use crate::model::value::FieldValue;
use crate::model::xpath::{self, XPathElement};

/// Source/destination of a relation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub source: PrimaryKey,
    pub destination: PrimaryKey,
    pub source_position: i32,
    pub destination_position: i32,
}

/// Aliases of the system-internal properties every root type carries.
pub mod system_alias {
    pub const ID: &str = "ID";
    pub const VERSION: &str = "VERSION";
    pub const TYPEDEF: &str = "TYPEDEF";
    pub const MANDATOR: &str = "MANDATOR";
    pub const ACL: &str = "ACL";
    pub const STEP: &str = "STEP";
    pub const MAX_VER: &str = "MAX_VER";
    pub const LIVE_VER: &str = "LIVE_VER";
    pub const ISMAX_VER: &str = "ISMAX_VER";
    pub const ISLIVE_VER: &str = "ISLIVE_VER";
    pub const ISACTIVE: &str = "ISACTIVE";
    pub const MAINLANG: &str = "MAINLANG";
    pub const CREATED_BY: &str = "CREATED_BY";
    pub const CREATED_AT: &str = "CREATED_AT";
    pub const MODIFIED_BY: &str = "MODIFIED_BY";
    pub const MODIFIED_AT: &str = "MODIFIED_AT";
    pub const RELSRC: &str = "RELSRC";
    pub const RELDST: &str = "RELDST";
    pub const RELPOS_SRC: &str = "RELPOS_SRC";
    pub const RELPOS_DST: &str = "RELPOS_DST";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub pk: PrimaryKey,
    pub type_id: Id,
    pub mandator: Id,
    pub acl: Id,
    pub step: Id,
    pub active: bool,
    pub main_language: LanguageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationInfo>,
    pub lifecycle: LifeCycleInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_binary: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_version: Option<i32>,
    data: DataTree,
}

fn not_found(path: &str) -> Error {
    Error::not_found(Message::new("ex.content.xpath.notFound").arg(path).xpath(path))
}

impl Content {
    /// Empty instance of `type_id` with default occurrences of every enabled root assignment.
    pub fn initialize(
        env: &Environment,
        type_id: Id,
        mandator: Id,
        acl: Id,
        step: Id,
        main_language: LanguageId,
        creator: Id,
    ) -> Result<Self> {
        env.content_type(type_id)?;
        let mut content = Self {
            pk: PrimaryKey::new_instance(),
            type_id,
            mandator,
            acl,
            step,
            active: true,
            main_language,
            relation: None,
            lifecycle: LifeCycleInfo::created_by(creator),
            preview_binary: None,
            max_version: None,
            live_version: None,
            data: DataTree::new(),
        };
        let root = content.data.root();
        let mut pos = 0;
        for assignment in env.root_assignments(type_id, false) {
            for index in 1..=assignment.default_multiplicity {
                content.create_empty_data(env, assignment, root, index, pos)?;
                pos += 1;
            }
        }
        content.init_system_properties()?;
        Ok(content)
    }

    pub fn data(&self) -> &DataTree {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut DataTree {
        &mut self.data
    }

    pub fn root(&self) -> NodeId {
        self.data.root()
    }

    pub fn node(&self, id: NodeId) -> Result<&DataNode> {
        self.data.node(id)
    }

    pub fn xpath_full(&self, id: NodeId) -> Result<String> {
        self.data.xpath_full(id)
    }

    /// Build the data node for `assignment` (and default children for groups).
    fn create_empty_data(
        &mut self,
        env: &Environment,
        assignment: &Assignment,
        parent: NodeId,
        index: u32,
        pos: i32,
    ) -> Result<NodeId> {
        let kind = match &assignment.kind {
            AssignmentKind::Property {
                property_id,
                default_value,
                ..
            } => {
                let property = env.property(*property_id)?;
                let mut value = FieldValue::empty(property.data_type, property.multilingual);
                value.default_language = self.main_language;
                let default = default_value.as_ref().or(property.default_value.as_ref());
                if let (Some(default), false) = (default, assignment.is_system_internal()) {
                    value.set_translation(self.main_language, default.clone())?;
                }
                DataKind::Property {
                    property_id: *property_id,
                    value,
                    max_length: assignment.max_length().or_else(|| property.max_length()),
                }
            }
            AssignmentKind::Group { mode, .. } => DataKind::Group {
                mode: *mode,
                children: Vec::new(),
            },
        };
        let node = DataNode {
            alias: assignment.alias.clone(),
            index,
            assignment_id: assignment.id,
            multiplicity: assignment.multiplicity,
            pos,
            parent: None,
            system_internal: assignment.is_system_internal(),
            kind,
        };
        let id = self.data.insert(node);
        self.data.attach(parent, id)?;

        if assignment.group_mode() == Some(GroupMode::AnyOf) {
            let mut child_pos = 0;
            for child in env.sub_assignments(assignment.id, false) {
                for child_index in 1..=child.default_multiplicity {
                    self.create_empty_data(env, child, id, child_index, child_pos)?;
                    child_pos += 1;
                }
            }
        }
        Ok(id)
    }

    /// Node addressed exactly by `path`; `/` is the root.
    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        let mut current = self.data.root();
        for element in xpath::split(path)? {
            if self.data.node(current)?.is_property() {
                return Err(Error::invalid(
                    Message::new("ex.xpath.element.noGroup").arg(path).xpath(path),
                ));
            }
            current = self
                .data
                .find_child(current, &element)?
                .ok_or_else(|| not_found(path))?;
        }
        Ok(current)
    }

    /// A property yields itself, a group its children.
    pub fn get_data(&self, path: &str) -> Result<Vec<NodeId>> {
        let node = self.resolve(path)?;
        if self.data.node(node)?.is_property() {
            Ok(vec![node])
        } else {
            self.data.children(node)
        }
    }

    pub fn get_group_data(&self, path: &str) -> Result<NodeId> {
        let node = self.resolve(path)?;
        if self.data.node(node)?.is_property() {
            return Err(Error::invalid(
                Message::new("ex.xpath.element.noGroup").arg(path).xpath(path),
            ));
        }
        Ok(node)
    }

    pub fn get_property_data(&self, path: &str) -> Result<NodeId> {
        let node = self.resolve(path)?;
        if !self.data.node(node)?.is_property() {
            return Err(Error::invalid(
                Message::new("ex.xpath.element.noProperty").arg(path).xpath(path),
            ));
        }
        Ok(node)
    }

    pub fn contains_xpath(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    /// Make sure every node on `path` exists, filling lower indices first.
    pub fn create_xpath(&mut self, env: &Environment, path: &str) -> Result<NodeId> {
        let elements = xpath::split(path)?;
        if elements.is_empty() {
            return Ok(self.data.root());
        }
        if !env.is_valid_xpath(self.type_id, path) {
            return Err(Error::invalid(
                Message::new("ex.content.xpath.undefined")
                    .arg(path)
                    .arg(self.type_id)
                    .xpath(path),
            ));
        }

        let last = elements.len() - 1;
        let mut current = self.data.root();
        for (i, element) in elements.iter().enumerate() {
            if let Some(existing) = self.data.find_child(current, element)? {
                if i < last && self.data.node(existing)?.is_property() {
                    return Err(Error::invalid(
                        Message::new("ex.xpath.element.noGroup").arg(path).xpath(path),
                    ));
                }
                current = existing;
                continue;
            }
            let prefix = xpath::build(&elements[..=i], false);
            let assignment_id = env.assignment_by_xpath(self.type_id, &prefix)?.id;
            for index in 1..element.index {
                let lower = XPathElement::new(&element.alias, index, true);
                if self.data.find_child(current, &lower)?.is_none() {
                    self.add_empty_child(env, current, assignment_id, index, InsertPosition::Bottom)?;
                }
            }
            current =
                self.add_empty_child(env, current, assignment_id, element.index, InsertPosition::Bottom)?;
        }
        Ok(current)
    }

    fn system_internal_children(&self, group: NodeId) -> Result<i32> {
        let mut count = 0;
        for child in self.data.children(group)? {
            if self.data.node(child)?.system_internal {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Lowest position a non-system-internal child of `group` may take.
    fn reserved_positions(&self, group: NodeId, system_internal: bool) -> Result<i32> {
        if system_internal || !self.data.is_root(group) {
            return Ok(0);
        }
        self.system_internal_children(group)
    }

    fn shift_positions_from(&mut self, group: NodeId, from: i32) -> Result<()> {
        for child in self.data.children(group)? {
            let node = self.data.node_mut(child)?;
            if !node.system_internal && node.pos >= from {
                node.pos += 1;
            }
        }
        Ok(())
    }

    /// Add an empty occurrence `index` of `assignment_id` below `group`.
    pub fn add_empty_child(
        &mut self,
        env: &Environment,
        group: NodeId,
        assignment_id: Id,
        index: u32,
        position: InsertPosition,
    ) -> Result<NodeId> {
        let assignment = env.assignment(assignment_id)?.clone();
        let group_path = self.data.xpath_full(group)?;
        if !assignment.enabled {
            return Err(Error::invalid(
                Message::new("ex.content.xpath.assignment.disabled")
                    .arg(&assignment.xpath)
                    .xpath(&group_path),
            ));
        }
        let group_node = self.data.node(group)?;
        if group_node.is_property() {
            return Err(Error::invalid(
                Message::new("ex.xpath.element.noGroup").arg(&group_path).xpath(&group_path),
            ));
        }
        if group_node.group_mode() == Some(GroupMode::OneOf) {
            for child in group_node.children() {
                if self.data.node(*child)?.assignment_id != assignment_id {
                    return Err(Error::create(
                        Message::new("ex.content.xpath.group.oneof")
                            .arg(&assignment.xpath)
                            .xpath(&group_path),
                    ));
                }
            }
        }
        if !assignment.multiplicity.is_valid_index(index) {
            return Err(Error::invalid(
                Message::new("ex.content.xpath.index.invalid")
                    .arg(index)
                    .arg(assignment.multiplicity)
                    .xpath(&group_path),
            ));
        }
        let element = XPathElement::new(&assignment.alias, index, true);
        if self.data.find_child(group, &element)?.is_some() {
            return Err(Error::invalid(
                Message::new("ex.content.xpath.index.exists")
                    .arg(&element)
                    .xpath(&group_path),
            ));
        }
        let existing = self.data.children_with_assignment(group, assignment_id)?.len() as u32;
        if assignment.multiplicity.max.map_or(false, |max| existing >= max) {
            return Err(Error::create(
                Message::new("ex.content.data.create.maxMultiplicity")
                    .arg(&assignment.xpath)
                    .arg(assignment.multiplicity)
                    .xpath(&group_path),
            ));
        }

        let reserved = self.reserved_positions(group, assignment.is_system_internal())?;
        let pos = match position {
            InsertPosition::Bottom => self.next_position(group)?,
            InsertPosition::Top => reserved,
            InsertPosition::At(p) => p.max(reserved),
        };
        if position != InsertPosition::Bottom {
            self.shift_positions_from(group, pos)?;
        }
        let id = self.create_empty_data(env, &assignment, group, index, pos)?;
        self.data.compact_positions(group, false)?;
        Ok(id)
    }

    fn next_position(&self, group: NodeId) -> Result<i32> {
        let mut max = -1;
        for child in self.data.children(group)? {
            max = max.max(self.data.node(child)?.pos);
        }
        Ok(max + 1)
    }

    /// How many more occurrences of this node's assignment may be created.
    pub fn creatable_elements(&self, node: NodeId) -> Result<u32> {
        let n = self.data.node(node)?;
        if n.parent.is_none() || n.multiplicity.is_single() {
            return Ok(0);
        }
        match n.multiplicity.max {
            None => Ok(u32::MAX),
            Some(max) => {
                let count = self.data.same_assignment_siblings(node)?.len() as u32;
                Ok(max.saturating_sub(count))
            }
        }
    }

    /// How many occurrences of this node's assignment may still be removed.
    pub fn removable_elements(&self, node: NodeId) -> Result<u32> {
        let n = self.data.node(node)?;
        if n.is_protected() {
            return Ok(0);
        }
        let mut count = 0u32;
        for sibling in self.data.same_assignment_siblings(node)? {
            let s = self.data.node(sibling)?;
            if s.alias == system_alias::ACL || !s.system_internal {
                count += 1;
            }
        }
        Ok(count.saturating_sub(n.multiplicity.min))
    }

    pub fn is_removable(&self, node: NodeId) -> Result<bool> {
        Ok(self.removable_elements(node)? > 0)
    }

    /// Insert a new sibling occurrence of `node`'s assignment.
    pub fn create_new(
        &mut self,
        env: &Environment,
        node: NodeId,
        position: InsertPosition,
    ) -> Result<NodeId> {
        let path = self.data.xpath_full(node)?;
        let n = self.data.node(node)?;
        let parent = n.parent.ok_or_else(|| {
            Error::create(Message::new("ex.content.data.create.root").xpath(&path))
        })?;
        let (assignment_id, multiplicity, system_internal) =
            (n.assignment_id, n.multiplicity, n.system_internal);
        if self.creatable_elements(node)? == 0 {
            return Err(Error::create(
                Message::new("ex.content.data.create.maxMultiplicity")
                    .arg(&path)
                    .arg(multiplicity)
                    .xpath(&path),
            ));
        }

        let reserved = self.reserved_positions(parent, system_internal)?;
        let insert_pos = match position {
            InsertPosition::Bottom => self.next_position(parent)?,
            InsertPosition::Top => 0,
            InsertPosition::At(p) => p.max(0),
        }
        .max(reserved);
        let mut new_index = 0;
        for sibling in self.data.same_assignment_siblings(node)? {
            new_index = new_index.max(self.data.node(sibling)?.index);
        }
        self.shift_positions_from(parent, insert_pos)?;

        let assignment = env.assignment(assignment_id)?.clone();
        let id = self.create_empty_data(env, &assignment, parent, new_index + 1, insert_pos)?;
        if position != InsertPosition::Top {
            self.data.compact(id)?;
        }
        Ok(id)
    }

    /// Remove `node` from `group` if its multiplicity allows it.
    pub fn remove_child(&mut self, group: NodeId, node: NodeId) -> Result<()> {
        if !self.data.node(group)?.children().contains(&node) {
            return Err(Error::invalid(
                Message::new("ex.content.xpath.remove.notFound").arg(node),
            ));
        }
        let path = self.data.xpath_full(node)?;
        if !self.is_removable(node)? {
            return Err(Error::no_access(
                Message::new("ex.content.xpath.remove.invalid").arg(&path).xpath(&path),
            ));
        }
        let assignment = self.data.node(node)?.assignment_id;
        self.data.remove_subtree(node)?;
        self.data.compact_assignment(group, assignment)
    }

    /// Remove the node at `path`; without an index on the last element every occurrence goes.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let last = xpath::last_element(path)?;
        let parent = self.get_group_data(&xpath::strip_last_element(path)?)?;
        if last.index_defined {
            let node = self
                .data
                .find_child(parent, &last)?
                .ok_or_else(|| not_found(path))?;
            return self.remove_child(parent, node);
        }

        let mut targets = Vec::new();
        for child in self.data.children(parent)? {
            if self.data.node(child)?.alias == last.alias {
                targets.push(child);
            }
        }
        let first = *targets.first().ok_or_else(|| not_found(path))?;
        if (self.removable_elements(first)? as usize) < targets.len() {
            return Err(Error::no_access(
                Message::new("ex.content.xpath.remove.invalid").arg(path).xpath(path),
            ));
        }
        for target in targets {
            self.remove_child(parent, target)?;
        }
        Ok(())
    }

    /// Move a child of `group` by `delta` slots, clamped to the sibling range.
    pub fn move_child(&mut self, group: NodeId, element: &XPathElement, delta: i32) -> Result<()> {
        let mut children = self.data.children(group)?;
        if delta == 0 || children.len() < 2 {
            return Ok(());
        }
        let mut from = None;
        for (i, child) in children.iter().enumerate() {
            let node = self.data.node(*child)?;
            if node.alias == element.alias && node.index == element.index {
                from = Some(i);
                break;
            }
        }
        let from = from.ok_or_else(|| {
            Error::not_found(Message::new("ex.content.xpath.notFound").arg(element))
        })?;
        let target = (from as i64 + delta as i64).clamp(0, children.len() as i64 - 1) as usize;
        if target == from {
            return Ok(());
        }
        let moved = children.remove(from);
        children.insert(target, moved);

        let mut assignments = Vec::new();
        for child in &children {
            assignments.push(self.data.node(*child)?.assignment_id);
        }
        self.data.set_children(group, children)?;
        self.data.compact_positions(group, false)?;
        for assignment in assignments.into_iter().unique() {
            self.data.compact_assignment(group, assignment)?;
        }
        Ok(())
    }

    /// Content-level move of the node at `path`.
    pub fn move_data(&mut self, path: &str, delta: i32) -> Result<()> {
        let group = self.get_group_data(&xpath::strip_last_element(path)?)?;
        let element = xpath::last_element(path)?;
        self.move_child(group, &element, delta)
    }

    /// Swap the index (and slot) of `node` with a same-assignment sibling `delta` steps away.
    pub fn move_index(&mut self, node: NodeId, delta: i32) -> Result<()> {
        let siblings = self.data.same_assignment_siblings(node)?;
        if delta == 0 || siblings.len() < 2 {
            return Ok(());
        }
        let from = siblings.iter().position(|s| *s == node).unwrap_or(0);
        let target = (from as i64 + delta as i64).clamp(0, siblings.len() as i64 - 1) as usize;
        if target == from {
            return Ok(());
        }
        let other = siblings[target];
        let (a_pos, a_index) = {
            let a = self.data.node(node)?;
            (a.pos, a.index)
        };
        let (b_pos, b_index) = {
            let b = self.data.node(other)?;
            (b.pos, b.index)
        };
        {
            let a = self.data.node_mut(node)?;
            a.pos = b_pos;
            a.index = b_index;
        }
        {
            let b = self.data.node_mut(other)?;
            b.pos = a_pos;
            b.index = a_index;
        }
        if let Some(parent) = self.data.parent(node)? {
            self.data.sort_children(parent)?;
        }
        Ok(())
    }

    fn check_settable(&self, node: NodeId, value: &FieldValue) -> Result<()> {
        let path = self.data.xpath_full(node)?;
        let n = self.data.node(node)?;
        let current = n.value().ok_or_else(|| {
            Error::invalid(Message::new("ex.xpath.element.noProperty").arg(&path).xpath(&path))
        })?;
        if n.system_internal {
            return Err(Error::invalid(
                Message::new("ex.content.value.systemInternal").arg(&path).xpath(&path),
            ));
        }
        if let Some(parent) = n.parent {
            let parent_node = self.data.node(parent)?;
            if parent_node.group_mode() == Some(GroupMode::OneOf) {
                for sibling in parent_node.children() {
                    let s = self.data.node(*sibling)?;
                    if s.assignment_id != n.assignment_id && !self.data.is_empty(*sibling)? {
                        return Err(Error::invalid(
                            Message::new("ex.content.xpath.group.oneof").arg(&path).xpath(&path),
                        ));
                    }
                }
            }
        }
        if current.is_no_access() {
            return Err(Error::no_access(
                Message::new("ex.content.value.noAccess").arg(&path).xpath(&path),
            ));
        }
        if current.is_read_only() {
            return Err(Error::no_access(
                Message::new("ex.content.value.readOnly").arg(&path).xpath(&path),
            ));
        }
        if value.data_type != current.data_type {
            return Err(Error::invalid(
                Message::new("ex.content.value.invalid.type")
                    .arg(format!("{:?}", value.data_type))
                    .arg(format!("{:?}", current.data_type))
                    .xpath(&path),
            ));
        }
        if value.multilingual != current.multilingual {
            return Err(Error::invalid(
                Message::new("ex.content.value.invalid.multilanguage").arg(&path).xpath(&path),
            ));
        }
        for translation in value.translations.values() {
            crate::model::value::check_type(value.data_type, translation)
                .map_err(|e| e.at_xpath(&path))?;
        }
        Ok(())
    }

    fn store_value(&mut self, node: NodeId, value: FieldValue) -> Result<()> {
        match &mut self.data.node_mut(node)?.kind {
            DataKind::Property { value: slot, .. } => {
                *slot = value;
                Ok(())
            }
            DataKind::Group { .. } => Err(Error::invalid(
                Message::new("ex.xpath.element.noProperty").arg(node),
            )),
        }
    }

    /// Set the value at `path`, creating missing nodes on the way.
    pub fn set_value(&mut self, env: &Environment, path: &str, value: FieldValue) -> Result<NodeId> {
        let node = self.create_xpath(env, path)?;
        self.check_settable(node, &value)?;
        self.store_value(node, value)?;
        Ok(node)
    }

    /// Set the main-language translation at `path` from a JSON scalar.
    pub fn set_json(&mut self, env: &Environment, path: &str, json: JsonValue) -> Result<NodeId> {
        let node = self.create_xpath(env, path)?;
        let mut value = self
            .data
            .node(node)?
            .value()
            .cloned()
            .ok_or_else(|| {
                Error::invalid(Message::new("ex.xpath.element.noProperty").arg(path).xpath(path))
            })?;
        value
            .set_translation(self.main_language, json)
            .map_err(|e| e.at_xpath(path))?;
        self.check_settable(node, &value)?;
        self.store_value(node, value)?;
        Ok(node)
    }

    pub fn value(&self, path: &str) -> Result<&FieldValue> {
        let node = self.get_property_data(path)?;
        self.data
            .node(node)?
            .value()
            .ok_or_else(|| not_found(path))
    }

    /// Values of every occurrence matching `path` regardless of indices.
    pub fn values(&self, path: &str) -> Result<Vec<&FieldValue>> {
        let target = xpath::to_xpath_no_mult(path)?;
        let mut out = Vec::new();
        for id in self.data.descendants(self.data.root())? {
            let node = self.data.node(id)?;
            if let Some(value) = node.value() {
                if self.data.xpath(id)? == target {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn value_mut(&mut self, node: NodeId) -> Result<&mut FieldValue> {
        match &mut self.data.node_mut(node)?.kind {
            DataKind::Property { value, .. } => Ok(value),
            DataKind::Group { .. } => Err(Error::invalid(
                Message::new("ex.xpath.element.noProperty").arg(node),
            )),
        }
    }

    /// Every property node in document order.
    pub fn property_nodes(&self) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        for id in self.data.descendants(self.data.root())? {
            if self.data.node(id)?.is_property() {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Check required occurrences and maximum lengths of the whole tree.
    pub fn check_validity(&self) -> Result<()> {
        self.check_group_validity(self.data.root())
    }

    fn check_group_validity(&self, group: NodeId) -> Result<()> {
        for child in self.data.children(group)? {
            let node = self.data.node(child)?;
            if node.is_group() {
                if node.multiplicity.is_optional() && self.data.is_empty(child)? {
                    continue;
                }
                self.check_group_validity(child)?;
            } else {
                self.check_required(child)?;
                self.check_max_length(child)?;
            }
        }
        Ok(())
    }

    fn check_required(&self, node: NodeId) -> Result<()> {
        let n = self.data.node(node)?;
        if !n.multiplicity.is_required() {
            return Ok(());
        }
        let mut filled = 0;
        for sibling in self.data.same_assignment_siblings(node)? {
            if !self.data.is_empty(sibling)? {
                filled += 1;
            }
        }
        if filled < n.multiplicity.min {
            let path = self.data.xpath_full(node)?;
            return Err(Error::invalid(
                Message::new("ex.content.required.missing")
                    .arg(&path)
                    .arg(n.multiplicity)
                    .xpath(&path),
            ));
        }
        Ok(())
    }

    fn check_max_length(&self, node: NodeId) -> Result<()> {
        let n = self.data.node(node)?;
        if let DataKind::Property {
            value,
            max_length: Some(max),
            ..
        } = &n.kind
        {
            if value.data_type.is_textual() && value.max_text_length() > *max {
                let path = self.data.xpath_full(node)?;
                return Err(Error::invalid(
                    Message::new("ex.content.value.maxLength")
                        .arg(&path)
                        .arg(max)
                        .xpath(&path),
                ));
            }
        }
        Ok(())
    }

    /// XPaths of all nodes in document order; group paths get `group_postfix` appended.
    pub fn all_xpaths(&self, group_postfix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for id in self.data.descendants(self.data.root())? {
            let path = self.data.xpath_full(id)?;
            if self.data.node(id)?.is_group() {
                out.push(format!("{}{}", path, group_postfix));
            } else {
                out.push(path);
            }
        }
        Ok(out)
    }

    pub fn all_property_xpaths(&self) -> Result<Vec<String>> {
        self.property_nodes()?
            .into_iter()
            .map(|id| self.data.xpath_full(id))
            .collect()
    }

    /// Renumber positions and indices throughout the tree.
    pub fn compact(&mut self) -> Result<()> {
        self.compact_group(self.data.root())
    }

    fn compact_group(&mut self, group: NodeId) -> Result<()> {
        self.data.compact_positions(group, false)?;
        let children = self.data.children(group)?;
        let mut assignments = Vec::new();
        for child in &children {
            assignments.push(self.data.node(*child)?.assignment_id);
        }
        for assignment in assignments.into_iter().unique() {
            self.data.compact_assignment(group, assignment)?;
        }
        for child in children {
            if self.data.node(child)?.is_group() {
                self.compact_group(child)?;
            }
        }
        Ok(())
    }

    /// Drop empty nodes wherever their multiplicity allows it.
    pub fn remove_empty_entries(&mut self) -> Result<()> {
        self.remove_empty_in(self.data.root())
    }

    fn remove_empty_in(&mut self, group: NodeId) -> Result<()> {
        for child in self.data.children(group)? {
            if self.data.node(child)?.is_group() {
                self.remove_empty_in(child)?;
            }
        }
        for child in self.data.children(group)? {
            if self.data.is_empty(child)? && self.is_removable(child)? {
                self.remove_child(group, child)?;
            }
        }
        Ok(())
    }

    /// Assignment ids that could still get another occurrence below `group`.
    pub fn creatable_children(&self, env: &Environment, group: NodeId) -> Result<Vec<Id>> {
        let node = self.data.node(group)?;
        let parent_assignment = if self.data.is_root(group) {
            None
        } else {
            Some(node.assignment_id)
        };
        let mut present = Vec::new();
        for child in node.children() {
            if !self.data.is_empty(*child)? {
                present.push(self.data.node(*child)?.assignment_id);
            }
        }
        let one_of = node.group_mode() == Some(GroupMode::OneOf);

        let mut out = Vec::new();
        for candidate in env.children_of(self.type_id, parent_assignment, false) {
            if candidate.is_system_internal() {
                continue;
            }
            if one_of && !present.is_empty() && !present.contains(&candidate.id) {
                continue;
            }
            let count = self.data.children_with_assignment(group, candidate.id)?.len() as u32;
            if candidate.multiplicity.max.map_or(true, |max| count < max) {
                out.push(candidate.id);
            }
        }
        Ok(out)
    }

    /// Create one occurrence of every assignment that has none yet, recursively.
    pub fn explode(&mut self, env: &Environment) -> Result<()> {
        self.explode_group(env, self.data.root())
    }

    fn explode_group(&mut self, env: &Environment, group: NodeId) -> Result<()> {
        let one_of = self.data.node(group)?.group_mode() == Some(GroupMode::OneOf);
        for assignment_id in self.creatable_children(env, group)? {
            if !self.data.children_with_assignment(group, assignment_id)?.is_empty() {
                continue;
            }
            if one_of && !self.data.children(group)?.is_empty() {
                break;
            }
            self.add_empty_child(env, group, assignment_id, 1, InsertPosition::Bottom)?;
        }
        for child in self.data.children(group)? {
            if self.data.node(child)?.is_group() {
                self.explode_group(env, child)?;
            }
        }
        Ok(())
    }

    /// Fill the instance with random occurrences and values.
    pub fn randomize<R: Rng>(&mut self, env: &Environment, rng: &mut R, max_multiplicity: u32) -> Result<()> {
        self.randomize_group(env, self.data.root(), rng, max_multiplicity.max(1))
    }

    fn randomize_group<R: Rng>(
        &mut self,
        env: &Environment,
        group: NodeId,
        rng: &mut R,
        cap: u32,
    ) -> Result<()> {
        let node = self.data.node(group)?;
        let parent_assignment = if self.data.is_root(group) {
            None
        } else {
            Some(node.assignment_id)
        };
        let one_of = node.group_mode() == Some(GroupMode::OneOf);
        let candidates: Vec<Assignment> = env
            .children_of(self.type_id, parent_assignment, false)
            .into_iter()
            .filter(|a| !a.is_system_internal())
            .cloned()
            .collect();

        for (i, assignment) in candidates.iter().enumerate() {
            if one_of && i > 0 {
                break;
            }
            let upper = assignment.multiplicity.max.unwrap_or(cap).min(cap);
            let lower = assignment.multiplicity.min.max(1).min(upper);
            let target = rng.random_range(lower..=upper);
            let mut count = self.data.children_with_assignment(group, assignment.id)?.len() as u32;
            while count < target {
                self.add_empty_child(env, group, assignment.id, count + 1, InsertPosition::Bottom)?;
                count += 1;
            }
        }

        for child in self.data.children(group)? {
            let n = self.data.node(child)?;
            if n.system_internal {
                continue;
            }
            match &n.kind {
                DataKind::Property { value, .. } => {
                    let random = FieldValue::random(value.data_type, value.multilingual, rng);
                    self.store_value(child, random)?;
                }
                DataKind::Group { .. } => self.randomize_group(env, child, rng, cap)?,
            }
        }
        Ok(())
    }

    fn set_system_value(&mut self, alias: &str, value: Option<JsonValue>) -> Result<()> {
        let root = self.data.root();
        let Some(node) = self
            .data
            .find_child(root, &XPathElement::new(alias, 1, true))?
        else {
            return Ok(());
        };
        if !self.data.node(node)?.system_internal {
            return Ok(());
        }
        let language = self.main_language;
        let slot = self.value_mut(node)?;
        slot.set_translation(language, value.unwrap_or(JsonValue::Null))
    }

    /// Mirror the header fields into the system-internal root properties.
    pub fn init_system_properties(&mut self) -> Result<()> {
        use system_alias::*;

        let version = match self.pk.version {
            Version::Number(n) => n,
            _ => self.max_version.unwrap_or(1),
        };
        let is_max = self.max_version.map_or(true, |max| max == version);
        let is_live = self.live_version == Some(version);
        let relation = self.relation;
        let lifecycle = self.lifecycle.clone();

        self.set_system_value(ID, Some(json!(self.pk.id)))?;
        self.set_system_value(VERSION, Some(json!(version)))?;
        self.set_system_value(TYPEDEF, Some(json!(self.type_id)))?;
        self.set_system_value(MANDATOR, Some(json!(self.mandator)))?;
        self.set_system_value(ACL, Some(json!(self.acl)))?;
        self.set_system_value(STEP, Some(json!(self.step)))?;
        self.set_system_value(MAX_VER, self.max_version.map(|v| json!(v)))?;
        self.set_system_value(LIVE_VER, self.live_version.map(|v| json!(v)))?;
        self.set_system_value(ISMAX_VER, Some(json!(is_max)))?;
        self.set_system_value(ISLIVE_VER, Some(json!(is_live)))?;
        self.set_system_value(ISACTIVE, Some(json!(self.active)))?;
        self.set_system_value(MAINLANG, Some(json!(self.main_language)))?;
        self.set_system_value(CREATED_BY, Some(json!(lifecycle.creator_id)))?;
        self.set_system_value(CREATED_AT, Some(json!(lifecycle.created_at.to_rfc3339())))?;
        self.set_system_value(MODIFIED_BY, Some(json!(lifecycle.modifier_id)))?;
        self.set_system_value(MODIFIED_AT, Some(json!(lifecycle.modified_at.to_rfc3339())))?;
        self.set_system_value(RELSRC, relation.map(|r| json!(r.source.to_string())))?;
        self.set_system_value(RELDST, relation.map(|r| json!(r.destination.to_string())))?;
        self.set_system_value(RELPOS_SRC, relation.map(|r| json!(r.source_position)))?;
        self.set_system_value(RELPOS_DST, relation.map(|r| json!(r.destination_position)))?;
        Ok(())
    }

    /// Deep copy that will be saved as a brand-new instance.
    pub fn copy_as_new_instance(&self) -> Result<Self> {
        let mut copy = self.clone();
        copy.pk = PrimaryKey::new_instance();
        copy.max_version = None;
        copy.live_version = None;
        copy.init_system_properties()?;
        Ok(copy)
    }

    /// Binary ids referenced by binary-typed values.
    pub fn binary_ids(&self) -> Result<Vec<Id>> {
        let mut out = Vec::new();
        for id in self.property_nodes()? {
            if let Some(value) = self.data.node(id)?.value() {
                if value.data_type == crate::model::common::DataType::Binary {
                    out.extend(value.translations.values().filter_map(JsonValue::as_i64));
                }
            }
        }
        Ok(out)
    }
}

/// Equal keys and lifecycle, and no difference according to the delta engine.
impl PartialEq for Content {
    fn eq(&self, other: &Self) -> bool {
        self.pk == other.pk
            && self.active == other.active
            && self.relation == other.relation
            && self.lifecycle == other.lifecycle
            && crate::logic::delta::DeltaEngine::process(self, other)
                .map(|delta| !delta.changes())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Multiplicity, NewContentType, NewGroup, NewProperty, UserContext};
    use crate::repository::Repository;
    use crate::store::MemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// ARTICLE with a required TITLE and an optional AUTHOR[0..3]/NAME group.
    fn article() -> (Repository<MemoryStore>, Id) {
        let repo = Repository::in_memory().unwrap();
        let system = UserContext::system();
        let ids = *repo.system();
        let type_id = repo
            .structure
            .create_type(&system, &NewContentType::new("ARTICLE", ids.structure_acl, ids.workflow))
            .unwrap();
        repo.structure
            .create_property(
                &system,
                type_id,
                &NewProperty::new("TITLE", DataType::String, Multiplicity::ONE, ids.structure_acl),
                "/",
                None,
            )
            .unwrap();
        repo.structure
            .create_group(
                &system,
                type_id,
                &NewGroup::new("AUTHOR", Multiplicity::new(0, Some(3)).unwrap()),
                "/",
                None,
            )
            .unwrap();
        repo.structure
            .create_property(
                &system,
                type_id,
                &NewProperty::new("NAME", DataType::String, Multiplicity::ZERO_OR_ONE, ids.structure_acl),
                "/AUTHOR",
                None,
            )
            .unwrap();
        (repo, type_id)
    }

    fn new_content(repo: &Repository<MemoryStore>, type_id: Id) -> Content {
        let ids = repo.system();
        Content::initialize(&repo.environment(), type_id, 1, ids.instance_acl, ids.default_step, 1, 7).unwrap()
    }

    #[test]
    fn test_initialize_builds_default_occurrences() {
        let (repo, type_id) = article();
        let content = new_content(&repo, type_id);

        assert!(content.contains_xpath("/TITLE"));
        assert!(content.contains_xpath("/AUTHOR[1]/NAME[1]"));
        assert_eq!(content.value("/TYPEDEF").unwrap().default_translation(), Some(&json!(type_id)));
        assert_eq!(content.value("/CREATED_BY").unwrap().default_translation(), Some(&json!(7)));

        // system-internal nodes come first at the root
        let title = content.get_property_data("/TITLE").unwrap();
        assert_eq!(content.node(title).unwrap().pos, 20);
    }

    #[test]
    fn test_validity_requires_title() {
        let (repo, type_id) = article();
        let mut content = new_content(&repo, type_id);

        let err = content.check_validity().unwrap_err();
        assert_eq!(err.key(), "ex.content.required.missing");
        assert_eq!(err.xpath(), Some("/TITLE[1]"));

        content.set_json(&repo.environment(), "/TITLE", json!("Hello")).unwrap();
        content.check_validity().unwrap();
    }

    #[test]
    fn test_system_values_are_read_only() {
        let (repo, type_id) = article();
        let mut content = new_content(&repo, type_id);
        let err = content.set_json(&repo.environment(), "/ID", json!(5)).unwrap_err();
        assert_eq!(err.key(), "ex.content.value.systemInternal");
    }

    #[test]
    fn test_remove_respects_minimum_multiplicity() {
        let (repo, type_id) = article();
        let mut content = new_content(&repo, type_id);

        assert!(content.remove("/TITLE").is_err());
        assert!(content.remove("/ID").is_err());
        content.remove("/AUTHOR[1]").unwrap();
        assert!(!content.contains_xpath("/AUTHOR[1]"));
    }

    #[test]
    fn test_create_xpath_fills_lower_indices() {
        let (repo, type_id) = article();
        let env = repo.environment();
        let mut content = new_content(&repo, type_id);

        content.create_xpath(&env, "/AUTHOR[3]/NAME").unwrap();
        assert!(content.contains_xpath("/AUTHOR[2]/NAME"));
        assert!(content.contains_xpath("/AUTHOR[3]/NAME"));

        let err = content.create_xpath(&env, "/AUTHOR[4]").unwrap_err();
        assert_eq!(err.key(), "ex.content.xpath.index.invalid");
        let err = content.create_xpath(&env, "/NOPE").unwrap_err();
        assert_eq!(err.key(), "ex.content.xpath.undefined");
    }

    #[test]
    fn test_move_renumbers_indices() {
        let (repo, type_id) = article();
        let env = repo.environment();
        let mut content = new_content(&repo, type_id);
        content.set_json(&env, "/AUTHOR[1]/NAME", json!("first")).unwrap();
        content.set_json(&env, "/AUTHOR[2]/NAME", json!("second")).unwrap();

        content.move_data("/AUTHOR[2]", -1).unwrap();
        assert_eq!(
            content.value("/AUTHOR[1]/NAME").unwrap().default_translation(),
            Some(&json!("second"))
        );
        assert_eq!(
            content.value("/AUTHOR[2]/NAME").unwrap().default_translation(),
            Some(&json!("first"))
        );
    }

    #[test]
    fn test_remove_empty_entries_keeps_required_nodes() {
        let (repo, type_id) = article();
        let mut content = new_content(&repo, type_id);
        content.remove_empty_entries().unwrap();

        assert!(content.contains_xpath("/TITLE"));
        assert!(content.contains_xpath("/MAX_VER"));
        assert!(!content.contains_xpath("/AUTHOR[1]"));
    }

    #[test]
    fn test_randomized_content_is_valid_and_copyable() {
        let (repo, type_id) = article();
        let env = repo.environment();
        let mut content = new_content(&repo, type_id);
        content.randomize(&env, &mut StdRng::seed_from_u64(42), 3).unwrap();
        content.check_validity().unwrap();

        let copy = content.copy_as_new_instance().unwrap();
        assert!(copy.pk.is_new());
        assert_eq!(copy.value("/TITLE").unwrap(), content.value("/TITLE").unwrap());
    }
}
