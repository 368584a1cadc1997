use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Message, Result};
use crate::model::common::{
    find_option, DataType, GroupMode, Id, Label, LanguageId, Multiplicity, StructureOption,
    UniqueMode,
};
use crate::model::security::PermissionMask;
use crate::model::xpath;

/// Reusable attribute definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: Id,
    pub name: String,
    pub data_type: DataType,
    pub multiplicity: Multiplicity,
    /// Whether assignments may narrow or widen `multiplicity`
    pub may_override_multiplicity: bool,
    pub acl: Id,
    pub may_override_acl: bool,
    pub fulltext: bool,
    pub multilingual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_type: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_list: Option<Id>,
    #[serde(default)]
    pub unique_mode: UniqueMode,
    #[serde(default)]
    pub system_internal: bool,
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub hint: Label,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub options: Vec<StructureOption>,
}

/// Input for `createProperty`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProperty {
    pub name: String,
    pub data_type: DataType,
    pub multiplicity: Multiplicity,
    #[serde(default = "default_true")]
    pub may_override_multiplicity: bool,
    /// Occurrences created for an empty instance; falls back to `max(min, 1)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_multiplicity: Option<u32>,
    pub acl: Id,
    #[serde(default = "default_true")]
    pub may_override_acl: bool,
    #[serde(default)]
    pub fulltext: bool,
    #[serde(default)]
    pub multilingual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_type: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_list: Option<Id>,
    #[serde(default)]
    pub unique_mode: UniqueMode,
    #[serde(default)]
    pub system_internal: bool,
    /// Retry the name with `_1`, `_2`, ... suffixes on a uniqueness conflict
    #[serde(default)]
    pub auto_unique_name: bool,
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub hint: Label,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub options: Vec<StructureOption>,
}

fn default_true() -> bool {
    true
}

impl NewProperty {
    pub fn new(name: &str, data_type: DataType, multiplicity: Multiplicity, acl: Id) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            multiplicity,
            may_override_multiplicity: true,
            default_multiplicity: None,
            acl,
            may_override_acl: true,
            fulltext: false,
            multilingual: false,
            referenced_type: None,
            referenced_list: None,
            unique_mode: UniqueMode::None,
            system_internal: false,
            auto_unique_name: false,
            label: Label::new(name),
            hint: Label::default(),
            default_value: None,
            options: Vec::new(),
        }
    }
}

impl Property {
    /// Build a Property from creation input; the name is stored upper-cased
    pub fn from_new(id: Id, name: &str, new: &NewProperty) -> Self {
        Self {
            id,
            name: name.to_uppercase(),
            data_type: new.data_type,
            multiplicity: new.multiplicity,
            may_override_multiplicity: new.may_override_multiplicity,
            acl: new.acl,
            may_override_acl: new.may_override_acl,
            fulltext: new.fulltext,
            multilingual: new.multilingual,
            referenced_type: new.referenced_type,
            referenced_list: new.referenced_list,
            unique_mode: new.unique_mode,
            system_internal: new.system_internal,
            label: new.label.clone(),
            hint: new.hint.clone(),
            default_value: new.default_value.clone(),
            options: new.options.clone(),
        }
    }

    pub fn max_length(&self) -> Option<usize> {
        max_length_option(&self.options)
    }
}

/// Reusable nesting construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Id,
    pub name: String,
    pub multiplicity: Multiplicity,
    pub may_override_multiplicity: bool,
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub hint: Label,
    #[serde(default)]
    pub options: Vec<StructureOption>,
}

/// Input for `createGroup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub multiplicity: Multiplicity,
    #[serde(default = "default_true")]
    pub may_override_multiplicity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_multiplicity: Option<u32>,
    #[serde(default)]
    pub mode: GroupMode,
    #[serde(default)]
    pub auto_unique_name: bool,
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub hint: Label,
    #[serde(default)]
    pub options: Vec<StructureOption>,
}

impl NewGroup {
    pub fn new(name: &str, multiplicity: Multiplicity) -> Self {
        Self {
            name: name.to_string(),
            multiplicity,
            may_override_multiplicity: true,
            default_multiplicity: None,
            mode: GroupMode::AnyOf,
            auto_unique_name: false,
            label: Label::new(name),
            hint: Label::default(),
            options: Vec::new(),
        }
    }
}

impl Group {
    pub fn from_new(id: Id, name: &str, new: &NewGroup) -> Self {
        Self {
            id,
            name: name.to_uppercase(),
            multiplicity: new.multiplicity,
            may_override_multiplicity: new.may_override_multiplicity,
            label: new.label.clone(),
            hint: new.hint.clone(),
            options: new.options.clone(),
        }
    }
}

/// Variant-specific part of an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignmentKind {
    Property {
        property_id: Id,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_value: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_language: Option<LanguageId>,
    },
    Group {
        group_id: Id,
        mode: GroupMode,
    },
}

/// Binding of one property or group to one XPath of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Id,
    pub type_id: Id,
    pub enabled: bool,
    pub multiplicity: Multiplicity,
    pub default_multiplicity: u32,
    pub position: i32,
    /// Full XPath including the type name, e.g. `DOCUMENT/ADDRESS/STREET`
    pub xpath: String,
    pub alias: String,
    /// Parent group assignment; `None` attaches to the type root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_group: Option<Id>,
    /// Assignment this one was inherited from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Id>,
    pub acl: Id,
    #[serde(default)]
    system_internal: bool,
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub hint: Label,
    #[serde(default)]
    pub options: Vec<StructureOption>,
    #[serde(flatten)]
    pub kind: AssignmentKind,
}

impl Assignment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Id,
        type_id: Id,
        type_name: &str,
        parent_xpath: &str,
        alias: &str,
        parent_group: Option<Id>,
        multiplicity: Multiplicity,
        acl: Id,
        kind: AssignmentKind,
    ) -> Result<Self> {
        let alias = alias.to_uppercase();
        let xpath = format!(
            "{}{}",
            type_name.to_uppercase(),
            xpath::child_of(parent_xpath, &alias)?
        );
        Ok(Self {
            id,
            type_id,
            enabled: true,
            multiplicity,
            default_multiplicity: multiplicity.default_count(None),
            position: 0,
            xpath,
            alias,
            parent_group,
            base: None,
            acl,
            system_internal: false,
            label: Label::default(),
            hint: Label::default(),
            options: Vec::new(),
            kind,
        })
    }

    pub fn is_property(&self) -> bool {
        matches!(self.kind, AssignmentKind::Property { .. })
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, AssignmentKind::Group { .. })
    }

    pub fn property_id(&self) -> Option<Id> {
        match self.kind {
            AssignmentKind::Property { property_id, .. } => Some(property_id),
            AssignmentKind::Group { .. } => None,
        }
    }

    pub fn group_id(&self) -> Option<Id> {
        match self.kind {
            AssignmentKind::Group { group_id, .. } => Some(group_id),
            AssignmentKind::Property { .. } => None,
        }
    }

    pub fn group_mode(&self) -> Option<GroupMode> {
        match self.kind {
            AssignmentKind::Group { mode, .. } => Some(mode),
            AssignmentKind::Property { .. } => None,
        }
    }

    pub fn is_derived(&self) -> bool {
        self.base.is_some()
    }

    pub fn is_system_internal(&self) -> bool {
        self.system_internal
    }

    /// One-way flag: may go from false to true, never back.
    pub fn set_system_internal(&mut self, value: bool) -> Result<()> {
        if self.system_internal && !value {
            return Err(Error::update(
                Message::new("ex.structure.systemInternal.unset").arg(&self.xpath),
            ));
        }
        self.system_internal = value;
        Ok(())
    }

    /// XPath without the type name (`/ADDRESS/STREET`).
    pub fn relative_xpath(&self) -> String {
        xpath::strip_type(&self.xpath)
    }

    pub fn is_root_attached(&self) -> bool {
        self.parent_group.is_none()
    }

    pub fn max_length(&self) -> Option<usize> {
        max_length_option(&self.options)
    }

    /// Copy of this assignment for another type, pointing back at it as base.
    pub fn derive_for(
        &self,
        id: Id,
        type_id: Id,
        type_name: &str,
        parent_group: Option<Id>,
    ) -> Self {
        let relative = self.relative_xpath();
        Self {
            id,
            type_id,
            xpath: format!("{}{}", type_name.to_uppercase(), relative),
            parent_group,
            base: Some(self.id),
            ..self.clone()
        }
    }
}

fn max_length_option(options: &[StructureOption]) -> Option<usize> {
    find_option(options, crate::model::common::OPTION_MAXLENGTH)
        .and_then(|o| o.value.parse().ok())
        .filter(|len: &usize| *len > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Hierarchical,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeCategory {
    User,
    System,
}

/// Whether instances are plain content or relations between two instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeMode {
    Content,
    Relation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageMode {
    Single,
    Multiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeState {
    Available,
    Locked,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPolicy {
    pub track_history: bool,
    /// Days to keep history entries; 0 keeps them forever
    pub history_age: u32,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            track_history: false,
            history_age: 0,
        }
    }
}

/// Allowed (source type, destination type) pair of a relation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRelation {
    pub source: Id,
    pub destination: Id,
    /// 0 is unlimited
    pub max_source: u32,
    /// 0 is unlimited
    pub max_destination: u32,
}

/// Schema root owning a set of assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentType {
    pub id: Id,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    pub storage_mode: StorageMode,
    pub category: TypeCategory,
    pub mode: TypeMode,
    pub language_mode: LanguageMode,
    pub state: TypeState,
    pub permissions: PermissionMask,
    #[serde(default)]
    pub history: HistoryPolicy,
    /// Negative is unlimited
    pub max_versions: i64,
    pub max_rel_source: u32,
    pub max_rel_destination: u32,
    pub acl: Id,
    pub workflow: Id,
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub relations: Vec<TypeRelation>,
    pub created_by: Id,
    pub created_at: DateTime<Utc>,
    pub updated_by: Id,
    pub updated_at: DateTime<Utc>,
}

/// Type definition input for creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContentType {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    pub mode: TypeMode,
    pub category: TypeCategory,
    pub language_mode: LanguageMode,
    pub permissions: PermissionMask,
    pub acl: Id,
    pub workflow: Id,
    #[serde(default = "default_max_versions")]
    pub max_versions: i64,
    #[serde(default)]
    pub history: HistoryPolicy,
    #[serde(default)]
    pub relations: Vec<TypeRelation>,
    #[serde(default)]
    pub max_rel_source: u32,
    #[serde(default)]
    pub max_rel_destination: u32,
    /// Whether assignments cloned from the parent start enabled
    #[serde(default = "default_true")]
    pub enable_parent_assignments: bool,
    #[serde(default)]
    pub label: Label,
}

fn default_max_versions() -> i64 {
    -1
}

impl NewContentType {
    pub fn new(name: &str, acl: Id, workflow: Id) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            mode: TypeMode::Content,
            category: TypeCategory::User,
            language_mode: LanguageMode::Multiple,
            permissions: PermissionMask::ALL,
            acl,
            workflow,
            max_versions: -1,
            history: HistoryPolicy::default(),
            relations: Vec::new(),
            max_rel_source: 0,
            max_rel_destination: 0,
            enable_parent_assignments: true,
            label: Label::new(name),
        }
    }

    pub fn with_parent(mut self, parent: Id) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Partial type update; every `Some` field is a requested change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentTypeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionMask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TypeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<TypeCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_mode: Option<LanguageMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_versions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rel_source: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rel_destination: Option<u32>,
    /// Replaces the entire relation list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<TypeRelation>>,
}

impl ContentType {
    /// Create a ContentType from NewContentType with audit information
    pub fn from_new(id: Id, new: &NewContentType, user_id: Id) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: new.name.to_uppercase(),
            parent: new.parent,
            storage_mode: StorageMode::Hierarchical,
            category: new.category,
            mode: new.mode,
            language_mode: new.language_mode,
            state: TypeState::Available,
            permissions: new.permissions,
            history: new.history,
            max_versions: new.max_versions,
            max_rel_source: new.max_rel_source,
            max_rel_destination: new.max_rel_destination,
            acl: new.acl,
            workflow: new.workflow,
            label: new.label.clone(),
            relations: new.relations.clone(),
            created_by: user_id,
            created_at: now,
            updated_by: user_id,
            updated_at: now,
        }
    }

    /// Apply every requested change, preserving the audit trail
    pub fn apply_update(&mut self, update: &ContentTypeUpdate, user_id: Id) {
        if let Some(name) = &update.name {
            self.name = name.to_uppercase();
        }
        if let Some(label) = &update.label {
            self.label = label.clone();
        }
        if let Some(acl) = update.acl {
            self.acl = acl;
        }
        if let Some(workflow) = update.workflow {
            self.workflow = workflow;
        }
        if let Some(permissions) = update.permissions {
            self.permissions = permissions;
        }
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(category) = update.category {
            self.category = category;
        }
        if let Some(language_mode) = update.language_mode {
            self.language_mode = language_mode;
        }
        if let Some(history) = update.history {
            self.history = history;
        }
        if let Some(max_versions) = update.max_versions {
            self.max_versions = max_versions;
        }
        if let Some(max) = update.max_rel_source {
            self.max_rel_source = max;
        }
        if let Some(max) = update.max_rel_destination {
            self.max_rel_destination = max;
        }
        if let Some(relations) = &update.relations {
            self.relations = relations.clone();
        }

        self.updated_by = user_id;
        self.updated_at = Utc::now();
    }

    pub fn is_relation(&self) -> bool {
        self.mode == TypeMode::Relation
    }

    pub fn is_derived(&self) -> bool {
        self.parent.is_some()
    }

    pub fn is_multilingual(&self) -> bool {
        self.language_mode == LanguageMode::Multiple
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title_assignment() -> Assignment {
        Assignment::new(
            10,
            5,
            "document",
            "/",
            "title",
            None,
            Multiplicity::ONE,
            1,
            AssignmentKind::Property {
                property_id: 3,
                default_value: None,
                default_language: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_assignment_xpath_includes_type() {
        let a = title_assignment();
        assert_eq!(a.xpath, "DOCUMENT/TITLE");
        assert_eq!(a.relative_xpath(), "/TITLE");
        assert_eq!(a.alias, "TITLE");
        assert!(a.is_property());
        assert_eq!(a.property_id(), Some(3));
        assert_eq!(a.default_multiplicity, 1);
    }

    #[test]
    fn test_system_internal_is_one_way() {
        let mut a = title_assignment();
        a.set_system_internal(false).unwrap();
        a.set_system_internal(true).unwrap();
        assert!(a.set_system_internal(false).is_err());
        assert!(a.is_system_internal());
    }

    #[test]
    fn test_derive_for_rewrites_type_and_base() {
        let a = title_assignment();
        let derived = a.derive_for(20, 6, "page", None);
        assert_eq!(derived.xpath, "PAGE/TITLE");
        assert_eq!(derived.base, Some(10));
        assert_eq!(derived.type_id, 6);
        assert_eq!(derived.multiplicity, a.multiplicity);
    }

    #[test]
    fn test_assignment_serializes_kind_flat() {
        let json = serde_json::to_value(title_assignment()).unwrap();
        assert_eq!(json["kind"], "property");
        assert_eq!(json["property_id"], 3);
        let back: Assignment = serde_json::from_value(json).unwrap();
        assert_eq!(back, title_assignment());
    }

    #[test]
    fn test_type_update_keeps_creator() {
        let mut t = ContentType::from_new(1, &NewContentType::new("doc", 1, 1), 7);
        let update = ContentTypeUpdate {
            name: Some("article".to_string()),
            max_versions: Some(3),
            ..Default::default()
        };
        t.apply_update(&update, 8);
        assert_eq!(t.name, "ARTICLE");
        assert_eq!(t.max_versions, 3);
        assert_eq!(t.created_by, 7);
        assert_eq!(t.updated_by, 8);
    }
}
