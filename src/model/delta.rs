use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::model::common::{DataType, Id, LanguageId};
use crate::model::data::DataNode;
use crate::model::value::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaChangeType {
    Add,
    Update,
    Remove,
}

/// Owned view of one data node taken while diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub assignment_id: Id,
    pub pos: i32,
    pub system_internal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldValue>,
}

impl DataSnapshot {
    pub fn of(node: &DataNode) -> Self {
        Self {
            assignment_id: node.assignment_id,
            pos: node.pos,
            system_internal: node.system_internal,
            value: node.value().cloned(),
        }
    }

    pub fn is_property(&self) -> bool {
        self.value.is_some()
    }

    fn languages(&self) -> BTreeSet<LanguageId> {
        self.value
            .as_ref()
            .map(FieldValue::languages)
            .unwrap_or_default()
    }

    fn data_type(&self) -> Option<DataType> {
        self.value.as_ref().map(|v| v.data_type)
    }
}

/// One XPath-level difference between two instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaChange {
    pub change_type: DeltaChangeType,
    pub xpath: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<DataSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<DataSnapshot>,
    pub position_change: bool,
    pub data_change: bool,
    pub language_setting_changed: bool,
}

impl DeltaChange {
    pub fn add(xpath: &str, new: DataSnapshot) -> Self {
        Self {
            change_type: DeltaChangeType::Add,
            xpath: xpath.to_string(),
            original: None,
            new: Some(new),
            position_change: true,
            data_change: true,
            language_setting_changed: false,
        }
    }

    pub fn remove(xpath: &str, original: DataSnapshot) -> Self {
        Self {
            change_type: DeltaChangeType::Remove,
            xpath: xpath.to_string(),
            original: Some(original),
            new: None,
            position_change: true,
            data_change: true,
            language_setting_changed: false,
        }
    }

    /// `None` when both sides are equal in position and value.
    pub fn update(xpath: &str, original: DataSnapshot, new: DataSnapshot) -> Option<Self> {
        let position_change = original.pos != new.pos;
        let data_change = original.value != new.value;
        if !position_change && !data_change {
            return None;
        }
        let language_setting_changed = original.is_property() && original.languages() != new.languages();
        Some(Self {
            change_type: DeltaChangeType::Update,
            xpath: xpath.to_string(),
            original: Some(original),
            new: Some(new),
            position_change,
            data_change,
            language_setting_changed,
        })
    }

    fn snapshot(&self) -> Option<&DataSnapshot> {
        self.new.as_ref().or(self.original.as_ref())
    }

    pub fn is_property(&self) -> bool {
        self.snapshot().map_or(false, DataSnapshot::is_property)
    }

    pub fn is_group(&self) -> bool {
        !self.is_property()
    }

    pub fn is_multi_column(&self) -> bool {
        self.snapshot()
            .and_then(DataSnapshot::data_type)
            .map_or(false, |dt| dt.is_multi_column())
    }

    pub fn is_internal(&self) -> bool {
        self.snapshot().map_or(false, |s| s.system_internal)
    }

    pub fn is_position_change_only(&self) -> bool {
        self.position_change && !self.data_change
    }

    /// Whether the persistence layer may update the row in place.
    pub fn is_updateable(&self) -> bool {
        self.change_type == DeltaChangeType::Update
            && !self.language_setting_changed
            && !self.is_multi_column()
    }

    pub fn assignment_id(&self) -> Option<Id> {
        self.snapshot().map(|s| s.assignment_id)
    }
}

/// Differences between an original and a compared content instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub updates: Vec<DeltaChange>,
    pub adds: Vec<DeltaChange>,
    pub removes: Vec<DeltaChange>,
    pub internal_property_changed: bool,
    pub only_internal_property_changes: bool,
}

impl Delta {
    pub fn new(updates: Vec<DeltaChange>, adds: Vec<DeltaChange>, removes: Vec<DeltaChange>) -> Self {
        let all = || updates.iter().chain(adds.iter()).chain(removes.iter());
        let internal_property_changed = all().any(|c| c.is_internal() && c.is_property());
        let only_internal_property_changes = all().next().is_some() && all().all(DeltaChange::is_internal);
        Self {
            updates,
            adds,
            removes,
            internal_property_changed,
            only_internal_property_changes,
        }
    }

    pub fn changes(&self) -> bool {
        !self.updates.is_empty() || !self.adds.is_empty() || !self.removes.is_empty()
    }

    /// Any change to a property's value, or any add/remove at all.
    pub fn is_data_changed(&self) -> bool {
        !self.adds.is_empty()
            || !self.removes.is_empty()
            || self.updates.iter().any(|c| c.data_change)
    }

    pub fn is_group_data_changed(&self) -> bool {
        self.all_changes().any(|c| c.is_group())
    }

    pub fn all_changes(&self) -> impl Iterator<Item = &DeltaChange> {
        self.updates
            .iter()
            .chain(self.adds.iter())
            .chain(self.removes.iter())
    }

    pub fn add_xpaths(&self) -> Vec<&str> {
        self.adds.iter().map(|c| c.xpath.as_str()).collect()
    }

    pub fn remove_xpaths(&self) -> Vec<&str> {
        self.removes.iter().map(|c| c.xpath.as_str()).collect()
    }

    pub fn update_xpaths(&self) -> Vec<&str> {
        self.updates.iter().map(|c| c.xpath.as_str()).collect()
    }

    /// Human-readable listing, one change per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (label, changes) in [
            ("update", &self.updates),
            ("add", &self.adds),
            ("remove", &self.removes),
        ] {
            for change in changes {
                let _ = writeln!(
                    out,
                    "{} {}{}{}",
                    label,
                    change.xpath,
                    if change.position_change { " pos" } else { "" },
                    if change.data_change { " data" } else { "" },
                );
            }
        }
        out
    }
}
