use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Message, Result};

/// Numeric identifier of any schema or content entity.
pub type Id = i64;

/// Identifier of a language; `SYSTEM_LANGUAGE` holds single-language values.
pub type LanguageId = i64;

pub const SYSTEM_LANGUAGE: LanguageId = 0;

/// Disjoint identifier spaces handed out by the sequence generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSpace {
    Type,
    Property,
    Group,
    Assignment,
    Content,
    Acl,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DataType {
    String,
    Text,
    Html,
    Number,
    LargeNumber,
    Float,
    Double,
    Boolean,
    Date,
    DateTime,
    Reference,
    SelectOne,
    SelectMany,
    Binary,
}

impl DataType {
    /// Types whose value is spread over more than one storage column.
    pub fn is_multi_column(&self) -> bool {
        matches!(self, DataType::SelectMany)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, DataType::String | DataType::Text | DataType::Html)
    }
}

/// Occurrence bound of an assignment at one XPath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Multiplicity {
    pub min: u32,
    /// `None` is unbounded
    pub max: Option<u32>,
}

impl Multiplicity {
    pub const ZERO_OR_ONE: Multiplicity = Multiplicity { min: 0, max: Some(1) };
    pub const ONE: Multiplicity = Multiplicity { min: 1, max: Some(1) };
    pub const ZERO_OR_MORE: Multiplicity = Multiplicity { min: 0, max: None };
    pub const ONE_OR_MORE: Multiplicity = Multiplicity { min: 1, max: None };

    pub fn new(min: u32, max: Option<u32>) -> Result<Self> {
        if let Some(max) = max {
            if max == 0 || max < min {
                return Err(Error::invalid(
                    Message::new("ex.structure.multiplicity.invalid")
                        .arg(min)
                        .arg(max),
                ));
            }
        }
        Ok(Self { min, max })
    }

    pub fn is_optional(&self) -> bool {
        self.min == 0
    }

    pub fn is_required(&self) -> bool {
        self.min > 0
    }

    pub fn is_unlimited(&self) -> bool {
        self.max.is_none()
    }

    pub fn is_single(&self) -> bool {
        self.max == Some(1)
    }

    /// Whether the 1-based index may exist under this bound.
    pub fn is_valid_index(&self, index: u32) -> bool {
        index >= 1 && self.max.map_or(true, |max| index <= max)
    }

    /// Whether `count` occurrences satisfy this bound.
    pub fn contains(&self, count: u32) -> bool {
        count >= self.min && self.max.map_or(true, |max| count <= max)
    }

    /// Whether `other` is at least as permissive as this bound.
    pub fn is_within(&self, other: &Multiplicity) -> bool {
        self.min >= other.min
            && match (self.max, other.max) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(a), Some(b)) => a <= b,
            }
    }

    /// Default occurrence count used when creating empty data.
    pub fn default_count(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(count) if self.contains(count) => count,
            _ => self.min.max(1).min(self.max.unwrap_or(u32::MAX)),
        }
    }
}

impl Default for Multiplicity {
    fn default() -> Self {
        Multiplicity::ZERO_OR_ONE
    }
}

impl fmt::Display for Multiplicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "{}..{}", self.min, max),
            None => write!(f, "{}..N", self.min),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueMode {
    None,
    Global,
    Type,
    DerivedTypes,
    Instance,
}

impl Default for UniqueMode {
    fn default() -> Self {
        UniqueMode::None
    }
}

/// Multi-value containment mode of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupMode {
    AnyOf,
    OneOf,
}

impl Default for GroupMode {
    fn default() -> Self {
        GroupMode::AnyOf
    }
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupMode::AnyOf => write!(f, "any-of"),
            GroupMode::OneOf => write!(f, "one-of"),
        }
    }
}

/// Option entry of a property, group or assignment option bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureOption {
    pub key: String,
    pub value: String,
    /// Whether assignments may set a different value
    #[serde(default = "default_true")]
    pub overridable: bool,
}

fn default_true() -> bool {
    true
}

pub const OPTION_MAXLENGTH: &str = "MAXLENGTH";
pub const OPTION_MULTILANG: &str = "MULTILANG";

impl StructureOption {
    pub fn new(key: &str, value: &str, overridable: bool) -> Self {
        Self {
            key: key.to_uppercase(),
            value: value.to_string(),
            overridable,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self.value.as_str(), "1" | "true" | "TRUE" | "yes")
    }
}

/// Find an option by (case-insensitive) key.
pub fn find_option<'a>(options: &'a [StructureOption], key: &str) -> Option<&'a StructureOption> {
    options.iter().find(|o| o.key.eq_ignore_ascii_case(key))
}

/// Translated text keyed by language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label(pub std::collections::BTreeMap<LanguageId, String>);

impl Label {
    pub fn new(text: &str) -> Self {
        let mut map = std::collections::BTreeMap::new();
        map.insert(SYSTEM_LANGUAGE, text.to_string());
        Label(map)
    }

    pub fn text(&self, language: LanguageId) -> Option<&str> {
        self.0
            .get(&language)
            .or_else(|| self.0.get(&SYSTEM_LANGUAGE))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
