use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Message, Result};
use crate::model::common::Id;

/// Id of an instance that has not been saved yet.
pub const NEW_ID: Id = -1;

/// Version part of a primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Version {
    Number(i32),
    /// Highest stored version
    Max,
    /// Version currently marked live
    Live,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Number(n) => write!(f, "{}", n),
            Version::Max => write!(f, "MAX"),
            Version::Live => write!(f, "LIVE"),
        }
    }
}

/// Identifies a content instance and one of its versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub id: Id,
    pub version: Version,
}

impl PrimaryKey {
    pub fn new(id: Id, version: i32) -> Self {
        Self {
            id,
            version: Version::Number(version),
        }
    }

    /// Key of an instance that is not persisted yet.
    pub fn new_instance() -> Self {
        Self {
            id: NEW_ID,
            version: Version::Max,
        }
    }

    pub fn max(id: Id) -> Self {
        Self {
            id,
            version: Version::Max,
        }
    }

    pub fn live(id: Id) -> Self {
        Self {
            id,
            version: Version::Live,
        }
    }

    pub fn is_new(&self) -> bool {
        self.id == NEW_ID
    }

    /// True if the version is a concrete number rather than MAX or LIVE.
    pub fn is_distinct_version(&self) -> bool {
        matches!(self.version, Version::Number(n) if n >= 0)
    }

    /// Order by instance id only, ignoring the version.
    pub fn cmp_id(&self, other: &PrimaryKey) -> Ordering {
        self.id.cmp(&other.id)
    }

    pub fn with_version(&self, version: Version) -> Self {
        Self {
            id: self.id,
            version,
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_new() {
            write!(f, "NEW")
        } else {
            write!(f, "{}.{}", self.id, self.version)
        }
    }
}

impl FromStr for PrimaryKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::invalid(Message::new("ex.content.pk.invalid").arg(s));
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("NEW") {
            return Ok(PrimaryKey::new_instance());
        }
        let (id, version) = trimmed.split_once('.').ok_or_else(invalid)?;
        let id: Id = id.parse().map_err(|_| invalid())?;
        let version = match version.to_ascii_uppercase().as_str() {
            "MAX" => Version::Max,
            "LIVE" => Version::Live,
            number => Version::Number(number.parse().map_err(|_| invalid())?),
        };
        Ok(PrimaryKey { id, version })
    }
}

/// Creator/modifier bookkeeping of a content version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeCycleInfo {
    pub creator_id: Id,
    pub created_at: DateTime<Utc>,
    pub modifier_id: Id,
    pub modified_at: DateTime<Utc>,
}

impl LifeCycleInfo {
    pub fn created_by(user_id: Id) -> Self {
        let now = Utc::now();
        Self {
            creator_id: user_id,
            created_at: now,
            modifier_id: user_id,
            modified_at: now,
        }
    }

    pub fn modified_by(&self, user_id: Id) -> Self {
        Self {
            creator_id: self.creator_id,
            created_at: self.created_at,
            modifier_id: user_id,
            modified_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub lifecycle: LifeCycleInfo,
    pub step: Id,
}

/// Version bookkeeping of one logical content instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentVersionInfo {
    pub id: Id,
    pub versions: BTreeMap<i32, VersionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_version: Option<i32>,
}

impl ContentVersionInfo {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            versions: BTreeMap::new(),
            live_version: None,
        }
    }

    pub fn min_version(&self) -> Option<i32> {
        self.versions.keys().next().copied()
    }

    pub fn max_version(&self) -> Option<i32> {
        self.versions.keys().next_back().copied()
    }

    pub fn has_live_version(&self) -> bool {
        self.live_version.is_some()
    }

    /// Version with the most recent modification timestamp.
    pub fn last_modified_version(&self) -> Option<i32> {
        self.versions
            .iter()
            .max_by_key(|(version, entry)| (entry.lifecycle.modified_at, **version))
            .map(|(version, _)| *version)
    }

    pub fn add_version(&mut self, version: i32, entry: VersionEntry, live: bool) {
        self.versions.insert(version, entry);
        if live {
            self.live_version = Some(version);
        }
    }

    pub fn remove_version(&mut self, version: i32) {
        self.versions.remove(&version);
        if self.live_version == Some(version) {
            self.live_version = None;
        }
    }

    pub fn contains_version(&self, pk: &PrimaryKey) -> bool {
        if pk.id != self.id {
            return false;
        }
        match pk.version {
            Version::Number(n) => self.versions.contains_key(&n),
            Version::Max => !self.versions.is_empty(),
            Version::Live => self.live_version.is_some(),
        }
    }

    /// Resolve MAX/LIVE to a concrete version number.
    pub fn distinct_version(&self, pk: &PrimaryKey) -> Result<i32> {
        let missing = || Error::not_found(Message::new("ex.content.version.notFound").arg(pk));
        match pk.version {
            Version::Number(n) if self.versions.contains_key(&n) => Ok(n),
            Version::Number(_) => Err(missing()),
            Version::Max => self.max_version().ok_or_else(missing),
            Version::Live => self.live_version.ok_or_else(missing),
        }
    }

    pub fn version_entry(&self, version: i32) -> Option<&VersionEntry> {
        self.versions.get(&version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pk_display_and_parse() {
        assert_eq!(PrimaryKey::new_instance().to_string(), "NEW");
        assert_eq!(PrimaryKey::new(12, 3).to_string(), "12.3");
        assert_eq!(PrimaryKey::max(12).to_string(), "12.MAX");
        assert_eq!(PrimaryKey::live(12).to_string(), "12.LIVE");

        for text in ["NEW", "12.3", "12.MAX", "12.live"] {
            let pk: PrimaryKey = text.parse().unwrap();
            assert_eq!(pk.to_string().to_uppercase(), text.to_uppercase());
        }
        assert!("12".parse::<PrimaryKey>().is_err());
        assert!("x.1".parse::<PrimaryKey>().is_err());
    }

    #[test]
    fn test_pk_equality_uses_version_ordering_does_not() {
        let a = PrimaryKey::new(5, 1);
        let b = PrimaryKey::new(5, 2);
        assert_ne!(a, b);
        assert_eq!(a.cmp_id(&b), Ordering::Equal);
        assert!(a.is_distinct_version());
        assert!(!PrimaryKey::max(5).is_distinct_version());
    }

    #[test]
    fn test_version_info_resolution() {
        let mut info = ContentVersionInfo::new(7);
        let entry = VersionEntry {
            lifecycle: LifeCycleInfo::created_by(1),
            step: 1,
        };
        info.add_version(1, entry.clone(), true);
        info.add_version(2, entry, false);

        assert_eq!(info.distinct_version(&PrimaryKey::max(7)).unwrap(), 2);
        assert_eq!(info.distinct_version(&PrimaryKey::live(7)).unwrap(), 1);
        assert!(info.contains_version(&PrimaryKey::new(7, 2)));
        assert!(!info.contains_version(&PrimaryKey::new(8, 2)));

        info.remove_version(1);
        assert!(!info.has_live_version());
        assert!(info.distinct_version(&PrimaryKey::live(7)).is_err());
        assert_eq!(info.min_version(), Some(2));
    }
}
