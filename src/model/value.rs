use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{Error, Message, Result};
use crate::model::common::{DataType, LanguageId, SYSTEM_LANGUAGE};
use crate::model::pk::PrimaryKey;

/// How much of a value the current caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueAccess {
    #[default]
    Full,
    ReadOnly,
    /// Placeholder; the real translations were withheld
    NoAccess,
}

/// Typed, optionally multilingual property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub data_type: DataType,
    pub multilingual: bool,
    #[serde(default)]
    pub translations: BTreeMap<LanguageId, JsonValue>,
    #[serde(default)]
    pub default_language: LanguageId,
    #[serde(default)]
    pub access: ValueAccess,
}

impl FieldValue {
    /// An empty value of the given type
    pub fn empty(data_type: DataType, multilingual: bool) -> Self {
        Self {
            data_type,
            multilingual,
            translations: BTreeMap::new(),
            default_language: SYSTEM_LANGUAGE,
            access: ValueAccess::Full,
        }
    }

    /// Single-language value
    pub fn single(data_type: DataType, value: JsonValue) -> Result<Self> {
        let mut field = Self::empty(data_type, false);
        field.set_translation(SYSTEM_LANGUAGE, value)?;
        Ok(field)
    }

    pub fn text(value: &str) -> Self {
        let mut field = Self::empty(DataType::String, false);
        field
            .translations
            .insert(SYSTEM_LANGUAGE, JsonValue::String(value.to_string()));
        field
    }

    /// Set (or with `null`, clear) the translation for one language.
    pub fn set_translation(&mut self, language: LanguageId, value: JsonValue) -> Result<()> {
        let language = if self.multilingual {
            language
        } else {
            SYSTEM_LANGUAGE
        };
        if value.is_null() {
            self.translations.remove(&language);
            return Ok(());
        }
        check_type(self.data_type, &value)?;
        self.translations.insert(language, value);
        Ok(())
    }

    /// Translation for `language`, falling back to the default language.
    pub fn translation(&self, language: LanguageId) -> Option<&JsonValue> {
        let language = if self.multilingual {
            language
        } else {
            SYSTEM_LANGUAGE
        };
        self.translations
            .get(&language)
            .or_else(|| self.translations.get(&self.default_language))
    }

    pub fn default_translation(&self) -> Option<&JsonValue> {
        self.translations
            .get(&self.default_language)
            .or_else(|| self.translations.values().next())
    }

    /// Languages that carry a translation.
    pub fn languages(&self) -> BTreeSet<LanguageId> {
        self.translations.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.access != ValueAccess::NoAccess && self.translations.is_empty()
    }

    pub fn is_read_only(&self) -> bool {
        self.access == ValueAccess::ReadOnly
    }

    pub fn is_no_access(&self) -> bool {
        self.access == ValueAccess::NoAccess
    }

    /// Same shape with every translation withheld.
    pub fn no_access_placeholder(&self) -> Self {
        Self {
            translations: BTreeMap::new(),
            access: ValueAccess::NoAccess,
            ..self.clone()
        }
    }

    /// Longest textual translation, in characters.
    pub fn max_text_length(&self) -> usize {
        self.translations
            .values()
            .filter_map(JsonValue::as_str)
            .map(|s| s.chars().count())
            .max()
            .unwrap_or(0)
    }

    /// Random non-empty value for test and demo fixtures.
    pub fn random<R: Rng>(data_type: DataType, multilingual: bool, rng: &mut R) -> Self {
        let mut field = Self::empty(data_type, multilingual);
        let languages: &[LanguageId] = if multilingual { &[1, 2] } else { &[SYSTEM_LANGUAGE] };
        for language in languages {
            let value = match data_type {
                DataType::String | DataType::Text | DataType::Html => {
                    json!(format!("text-{}", rng.random_range(0..100_000)))
                }
                DataType::Number | DataType::LargeNumber => json!(rng.random_range(-1000i64..1000)),
                DataType::Float | DataType::Double => json!(rng.random_range(-1000.0f64..1000.0)),
                DataType::Boolean => json!(rng.random_bool(0.5)),
                DataType::Date => json!(format!(
                    "2024-{:02}-{:02}",
                    rng.random_range(1..=12),
                    rng.random_range(1..=28)
                )),
                DataType::DateTime => json!(Utc::now().to_rfc3339()),
                DataType::Reference => json!(format!("{}.1", rng.random_range(1i64..10_000))),
                DataType::SelectOne | DataType::Binary => json!(rng.random_range(1i64..100)),
                DataType::SelectMany => json!([rng.random_range(1i64..50), rng.random_range(50i64..100)]),
            };
            field.translations.insert(*language, value);
        }
        field.default_language = languages[0];
        field
    }
}

/// Check a JSON scalar against a data type.
pub fn check_type(data_type: DataType, value: &JsonValue) -> Result<()> {
    let ok = match data_type {
        DataType::String | DataType::Text | DataType::Html => value.is_string(),
        DataType::Number | DataType::LargeNumber => value.is_i64(),
        DataType::Float | DataType::Double => value.is_number(),
        DataType::Boolean => value.is_boolean(),
        DataType::Date => value
            .as_str()
            .map_or(false, |s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
        DataType::DateTime => value
            .as_str()
            .map_or(false, |s| DateTime::parse_from_rfc3339(s).is_ok()),
        DataType::Reference => {
            value.is_i64()
                || value
                    .as_str()
                    .map_or(false, |s| s.parse::<PrimaryKey>().is_ok())
        }
        DataType::SelectOne | DataType::Binary => value.is_i64(),
        DataType::SelectMany => value
            .as_array()
            .map_or(false, |items| items.iter().all(JsonValue::is_i64)),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::invalid(
            Message::new("ex.content.value.invalid")
                .arg(format!("{:?}", data_type))
                .arg(value),
        ))
    }
}
