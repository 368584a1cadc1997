use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::common::Id;

/// One audit record written by a structural or content operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: Id,
    /// Message key, e.g. `history.assignment.updateMultiplicity`
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<Id>,
}

impl HistoryEntry {
    pub fn new(user_id: Id, key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id,
            key: key.to_string(),
            args: Vec::new(),
            type_id: None,
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn for_type(mut self, type_id: Id) -> Self {
        self.type_id = Some(type_id);
        self
    }
}
