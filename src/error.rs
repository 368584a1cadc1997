use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed underlying cause carried by create/update/remove failures.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Localizable error message: a key, positional arguments and an optional content XPath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
}

impl Message {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            args: Vec::new(),
            xpath: None,
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn xpath(mut self, xpath: impl Into<String>) -> Self {
        self.xpath = Some(xpath.into());
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if !self.args.is_empty() {
            write!(f, " [{}]", self.args.join(", "))?;
        }
        if let Some(xpath) = &self.xpath {
            write!(f, " at {}", xpath)?;
        }
        Ok(())
    }
}

/// Errors raised by the structure, content and permission engines.
#[derive(Debug, Error)]
pub enum Error {
    /// A referenced schema or content entity does not exist.
    #[error("not found: {0}")]
    NotFound(Message),

    /// Malformed XPath, wrong node kind or out-of-range index.
    #[error("invalid parameter: {0}")]
    InvalidParameter(Message),

    /// Uniqueness violation reported by the persistence layer.
    #[error("entry exists: {0}")]
    EntryExists(Message),

    /// Permission denied; `acls` names every ACL that withheld the permission.
    #[error("no access: {message} (acls: {})", .acls.join(", "))]
    NoAccess { message: Message, acls: Vec<String> },

    #[error("create failed: {message}")]
    Create {
        message: Message,
        #[source]
        source: Option<Cause>,
    },

    #[error("update failed: {message}")]
    Update {
        message: Message,
        #[source]
        source: Option<Cause>,
    },

    #[error("remove failed: {message}")]
    Remove {
        message: Message,
        #[source]
        source: Option<Cause>,
    },

    /// Schema or content could not be reconstituted from storage.
    #[error("load failed: {0}")]
    Load(Message),

    /// The environment snapshot could not be reloaded.
    #[error("cache failure: {0}")]
    Cache(Message),
}

impl Error {
    pub fn not_found(message: Message) -> Self {
        Error::NotFound(message)
    }

    pub fn invalid(message: Message) -> Self {
        Error::InvalidParameter(message)
    }

    pub fn no_access(message: Message) -> Self {
        Error::NoAccess {
            message,
            acls: Vec::new(),
        }
    }

    pub fn create(message: Message) -> Self {
        Error::Create {
            message,
            source: None,
        }
    }

    pub fn update(message: Message) -> Self {
        Error::Update {
            message,
            source: None,
        }
    }

    pub fn remove(message: Message) -> Self {
        Error::Remove {
            message,
            source: None,
        }
    }

    /// The message of any variant.
    pub fn message(&self) -> &Message {
        match self {
            Error::NotFound(m)
            | Error::InvalidParameter(m)
            | Error::EntryExists(m)
            | Error::Load(m)
            | Error::Cache(m) => m,
            Error::NoAccess { message, .. }
            | Error::Create { message, .. }
            | Error::Update { message, .. }
            | Error::Remove { message, .. } => message,
        }
    }

    pub fn key(&self) -> &str {
        &self.message().key
    }

    pub fn xpath(&self) -> Option<&str> {
        self.message().xpath.as_deref()
    }

    /// Tag the error with the content XPath it refers to, unless it already names one.
    pub fn at_xpath(mut self, xpath: &str) -> Self {
        let message = match &mut self {
            Error::NotFound(m)
            | Error::InvalidParameter(m)
            | Error::EntryExists(m)
            | Error::Load(m)
            | Error::Cache(m) => m,
            Error::NoAccess { message, .. }
            | Error::Create { message, .. }
            | Error::Update { message, .. }
            | Error::Remove { message, .. } => message,
        };
        if message.xpath.is_none() {
            message.xpath = Some(xpath.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_display_carries_args_and_xpath() {
        let message = Message::new("ex.content.required.missing")
            .arg("TITLE")
            .xpath("/TITLE[1]");
        assert_eq!(
            message.to_string(),
            "ex.content.required.missing [TITLE] at /TITLE[1]"
        );
    }

    #[test]
    fn test_no_access_lists_acls() {
        let err = Error::NoAccess {
            message: Message::new("ex.acl.noAccess.extended.2").arg("DELETE"),
            acls: vec!["Editors".to_string(), "#7".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("Editors, #7"));
        assert_eq!(err.key(), "ex.acl.noAccess.extended.2");
    }

    #[test]
    fn test_at_xpath_keeps_existing_xpath() {
        let err = Error::invalid(Message::new("ex.xpath.invalid").xpath("/A[1]")).at_xpath("/B[1]");
        assert_eq!(err.xpath(), Some("/A[1]"));
        let err = Error::invalid(Message::new("ex.xpath.invalid")).at_xpath("/B[1]");
        assert_eq!(err.xpath(), Some("/B[1]"));
    }
}
