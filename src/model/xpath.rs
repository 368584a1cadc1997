//! Slash-delimited addressing of schema and content nodes.
//!
//! A content XPath looks like `/ADDRESS[2]/STREET[1]`; an assignment XPath is
//! prefixed with its type name (`DOCUMENT/ADDRESS/STREET`). Aliases are case
//! insensitive and stored upper-cased. An element without an index means
//! index 1.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Message, Result};

/// One `(alias, index)` step of an XPath.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XPathElement {
    pub alias: String,
    pub index: u32,
    /// False when the source text carried no explicit `[n]`
    #[serde(default)]
    pub index_defined: bool,
}

impl PartialEq for XPathElement {
    fn eq(&self, other: &Self) -> bool {
        self.alias == other.alias && self.index == other.index
    }
}

impl Eq for XPathElement {}

impl XPathElement {
    pub fn new(alias: &str, index: u32, index_defined: bool) -> Self {
        Self {
            alias: alias.to_uppercase(),
            index,
            index_defined,
        }
    }

    /// Parse a single `ALIAS` or `ALIAS[n]` segment.
    pub fn parse(segment: &str) -> Result<Self> {
        let invalid = || invalid_xpath(segment);
        let (alias, index, defined) = match segment.find('[') {
            Some(open) => {
                let close = segment.strip_suffix(']').ok_or_else(invalid)?;
                let number = &close[open + 1..];
                let index: u32 = number.parse().map_err(|_| invalid())?;
                if index == 0 {
                    return Err(Error::invalid(
                        Message::new("ex.content.xpath.index.invalid")
                            .arg(index)
                            .xpath(segment),
                    ));
                }
                (&segment[..open], index, true)
            }
            None => (segment, 1, false),
        };
        if !is_valid_alias(alias) {
            return Err(invalid());
        }
        Ok(Self::new(alias, index, defined))
    }
}

impl fmt::Display for XPathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.alias, self.index)
    }
}

fn invalid_xpath(xpath: &str) -> Error {
    Error::invalid(Message::new("ex.xpath.invalid").arg(xpath).xpath(xpath))
}

/// `[A-Z][A-Z_0-9]*`, case insensitive.
pub fn is_valid_alias(alias: &str) -> bool {
    let mut chars = alias.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split off a leading type name (`TYPE/A/B` or `TYPE[@pk=1.1]/A`).
fn split_type(xpath: &str) -> (Option<&str>, &str) {
    if xpath.starts_with('/') {
        return (None, xpath);
    }
    match xpath.find('/') {
        Some(slash) => (Some(&xpath[..slash]), &xpath[slash..]),
        None => (Some(xpath), ""),
    }
}

/// Upper-cased type name of an assignment XPath, if present.
pub fn type_name(xpath: &str) -> Option<String> {
    let (name, _) = split_type(xpath.trim());
    name.map(|n| match n.find('[') {
        Some(bracket) => n[..bracket].to_uppercase(),
        None => n.to_uppercase(),
    })
}

/// Remove a leading type name; the root is returned as `/`.
pub fn strip_type(xpath: &str) -> String {
    let (_, path) = split_type(xpath.trim());
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_uppercase()
    }
}

/// Split an XPath into its elements; the root (`/` or empty) yields no elements.
pub fn split(xpath: &str) -> Result<Vec<XPathElement>> {
    let stripped = strip_type(xpath);
    if stripped == "/" {
        return Ok(Vec::new());
    }
    let body = stripped.strip_suffix('/').unwrap_or(&stripped);
    body[1..]
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                Err(invalid_xpath(xpath))
            } else {
                XPathElement::parse(segment)
            }
        })
        .collect()
}

pub fn is_valid(xpath: &str) -> bool {
    if let Some(name) = type_name(xpath) {
        if !is_valid_alias(&name) {
            return false;
        }
    }
    split(xpath).is_ok()
}

/// Build an XPath from elements, with or without indices.
pub fn build(elements: &[XPathElement], with_indices: bool) -> String {
    if elements.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for element in elements {
        out.push('/');
        if with_indices {
            out.push_str(&element.to_string());
        } else {
            out.push_str(&element.alias);
        }
    }
    out
}

/// Every element gets an explicit index (`/A/B[2]` becomes `/A[1]/B[2]`).
pub fn to_xpath_mult(xpath: &str) -> Result<String> {
    Ok(build(&split(xpath)?, true))
}

/// All indices removed (`/A[1]/B[2]` becomes `/A/B`).
pub fn to_xpath_no_mult(xpath: &str) -> Result<String> {
    Ok(build(&split(xpath)?, false))
}

pub fn last_element(xpath: &str) -> Result<XPathElement> {
    split(xpath)?
        .pop()
        .ok_or_else(|| invalid_xpath(xpath))
}

/// Parent path of an XPath, keeping indices as written.
pub fn strip_last_element(xpath: &str) -> Result<String> {
    let mut elements = split(xpath)?;
    elements.pop();
    Ok(build(&elements, true))
}

/// Join a parent XPath and an alias into a child XPath without indices.
pub fn child_of(parent: &str, alias: &str) -> Result<String> {
    let mut elements = split(parent)?;
    if !is_valid_alias(alias) {
        return Err(invalid_xpath(alias));
    }
    elements.push(XPathElement::new(alias, 1, false));
    Ok(build(&elements, false))
}

/// Whether `xpath` equals `prefix` or lies below it (both without type name).
pub fn is_below(xpath: &str, prefix: &str) -> bool {
    xpath == prefix
        || (xpath.starts_with(prefix) && xpath.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_with_and_without_indices() {
        let elements = split("/address[2]/street").unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].alias, "ADDRESS");
        assert_eq!(elements[0].index, 2);
        assert!(elements[0].index_defined);
        assert_eq!(elements[1].index, 1);
        assert!(!elements[1].index_defined);
        assert!(split("/").unwrap().is_empty());
        assert!(split("").unwrap().is_empty());
    }

    #[test]
    fn test_type_prefix_is_stripped() {
        assert_eq!(strip_type("document/Title"), "/TITLE");
        assert_eq!(strip_type("DOCUMENT[@pk=12.1]/A[2]"), "/A[2]");
        assert_eq!(strip_type("DOCUMENT"), "/");
        assert_eq!(type_name("document[@pk=1.MAX]/A"), Some("DOCUMENT".to_string()));
        assert_eq!(type_name("/A"), None);
    }

    #[test]
    fn test_mult_conversions() {
        assert_eq!(to_xpath_mult("/A/B[3]").unwrap(), "/A[1]/B[3]");
        assert_eq!(to_xpath_no_mult("TYPE/A[1]/B[3]").unwrap(), "/A/B");
        assert_eq!(strip_last_element("/A[2]/B[3]").unwrap(), "/A[2]");
        assert_eq!(strip_last_element("/A[2]").unwrap(), "/");
        assert_eq!(last_element("/A[2]/B[3]").unwrap(), XPathElement::new("B", 3, true));
        assert_eq!(child_of("/", "title").unwrap(), "/TITLE");
        assert_eq!(child_of("/A[1]", "b").unwrap(), "/A/B");
    }

    #[test]
    fn test_invalid_paths() {
        assert!(!is_valid("/1A"));
        assert!(!is_valid("/A[0]"));
        assert!(!is_valid("/A[x]"));
        assert!(!is_valid("/A//B"));
        assert!(!is_valid("/A-B"));
        assert!(is_valid("TYPE/A_1[4]/B"));
    }

    #[test]
    fn test_is_below() {
        assert!(is_below("/A/B", "/A"));
        assert!(is_below("/A", "/A"));
        assert!(!is_below("/AB", "/A"));
    }

    #[test]
    fn test_element_equality_ignores_defined_flag() {
        assert_eq!(XPathElement::new("A", 1, false), XPathElement::new("a", 1, true));
    }
}
