//! Structured tag bags attached to nodes and edges.
//!
//! A [`Tag`] is a name with an optional value, written `name` or `name:value`.
//! [`Tags`] keeps them in insertion order and may hold the same tag more than
//! once. Searches match with [`Tags::has`]: every predicate tag must be
//! satisfied by some tag in the bag, where a predicate without a value matches
//! any value.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KnotError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self { name: name.into(), value }
    }
    /// Parses `name` or `name:value`. Only the first colon separates.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (name, value) = match text.split_once(':') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (text, None),
        };
        if name.is_empty() {
            return Err(KnotError::Validation(format!("malformed tag '{text}': empty name")));
        }
        if value.is_some_and(str::is_empty) {
            return Err(KnotError::Validation(format!("malformed tag '{text}': empty value")));
        }
        Ok(Self::new(name, value.map(String::from)))
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
    fn satisfies(&self, predicate: &Tag) -> bool {
        self.name == predicate.name
            && match &predicate.value {
                None => true,
                Some(v) => self.value.as_ref() == Some(v),
            }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}:{}", self.name, value),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags {
    tags: Vec<Tag>,
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }
    /// Parses a comma separated list such as `active, role:admin`.
    pub fn parse(list: &str) -> Result<Self> {
        let mut tags = Self::new();
        for part in list.split(',').filter(|p| !p.trim().is_empty()) {
            tags.push(Tag::parse(part)?);
        }
        Ok(tags)
    }
    pub fn push(&mut self, tag: Tag) {
        self.tags.push(tag);
    }
    pub fn extend(&mut self, other: Tags) {
        self.tags.extend(other.tags);
    }
    pub fn len(&self) -> usize {
        self.tags.len()
    }
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.tags.iter()
    }
    pub fn has(&self, predicate: &Tags) -> bool {
        predicate
            .tags
            .iter()
            .all(|p| self.tags.iter().any(|t| t.satisfies(p)))
    }
}

impl FromIterator<Tag> for Tags {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self { tags: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;
    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.tags.iter().map(Tag::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_matches_names_and_values() {
        let tags = Tags::parse("active, role:admin, role:owner").unwrap();
        assert!(tags.has(&Tags::parse("active").unwrap()));
        assert!(tags.has(&Tags::parse("role").unwrap()));
        assert!(tags.has(&Tags::parse("role:owner,active").unwrap()));
        assert!(!tags.has(&Tags::parse("role:guest").unwrap()));
        assert!(!tags.has(&Tags::parse("temp").unwrap()));
        assert!(tags.has(&Tags::new()), "empty predicate matches everything");
    }

    #[test]
    fn malformed_tags_are_rejected() {
        assert!(matches!(Tag::parse(":x"), Err(KnotError::Validation(_))));
        assert!(matches!(Tag::parse("x:"), Err(KnotError::Validation(_))));
    }

    #[test]
    fn display_is_parseable() {
        let tags = Tags::parse("a,b:c").unwrap();
        assert_eq!(tags.to_string(), "a,b:c");
        assert_eq!(Tags::parse(&tags.to_string()).unwrap(), tags);
    }
}
