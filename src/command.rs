//! The typed command model produced by the parser.
//!
//! Commands describe intent and matching criteria only; they never hold
//! references into graph state. Every command renders back to canonical query
//! text through `Display`, and parsing that text yields an equal command.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::construct::Direction;
use crate::error::{KnotError, Result};
use crate::tags::Tags;
use crate::tokenizer::{needs_quoting, quote, quote_if_needed};

lazy_static! {
    static ref ALIAS: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

pub fn is_valid_alias(alias: &str) -> bool {
    ALIAS.is_match(alias)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Node,
    Edge,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Node => write!(f, "node"),
            Entity::Edge => write!(f, "edge"),
        }
    }
}

// ------------- Key patterns -------------
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPattern {
    Any,
    Exact(String),
    Glob(String),
}

impl KeyPattern {
    /// `*` matches everything, text containing `*` is a glob, anything else is exact.
    pub fn parse(text: &str) -> Self {
        if text == "*" {
            KeyPattern::Any
        } else if text.contains('*') {
            KeyPattern::Glob(text.to_string())
        } else {
            KeyPattern::Exact(text.to_string())
        }
    }
    pub fn exact(key: impl Into<String>) -> Self {
        KeyPattern::Exact(key.into())
    }
    pub fn matcher(&self) -> Result<KeyMatcher> {
        let regex = match self {
            KeyPattern::Glob(glob) => {
                let pattern = glob.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
                let regex = Regex::new(&format!("^{pattern}$"))
                    .map_err(|e| KnotError::Validation(format!("bad key pattern '{glob}': {e}")))?;
                Some(regex)
            }
            _ => None,
        };
        Ok(KeyMatcher { pattern: self.clone(), regex })
    }
    fn render(&self) -> String {
        match self {
            KeyPattern::Any => "*".to_string(),
            KeyPattern::Exact(key) if key.contains('*') || needs_quoting(key) => quote(key),
            KeyPattern::Exact(key) => key.clone(),
            KeyPattern::Glob(glob) => glob.clone(),
        }
    }
}

/// A key pattern with its wildcard compiled once per command.
#[derive(Debug, Clone)]
pub struct KeyMatcher {
    pattern: KeyPattern,
    regex: Option<Regex>,
}

impl KeyMatcher {
    pub fn matches(&self, key: &str) -> bool {
        match (&self.pattern, &self.regex) {
            (KeyPattern::Any, _) => true,
            (KeyPattern::Exact(exact), _) => exact == key,
            (KeyPattern::Glob(_), Some(regex)) => regex.is_match(key),
            (KeyPattern::Glob(_), None) => false,
        }
    }
}

fn matches_optional(matcher: &Option<KeyMatcher>, key: &str) -> bool {
    matcher.as_ref().is_none_or(|m| m.matches(key))
}

// ------------- Searches -------------
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSearch {
    key: Option<KeyPattern>,
    tags: Tags,
    alias: Option<String>,
    scope: Option<String>,
}

impl NodeSearch {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_key(mut self, key: KeyPattern) -> Self {
        self.key = Some(key);
        self
    }
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
    pub fn key(&self) -> Option<&KeyPattern> {
        self.key.as_ref()
    }
    pub fn tags(&self) -> &Tags {
        &self.tags
    }
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
    pub fn matcher(&self) -> Result<Option<KeyMatcher>> {
        self.key.as_ref().map(KeyPattern::matcher).transpose()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSearch {
    key: Option<KeyPattern>,
    node_key: Option<KeyPattern>,
    from_key: Option<KeyPattern>,
    to_key: Option<KeyPattern>,
    edge_type: Option<String>,
    tags: Tags,
    direction: Direction,
    alias: Option<String>,
    scope: Option<String>,
}

impl EdgeSearch {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_key(mut self, key: KeyPattern) -> Self {
        self.key = Some(key);
        self
    }
    pub fn with_node_key(mut self, key: KeyPattern) -> Self {
        self.node_key = Some(key);
        self
    }
    pub fn with_from_key(mut self, key: KeyPattern) -> Self {
        self.from_key = Some(key);
        self
    }
    pub fn with_to_key(mut self, key: KeyPattern) -> Self {
        self.to_key = Some(key);
        self
    }
    pub fn with_edge_type(mut self, edge_type: impl Into<String>) -> Self {
        self.edge_type = Some(edge_type.into());
        self
    }
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
    pub fn key(&self) -> Option<&KeyPattern> {
        self.key.as_ref()
    }
    pub fn node_key(&self) -> Option<&KeyPattern> {
        self.node_key.as_ref()
    }
    pub fn from_key(&self) -> Option<&KeyPattern> {
        self.from_key.as_ref()
    }
    pub fn to_key(&self) -> Option<&KeyPattern> {
        self.to_key.as_ref()
    }
    pub fn edge_type(&self) -> Option<&str> {
        self.edge_type.as_deref()
    }
    pub fn tags(&self) -> &Tags {
        &self.tags
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
    pub fn matchers(&self) -> Result<EdgeMatchers> {
        Ok(EdgeMatchers {
            key: self.key.as_ref().map(KeyPattern::matcher).transpose()?,
            node: self.node_key.as_ref().map(KeyPattern::matcher).transpose()?,
            from: self.from_key.as_ref().map(KeyPattern::matcher).transpose()?,
            to: self.to_key.as_ref().map(KeyPattern::matcher).transpose()?,
        })
    }
}

/// Compiled key patterns of one edge search.
#[derive(Debug, Clone)]
pub struct EdgeMatchers {
    pub key: Option<KeyMatcher>,
    pub node: Option<KeyMatcher>,
    pub from: Option<KeyMatcher>,
    pub to: Option<KeyMatcher>,
}

impl EdgeMatchers {
    pub fn key_matches(&self, key: &str) -> bool {
        matches_optional(&self.key, key)
    }
    pub fn endpoints_match(&self, from: &str, to: &str) -> bool {
        matches_optional(&self.from, from) && matches_optional(&self.to, to)
    }
    pub fn node_matches(&self, key: &str) -> bool {
        matches_optional(&self.node, key)
    }
}

// ------------- Deletes -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDelete {
    search: Vec<NodeSearch>,
}

impl NodeDelete {
    pub fn new(search: Vec<NodeSearch>) -> Self {
        Self { search }
    }
    pub fn search(&self) -> &[NodeSearch] {
        &self.search
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDelete {
    search: Vec<EdgeSearch>,
}

impl EdgeDelete {
    pub fn new(search: Vec<EdgeSearch>) -> Self {
        Self { search }
    }
    pub fn search(&self) -> &[EdgeSearch] {
        &self.search
    }
}

// ------------- Adds -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeAdd {
    key: Option<String>,
    from_key: String,
    to_key: String,
    edge_type: Option<String>,
    tags: Tags,
    direction: Direction,
    alias: Option<String>,
}

impl EdgeAdd {
    pub fn new(from_key: impl Into<String>, to_key: impl Into<String>) -> Self {
        Self {
            key: None,
            from_key: from_key.into(),
            to_key: to_key.into(),
            edge_type: None,
            tags: Tags::new(),
            direction: Direction::Forward,
            alias: None,
        }
    }
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
    pub fn with_edge_type(mut self, edge_type: impl Into<String>) -> Self {
        self.edge_type = Some(edge_type.into());
        self
    }
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
    pub fn from_key(&self) -> &str {
        &self.from_key
    }
    pub fn to_key(&self) -> &str {
        &self.to_key
    }
    pub fn edge_type(&self) -> Option<&str> {
        self.edge_type.as_deref()
    }
    pub fn tags(&self) -> &Tags {
        &self.tags
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAdd {
    key: String,
    tags: Tags,
    data: Option<serde_json::Value>,
    alias: Option<String>,
}

impl NodeAdd {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), tags: Tags::new(), data: None, alias: None }
    }
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn tags(&self) -> &Tags {
        &self.tags
    }
    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }
}

// ------------- Commands -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GraphCommand {
    NodeSearch(NodeSearch),
    EdgeSearch(EdgeSearch),
    NodeDelete(NodeDelete),
    EdgeDelete(EdgeDelete),
    EdgeAdd(EdgeAdd),
    NodeAdd(NodeAdd),
}

impl GraphCommand {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, GraphCommand::NodeSearch(_) | GraphCommand::EdgeSearch(_))
    }
    /// The kind of entity this command selects or changes.
    pub fn entity(&self) -> Entity {
        match self {
            GraphCommand::NodeSearch(_) | GraphCommand::NodeDelete(_) | GraphCommand::NodeAdd(_) => {
                Entity::Node
            }
            GraphCommand::EdgeSearch(_) | GraphCommand::EdgeDelete(_) | GraphCommand::EdgeAdd(_) => {
                Entity::Edge
            }
        }
    }
    /// The alias the command's result is bound to. Deletes have none of
    /// their own: each of their searches binds its matches under its alias.
    pub fn alias(&self) -> Option<&str> {
        match self {
            GraphCommand::NodeSearch(s) => s.alias(),
            GraphCommand::EdgeSearch(s) => s.alias(),
            GraphCommand::NodeDelete(_) | GraphCommand::EdgeDelete(_) => None,
            GraphCommand::EdgeAdd(a) => a.alias(),
            GraphCommand::NodeAdd(a) => a.alias(),
        }
    }
}

impl From<NodeSearch> for GraphCommand {
    fn from(search: NodeSearch) -> Self {
        GraphCommand::NodeSearch(search)
    }
}
impl From<EdgeSearch> for GraphCommand {
    fn from(search: EdgeSearch) -> Self {
        GraphCommand::EdgeSearch(search)
    }
}
impl From<NodeDelete> for GraphCommand {
    fn from(delete: NodeDelete) -> Self {
        GraphCommand::NodeDelete(delete)
    }
}
impl From<EdgeDelete> for GraphCommand {
    fn from(delete: EdgeDelete) -> Self {
        GraphCommand::EdgeDelete(delete)
    }
}
impl From<EdgeAdd> for GraphCommand {
    fn from(add: EdgeAdd) -> Self {
        GraphCommand::EdgeAdd(add)
    }
}
impl From<NodeAdd> for GraphCommand {
    fn from(add: NodeAdd) -> Self {
        GraphCommand::NodeAdd(add)
    }
}

// ------------- Canonical text -------------
struct Predicates(Vec<String>);

impl Predicates {
    fn new() -> Self {
        Self(Vec::new())
    }
    fn push(&mut self, name: &str, value: String) {
        self.0.push(format!("{name}={value}"));
    }
    fn key(&mut self, name: &str, key: Option<&KeyPattern>) {
        if let Some(key) = key {
            self.push(name, key.render());
        }
    }
    fn text(&mut self, name: &str, text: Option<&str>) {
        if let Some(text) = text {
            self.push(name, quote_if_needed(text));
        }
    }
    fn tags(&mut self, tags: &Tags) {
        for tag in tags {
            self.push("tags", quote_if_needed(&tag.to_string()));
        }
    }
}

fn write_group(
    f: &mut fmt::Formatter<'_>,
    entity: Option<Entity>,
    predicates: Predicates,
    scope: Option<&str>,
    alias: Option<&str>,
) -> fmt::Result {
    if let Some(entity) = entity {
        write!(f, "{entity} ")?;
    }
    write!(f, "({})", predicates.0.join(" "))?;
    if let Some(scope) = scope {
        write!(f, " in {scope}")?;
    }
    if let Some(alias) = alias {
        write!(f, " as {alias}")?;
    }
    Ok(())
}

impl fmt::Display for NodeSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Predicates::new();
        p.key("key", self.key());
        p.tags(&self.tags);
        write_group(f, None, p, self.scope(), self.alias())
    }
}

impl fmt::Display for EdgeSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Predicates::new();
        p.key("key", self.key());
        p.key("node", self.node_key());
        p.key("from", self.from_key());
        p.key("to", self.to_key());
        p.text("type", self.edge_type());
        p.tags(&self.tags);
        if self.direction != Direction::Both {
            p.push("direction", self.direction.to_string());
        }
        write_group(f, Some(Entity::Edge), p, self.scope(), self.alias())
    }
}

impl fmt::Display for EdgeAdd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Predicates::new();
        p.text("key", self.key());
        p.text("from", Some(self.from_key()));
        p.text("to", Some(self.to_key()));
        p.text("type", self.edge_type());
        p.tags(&self.tags);
        if self.direction != Direction::Forward {
            p.push("direction", self.direction.to_string());
        }
        write_group(f, Some(Entity::Edge), p, None, self.alias())
    }
}

impl fmt::Display for NodeAdd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Predicates::new();
        p.text("key", Some(self.key()));
        p.tags(&self.tags);
        if let Some(data) = &self.data {
            p.push("data", quote(&data.to_string()));
        }
        write_group(f, Some(Entity::Node), p, None, self.alias())
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(T::to_string).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for GraphCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphCommand::NodeSearch(s) => write!(f, "select {s};"),
            GraphCommand::EdgeSearch(s) => write!(f, "select {s};"),
            GraphCommand::NodeDelete(d) => write!(f, "delete {};", join(d.search())),
            GraphCommand::EdgeDelete(d) => write!(f, "delete {};", join(d.search())),
            GraphCommand::EdgeAdd(a) => write!(f, "add {a};"),
            GraphCommand::NodeAdd(a) => write!(f, "add {a};"),
        }
    }
}

/// Canonical query text for a command list, one statement per command.
pub fn render(commands: &[GraphCommand]) -> String {
    commands.iter().map(GraphCommand::to_string).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns_anchor_both_ends() {
        let matcher = KeyPattern::parse("user*").matcher().unwrap();
        assert!(matcher.matches("user1"));
        assert!(matcher.matches("user"));
        assert!(!matcher.matches("superuser"));
        let matcher = KeyPattern::parse("*.v?").matcher().unwrap();
        assert!(matcher.matches("a.v?"));
        assert!(!matcher.matches("a.vx"));
    }

    #[test]
    fn any_and_exact() {
        assert_eq!(KeyPattern::parse("*"), KeyPattern::Any);
        assert_eq!(KeyPattern::parse("a"), KeyPattern::exact("a"));
        assert!(KeyPattern::Any.matcher().unwrap().matches("anything"));
        assert!(!KeyPattern::exact("a").matcher().unwrap().matches("b"));
    }

    #[test]
    fn renders_canonical_text() {
        let search = NodeSearch::new()
            .with_key(KeyPattern::exact("user 1"))
            .with_tags(Tags::parse("active,role:admin").unwrap())
            .with_alias("u");
        assert_eq!(
            GraphCommand::from(search).to_string(),
            "select (key='user 1' tags=active tags=role:admin) as u;"
        );
        let add = EdgeAdd::new("a", "b").with_edge_type("owns");
        assert_eq!(GraphCommand::from(add).to_string(), "add edge (from=a to=b type=owns);");
        let delete = NodeDelete::new(vec![NodeSearch::new().with_key(KeyPattern::exact("a"))]);
        assert_eq!(GraphCommand::from(delete).to_string(), "delete (key=a);");
    }

    #[test]
    fn mutations_are_classified() {
        assert!(!GraphCommand::from(NodeSearch::new()).is_mutation());
        assert!(GraphCommand::from(NodeAdd::new("a")).is_mutation());
        assert_eq!(GraphCommand::from(EdgeDelete::new(vec![])).entity(), Entity::Edge);
    }
}
