//! Folds tokens into [`GraphCommand`]s.
//!
//! The parser shifts tokens onto an explicit stack of [`LangNode`]s and
//! reduces a predicate list into a search group at `)` and a whole statement
//! into commands at `;`. What may come next is decided by the node on top of
//! the stack. The stack is owned by one call, so independent queries parse
//! concurrently without shared state.
//!
//! ```text
//! statement := verb search (',' search)* ';'
//! search    := ['node' | 'edge'] '(' predicate* ')' ['in' alias] ['as' alias]
//! predicate := '*' | name '=' value
//! ```
//!
//! A `delete` is read exactly like a `select` and its searches are then
//! re-tagged into one delete command. Any error discards the whole query.

use std::collections::HashSet;

use crate::command::{
    EdgeAdd, EdgeDelete, EdgeSearch, Entity, GraphCommand, KeyPattern, NodeAdd, NodeDelete,
    NodeSearch, is_valid_alias,
};
use crate::construct::Direction;
use crate::error::{KnotError, Result};
use crate::tags::Tags;
use crate::tokenizer::{Token, TokenKind, tokenize};

const NODE_SEARCH: &[&str] = &["key", "tags"];
const EDGE_SEARCH: &[&str] = &["key", "tags", "node", "from", "to", "type", "direction"];
const NODE_ADD: &[&str] = &["key", "tags", "data"];
const EDGE_ADD: &[&str] = &["key", "from", "to", "type", "tags", "direction"];
const KNOWN: &[&str] = &["key", "tags", "node", "from", "to", "type", "direction", "data"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Select,
    Delete,
    Add,
}

#[derive(Debug)]
enum Value {
    Quoted(String),
    Bare(String),
}

impl Value {
    fn text(&self) -> &str {
        match self {
            Value::Quoted(text) | Value::Bare(text) => text,
        }
    }
    fn key_pattern(&self) -> KeyPattern {
        match self {
            Value::Quoted(text) => KeyPattern::exact(text.as_str()),
            Value::Bare(text) => KeyPattern::parse(text),
        }
    }
}

#[derive(Debug)]
struct Predicate {
    name: String,
    value: Value,
    offset: usize,
}

impl Predicate {
    fn error(&self, message: impl Into<String>) -> KnotError {
        KnotError::Parse { message: message.into(), token: Some(self.name.clone()), offset: Some(self.offset) }
    }
}

#[derive(Debug)]
struct Group {
    entity: Option<Entity>,
    predicates: Vec<Predicate>,
    scope: Option<String>,
    alias: Option<String>,
    offset: usize,
}

#[derive(Debug)]
enum LangNode {
    Verb { verb: Verb, offset: usize },
    Entity(Entity),
    Open(usize),
    Predicate(Predicate),
    Group(Group),
    Separator,
}

/// What the node on top of the stack allows next.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Verb,
    Search,
    Open,
    Predicate,
    Suffix,
}

enum Search {
    Node(NodeSearch),
    Edge(EdgeSearch),
}

pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
    stack: Vec<LangNode>,
    aliases: HashSet<String>,
    commands: Vec<GraphCommand>,
}

/// Tokenizes and parses a complete query.
pub fn parse_query(text: &str) -> Result<Vec<GraphCommand>> {
    let tokens = tokenize(text).collect::<Result<Vec<_>>>()?;
    Parser::parse(tokens)
}

impl Parser {
    pub fn parse(tokens: Vec<Token>) -> Result<Vec<GraphCommand>> {
        let mut parser = Self {
            tokens,
            position: 0,
            stack: Vec::new(),
            aliases: HashSet::new(),
            commands: Vec::new(),
        };
        parser.run()?;
        Ok(parser.commands)
    }

    fn run(&mut self) -> Result<()> {
        while let Some(token) = self.next_significant() {
            match self.expect() {
                Expect::Verb => self.shift_verb(token)?,
                Expect::Search => self.shift_search(token)?,
                Expect::Open => {
                    if !token.is_symbol('(') {
                        return Err(unexpected(&token, "'('"));
                    }
                    self.stack.push(LangNode::Open(token.offset()));
                }
                Expect::Predicate => self.shift_predicate(token)?,
                Expect::Suffix => self.shift_suffix(token)?,
            }
        }
        if !self.stack.is_empty() {
            return Err(self.end_of_input("';'"));
        }
        Ok(())
    }

    fn expect(&self) -> Expect {
        match self.stack.last() {
            None => Expect::Verb,
            Some(LangNode::Verb { .. } | LangNode::Separator) => Expect::Search,
            Some(LangNode::Entity(_)) => Expect::Open,
            Some(LangNode::Open(_) | LangNode::Predicate(_)) => Expect::Predicate,
            Some(LangNode::Group(_)) => Expect::Suffix,
        }
    }

    fn next_significant(&mut self) -> Option<Token> {
        while let Some(token) = self.tokens.get(self.position) {
            self.position += 1;
            if !token.is_whitespace() {
                return Some(token.clone());
            }
        }
        None
    }

    fn skip_whitespace(&mut self) {
        while self.tokens.get(self.position).is_some_and(Token::is_whitespace) {
            self.position += 1;
        }
    }

    fn end_of_input(&self, expected: &str) -> KnotError {
        let offset = self.tokens.last().map_or(0, |t| t.offset() + t.text().len());
        KnotError::Parse {
            message: format!("unexpected end of input, expected {expected}"),
            token: None,
            offset: Some(offset),
        }
    }

    fn shift_verb(&mut self, token: Token) -> Result<()> {
        let verb = if token.is_keyword("select") {
            Verb::Select
        } else if token.is_keyword("delete") {
            Verb::Delete
        } else if token.is_keyword("add") {
            Verb::Add
        } else {
            return Err(unexpected(&token, "a command keyword (select, delete or add)"));
        };
        self.stack.push(LangNode::Verb { verb, offset: token.offset() });
        Ok(())
    }

    fn shift_search(&mut self, token: Token) -> Result<()> {
        if token.is_symbol('(') {
            self.stack.push(LangNode::Open(token.offset()));
        } else if token.is_keyword("node") {
            self.stack.push(LangNode::Entity(Entity::Node));
        } else if token.is_keyword("edge") {
            self.stack.push(LangNode::Entity(Entity::Edge));
        } else {
            return Err(unexpected(&token, "'(', 'node' or 'edge'"));
        }
        Ok(())
    }

    fn shift_predicate(&mut self, token: Token) -> Result<()> {
        if token.is_symbol(')') {
            return self.reduce_group();
        }
        if token.is_symbol('*') {
            let value = Value::Bare("*".to_string());
            self.stack.push(LangNode::Predicate(Predicate { name: "key".to_string(), value, offset: token.offset() }));
            return Ok(());
        }
        if token.kind() != TokenKind::Value {
            return Err(unexpected(&token, "a predicate name, '*' or ')'"));
        }
        let name = token.text().to_ascii_lowercase();
        match self.next_significant() {
            Some(equals) if equals.is_symbol('=') => {}
            Some(other) => return Err(unexpected(&other, &format!("'=' after '{name}'"))),
            None => return Err(self.end_of_input(&format!("'=' after '{name}'"))),
        }
        let value = self.read_value(&name)?;
        self.stack.push(LangNode::Predicate(Predicate { name, value, offset: token.offset() }));
        Ok(())
    }

    /// A quoted literal, or a run of adjacent words and `*`.
    fn read_value(&mut self, name: &str) -> Result<Value> {
        self.skip_whitespace();
        let Some(first) = self.tokens.get(self.position) else {
            return Err(self.end_of_input(&format!("a value for '{name}'")));
        };
        if first.kind() == TokenKind::Quoted {
            let value = Value::Quoted(first.text().to_string());
            self.position += 1;
            return Ok(value);
        }
        let mut text = String::new();
        while let Some(token) = self.tokens.get(self.position) {
            if token.kind() != TokenKind::Value && !token.is_symbol('*') {
                break;
            }
            text.push_str(token.text());
            self.position += 1;
        }
        if text.is_empty() {
            let token = self.tokens[self.position].clone();
            return Err(unexpected(&token, &format!("a value for '{name}'")));
        }
        Ok(Value::Bare(text))
    }

    fn reduce_group(&mut self) -> Result<()> {
        let mut predicates = Vec::new();
        let offset = loop {
            match self.stack.pop() {
                Some(LangNode::Predicate(predicate)) => predicates.push(predicate),
                Some(LangNode::Open(offset)) => break offset,
                _ => return Err(KnotError::Invariant("unbalanced parser stack".to_string())),
            }
        };
        predicates.reverse();
        let entity = match self.stack.last() {
            Some(LangNode::Entity(entity)) => Some(*entity),
            _ => None,
        };
        if entity.is_some() {
            self.stack.pop();
        }
        self.stack.push(LangNode::Group(Group { entity, predicates, scope: None, alias: None, offset }));
        Ok(())
    }

    fn top_group(&mut self) -> Result<&mut Group> {
        match self.stack.last_mut() {
            Some(LangNode::Group(group)) => Ok(group),
            _ => Err(KnotError::Invariant("expected a search group on the parser stack".to_string())),
        }
    }

    fn read_alias(&mut self, after: &str) -> Result<String> {
        match self.next_significant() {
            Some(token) if token.kind() == TokenKind::Value && is_valid_alias(token.text()) => {
                Ok(token.text().to_string())
            }
            Some(token) => Err(unexpected(&token, &format!("an alias after '{after}'"))),
            None => Err(self.end_of_input(&format!("an alias after '{after}'"))),
        }
    }

    fn shift_suffix(&mut self, token: Token) -> Result<()> {
        let (scoped, aliased) = {
            let group = self.top_group()?;
            (group.scope.is_some(), group.alias.is_some())
        };
        if token.is_keyword("in") && !scoped && !aliased {
            let scope = self.read_alias("in")?;
            if !self.aliases.contains(&scope) {
                return Err(KnotError::NotFound(format!("alias '{scope}' is not declared")));
            }
            self.top_group()?.scope = Some(scope);
        } else if token.is_keyword("as") && !aliased {
            let alias = self.read_alias("as")?;
            self.aliases.insert(alias.clone());
            self.top_group()?.alias = Some(alias);
        } else if token.is_symbol(',') {
            self.stack.push(LangNode::Separator);
        } else if token.is_symbol(';') {
            self.reduce_statement()?;
        } else {
            return Err(unexpected(&token, "'in', 'as', ',' or ';'"));
        }
        Ok(())
    }

    fn reduce_statement(&mut self) -> Result<()> {
        let mut groups = Vec::new();
        let (verb, offset) = loop {
            match self.stack.pop() {
                Some(LangNode::Group(group)) => groups.push(group),
                Some(LangNode::Separator) => {}
                Some(LangNode::Verb { verb, offset }) => break (verb, offset),
                _ => return Err(KnotError::Invariant("unbalanced parser stack".to_string())),
            }
        };
        groups.reverse();
        match verb {
            Verb::Select => {
                for group in groups {
                    let command = match build_search(group)? {
                        Search::Node(search) => GraphCommand::from(search),
                        Search::Edge(search) => GraphCommand::from(search),
                    };
                    self.commands.push(command);
                }
            }
            Verb::Delete => {
                let command = build_delete(groups, offset)?;
                self.commands.push(command);
            }
            Verb::Add => {
                for group in groups {
                    let command = build_add(group)?;
                    self.commands.push(command);
                }
            }
        }
        Ok(())
    }
}

fn unexpected(token: &Token, expected: &str) -> KnotError {
    KnotError::Parse {
        message: format!("unexpected '{}' at offset {}, expected {expected}", token.text(), token.offset()),
        token: Some(token.text().to_string()),
        offset: Some(token.offset()),
    }
}

/// Rejects unknown, misplaced and repeated predicates. `tags` may repeat.
fn check_predicates(group: &Group, allowed: &[&str], context: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for predicate in &group.predicates {
        let name = predicate.name.as_str();
        if !KNOWN.contains(&name) {
            return Err(predicate.error(format!("unknown predicate '{name}'")));
        }
        if !allowed.contains(&name) {
            return Err(predicate.error(format!("predicate '{name}' does not apply to {context}")));
        }
        if name != "tags" && !seen.insert(name) {
            return Err(predicate.error(format!("duplicate predicate '{name}'")));
        }
    }
    Ok(())
}

fn uses_any(group: &Group, names: &[&str]) -> bool {
    group.predicates.iter().any(|p| names.contains(&p.name.as_str()))
}

fn direction(predicate: &Predicate) -> Result<Direction> {
    Direction::parse(predicate.value.text()).ok_or_else(|| {
        KnotError::Validation(format!(
            "malformed direction '{}', expected both, forward or backward",
            predicate.value.text()
        ))
    })
}

fn build_search(group: Group) -> Result<Search> {
    let entity = group.entity.unwrap_or(if uses_any(&group, &["node", "from", "to", "type", "direction"]) {
        Entity::Edge
    } else {
        Entity::Node
    });
    match entity {
        Entity::Node => {
            check_predicates(&group, NODE_SEARCH, "node searches")?;
            let mut search = NodeSearch::new();
            let mut tags = Tags::new();
            for predicate in &group.predicates {
                match predicate.name.as_str() {
                    "key" => search = search.with_key(predicate.value.key_pattern()),
                    _ => tags.extend(Tags::parse(predicate.value.text())?),
                }
            }
            search = search.with_tags(tags);
            if let Some(scope) = group.scope {
                search = search.with_scope(scope);
            }
            if let Some(alias) = group.alias {
                search = search.with_alias(alias);
            }
            Ok(Search::Node(search))
        }
        Entity::Edge => {
            check_predicates(&group, EDGE_SEARCH, "edge searches")?;
            let mut search = EdgeSearch::new();
            let mut tags = Tags::new();
            for predicate in &group.predicates {
                search = match predicate.name.as_str() {
                    "key" => search.with_key(predicate.value.key_pattern()),
                    "node" => search.with_node_key(predicate.value.key_pattern()),
                    "from" => search.with_from_key(predicate.value.key_pattern()),
                    "to" => search.with_to_key(predicate.value.key_pattern()),
                    "type" => search.with_edge_type(predicate.value.text()),
                    "direction" => search.with_direction(direction(predicate)?),
                    _ => {
                        tags.extend(Tags::parse(predicate.value.text())?);
                        search
                    }
                };
            }
            search = search.with_tags(tags);
            if let Some(scope) = group.scope {
                search = search.with_scope(scope);
            }
            if let Some(alias) = group.alias {
                search = search.with_alias(alias);
            }
            Ok(Search::Edge(search))
        }
    }
}

fn build_delete(groups: Vec<Group>, offset: usize) -> Result<GraphCommand> {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for group in groups {
        match build_search(group)? {
            Search::Node(search) => nodes.push(search),
            Search::Edge(search) => edges.push(search),
        }
    }
    match (nodes.is_empty(), edges.is_empty()) {
        (false, false) => Err(KnotError::Parse {
            message: "cannot mix node and edge searches in one delete".to_string(),
            token: Some("delete".to_string()),
            offset: Some(offset),
        }),
        (_, true) => Ok(NodeDelete::new(nodes).into()),
        (true, false) => Ok(EdgeDelete::new(edges).into()),
    }
}

/// Keys given to `add` name exactly one entity.
fn add_key(predicate: &Predicate) -> Result<String> {
    let key = predicate.value.text();
    if key.is_empty() {
        return Err(KnotError::Validation(format!("empty '{}' in add", predicate.name)));
    }
    if key.contains('*') {
        return Err(KnotError::Validation(format!(
            "wildcards are not allowed in add keys, got {}='{key}'",
            predicate.name
        )));
    }
    Ok(key.to_string())
}

fn build_add(group: Group) -> Result<GraphCommand> {
    if let Some(scope) = &group.scope {
        return Err(KnotError::Parse {
            message: format!("add does not take a scope, got 'in {scope}'"),
            token: Some("in".to_string()),
            offset: Some(group.offset),
        });
    }
    let entity = group.entity.unwrap_or(if uses_any(&group, &["from", "to", "type", "direction"]) {
        Entity::Edge
    } else {
        Entity::Node
    });
    let find = |name: &str| group.predicates.iter().find(|p| p.name == name);
    let mut tags = Tags::new();
    for predicate in group.predicates.iter().filter(|p| p.name == "tags") {
        tags.extend(Tags::parse(predicate.value.text())?);
    }
    match entity {
        Entity::Node => {
            check_predicates(&group, NODE_ADD, "add node")?;
            let key = find("key").ok_or_else(|| KnotError::Parse {
                message: "add node requires a key".to_string(),
                token: None,
                offset: Some(group.offset),
            })?;
            let mut add = NodeAdd::new(add_key(key)?).with_tags(tags);
            if let Some(data) = find("data") {
                let value = serde_json::from_str(data.value.text())
                    .map_err(|e| KnotError::Validation(format!("malformed data: {e}")))?;
                add = add.with_data(value);
            }
            if let Some(alias) = &group.alias {
                add = add.with_alias(alias.as_str());
            }
            Ok(add.into())
        }
        Entity::Edge => {
            check_predicates(&group, EDGE_ADD, "add edge")?;
            let (Some(from), Some(to)) = (find("from"), find("to")) else {
                return Err(KnotError::Parse {
                    message: "add edge requires both 'from' and 'to'".to_string(),
                    token: None,
                    offset: Some(group.offset),
                });
            };
            let mut add = EdgeAdd::new(add_key(from)?, add_key(to)?).with_tags(tags);
            if let Some(key) = find("key") {
                add = add.with_key(add_key(key)?);
            }
            if let Some(edge_type) = find("type") {
                add = add.with_edge_type(edge_type.value.text());
            }
            if let Some(predicate) = find("direction") {
                add = add.with_direction(direction(predicate)?);
            }
            if let Some(alias) = &group.alias {
                add = add.with_alias(alias.as_str());
            }
            Ok(add.into())
        }
    }
}
