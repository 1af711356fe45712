//! Executes parsed command sequences.
//!
//! An [`Interpreter`] walks the commands with a [`Cursor`], binding each
//! result to an alias (or a synthesized `$<index>`) so later commands can
//! scope their searches to it. Traversing from a node set to its edges
//! records [`Link`]s, which let a node search over that edge set return the
//! far endpoints.
//!
//! Mutations go to the journal as `Action` entries before they are applied to
//! a private copy of the graph. The transaction is opened lazily by the first
//! mutation, committed when every command succeeded and rolled back
//! otherwise. Only a committed copy is handed back to the caller.

use std::borrow::{Borrow, Cow};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{EdgeAdd, EdgeDelete, EdgeSearch, GraphCommand, NodeAdd, NodeDelete, NodeSearch};
use crate::config::EngineSettings;
use crate::construct::{Direction, GraphEdge, GraphItem, GraphNode, GraphState, Mutation, OtherHasher};
use crate::error::{KnotError, Result};
use crate::interface::CancelToken;
use crate::journal::{Journal, TransactionId};

// ------------- Results -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Invalid,
    NotFound,
    Conflict,
    Cancelled,
    Error,
}

impl StatusCode {
    pub fn from_error(error: &KnotError) -> Self {
        match error {
            KnotError::Lex { .. } | KnotError::Parse { .. } => StatusCode::BadRequest,
            KnotError::Validation(_) => StatusCode::Invalid,
            KnotError::NotFound(_) => StatusCode::NotFound,
            KnotError::Conflict(_) => StatusCode::Conflict,
            KnotError::Cancelled(_) => StatusCode::Cancelled,
            _ => StatusCode::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQueryResult {
    pub status: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub items: Vec<GraphItem>,
    pub alias: BTreeMap<String, Vec<GraphItem>>,
}

impl GraphQueryResult {
    pub fn ok(items: Vec<GraphItem>, alias: BTreeMap<String, Vec<GraphItem>>) -> Self {
        Self { status: StatusCode::Ok, error: None, items, alias }
    }
    pub fn failure(error: &KnotError) -> Self {
        Self {
            status: StatusCode::from_error(error),
            error: Some(error.to_string()),
            items: Vec::new(),
            alias: BTreeMap::new(),
        }
    }
    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::Ok
    }
    pub fn keys(&self) -> Vec<&str> {
        self.items.iter().map(GraphItem::key).collect()
    }
    pub fn alias_keys(&self, alias: &str) -> Option<Vec<&str>> {
        self.alias.get(alias).map(|items| items.iter().map(GraphItem::key).collect())
    }
}

/// What one run produced. `graph` is only set when a transaction committed.
#[derive(Debug)]
pub struct Execution {
    pub result: GraphQueryResult,
    pub graph: Option<GraphState>,
}

// ------------- Cursor -------------
#[derive(Debug, Clone)]
pub struct Cursor<'c> {
    commands: &'c [GraphCommand],
    position: usize,
}

impl<'c> Cursor<'c> {
    pub fn new(commands: &'c [GraphCommand]) -> Self {
        Self { commands, position: 0 }
    }
    pub fn position(&self) -> usize {
        self.position
    }
    pub fn has_next(&self) -> bool {
        self.position < self.commands.len()
    }
    pub fn current(&self) -> Option<&'c GraphCommand> {
        self.commands.get(self.position)
    }
    pub fn advance(&mut self) {
        if self.has_next() {
            self.position += 1;
        }
    }
}

// ------------- Working state -------------
/// Append-ordered multimap.
#[derive(Debug, Clone)]
pub struct DictionaryList<K, V> {
    entries: HashMap<K, Vec<V>, OtherHasher>,
}

impl<K: Eq + Hash, V> DictionaryList<K, V> {
    pub fn new() -> Self {
        Self { entries: HashMap::default() }
    }
    pub fn push(&mut self, key: K, value: V) {
        self.entries.entry(key).or_default().push(value);
    }
    pub fn get<Q>(&self, key: &Q) -> &[V]
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map_or(&[], Vec::as_slice)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for DictionaryList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// An edge traversed from a node, recorded under that node's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub edge_key: String,
    pub peer_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkingDataSet {
    Nodes(Vec<GraphNode>),
    /// `anchors` holds the keys of the nodes the edges were traversed from,
    /// captured when the set was built.
    Edges { edges: Vec<GraphEdge>, anchors: Option<Vec<String>> },
}

impl WorkingDataSet {
    pub fn len(&self) -> usize {
        match self {
            WorkingDataSet::Nodes(nodes) => nodes.len(),
            WorkingDataSet::Edges { edges, .. } => edges.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn items(&self) -> Vec<GraphItem> {
        match self {
            WorkingDataSet::Nodes(nodes) => nodes.iter().cloned().map(GraphItem::Node).collect(),
            WorkingDataSet::Edges { edges, .. } => edges.iter().cloned().map(GraphItem::Edge).collect(),
        }
    }
}

// ------------- Interpreter -------------
pub struct Interpreter<'g> {
    graph: &'g GraphState,
    settings: &'g EngineSettings,
    cancel: Option<CancelToken>,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g GraphState, settings: &'g EngineSettings) -> Self {
        Self { graph, settings, cancel: None }
    }
    pub fn with_cancel(mut self, cancel: Option<CancelToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs `commands` in order. Without a journal only searches are allowed.
    pub fn execute(&self, commands: &[GraphCommand], journal: Option<&mut Journal>) -> Execution {
        let mut run = Run {
            scratch: Cow::Borrowed(self.graph),
            settings: self.settings,
            journal,
            transaction: None,
            sets: HashMap::default(),
            links: DictionaryList::new(),
            items: Vec::new(),
        };
        let mut cursor = Cursor::new(commands);
        match self.run_all(&mut run, &mut cursor) {
            Ok(()) => run.finish(),
            Err(error) => {
                debug!(position = cursor.position(), "command failed");
                run.abort(error)
            }
        }
    }

    fn run_all(&self, run: &mut Run<'_>, cursor: &mut Cursor<'_>) -> Result<()> {
        while let Some(command) = cursor.current() {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(KnotError::Cancelled(format!("query cancelled before command {}", cursor.position())));
            }
            debug!(position = cursor.position(), %command, "executing");
            run.execute(command, cursor.position())?;
            cursor.advance();
        }
        Ok(())
    }
}

struct Run<'a> {
    scratch: Cow<'a, GraphState>,
    settings: &'a EngineSettings,
    journal: Option<&'a mut Journal>,
    transaction: Option<TransactionId>,
    sets: HashMap<String, WorkingDataSet, OtherHasher>,
    // node key -> edges traversed from it
    links: DictionaryList<String, Link>,
    items: Vec<GraphItem>,
}

/// Journal failures during a run are reported as conflicts.
fn conflict(error: KnotError) -> KnotError {
    match error {
        KnotError::Conflict(_) => error,
        other => KnotError::Conflict(format!("journal append failed: {other}")),
    }
}

fn sorted_nodes(mut nodes: Vec<GraphNode>) -> Vec<GraphNode> {
    nodes.sort_by(|a, b| a.key().cmp(b.key()));
    nodes.dedup_by(|a, b| a.key() == b.key());
    nodes
}

fn sorted_edges(mut edges: Vec<GraphEdge>) -> Vec<GraphEdge> {
    edges.sort_by(|a, b| a.key().cmp(b.key()));
    edges.dedup_by(|a, b| a.key() == b.key());
    edges
}

impl Run<'_> {
    fn graph(&self) -> &GraphState {
        &self.scratch
    }

    fn execute(&mut self, command: &GraphCommand, index: usize) -> Result<()> {
        let set = match command {
            GraphCommand::NodeSearch(search) => WorkingDataSet::Nodes(self.search_nodes(search)?),
            GraphCommand::EdgeSearch(search) => self.search_edges(search)?,
            GraphCommand::NodeAdd(add) => WorkingDataSet::Nodes(vec![self.add_node(add)?]),
            GraphCommand::EdgeAdd(add) => WorkingDataSet::Edges { edges: vec![self.add_edge(add)?], anchors: None },
            GraphCommand::NodeDelete(delete) => WorkingDataSet::Nodes(self.delete_nodes(delete)?),
            GraphCommand::EdgeDelete(delete) => WorkingDataSet::Edges { edges: self.delete_edges(delete)?, anchors: None },
        };
        self.items.extend(set.items());
        let alias = command.alias().map_or_else(|| format!("${index}"), str::to_string);
        self.sets.insert(alias, set);
        Ok(())
    }

    fn set(&self, alias: &str) -> Result<&WorkingDataSet> {
        self.sets
            .get(alias)
            .ok_or_else(|| KnotError::NotFound(format!("alias '{alias}' is not bound")))
    }

    fn search_nodes(&self, search: &NodeSearch) -> Result<Vec<GraphNode>> {
        let matcher = search.matcher()?;
        let accept = |node: &GraphNode| {
            matcher.as_ref().is_none_or(|m| m.matches(node.key())) && node.tags().has(search.tags())
        };
        let found = match search.scope() {
            None => self.graph().nodes().filter(|&n| accept(n)).cloned().collect(),
            Some(scope) => match self.set(scope)? {
                WorkingDataSet::Nodes(nodes) => nodes.iter().filter(|&n| accept(n)).cloned().collect(),
                WorkingDataSet::Edges { edges, anchors } => self
                    .endpoints(edges, anchors.as_deref())
                    .into_iter()
                    .filter_map(|key| self.graph().node(key))
                    .filter(|&n| accept(n))
                    .cloned()
                    .collect(),
            },
        };
        Ok(sorted_nodes(found))
    }

    /// Far endpoints of `edges` as seen from `anchors`, or both endpoints
    /// when the edges were not traversed from a node set.
    fn endpoints<'e>(&'e self, edges: &'e [GraphEdge], anchors: Option<&'e [String]>) -> Vec<&'e str> {
        let Some(anchors) = anchors else {
            return edges.iter().flat_map(|e| [e.from_node_key(), e.to_node_key()]).collect();
        };
        let traversed: HashSet<&str> = edges.iter().map(GraphEdge::key).collect();
        anchors
            .iter()
            .flat_map(|anchor| self.links.get(anchor.as_str()))
            .filter(|link| traversed.contains(link.edge_key.as_str()))
            .map(|link| link.peer_key.as_str())
            .collect()
    }

    fn search_edges(&mut self, search: &EdgeSearch) -> Result<WorkingDataSet> {
        let matchers = search.matchers()?;
        let accept = |edge: &GraphEdge, anchor: Option<&str>| {
            if !matchers.key_matches(edge.key())
                || !matchers.endpoints_match(edge.from_node_key(), edge.to_node_key())
                || search.edge_type().is_some_and(|t| edge.edge_type() != Some(t))
                || !edge.tags().has(search.tags())
            {
                return false;
            }
            let endpoints = [edge.from_node_key(), edge.to_node_key()];
            if matchers.node.is_some() && !endpoints.iter().any(|n| matchers.node_matches(n)) {
                return false;
            }
            match (anchor, search.direction()) {
                (_, Direction::Both) => true,
                (Some(anchor), direction) => edge.oriented(anchor, direction),
                (None, direction) if matchers.node.is_some() => endpoints
                    .iter()
                    .any(|n| matchers.node_matches(n) && edge.oriented(n, direction)),
                (None, direction) => edge.direction() == direction,
            }
        };
        let Some(scope) = search.scope() else {
            let edges = self.graph().edges().filter(|&e| accept(e, None)).cloned().collect();
            return Ok(WorkingDataSet::Edges { edges: sorted_edges(edges), anchors: None });
        };
        let (edges, links, anchors) = match self.set(scope)? {
            WorkingDataSet::Edges { edges, anchors } => {
                let kept = edges.iter().filter(|&e| accept(e, None)).cloned().collect();
                return Ok(WorkingDataSet::Edges { edges: sorted_edges(kept), anchors: anchors.clone() });
            }
            WorkingDataSet::Nodes(nodes) => {
                let mut edges = Vec::new();
                let mut links = Vec::new();
                for node in nodes {
                    for edge in self.graph().incident_edges(node.key()) {
                        if accept(edge, Some(node.key())) {
                            if let Some(peer) = edge.peer(node.key()) {
                                let link = Link { edge_key: edge.key().to_string(), peer_key: peer.to_string() };
                                links.push((node.key().to_string(), link));
                            }
                            edges.push(edge.clone());
                        }
                    }
                }
                let anchors = nodes.iter().map(|n| n.key().to_string()).collect();
                (edges, links, anchors)
            }
        };
        for (node_key, link) in links {
            self.links.push(node_key, link);
        }
        Ok(WorkingDataSet::Edges { edges: sorted_edges(edges), anchors: Some(anchors) })
    }

    fn record(&mut self, mutation: Mutation) -> Result<()> {
        let journal = self
            .journal
            .as_deref_mut()
            .ok_or_else(|| KnotError::Invariant("mutation outside a journaled execution".to_string()))?;
        let tx = match self.transaction {
            Some(tx) => tx,
            None => {
                let tx = journal.start().map_err(conflict)?;
                debug!(transaction = tx, "transaction started");
                self.transaction = Some(tx);
                tx
            }
        };
        journal.action(tx, mutation.clone()).map_err(conflict)?;
        self.scratch.to_mut().apply(&mutation)
    }

    fn add_node(&mut self, add: &NodeAdd) -> Result<GraphNode> {
        let exists = self.graph().contains_node(add.key());
        if exists && self.settings.reject_duplicates {
            return Err(KnotError::Validation(format!("node '{}' already exists", add.key())));
        }
        let node = GraphNode::new(add.key(), add.tags().clone())
            .with_data(add.data().cloned().unwrap_or_default());
        let mutation = if exists { Mutation::NodeChange(node.clone()) } else { Mutation::NodeAdd(node.clone()) };
        self.record(mutation)?;
        Ok(node)
    }

    fn add_edge(&mut self, add: &EdgeAdd) -> Result<GraphEdge> {
        for endpoint in [add.from_key(), add.to_key()] {
            if !self.graph().contains_node(endpoint) {
                return Err(KnotError::Validation(format!("edge references missing node '{endpoint}'")));
            }
        }
        let key = match add.key() {
            Some(key) => key.to_string(),
            None => GraphEdge::synthesize_key(add.from_key(), add.to_key(), add.edge_type()),
        };
        let exists = self.graph().edge(&key).is_some();
        if exists && self.settings.reject_duplicates {
            return Err(KnotError::Validation(format!("edge '{key}' already exists")));
        }
        let edge = GraphEdge::new(
            key,
            add.from_key(),
            add.to_key(),
            add.edge_type().map(str::to_string),
            add.tags().clone(),
            add.direction(),
        );
        let mutation = if exists { Mutation::EdgeChange(edge.clone()) } else { Mutation::EdgeAdd(edge.clone()) };
        self.record(mutation)?;
        Ok(edge)
    }

    /// Deletes every node matched by any of the searches, each after its
    /// incident edges.
    fn delete_nodes(&mut self, delete: &NodeDelete) -> Result<Vec<GraphNode>> {
        let mut matched = Vec::new();
        for search in delete.search() {
            let found = self.search_nodes(search)?;
            if let Some(alias) = search.alias() {
                self.sets.insert(alias.to_string(), WorkingDataSet::Nodes(found.clone()));
            }
            matched.extend(found);
        }
        let mut deleted = Vec::new();
        for node in sorted_nodes(matched) {
            if !self.graph().contains_node(node.key()) {
                continue;
            }
            let incident: Vec<String> =
                self.graph().incident_edges(node.key()).iter().map(|e| e.key().to_string()).collect();
            for key in incident {
                self.record(Mutation::EdgeDelete { key })?;
            }
            self.record(Mutation::NodeDelete { key: node.key().to_string() })?;
            deleted.push(node);
        }
        Ok(deleted)
    }

    fn delete_edges(&mut self, delete: &EdgeDelete) -> Result<Vec<GraphEdge>> {
        let mut matched = Vec::new();
        for search in delete.search() {
            let found = self.search_edges(search)?;
            if let WorkingDataSet::Edges { edges, .. } = &found {
                matched.extend(edges.iter().cloned());
            }
            if let Some(alias) = search.alias() {
                self.sets.insert(alias.to_string(), found);
            }
        }
        let mut deleted = Vec::new();
        for edge in sorted_edges(matched) {
            if self.graph().edge(edge.key()).is_none() {
                continue;
            }
            self.record(Mutation::EdgeDelete { key: edge.key().to_string() })?;
            deleted.push(edge);
        }
        Ok(deleted)
    }

    fn result(&self) -> GraphQueryResult {
        let alias = self.sets.iter().map(|(alias, set)| (alias.clone(), set.items())).collect();
        GraphQueryResult::ok(self.items.clone(), alias)
    }

    fn finish(mut self) -> Execution {
        let Some(tx) = self.transaction else {
            return Execution { result: self.result(), graph: None };
        };
        let committed = match self.journal.as_deref_mut() {
            Some(journal) => journal.commit(tx).map_err(conflict),
            None => Err(KnotError::Invariant("transaction without a journal".to_string())),
        };
        match committed {
            Ok(lsn) => {
                info!(transaction = tx, lsn, items = self.items.len(), "transaction committed");
                let result = self.result();
                Execution { result, graph: Some(self.scratch.into_owned()) }
            }
            Err(error) => self.abort(error),
        }
    }

    fn abort(mut self, error: KnotError) -> Execution {
        if let (Some(tx), Some(journal)) = (self.transaction, self.journal.as_deref_mut()) {
            if journal.is_open(tx) {
                if let Err(rollback_error) = journal.rollback(tx) {
                    warn!(transaction = tx, error = %rollback_error, "could not write rollback");
                }
            }
            warn!(transaction = tx, %error, "transaction rolled back");
        } else {
            debug!(%error, "execution failed");
        }
        Execution { result: GraphQueryResult::failure(&error), graph: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{EntryType, MemoryStore};
    use crate::parser::parse_query;

    fn run(graph: &GraphState, journal: &mut Journal, text: &str) -> Execution {
        let settings = EngineSettings::default();
        let commands = parse_query(text).unwrap();
        Interpreter::new(graph, &settings).execute(&commands, Some(journal))
    }

    #[test]
    fn cursor_walks_forward() {
        let commands = parse_query("select (*); select (*);").unwrap();
        let mut cursor = Cursor::new(&commands);
        assert!(cursor.has_next());
        cursor.advance();
        cursor.advance();
        assert!(!cursor.has_next());
        assert!(cursor.current().is_none());
        cursor.advance();
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn dictionary_list_keeps_insertion_order() {
        let mut list: DictionaryList<String, u32> = DictionaryList::new();
        list.push("a".into(), 2);
        list.push("a".into(), 1);
        assert_eq!(list.get("a"), &[2, 1]);
        assert!(list.get("b").is_empty());
    }

    #[test]
    fn commit_hands_back_the_new_graph() {
        let mut journal = Journal::open(Box::new(MemoryStore::new())).unwrap();
        let graph = GraphState::new();
        let execution = run(&graph, &mut journal, "add node (key=a); add node (key=b); add edge (from=a to=b);");
        assert!(execution.result.is_ok(), "{:?}", execution.result.error);
        let committed = execution.graph.unwrap();
        assert_eq!(committed.edge_count(), 1);
        assert_eq!(graph.node_count(), 0);
        let types: Vec<EntryType> = journal.records().unwrap().iter().map(|r| r.entry.entry_type()).collect();
        assert_eq!(types.first(), Some(&EntryType::StartTran));
        assert_eq!(types.last(), Some(&EntryType::CommitTran));
    }

    #[test]
    fn failure_rolls_back() {
        let mut journal = Journal::open(Box::new(MemoryStore::new())).unwrap();
        let execution = run(&GraphState::new(), &mut journal, "add node (key=a); add edge (from=a to=ghost);");
        assert_eq!(execution.result.status, StatusCode::Invalid);
        assert!(execution.graph.is_none());
        let last = journal.records().unwrap().pop().unwrap();
        assert_eq!(last.entry.entry_type(), EntryType::RollbackTran);
    }

    #[test]
    fn searches_leave_the_journal_alone() {
        let mut journal = Journal::open(Box::new(MemoryStore::new())).unwrap();
        let execution = run(&GraphState::new(), &mut journal, "select (*) as all; delete (key=nothing);");
        assert!(execution.result.is_ok());
        assert!(execution.graph.is_none());
        assert_eq!(journal.last_lsn(), None);
        assert_eq!(execution.result.alias_keys("all"), Some(vec![]));
    }

    #[test]
    fn cancelled_before_the_first_command() {
        let token = CancelToken::new();
        token.cancel();
        let settings = EngineSettings::default();
        let commands = parse_query("select (*);").unwrap();
        let execution = Interpreter::new(&GraphState::new(), &settings)
            .with_cancel(Some(token))
            .execute(&commands, None);
        assert_eq!(execution.result.status, StatusCode::Cancelled);
    }
}
