use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use seahash::SeaHasher;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// our own stuff that we need
use crate::command::GraphCommand;
use crate::config::{EngineSettings, Settings};
use crate::error::{KnotError, Result};
use crate::interface::CancelToken;
use crate::interpreter::{GraphQueryResult, Interpreter};
use crate::journal::{Journal, JournalRecord, JournalStore, Lsn};
pub use crate::persist::PersistenceMode;
use crate::tags::Tags;

pub type OtherHasher = BuildHasherDefault<SeaHasher>;

// ------------- Direction -------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
    #[default]
    Both,
}

impl Direction {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "forward" => Some(Direction::Forward),
            "backward" => Some(Direction::Backward),
            "both" => Some(Direction::Both),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Backward => write!(f, "backward"),
            Direction::Both => write!(f, "both"),
        }
    }
}

// ------------- Node -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    key: String,
    #[serde(default)]
    tags: Tags,
    #[serde(default)]
    data: serde_json::Value,
}

impl GraphNode {
    pub fn new(key: impl Into<String>, tags: Tags) -> Self {
        Self { key: key.into(), tags, data: serde_json::Value::Null }
    }
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn tags(&self) -> &Tags {
        &self.tags
    }
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }
}

// ------------- Edge -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    key: String,
    from_node_key: String,
    to_node_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    edge_type: Option<String>,
    #[serde(default)]
    tags: Tags,
    direction: Direction,
}

impl GraphEdge {
    pub fn new(
        key: impl Into<String>,
        from_node_key: impl Into<String>,
        to_node_key: impl Into<String>,
        edge_type: Option<String>,
        tags: Tags,
        direction: Direction,
    ) -> Self {
        Self {
            key: key.into(),
            from_node_key: from_node_key.into(),
            to_node_key: to_node_key.into(),
            edge_type,
            tags,
            direction,
        }
    }
    /// The key an edge gets when the caller does not name it.
    pub fn synthesize_key(from: &str, to: &str, edge_type: Option<&str>) -> String {
        match edge_type {
            Some(edge_type) => format!("{from}->{to}:{edge_type}"),
            None => format!("{from}->{to}"),
        }
    }
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn from_node_key(&self) -> &str {
        &self.from_node_key
    }
    pub fn to_node_key(&self) -> &str {
        &self.to_node_key
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
    pub fn touches(&self, node: &str) -> bool {
        self.from_node_key == node || self.to_node_key == node
    }
    /// The endpoint opposite `node`, if `node` is an endpoint at all.
    pub fn peer(&self, node: &str) -> Option<&str> {
        if self.from_node_key == node {
            Some(&self.to_node_key)
        } else if self.to_node_key == node {
            Some(&self.from_node_key)
        } else {
            None
        }
    }
    /// Whether the edge points away from `node`.
    pub fn leaves(&self, node: &str) -> bool {
        match self.direction {
            Direction::Forward => self.from_node_key == node,
            Direction::Backward => self.to_node_key == node,
            Direction::Both => self.touches(node),
        }
    }
    /// Whether the edge points into `node`.
    pub fn enters(&self, node: &str) -> bool {
        match self.direction {
            Direction::Forward => self.to_node_key == node,
            Direction::Backward => self.from_node_key == node,
            Direction::Both => self.touches(node),
        }
    }
    /// Direction test relative to an anchor node.
    pub fn oriented(&self, anchor: &str, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.leaves(anchor),
            Direction::Backward => self.enters(anchor),
            Direction::Both => self.touches(anchor),
        }
    }
}

// ------------- Items -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum GraphItem {
    Node(GraphNode),
    Edge(GraphEdge),
}

impl GraphItem {
    pub fn key(&self) -> &str {
        match self {
            GraphItem::Node(node) => node.key(),
            GraphItem::Edge(edge) => edge.key(),
        }
    }
    pub fn as_node(&self) -> Option<&GraphNode> {
        match self {
            GraphItem::Node(node) => Some(node),
            GraphItem::Edge(_) => None,
        }
    }
    pub fn as_edge(&self) -> Option<&GraphEdge> {
        match self {
            GraphItem::Edge(edge) => Some(edge),
            GraphItem::Node(_) => None,
        }
    }
}

// ------------- Mutations -------------
/// A single change to graph state, as recorded by journal `Action` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    NodeAdd(GraphNode),
    NodeChange(GraphNode),
    NodeDelete { key: String },
    EdgeAdd(GraphEdge),
    EdgeChange(GraphEdge),
    EdgeDelete { key: String },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::NodeAdd(node) | Mutation::NodeChange(node) => node.key(),
            Mutation::EdgeAdd(edge) | Mutation::EdgeChange(edge) => edge.key(),
            Mutation::NodeDelete { key } | Mutation::EdgeDelete { key } => key,
        }
    }
}

// ------------- Lookups -------------
#[derive(Debug, Clone)]
pub struct Lookup<K, V, H = RandomState> {
    index: HashMap<K, HashSet<V, H>, H>,
}
impl<K: Eq + Hash, V: Eq + Hash, H: BuildHasher + Default> Lookup<K, V, H> {
    pub fn new() -> Self {
        Self { index: HashMap::default() }
    }
    pub fn insert(&mut self, key: K, value: V) {
        self.index.entry(key).or_default().insert(value);
    }
    pub fn remove<Q, R>(&mut self, key: &Q, value: &R)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Borrow<R>,
        R: Hash + Eq + ?Sized,
    {
        let emptied = match self.index.get_mut(key) {
            Some(set) => {
                set.remove(value);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            self.index.remove(key);
        }
    }
    pub fn lookup<Q>(&self, key: &Q) -> impl Iterator<Item = &V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).into_iter().flatten()
    }
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).map_or(0, HashSet::len)
    }
}
impl<K: Eq + Hash, V: Eq + Hash, H: BuildHasher + Default> Default for Lookup<K, V, H> {
    fn default() -> Self {
        Self::new()
    }
}

// ------------- Graph state -------------
/// Sorted, serializable copy of a graph, used by checkpoints and comparisons.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// The materialized view of committed journal entries. It only changes
/// through [`GraphState::apply`], which is shared by the commit path and
/// recovery.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    nodes: HashMap<String, GraphNode, OtherHasher>,
    edges: HashMap<String, GraphEdge, OtherHasher>,
    // node key -> keys of incident edges
    adjacency: Lookup<String, String, OtherHasher>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn node(&self, key: &str) -> Option<&GraphNode> {
        self.nodes.get(key)
    }
    pub fn edge(&self, key: &str) -> Option<&GraphEdge> {
        self.edges.get(key)
    }
    pub fn contains_node(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }
    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.values()
    }
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
    /// Edges touching `key`, sorted by edge key.
    pub fn incident_edges(&self, key: &str) -> Vec<&GraphEdge> {
        let mut edges: Vec<&GraphEdge> = self
            .adjacency
            .lookup(key)
            .filter_map(|edge_key| self.edges.get(edge_key))
            .collect();
        edges.sort_by(|a, b| a.key().cmp(b.key()));
        edges
    }
    pub fn degree(&self, key: &str) -> usize {
        self.adjacency.count(key)
    }

    pub fn apply(&mut self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::NodeAdd(node) => {
                if self.nodes.contains_key(node.key()) {
                    return Err(KnotError::Invariant(format!("node '{}' already exists", node.key())));
                }
                self.nodes.insert(node.key().to_string(), node.clone());
            }
            Mutation::NodeChange(node) => {
                match self.nodes.get_mut(node.key()) {
                    Some(kept) => *kept = node.clone(),
                    None => {
                        return Err(KnotError::Invariant(format!("cannot change missing node '{}'", node.key())));
                    }
                }
            }
            Mutation::NodeDelete { key } => {
                if self.adjacency.count(key.as_str()) > 0 {
                    return Err(KnotError::Invariant(format!("node '{key}' still has incident edges")));
                }
                if self.nodes.remove(key).is_none() {
                    return Err(KnotError::Invariant(format!("cannot delete missing node '{key}'")));
                }
            }
            Mutation::EdgeAdd(edge) => {
                if self.edges.contains_key(edge.key()) {
                    return Err(KnotError::Invariant(format!("edge '{}' already exists", edge.key())));
                }
                self.check_endpoints(edge)?;
                self.link(edge);
                self.edges.insert(edge.key().to_string(), edge.clone());
            }
            Mutation::EdgeChange(edge) => {
                self.check_endpoints(edge)?;
                let previous = self.edges.remove(edge.key()).ok_or_else(|| {
                    KnotError::Invariant(format!("cannot change missing edge '{}'", edge.key()))
                })?;
                self.unlink(&previous);
                self.link(edge);
                self.edges.insert(edge.key().to_string(), edge.clone());
            }
            Mutation::EdgeDelete { key } => {
                let previous = self
                    .edges
                    .remove(key)
                    .ok_or_else(|| KnotError::Invariant(format!("cannot delete missing edge '{key}'")))?;
                self.unlink(&previous);
            }
        }
        Ok(())
    }

    fn check_endpoints(&self, edge: &GraphEdge) -> Result<()> {
        for endpoint in [edge.from_node_key(), edge.to_node_key()] {
            if !self.nodes.contains_key(endpoint) {
                return Err(KnotError::Invariant(format!(
                    "edge '{}' references missing node '{endpoint}'",
                    edge.key()
                )));
            }
        }
        Ok(())
    }
    fn link(&mut self, edge: &GraphEdge) {
        self.adjacency.insert(edge.from_node_key().to_string(), edge.key().to_string());
        self.adjacency.insert(edge.to_node_key().to_string(), edge.key().to_string());
    }
    fn unlink(&mut self, edge: &GraphEdge) {
        self.adjacency.remove(edge.from_node_key(), edge.key());
        self.adjacency.remove(edge.to_node_key(), edge.key());
    }

    pub fn to_snapshot(&self) -> Snapshot {
        let mut nodes: Vec<GraphNode> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.key().cmp(b.key()));
        let mut edges: Vec<GraphEdge> = self.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.key().cmp(b.key()));
        Snapshot { nodes, edges }
    }
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        let mut state = Self::new();
        for node in &snapshot.nodes {
            state.apply(&Mutation::NodeAdd(node.clone()))?;
        }
        for edge in &snapshot.edges {
            state.apply(&Mutation::EdgeAdd(edge.clone()))?;
        }
        Ok(state)
    }
}

// ------------- Database -------------
// Owns the journal (the single writer) and the committed graph that readers share.
pub struct Database {
    settings: EngineSettings,
    checkpoint_interval: u64,
    journal: Mutex<Journal>,
    state: RwLock<Arc<GraphState>>,
    commits: AtomicU64,
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        Self::open(mode.store()?, &Settings::default())
    }
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::open(settings.persistence_mode().store()?, settings)
    }
    /// Opens a journal and restores the graph from its last checkpoint and
    /// committed entries.
    pub fn open(store: Box<dyn JournalStore>, settings: &Settings) -> Result<Self> {
        let journal = Journal::open(store)?;
        let replay = journal.replay()?;
        info!(
            nodes = replay.graph.node_count(),
            edges = replay.graph.edge_count(),
            actions = replay.applied,
            lsn = ?journal.last_lsn(),
            "graph restored from journal"
        );
        Ok(Self {
            settings: settings.engine.clone(),
            checkpoint_interval: settings.journal.checkpoint_interval,
            journal: Mutex::new(journal),
            state: RwLock::new(Arc::new(replay.graph)),
            commits: AtomicU64::new(0),
        })
    }
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
    /// A stable snapshot of committed state.
    pub fn graph(&self) -> Result<Arc<GraphState>> {
        Ok(Arc::clone(&*self.state.read()?))
    }

    pub fn execute(&self, commands: &[GraphCommand], cancel: Option<&CancelToken>) -> GraphQueryResult {
        self.try_execute(commands, cancel)
            .unwrap_or_else(|e| GraphQueryResult::failure(&e))
    }

    fn try_execute(&self, commands: &[GraphCommand], cancel: Option<&CancelToken>) -> Result<GraphQueryResult> {
        if !commands.iter().any(GraphCommand::is_mutation) {
            let graph = self.graph()?;
            let interpreter = Interpreter::new(&graph, &self.settings).with_cancel(cancel.cloned());
            return Ok(interpreter.execute(commands, None).result);
        }
        // mutating sequences are serialized by the journal lock
        let mut journal = self.journal.lock()?;
        let graph = self.graph()?;
        let execution = Interpreter::new(&graph, &self.settings)
            .with_cancel(cancel.cloned())
            .execute(commands, Some(&mut *journal));
        if let Some(committed) = execution.graph {
            let committed = Arc::new(committed);
            *self.state.write()? = Arc::clone(&committed);
            let commits = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
            if self.checkpoint_interval > 0 && commits % self.checkpoint_interval == 0 {
                if let Err(e) = journal.checkpoint(&committed) {
                    warn!(error = %e, "automatic checkpoint failed");
                }
            }
        }
        Ok(execution.result)
    }

    /// Stores a snapshot of committed state so recovery can start from it.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let mut journal = self.journal.lock()?;
        let graph = self.graph()?;
        journal.checkpoint(&graph)
    }
    /// Rebuilds the graph from an empty state using every committed journal
    /// entry and compares it to the materialized view.
    pub fn verify(&self) -> Result<()> {
        let journal = self.journal.lock()?;
        let rebuilt = journal.rebuild()?;
        if rebuilt.to_snapshot() != self.graph()?.to_snapshot() {
            return Err(KnotError::Invariant(
                "materialized graph differs from journal replay".to_string(),
            ));
        }
        Ok(())
    }
    pub fn journal_records(&self) -> Result<Vec<JournalRecord>> {
        self.journal.lock()?.records()
    }
    pub fn last_lsn(&self) -> Result<Option<Lsn>> {
        Ok(self.journal.lock()?.last_lsn())
    }
    pub fn current_superhash(&self) -> Result<Option<String>> {
        Ok(self.journal.lock()?.current_superhash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: &str) -> GraphNode {
        GraphNode::new(key, Tags::new())
    }
    fn edge(from: &str, to: &str, direction: Direction) -> GraphEdge {
        GraphEdge::new(GraphEdge::synthesize_key(from, to, None), from, to, None, Tags::new(), direction)
    }

    #[test]
    fn apply_keeps_adjacency_in_step() {
        let mut state = GraphState::new();
        state.apply(&Mutation::NodeAdd(node("a"))).unwrap();
        state.apply(&Mutation::NodeAdd(node("b"))).unwrap();
        state.apply(&Mutation::EdgeAdd(edge("a", "b", Direction::Forward))).unwrap();
        assert_eq!(state.degree("a"), 1);
        assert_eq!(state.incident_edges("b")[0].key(), "a->b");
        assert!(matches!(
            state.apply(&Mutation::NodeDelete { key: "a".into() }),
            Err(KnotError::Invariant(_))
        ));
        state.apply(&Mutation::EdgeDelete { key: "a->b".into() }).unwrap();
        state.apply(&Mutation::NodeDelete { key: "a".into() }).unwrap();
        assert_eq!(state.degree("b"), 0);
        assert_eq!(state.node_count(), 1);
    }

    #[test]
    fn lookup_drops_emptied_keys() {
        let mut lookup: Lookup<String, String, OtherHasher> = Lookup::default();
        lookup.insert("a".into(), "a->b".into());
        lookup.insert("a".into(), "a->b".into());
        lookup.insert("a".into(), "a->c".into());
        assert_eq!(lookup.count("a"), 2);
        let copy = lookup.clone();
        lookup.remove("a", "a->b");
        lookup.remove("a", "a->c");
        assert_eq!(lookup.count("a"), 0);
        assert_eq!(lookup.lookup("a").count(), 0);
        assert_eq!(copy.count("a"), 2);
        assert!(format!("{copy:?}").contains("a->c"));
    }

    #[test]
    fn edges_need_both_endpoints() {
        let mut state = GraphState::new();
        state.apply(&Mutation::NodeAdd(node("a"))).unwrap();
        let result = state.apply(&Mutation::EdgeAdd(edge("a", "ghost", Direction::Forward)));
        assert!(matches!(result, Err(KnotError::Invariant(_))));
        assert_eq!(state.edge_count(), 0);
    }

    #[test]
    fn orientation_follows_direction() {
        let forward = edge("a", "b", Direction::Forward);
        assert!(forward.leaves("a") && !forward.leaves("b"));
        let backward = edge("a", "b", Direction::Backward);
        assert!(backward.leaves("b") && backward.enters("a"));
        let both = edge("a", "b", Direction::Both);
        assert!(both.oriented("a", Direction::Forward) && both.oriented("b", Direction::Forward));
        assert_eq!(both.peer("b"), Some("a"));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut state = GraphState::new();
        for key in ["c", "a", "b"] {
            state.apply(&Mutation::NodeAdd(node(key))).unwrap();
        }
        state.apply(&Mutation::EdgeAdd(edge("a", "c", Direction::Both))).unwrap();
        let snapshot = state.to_snapshot();
        assert_eq!(snapshot.nodes[0].key(), "a");
        let restored = GraphState::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored.to_snapshot(), snapshot);
        assert_eq!(restored.degree("c"), 1);
    }
}
