//! The write-ahead journal.
//!
//! Every change to the graph is written here as an `Action` entry before it
//! is acknowledged, bracketed by `StartTran` and `CommitTran` (or
//! `RollbackTran`) entries of the same transaction. Entries get strictly
//! increasing log sequence numbers from the backing [`JournalStore`]. Only
//! actions of committed transactions count: [`Journal::recover`] drops
//! everything else, and [`Journal::replay`] rebuilds the graph from the last
//! checkpoint plus the committed actions after it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::construct::{GraphState, Mutation, Snapshot};
use crate::error::{KnotError, Result};

pub type Lsn = u64;
pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    Action,
    StartTran,
    CommitTran,
    RollbackTran,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Action => "Action",
            EntryType::StartTran => "StartTran",
            EntryType::CommitTran => "CommitTran",
            EntryType::RollbackTran => "RollbackTran",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "mutation")]
pub enum EntryKind {
    Action(Mutation),
    StartTran,
    CommitTran,
    RollbackTran,
}

impl EntryKind {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryKind::Action(_) => EntryType::Action,
            EntryKind::StartTran => EntryType::StartTran,
            EntryKind::CommitTran => EntryType::CommitTran,
            EntryKind::RollbackTran => EntryType::RollbackTran,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub transaction_id: TransactionId,
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
}

impl JournalEntry {
    pub fn new(transaction_id: TransactionId, kind: EntryKind) -> Self {
        Self { transaction_id, timestamp: Utc::now(), kind }
    }
    pub fn entry_type(&self) -> EntryType {
        self.kind.entry_type()
    }
    pub fn mutation(&self) -> Option<&Mutation> {
        match &self.kind {
            EntryKind::Action(mutation) => Some(mutation),
            _ => None,
        }
    }
}

/// An entry together with the sequence number the store assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub lsn: Lsn,
    pub entry: JournalEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last sequence number whose effect the snapshot contains.
    pub lsn: Lsn,
    pub snapshot: Snapshot,
}

/// Durable append-only storage behind a [`Journal`].
///
/// `append` must be atomic and assign strictly increasing sequence numbers.
/// `read_from` returns records with `lsn >= from` in sequence order.
pub trait JournalStore: Send {
    fn append(&mut self, entry: &JournalEntry) -> Result<Lsn>;
    fn read_from(&self, from: Lsn) -> Result<Vec<JournalRecord>>;
    fn last_lsn(&self) -> Result<Option<Lsn>>;
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()>;
    fn load_checkpoint(&self) -> Result<Option<Checkpoint>>;
    /// Hex digest chaining every stored entry, for stores that keep one.
    fn current_superhash(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    records: Vec<JournalRecord>,
    checkpoint: Option<Checkpoint>,
}

/// A volatile store. Clones share the same log, so a test can drop a
/// database and open a new one over the surviving handle.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.log.lock().map_or(0, |log| log.records.len())
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JournalStore for MemoryStore {
    fn append(&mut self, entry: &JournalEntry) -> Result<Lsn> {
        let mut log = self.log.lock()?;
        let lsn = log.records.last().map_or(1, |r| r.lsn + 1);
        log.records.push(JournalRecord { lsn, entry: entry.clone() });
        Ok(lsn)
    }
    fn read_from(&self, from: Lsn) -> Result<Vec<JournalRecord>> {
        let log = self.log.lock()?;
        Ok(log.records.iter().filter(|r| r.lsn >= from).cloned().collect())
    }
    fn last_lsn(&self) -> Result<Option<Lsn>> {
        Ok(self.log.lock()?.records.last().map(|r| r.lsn))
    }
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.log.lock()?.checkpoint = Some(checkpoint.clone());
        Ok(())
    }
    fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(self.log.lock()?.checkpoint.clone())
    }
}

/// The graph rebuilt by [`Journal::replay`].
#[derive(Debug)]
pub struct Replay {
    pub graph: GraphState,
    pub checkpoint: Option<Lsn>,
    pub applied: usize,
}

pub struct Journal {
    store: Box<dyn JournalStore>,
    last_lsn: Option<Lsn>,
    next_transaction: TransactionId,
    open: HashSet<TransactionId>,
}

impl Journal {
    /// Scans the store to resume transaction numbering. Transactions that
    /// were still open when the previous session ended are rolled back.
    pub fn open(store: Box<dyn JournalStore>) -> Result<Self> {
        let records = store.read_from(0)?;
        let mut journal = Self { store, last_lsn: None, next_transaction: 1, open: HashSet::new() };
        for record in &records {
            if journal.last_lsn.is_some_and(|last| record.lsn <= last) {
                return Err(KnotError::DataCorruption {
                    message: format!("journal sequence number {} is out of order", record.lsn),
                });
            }
            journal.last_lsn = Some(record.lsn);
            let tx = record.entry.transaction_id;
            let next = tx.checked_add(1).ok_or_else(|| KnotError::DataCorruption {
                message: format!("transaction id {tx} at sequence number {} leaves no successor", record.lsn),
            })?;
            journal.next_transaction = journal.next_transaction.max(next);
            match record.entry.kind {
                EntryKind::StartTran => {
                    journal.open.insert(tx);
                }
                EntryKind::CommitTran | EntryKind::RollbackTran => {
                    journal.open.remove(&tx);
                }
                EntryKind::Action(_) => {}
            }
        }
        let mut abandoned: Vec<TransactionId> = journal.open.iter().copied().collect();
        abandoned.sort_unstable();
        for tx in abandoned {
            warn!(transaction = tx, "rolling back transaction left open by an earlier session");
            journal.rollback(tx)?;
        }
        Ok(journal)
    }

    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }
    pub fn is_open(&self, tx: TransactionId) -> bool {
        self.open.contains(&tx)
    }
    pub fn has_open_transactions(&self) -> bool {
        !self.open.is_empty()
    }

    /// Appends an entry after checking it against the transaction state
    /// machine. State only changes once the store accepted the entry.
    pub fn append(&mut self, entry: JournalEntry) -> Result<Lsn> {
        let tx = entry.transaction_id;
        let mut next_transaction = self.next_transaction;
        match entry.kind {
            EntryKind::StartTran => {
                if tx < self.next_transaction || self.open.contains(&tx) {
                    return Err(KnotError::Invariant(format!("transaction {tx} was already started")));
                }
                next_transaction = tx
                    .checked_add(1)
                    .ok_or_else(|| KnotError::Invariant(format!("transaction ids are exhausted at {tx}")))?;
            }
            _ => {
                if !self.open.contains(&tx) {
                    return Err(KnotError::Invariant(format!(
                        "{} for transaction {tx}, which is not open",
                        entry.entry_type()
                    )));
                }
            }
        }
        let lsn = self.store.append(&entry)?;
        if self.last_lsn.is_some_and(|last| lsn <= last) {
            return Err(KnotError::Invariant(format!(
                "store assigned sequence number {lsn} after {:?}",
                self.last_lsn
            )));
        }
        self.last_lsn = Some(lsn);
        match entry.kind {
            EntryKind::StartTran => {
                self.open.insert(tx);
                self.next_transaction = next_transaction;
            }
            EntryKind::CommitTran | EntryKind::RollbackTran => {
                self.open.remove(&tx);
            }
            EntryKind::Action(_) => {}
        }
        debug!(lsn, transaction = tx, entry = %entry.entry_type(), "journal append");
        Ok(lsn)
    }

    pub fn start(&mut self) -> Result<TransactionId> {
        let tx = self.next_transaction;
        self.append(JournalEntry::new(tx, EntryKind::StartTran))?;
        Ok(tx)
    }
    pub fn action(&mut self, tx: TransactionId, mutation: Mutation) -> Result<Lsn> {
        self.append(JournalEntry::new(tx, EntryKind::Action(mutation)))
    }
    pub fn commit(&mut self, tx: TransactionId) -> Result<Lsn> {
        self.append(JournalEntry::new(tx, EntryKind::CommitTran))
    }
    pub fn rollback(&mut self, tx: TransactionId) -> Result<Lsn> {
        self.append(JournalEntry::new(tx, EntryKind::RollbackTran))
    }

    /// Committed `Action` records with `lsn >= from`, in sequence order.
    /// Actions of rolled back or unterminated transactions are dropped, and
    /// entries that break the state machine are skipped.
    pub fn recover(&self, from: Lsn) -> Result<Vec<JournalRecord>> {
        let mut pending: HashMap<TransactionId, Vec<JournalRecord>> = HashMap::new();
        let mut committed = Vec::new();
        for record in self.store.read_from(from)? {
            let tx = record.entry.transaction_id;
            match record.entry.kind {
                EntryKind::StartTran => {
                    if pending.contains_key(&tx) {
                        warn!(lsn = record.lsn, transaction = tx, "skipping repeated StartTran");
                    } else {
                        pending.insert(tx, Vec::new());
                    }
                }
                EntryKind::Action(_) => match pending.get_mut(&tx) {
                    Some(actions) => actions.push(record),
                    None => warn!(lsn = record.lsn, transaction = tx, "skipping action outside an open transaction"),
                },
                EntryKind::CommitTran => match pending.remove(&tx) {
                    Some(actions) => committed.extend(actions),
                    None => warn!(lsn = record.lsn, transaction = tx, "skipping commit of unknown transaction"),
                },
                EntryKind::RollbackTran => {
                    if pending.remove(&tx).is_none() {
                        warn!(lsn = record.lsn, transaction = tx, "skipping rollback of unknown transaction");
                    }
                }
            }
        }
        committed.sort_by_key(|r| r.lsn);
        Ok(committed)
    }

    /// Restores the graph from the last checkpoint plus the committed
    /// actions written after it.
    pub fn replay(&self) -> Result<Replay> {
        let checkpoint = self.store.load_checkpoint()?;
        let (graph, from) = match &checkpoint {
            Some(checkpoint) => (GraphState::from_snapshot(&checkpoint.snapshot)?, checkpoint.lsn + 1),
            None => (GraphState::new(), 0),
        };
        let (graph, applied) = self.apply_committed(graph, from)?;
        Ok(Replay { graph, checkpoint: checkpoint.map(|c| c.lsn), applied })
    }

    /// Rebuilds the graph from empty state, ignoring checkpoints.
    pub fn rebuild(&self) -> Result<GraphState> {
        Ok(self.apply_committed(GraphState::new(), 0)?.0)
    }

    fn apply_committed(&self, mut graph: GraphState, from: Lsn) -> Result<(GraphState, usize)> {
        let actions = self.recover(from)?;
        for record in &actions {
            if let Some(mutation) = record.entry.mutation() {
                graph.apply(mutation).map_err(|e| KnotError::DataCorruption {
                    message: format!("committed action at {} does not apply: {e}", record.lsn),
                })?;
            }
        }
        Ok((graph, actions.len()))
    }

    /// Stores a snapshot of `graph` at the current sequence number. The graph
    /// must reflect every committed action, so no transaction may be open.
    pub fn checkpoint(&mut self, graph: &GraphState) -> Result<Lsn> {
        if self.has_open_transactions() {
            return Err(KnotError::Conflict("cannot checkpoint while a transaction is open".to_string()));
        }
        let lsn = self.last_lsn.unwrap_or(0);
        self.store.save_checkpoint(&Checkpoint { lsn, snapshot: graph.to_snapshot() })?;
        info!(lsn, nodes = graph.node_count(), edges = graph.edge_count(), "checkpoint written");
        Ok(lsn)
    }

    pub fn records(&self) -> Result<Vec<JournalRecord>> {
        self.store.read_from(0)
    }
    pub fn current_superhash(&self) -> Option<String> {
        self.store.current_superhash()
    }
}
