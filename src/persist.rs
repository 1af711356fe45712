// used for persistence
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{KnotError, Result};
use crate::journal::{
    Checkpoint, EntryKind, JournalEntry, JournalRecord, JournalStore, Lsn, MemoryStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

impl PersistenceMode {
    pub fn store(&self) -> Result<Box<dyn JournalStore>> {
        match self {
            PersistenceMode::InMemory => Ok(Box::new(MemoryStore::new())),
            PersistenceMode::File(path) => Ok(Box::new(Persistor::open(path)?)),
        }
    }
}

// ------------- Persistence -------------
/// A SQLite journal store. Each row carries a blake3 superhash over the
/// previous row's superhash and its own fields, so edits or deletions of
/// earlier rows are caught when the file is opened.
pub struct Persistor {
    connection: Connection,
    head: Option<blake3::Hash>,
}

impl Persistor {
    pub fn open(path: &str) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }
    pub fn with_connection(connection: Connection) -> Result<Self> {
        // The "STRICT" keyword introduced in 3.37.0 breaks JDBC connections, which makes
        // debugging using an external tool like DBeaver impossible
        connection.execute_batch(
            "
            create table if not exists Journal (
                Journal_LSN integer primary key autoincrement,
                Transaction_Identity integer not null,
                EntryType text not null,
                EntryTime text not null,
                Mutation text null,
                Superhash blob not null
            );-- STRICT;
            create table if not exists Checkpoint (
                Checkpoint_Identity integer not null,
                Journal_LSN integer not null,
                Snapshot text not null,
                Superhash blob not null,
                constraint referenceable_Checkpoint_Identity primary key (
                    Checkpoint_Identity
                )
            );-- STRICT;
            ",
        )?;
        let head = verify_chain(&connection)?;
        info!(superhash = ?head.map(|h| h.to_hex().to_string()), "journal chain verified");
        Ok(Self { connection, head })
    }

    fn row_superhash(&self, lsn: i64) -> Result<Option<Vec<u8>>> {
        let hash = self
            .connection
            .query_row("select Superhash from Journal where Journal_LSN = ?", params![lsn], |r| r.get(0))
            .optional()?;
        Ok(hash)
    }
}

struct StoredEntry {
    lsn: Lsn,
    transaction_id: i64,
    entry_type: String,
    entry_time: String,
    mutation: Option<String>,
    superhash: Vec<u8>,
}

impl StoredEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            lsn: row.get::<_, i64>(0)? as Lsn,
            transaction_id: row.get(1)?,
            entry_type: row.get(2)?,
            entry_time: row.get(3)?,
            mutation: row.get(4)?,
            superhash: row.get(5)?,
        })
    }
    fn into_record(self) -> Result<JournalRecord> {
        let corrupt = |what: String| KnotError::DataCorruption {
            message: format!("journal entry {}: {what}", self.lsn),
        };
        let timestamp = DateTime::parse_from_rfc3339(&self.entry_time)
            .map_err(|e| corrupt(format!("bad timestamp: {e}")))?
            .with_timezone(&Utc);
        let kind = match (self.entry_type.as_str(), &self.mutation) {
            ("Action", Some(mutation)) => EntryKind::Action(
                serde_json::from_str(mutation).map_err(|e| corrupt(format!("bad mutation: {e}")))?,
            ),
            ("StartTran", None) => EntryKind::StartTran,
            ("CommitTran", None) => EntryKind::CommitTran,
            ("RollbackTran", None) => EntryKind::RollbackTran,
            (other, _) => return Err(corrupt(format!("unexpected {other} entry"))),
        };
        Ok(JournalRecord {
            lsn: self.lsn,
            entry: JournalEntry { transaction_id: self.transaction_id as u64, timestamp, kind },
        })
    }
}

fn superhash(
    previous: Option<&blake3::Hash>,
    transaction_id: i64,
    entry_type: &str,
    entry_time: &str,
    mutation: Option<&str>,
) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    if let Some(previous) = previous {
        hasher.update(previous.as_bytes());
    }
    hasher.update(&transaction_id.to_le_bytes());
    for field in [entry_type, entry_time, mutation.unwrap_or_default()] {
        hasher.update(field.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

// Seals a checkpoint to the journal row it was taken at.
fn checkpoint_superhash(anchor: Option<&[u8]>, lsn: i64, snapshot: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    if let Some(anchor) = anchor {
        hasher.update(anchor);
    }
    hasher.update(&lsn.to_le_bytes());
    hasher.update(snapshot.as_bytes());
    hasher.finalize()
}

fn verify_chain(connection: &Connection) -> Result<Option<blake3::Hash>> {
    let mut statement = connection.prepare_cached(
        "
        select Journal_LSN, Transaction_Identity, EntryType, EntryTime, Mutation, Superhash
            from Journal
            order by Journal_LSN
        ",
    )?;
    let mut rows = statement.query([])?;
    let mut head: Option<blake3::Hash> = None;
    while let Some(row) = rows.next()? {
        let stored = StoredEntry::from_row(row)?;
        let expected = superhash(
            head.as_ref(),
            stored.transaction_id,
            &stored.entry_type,
            &stored.entry_time,
            stored.mutation.as_deref(),
        );
        if stored.superhash.as_slice() != expected.as_bytes() {
            return Err(KnotError::DataCorruption {
                message: format!("superhash mismatch at journal entry {}", stored.lsn),
            });
        }
        head = Some(expected);
    }
    Ok(head)
}

impl JournalStore for Persistor {
    fn append(&mut self, entry: &JournalEntry) -> Result<Lsn> {
        let transaction_id = entry.transaction_id as i64;
        let entry_type = entry.entry_type();
        let entry_time = entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let mutation = entry.mutation().map(serde_json::to_string).transpose()?;
        let hash = superhash(
            self.head.as_ref(),
            transaction_id,
            entry_type.as_str(),
            &entry_time,
            mutation.as_deref(),
        );
        self.connection
            .prepare_cached(
                "
                insert into Journal (
                    Transaction_Identity,
                    EntryType,
                    EntryTime,
                    Mutation,
                    Superhash
                ) values (?, ?, ?, ?, ?)
                ",
            )?
            .execute(params![
                transaction_id,
                entry_type.as_str(),
                &entry_time,
                &mutation,
                hash.as_bytes().as_slice()
            ])?;
        let lsn = self.connection.last_insert_rowid() as Lsn;
        self.head = Some(hash);
        debug!(lsn, superhash = %hash.to_hex(), "journal row written");
        Ok(lsn)
    }

    fn read_from(&self, from: Lsn) -> Result<Vec<JournalRecord>> {
        let mut statement = self.connection.prepare_cached(
            "
            select Journal_LSN, Transaction_Identity, EntryType, EntryTime, Mutation, Superhash
                from Journal
                where Journal_LSN >= ?
                order by Journal_LSN
            ",
        )?;
        let stored = statement
            .query_map(params![from as i64], StoredEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        stored.into_iter().map(StoredEntry::into_record).collect()
    }

    fn last_lsn(&self) -> Result<Option<Lsn>> {
        let last: Option<i64> = self
            .connection
            .query_row("select max(Journal_LSN) from Journal", [], |r| r.get(0))?;
        Ok(last.map(|lsn| lsn as Lsn))
    }

    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let snapshot = serde_json::to_string(&checkpoint.snapshot)?;
        let lsn = checkpoint.lsn as i64;
        let hash = checkpoint_superhash(self.row_superhash(lsn)?.as_deref(), lsn, &snapshot);
        self.connection
            .prepare_cached(
                "
                insert or replace into Checkpoint (
                    Checkpoint_Identity,
                    Journal_LSN,
                    Snapshot,
                    Superhash
                ) values (1, ?, ?, ?)
                ",
            )?
            .execute(params![lsn, &snapshot, hash.as_bytes().as_slice()])?;
        Ok(())
    }

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let row: Option<(i64, String, Vec<u8>)> = self
            .connection
            .query_row(
                "select Journal_LSN, Snapshot, Superhash from Checkpoint where Checkpoint_Identity = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        match row {
            Some((lsn, snapshot, stored)) => {
                let expected = checkpoint_superhash(self.row_superhash(lsn)?.as_deref(), lsn, &snapshot);
                if stored.as_slice() != expected.as_bytes() {
                    return Err(KnotError::DataCorruption {
                        message: format!("superhash mismatch for the checkpoint at {lsn}"),
                    });
                }
                let snapshot = serde_json::from_str(&snapshot).map_err(|e| KnotError::DataCorruption {
                    message: format!("checkpoint at {lsn} does not parse: {e}"),
                })?;
                Ok(Some(Checkpoint { lsn: lsn as Lsn, snapshot }))
            }
            None => Ok(None),
        }
    }

    fn current_superhash(&self) -> Option<String> {
        self.head.map(|h| h.to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::construct::{GraphNode, Mutation, Snapshot};
    use crate::tags::Tags;

    fn persistor() -> Persistor {
        Persistor::with_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn rows_come_back_as_written() {
        let mut store = persistor();
        assert!(store.current_superhash().is_none());
        let start = JournalEntry::new(1, EntryKind::StartTran);
        let action = JournalEntry::new(
            1,
            EntryKind::Action(Mutation::NodeAdd(GraphNode::new("a", Tags::parse("x:1").unwrap()))),
        );
        assert_eq!(store.append(&start).unwrap(), 1);
        assert_eq!(store.append(&action).unwrap(), 2);
        let records = store.read_from(2).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry, action);
        assert_eq!(store.last_lsn().unwrap(), Some(2));
        assert!(store.current_superhash().is_some());
    }

    #[test]
    fn checkpoint_is_replaced() {
        let mut store = persistor();
        assert!(store.load_checkpoint().unwrap().is_none());
        let snapshot = Snapshot { nodes: vec![GraphNode::new("a", Tags::new())], edges: vec![] };
        store.save_checkpoint(&Checkpoint { lsn: 3, snapshot: Snapshot::default() }).unwrap();
        store.save_checkpoint(&Checkpoint { lsn: 9, snapshot: snapshot.clone() }).unwrap();
        let loaded = store.load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded.lsn, 9);
        assert_eq!(loaded.snapshot, snapshot);
    }

    #[test]
    fn tampered_checkpoint_is_refused() {
        let mut store = persistor();
        store.append(&JournalEntry::new(1, EntryKind::StartTran)).unwrap();
        let snapshot = Snapshot { nodes: vec![GraphNode::new("a", Tags::new())], edges: vec![] };
        store.save_checkpoint(&Checkpoint { lsn: 1, snapshot }).unwrap();
        assert!(store.load_checkpoint().unwrap().is_some());
        store
            .connection
            .execute("update Checkpoint set Snapshot = replace(Snapshot, '\"a\"', '\"z\"')", [])
            .unwrap();
        assert!(matches!(store.load_checkpoint(), Err(KnotError::DataCorruption { .. })));
    }

    #[test]
    fn superhash_depends_on_predecessor() {
        let first = superhash(None, 1, "StartTran", "t", None);
        let chained = superhash(Some(&first), 1, "CommitTran", "t", None);
        let unchained = superhash(None, 1, "CommitTran", "t", None);
        assert_ne!(chained, unchained);
    }
}
