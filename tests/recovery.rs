use knotgraph::config::Settings;
use knotgraph::construct::{Database, GraphNode, Mutation, PersistenceMode};
use knotgraph::engine::Engine;
use knotgraph::error::KnotError;
use knotgraph::journal::{EntryType, Journal, JournalStore, MemoryStore};
use knotgraph::tags::Tags;

const HISTORY: [&str; 5] = [
    "add node (key=alice tags=person); add node (key=bob tags=person); add node (key=acme tags=company);",
    "add edge (from=alice to=acme type=works_at direction=forward); add edge (from=bob to=acme type=works_at);",
    "add edge (from=alice to=bob type=knows);",
    "delete (key=bob);",
    "add node (key=alice tags=person tags=founder data='{\"since\":2019}');",
];

fn replay_history(db: &Database) {
    let engine = Engine::new(db);
    for query in HISTORY {
        let res = engine.execute(query);
        assert!(res.is_ok(), "{query}: {:?}", res.error);
    }
}

#[test]
fn reopening_restores_the_same_graph() {
    let store = MemoryStore::new();
    let db = Database::open(Box::new(store.clone()), &Settings::default()).unwrap();
    replay_history(&db);
    let before = db.graph().unwrap().to_snapshot();
    drop(db);

    let db = Database::open(Box::new(store.clone()), &Settings::default()).unwrap();
    assert_eq!(db.graph().unwrap().to_snapshot(), before);
    assert_eq!(before.nodes.len(), 2);
    assert_eq!(before.edges.len(), 1);
    db.verify().unwrap();
}

#[test]
fn crash_inside_a_transaction_is_rolled_back() {
    let store = MemoryStore::new();
    let db = Database::open(Box::new(store.clone()), &Settings::default()).unwrap();
    replay_history(&db);
    drop(db);

    // a session that dies between an action and its commit
    let mut journal = Journal::open(Box::new(store.clone())).unwrap();
    let tx = journal.start().unwrap();
    journal
        .action(tx, Mutation::NodeAdd(GraphNode::new("ghost", Tags::new())))
        .unwrap();
    drop(journal);

    let db = Database::open(Box::new(store.clone()), &Settings::default()).unwrap();
    let graph = db.graph().unwrap();
    assert!(graph.node("ghost").is_none());
    assert!(graph.node("alice").is_some());
    let last = db.journal_records().unwrap().pop().unwrap();
    assert_eq!(last.entry.entry_type(), EntryType::RollbackTran);
    assert_eq!(last.entry.transaction_id, tx);

    // numbering continues past the abandoned transaction
    let res = Engine::new(&db).execute("add node (key=carol);");
    assert!(res.is_ok());
    let start = db
        .journal_records()
        .unwrap()
        .into_iter()
        .rev()
        .find(|r| r.entry.entry_type() == EntryType::StartTran)
        .unwrap();
    assert!(start.entry.transaction_id > tx);
}

#[test]
fn checkpoint_plus_tail_equals_full_replay() {
    let store = MemoryStore::new();
    let mut settings = Settings::default();
    settings.journal.checkpoint_interval = 2;
    let db = Database::open(Box::new(store.clone()), &settings).unwrap();
    replay_history(&db);
    let checkpoint = store.load_checkpoint().unwrap().expect("automatic checkpoint");
    assert!(checkpoint.lsn < db.last_lsn().unwrap().unwrap());
    let before = db.graph().unwrap().to_snapshot();
    db.verify().unwrap();
    drop(db);

    let db = Database::open(Box::new(store.clone()), &settings).unwrap();
    assert_eq!(db.graph().unwrap().to_snapshot(), before);
    db.verify().unwrap();
}

#[test]
fn explicit_checkpoint_covers_everything() {
    let store = MemoryStore::new();
    let db = Database::open(Box::new(store.clone()), &Settings::default()).unwrap();
    replay_history(&db);
    let lsn = db.checkpoint().unwrap();
    assert_eq!(Some(lsn), db.last_lsn().unwrap());
    let before = db.graph().unwrap().to_snapshot();
    drop(db);
    let db = Database::open(Box::new(store), &Settings::default()).unwrap();
    assert_eq!(db.graph().unwrap().to_snapshot(), before);
}

#[test]
fn file_journal_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.db").to_string_lossy().into_owned();
    let db = Database::new(PersistenceMode::File(path.clone())).unwrap();
    replay_history(&db);
    let before = db.graph().unwrap().to_snapshot();
    let superhash = db.current_superhash().unwrap();
    assert!(superhash.is_some());
    drop(db);

    let db = Database::new(PersistenceMode::File(path)).unwrap();
    assert_eq!(db.graph().unwrap().to_snapshot(), before);
    assert_eq!(db.current_superhash().unwrap(), superhash);
    db.verify().unwrap();
}

#[test]
fn tampered_file_journal_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.db").to_string_lossy().into_owned();
    let db = Database::new(PersistenceMode::File(path.clone())).unwrap();
    replay_history(&db);
    drop(db);

    let connection = rusqlite::Connection::open(&path).unwrap();
    let changed = connection
        .execute(
            "update Journal set Mutation = replace(Mutation, 'acme', 'evil') where EntryType = 'Action'",
            [],
        )
        .unwrap();
    assert!(changed > 0);
    drop(connection);

    let reopened = Database::new(PersistenceMode::File(path));
    assert!(matches!(reopened, Err(KnotError::DataCorruption { .. })));
}

#[test]
fn tampered_checkpoint_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.db").to_string_lossy().into_owned();
    let db = Database::new(PersistenceMode::File(path.clone())).unwrap();
    replay_history(&db);
    db.checkpoint().expect("checkpoint is written");
    drop(db);

    let connection = rusqlite::Connection::open(&path).unwrap();
    let changed = connection
        .execute("update Checkpoint set Snapshot = replace(Snapshot, 'acme', 'evil')", [])
        .unwrap();
    assert_eq!(changed, 1);
    drop(connection);

    let reopened = Database::new(PersistenceMode::File(path));
    assert!(matches!(reopened, Err(KnotError::DataCorruption { .. })));
}
