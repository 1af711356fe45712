use knotgraph::config::Settings;
use knotgraph::construct::{Database, PersistenceMode};
use knotgraph::engine::Engine;

#[test]
fn in_memory_mode_allows_basic_operations() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let engine = Engine::new(&db);
    let res = engine.execute("add node (key=person); add node (key=place); add edge (from=person to=place);");
    assert!(res.is_ok(), "{:?}", res.error);
    assert_eq!(db.graph().unwrap().edge_count(), 1);
    // No superhash chain without a file
    assert!(db.current_superhash().unwrap().is_none());
}

#[test]
fn file_mode_persists_and_has_superhash() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("knotgraph.db").to_string_lossy().into_owned();
    let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
    assert!(db.current_superhash().unwrap().is_none(), "fresh file has no entries");
    let res = Engine::new(&db).execute("add node (key=audit);");
    assert!(res.is_ok());
    let head = db.current_superhash().unwrap();
    assert!(head.is_some(), "expected superhash after a committed add in file-backed mode");
    assert_eq!(head.unwrap().len(), 64);
}

#[test]
fn settings_choose_the_journal() {
    let dir = tempfile::tempdir().expect("temp dir");
    let file = dir.path().join("knotgraph.toml");
    let journal = dir.path().join("journal.db");
    std::fs::write(
        &file,
        format!(
            "[journal]\npath = {:?}\ncheckpoint_interval = 5\n\n[engine]\nreject_duplicates = true\n",
            journal.to_string_lossy()
        ),
    )
    .unwrap();
    let settings = Settings::load(Some(file.as_path())).expect("settings");
    assert_eq!(settings.journal.checkpoint_interval, 5);
    assert!(settings.engine.reject_duplicates);
    assert_eq!(settings.log.filter, "info");

    let db = Database::from_settings(&settings).expect("db");
    assert!(Engine::new(&db).execute("add node (key=x);").is_ok());
    drop(db);
    assert!(journal.exists());
    let db = Database::from_settings(&settings).expect("db");
    assert_eq!(Engine::new(&db).execute("select (key=x);").keys(), vec!["x"]);
}
