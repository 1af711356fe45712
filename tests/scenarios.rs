use knotgraph::command::{EdgeSearch, GraphCommand, KeyPattern, NodeSearch};
use knotgraph::config::Settings;
use knotgraph::construct::{Database, Mutation, PersistenceMode};
use knotgraph::engine::Engine;
use knotgraph::interpreter::StatusCode;
use knotgraph::journal::{EntryKind, MemoryStore};
use knotgraph::tags::Tags;
use proptest::prelude::*;

fn setup() -> Engine<'static> {
    // Leak the database so the engine can live for the whole test
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    let engine = Engine::new(Box::leak(Box::new(db)));
    let res = engine.execute("add node (key=a tags=active); add node (key=b); add edge (from=a to=b type=owns);");
    assert!(res.is_ok(), "seeding failed: {:?}", res.error);
    engine
}

#[test]
fn delete_removes_node_and_its_edge() {
    let engine = setup();
    let res = engine.execute("select (key=a) as n;");
    assert_eq!(res.status, StatusCode::Ok);
    assert_eq!(res.alias_keys("n"), Some(vec!["a"]));
    assert_eq!(res.alias.len(), 1);

    let res = engine.execute("delete (key=a);");
    assert!(res.is_ok(), "{:?}", res.error);
    assert_eq!(res.keys(), vec!["a"]);

    let res = engine.execute("select (*);");
    assert_eq!(res.keys(), vec!["b"]);
    let res = engine.execute("select edge (*);");
    assert!(res.items.is_empty(), "edge a->b:owns should be gone");
    engine.database().verify().expect("journal replay matches");
}

#[test]
fn delete_without_matches_is_not_an_error() {
    let engine = setup();
    let before = engine.database().last_lsn().unwrap();
    let res = engine.execute("delete (key=* tags=temp);");
    assert_eq!(res.status, StatusCode::Ok);
    assert!(res.items.is_empty());
    assert_eq!(engine.database().last_lsn().unwrap(), before);
}

#[test]
fn malformed_query_leaves_the_journal_untouched() {
    let engine = setup();
    let before = engine.database().last_lsn().unwrap();
    let res = engine.execute("select (key=;");
    assert_eq!(res.status, StatusCode::BadRequest);
    assert!(res.error.as_deref().unwrap_or_default().contains("Parse error"));
    assert_eq!(engine.database().last_lsn().unwrap(), before);

    let res = engine.execute("add node (key=c); select [x];");
    assert_eq!(res.status, StatusCode::BadRequest);
    assert!(res.error.as_deref().unwrap_or_default().contains("Lex error"));
    assert_eq!(engine.database().last_lsn().unwrap(), before);
}

#[test]
fn repeated_searches_return_the_same_items() {
    let engine = setup();
    let query = "select (tags=active) as t; select edge () in t;";
    let first = engine.execute(query);
    let second = engine.execute(query);
    assert!(first.is_ok());
    assert_eq!(first.items, second.items);
    assert_eq!(first.keys(), vec!["a", "a->b:owns"]);
}

#[test]
fn cascade_leaves_no_dangling_edges() {
    let engine = setup();
    let res = engine.execute(
        "add node (key=hub); add edge (from=hub to=a); add edge (from=b to=hub direction=both); \
         add edge (from=hub to=hub type=self);",
    );
    assert!(res.is_ok(), "{:?}", res.error);
    let res = engine.execute("delete (key=hub);");
    assert!(res.is_ok(), "{:?}", res.error);
    let graph = engine.database().graph().unwrap();
    assert!(graph.edges().all(|e| !e.touches("hub")));
    assert_eq!(graph.edge_count(), 1);

    // one EdgeDelete per incident edge, then the node
    let records = engine.database().journal_records().unwrap();
    let deletes: Vec<&Mutation> = records
        .iter()
        .rev()
        .skip(1)
        .take(4)
        .filter_map(|r| r.entry.mutation())
        .collect();
    assert!(matches!(deletes[0], Mutation::NodeDelete { key } if key == "hub"));
    assert_eq!(deletes.iter().filter(|m| matches!(m, Mutation::EdgeDelete { .. })).count(), 3);
}

#[test]
fn adding_an_existing_node_replaces_it() {
    let engine = setup();
    let res = engine.execute("add node (key=a tags=renamed data='{\"v\":2}');");
    assert!(res.is_ok());
    let graph = engine.database().graph().unwrap();
    let node = graph.node("a").unwrap();
    assert!(node.tags().iter().any(|t| t.name() == "renamed"));
    assert_eq!(node.data()["v"], 2);
    // the edge to b survives the change
    assert_eq!(graph.degree("a"), 1);
    let records = engine.database().journal_records().unwrap();
    assert!(records
        .iter()
        .any(|r| matches!(&r.entry.kind, EntryKind::Action(Mutation::NodeChange(n)) if n.key() == "a")));
}

#[test]
fn duplicates_can_be_rejected() {
    let mut settings = Settings::default();
    settings.engine.reject_duplicates = true;
    let db = Database::open(Box::new(MemoryStore::new()), &settings).unwrap();
    let engine = Engine::new(&db);
    assert!(engine.execute("add node (key=a);").is_ok());
    let res = engine.execute("add node (key=a);");
    assert_eq!(res.status, StatusCode::Invalid);
    assert!(res.error.unwrap().contains("already exists"));
}

#[test]
fn undeclared_alias_is_not_found() {
    let engine = setup();
    let res = engine.execute("select () in nowhere;");
    assert_eq!(res.status, StatusCode::NotFound);
}

#[test]
fn delete_searches_bind_their_own_aliases() {
    let engine = setup();
    assert!(engine.execute("add node (key=c);").is_ok());
    let res = engine.execute("delete (key=c), (key=a) as x; select () in x;");
    assert!(res.is_ok(), "{:?}", res.error);
    assert_eq!(res.alias_keys("x"), Some(vec!["a"]));
    assert_eq!(res.alias_keys("$0"), Some(vec!["a", "c"]));
    assert_eq!(res.alias_keys("$1"), Some(vec!["a"]));
    assert!(!engine.database().graph().unwrap().contains_node("a"));
}

#[test]
fn later_delete_searches_can_scope_to_earlier_ones() {
    let engine = setup();
    assert!(engine.execute("add node (key=c);").is_ok());
    let res = engine.execute("delete (key=c) as x, (key=a) in x;");
    assert!(res.is_ok(), "{:?}", res.error);
    assert_eq!(res.keys(), vec!["c"]);
    let graph = engine.database().graph().unwrap();
    assert!(graph.contains_node("a"));
    assert!(!graph.contains_node("c"));

    let res = engine.execute("delete edge (type=owns) as gone; select () in gone;");
    assert!(res.is_ok(), "{:?}", res.error);
    assert_eq!(res.alias_keys("gone"), Some(vec!["a->b:owns"]));
    assert_eq!(res.alias_keys("$1"), Some(vec!["a", "b"]));
}

#[test]
fn commands_built_in_code_run_without_parsing() {
    let engine = setup();
    let commands = vec![
        GraphCommand::NodeSearch(
            NodeSearch::new().with_tags(Tags::parse("active").unwrap()).with_alias("n"),
        ),
        GraphCommand::EdgeSearch(EdgeSearch::new().with_scope("n")),
        GraphCommand::NodeSearch(NodeSearch::new().with_key(KeyPattern::exact("b"))),
    ];
    let res = engine.execute_commands(&commands);
    assert!(res.is_ok(), "{:?}", res.error);
    assert_eq!(res.alias_keys("n"), Some(vec!["a"]));
    assert_eq!(res.alias_keys("$1"), Some(vec!["a->b:owns"]));
    let node = res.items[0].as_node().expect("first item is a node");
    assert!(node.tags().iter().any(|t| t.name() == "active"));
    assert!(res.items[1].as_node().is_none());

    let res = engine.execute_commands(&[GraphCommand::NodeSearch(NodeSearch::new().with_scope("missing"))]);
    assert_eq!(res.status, StatusCode::NotFound);
}

fn random_graph() -> impl Strategy<Value = (usize, Vec<(usize, usize, &'static str)>, usize)> {
    (1usize..8).prop_flat_map(|nodes| {
        let edge = (0..nodes, 0..nodes, prop::sample::select(vec!["forward", "backward", "both"]));
        (Just(nodes), prop::collection::vec(edge, 0..16), 0..nodes)
    })
}

proptest! {
    #[test]
    fn deleting_any_node_leaves_no_edge_touching_it((nodes, edges, victim) in random_graph()) {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        let engine = Engine::new(&db);
        let mut query: String = (0..nodes).map(|n| format!("add node (key=k{n});")).collect();
        for (i, (from, to, direction)) in edges.iter().enumerate() {
            query.push_str(&format!("add edge (key=e{i} from=k{from} to=k{to} direction={direction});"));
        }
        let res = engine.execute(&query);
        prop_assert!(res.is_ok(), "{:?}", res.error);

        let victim_key = format!("k{victim}");
        let res = engine.execute(&format!("delete (key={victim_key});"));
        prop_assert_eq!(res.status, StatusCode::Ok);
        prop_assert_eq!(res.keys(), vec![victim_key.as_str()]);

        let graph = db.graph().unwrap();
        prop_assert!(graph.edges().all(|e| !e.touches(&victim_key)));
        let survivors = edges.iter().filter(|(from, to, _)| *from != victim && *to != victim).count();
        prop_assert_eq!(graph.edge_count(), survivors);
        prop_assert_eq!(graph.node_count(), nodes - 1);
        prop_assert!(!graph.contains_node(&victim_key));
        prop_assert!(db.verify().is_ok());
    }
}
