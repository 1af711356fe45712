//! Knotgraph – an embedded graph query engine with a write-ahead journal.
//!
//! Knotgraph keeps a graph of keyed *nodes* and *edges* in memory and changes
//! it only through a journal:
//! * A [`construct::GraphNode`] has a unique key, structured [`tags::Tags`] and an opaque JSON payload.
//! * A [`construct::GraphEdge`] joins two existing nodes and carries an optional type, tags and a [`construct::Direction`].
//! * A [`construct::Mutation`] is one change to either of them, written to the [`journal::Journal`] as an `Action` entry.
//! * The [`construct::GraphState`] is the materialized view of every committed action.
//!
//! ## Modules
//! * [`tokenizer`] – Splits query text into syntax, value, quoted and whitespace tokens.
//! * [`parser`] – Folds tokens into typed commands using an explicit node stack.
//! * [`command`] – The closed [`command::GraphCommand`] set and its canonical text form.
//! * [`interpreter`] – Runs command sequences with aliases, links and transactions.
//! * [`journal`] – Transaction log, recovery and checkpoints over a [`journal::JournalStore`].
//! * [`persist`] – SQLite journal store with a blake3 superhash chain.
//! * [`construct`] – Graph building blocks and the [`construct::Database`] tying them together.
//! * [`engine`] – [`engine::Engine::execute`], the single entry point for query text.
//! * [`interface`] – Background query threads with cancellation and timeouts.
//! * [`config`] – Layered settings and logging setup.
//!
//! ## Query Language
//! Statements end with `;`. Each starts with `select`, `delete` or `add`,
//! followed by one or more comma separated groups of predicates:
//! ```text
//! add node (key=a tags=active); add node (key=b);
//! add edge (from=a to=b type=owns);
//! select (key=a) as n;
//! select edge (direction=forward) in n as owned;
//! select () in owned;
//! delete (key=* tags=temp);
//! ```
//! Keys accept `*` wildcards. A search may scan an earlier result with
//! `in <alias>` instead of the whole graph: edges found from a node set are
//! that set's incident edges, and nodes found from such an edge set are the
//! nodes at the other end.
//!
//! ## Transactions
//! Read-only queries run against a snapshot of committed state. A query that
//! changes anything takes the journal for its whole run, writes `StartTran`
//! with its first change and `CommitTran` after its last one, and only then
//! publishes the new graph. Any failure writes `RollbackTran` and leaves the
//! graph as it was. Deleting a node deletes its incident edges first.
//!
//! ## Recovery
//! At open the journal is read back: the last checkpoint (if any) is loaded
//! and the committed actions after it are applied in sequence order.
//! Transactions a crash left open are rolled back, and a file-backed journal
//! whose superhash chain does not verify is refused.
//!
//! ## Quick Start
//! ```
//! use knotgraph::{construct::{Database, PersistenceMode}, engine::Engine};
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! let engine = Engine::new(&db);
//! let result = engine.execute("add node (key=a); add node (key=b); add edge (from=a to=b type=owns);");
//! assert!(result.is_ok());
//! let result = engine.execute("select (key=a) as n;");
//! assert_eq!(result.alias_keys("n"), Some(vec!["a"]));
//! ```

pub mod command;
pub mod config;
pub mod construct;
pub mod engine;
pub mod error;
pub mod interface;
pub mod interpreter;
pub mod journal;
pub mod parser;
pub mod persist;
pub mod tags;
pub mod tokenizer;
