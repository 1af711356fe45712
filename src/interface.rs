//! Threaded interface for submitting and controlling queries.
//!
//! This module provides a minimal, thread-per-query runner that accepts query
//! text, executes it on a background thread, and optionally streams the
//! resulting items back to the caller. Cancellation is cooperative: the
//! interpreter checks the query's [`CancelToken`] before every command, and a
//! cancelled mutating query is rolled back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::construct::{Database, GraphItem};
use crate::engine::Engine;
use crate::error::KnotError;
use crate::interpreter::GraphQueryResult;

/// Cancellation token shared with the worker thread. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    /// A token that also counts as cancelled once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { flag: Arc::default(), deadline: Some(Instant::now() + timeout) }
    }
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Opaque query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

/// Handle to a running or completed query.
pub struct QueryHandle {
    pub id: QueryId,
    cancel: CancelToken,
    started: Instant,
    join: Option<JoinHandle<GraphQueryResult>>,
    pub results: Option<Receiver<GraphItem>>, // None unless streaming was requested
}

impl QueryHandle {
    /// Request cancellation (cooperative). The worker may take a short time to observe it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Wait for the query to finish.
    pub fn join(mut self) -> GraphQueryResult {
        match self.join.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => GraphQueryResult::failure(&KnotError::Invariant("query thread panicked".to_string())),
            None => GraphQueryResult::failure(&KnotError::Invariant("query already joined".to_string())),
        }
    }
    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Query submission options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub stream_results: bool,
    pub timeout: Option<Duration>,
}

/// Registry managing query lifecycles.
pub struct QueryInterface {
    db: Arc<Database>,
    next_id: AtomicU64,
    active: Arc<Mutex<HashMap<QueryId, CancelToken>>>, // for external cancellation
}

impl QueryInterface {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, next_id: AtomicU64::new(0), active: Arc::default() }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Submit a query for execution on a background thread.
    /// When `options.stream_results` is true, a channel is returned for items.
    pub fn start_query(&self, script: String, options: QueryOptions) -> QueryHandle {
        let id = QueryId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let cancel = match options.timeout {
            Some(timeout) => CancelToken::with_timeout(timeout),
            None => CancelToken::new(),
        };
        if let Ok(mut active) = self.active.lock() {
            active.insert(id, cancel.clone());
        }
        let (tx, rx) = if options.stream_results {
            let (tx, rx) = mpsc::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let db = Arc::clone(&self.db);
        let active = Arc::clone(&self.active);
        let cancel_for_thread = cancel.clone();
        let join = std::thread::spawn(move || {
            let result = Engine::new(&db).execute_cancellable(&script, &cancel_for_thread);
            if let Some(tx) = tx {
                for item in &result.items {
                    if tx.send(item.clone()).is_err() {
                        debug!(id = id.0, "result receiver dropped");
                        break;
                    }
                }
            }
            match active.lock() {
                Ok(mut active) => {
                    active.remove(&id);
                }
                Err(e) => warn!(id = id.0, error = %e, "query registry poisoned"),
            }
            result
        });

        QueryHandle { id, cancel, started: Instant::now(), join: Some(join), results: rx }
    }

    /// Run a query synchronously on the current thread.
    pub fn run_sync(&self, script: &str) -> GraphQueryResult {
        Engine::new(&self.db).execute(script)
    }

    /// Cancel a query by id.
    pub fn cancel(&self, id: QueryId) -> bool {
        match self.active.lock() {
            Ok(active) => match active.get(&id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn active_queries(&self) -> usize {
        self.active.lock().map_or(0, |active| active.len())
    }
}
