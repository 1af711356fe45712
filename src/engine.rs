use tracing::debug;

use crate::command::GraphCommand;
use crate::construct::Database;
use crate::interface::CancelToken;
use crate::interpreter::GraphQueryResult;
use crate::parser::parse_query;

/// Entry point combining tokenizer, parser and interpreter over a database.
pub struct Engine<'db> {
    database: &'db Database,
}

impl<'db> Engine<'db> {
    pub fn new(database: &'db Database) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &'db Database {
        self.database
    }

    /// Parses and runs `text`. Lex and parse errors come back as a
    /// `BadRequest` result before anything reaches the journal.
    pub fn execute(&self, text: &str) -> GraphQueryResult {
        self.run(text, None)
    }

    pub fn execute_cancellable(&self, text: &str, cancel: &CancelToken) -> GraphQueryResult {
        self.run(text, Some(cancel))
    }

    /// Runs commands built in code, skipping the parser.
    pub fn execute_commands(&self, commands: &[GraphCommand]) -> GraphQueryResult {
        self.database.execute(commands, None)
    }

    fn run(&self, text: &str, cancel: Option<&CancelToken>) -> GraphQueryResult {
        match parse_query(text) {
            Ok(commands) => self.database.execute(&commands, cancel),
            Err(error) => {
                debug!(%error, "query rejected");
                GraphQueryResult::failure(&error)
            }
        }
    }
}
