use std::sync::PoisonError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KnotError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Lex error at offset {offset}: {message}")]
    Lex { message: String, offset: usize },
    #[error("Parse error: {message}")]
    Parse { message: String, token: Option<String>, offset: Option<usize> },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KnotError>;

// Helper conversions
impl From<rusqlite::Error> for KnotError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<serde_json::Error> for KnotError {
    fn from(e: serde_json::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<config::ConfigError> for KnotError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl<T> From<PoisonError<T>> for KnotError {
    fn from(e: PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
