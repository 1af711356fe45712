use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use knotgraph::config::Settings;
use knotgraph::construct::Database;
use knotgraph::engine::Engine;
use knotgraph::error::Result;
use tracing::{error, info};

// Reads a query from stdin, runs it and prints the result as JSON.
// An optional first argument names a settings file.
fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "knotgraph failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let settings_path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = Settings::load(settings_path.as_deref())?;
    settings.log.init()?;
    info!(journal = ?settings.journal.path, "starting knotgraph");
    let database = Database::from_settings(&settings)?;
    let mut script = String::new();
    std::io::stdin().read_to_string(&mut script)?;
    let result = Engine::new(&database).execute(&script);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_ok())
}
