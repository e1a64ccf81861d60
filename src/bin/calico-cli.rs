//! Thin inspection/smoke-test CLI over a calico database (§6: "CLI / examples
//! surface: not part of the core spec" — this binary exists only to exercise the
//! public `Engine` API from a shell).

use std::path::PathBuf;
use std::process::ExitCode;

use calico::{CursorStatus, Engine, Options, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the database file.
    path: PathBuf,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the value for a key.
    Get { key: String },
    /// Insert or overwrite a key.
    Put { key: String, value: String },
    /// Remove a key.
    Erase { key: String },
    /// Print every key/value pair in order.
    Scan,
    /// Compact the file, reclaiming space left by erased pages.
    Vacuum,
    /// Print `get_property` diagnostics.
    Stat,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let engine = match Engine::open(&cli.path, Options::default()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to open {}: {e}", cli.path.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(&engine, cli.command) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(engine: &Engine, command: Cmd) -> Result<()> {
    match command {
        Cmd::Get { key } => {
            let value = engine.get(key.as_bytes())?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Cmd::Put { key, value } => engine.put(key.as_bytes(), value.as_bytes())?,
        Cmd::Erase { key } => engine.erase(key.as_bytes())?,
        Cmd::Scan => {
            let mut cursor = engine.new_cursor();
            cursor.seek_first()?;
            while cursor.status() == CursorStatus::Valid {
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(&cursor.key()?),
                    String::from_utf8_lossy(&cursor.value()?)
                );
                cursor.next()?;
            }
        }
        Cmd::Vacuum => engine.vacuum()?,
        Cmd::Stat => {
            for name in ["page_size", "page_count", "record_count", "cache_hit_ratio"] {
                println!("{name}: {}", engine.get_property(name)?);
            }
        }
    }
    Ok(())
}
