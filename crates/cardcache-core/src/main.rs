//! cardcache: inspect and maintain a processing cache from the shell.
//!
//! **Usage:**
//! ```bash
//! cardcache [--config <file>] <command>
//! cardcache hash scan_001.jpg
//! cardcache lookup <sha256> --role face
//! cardcache display <entry_id> ./out
//! ```
//!
//! Results are printed to stdout as JSON; logs go to stderr and follow
//! `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::error;

use cardcache_core::identity;
use cardcache_core::models::Role;
use cardcache_core::{CacheConfig, CacheResult, ContentHash, ProcessingCache};

/// Content-addressable processing cache for scanned cards and stamps
#[derive(Parser, Debug)]
#[clap(name = "cardcache", version)]
struct Args {
    /// TOML config file
    #[clap(long, global = true, env = "CARDCACHE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or migrate the database and artifact tree
    Init,
    /// Print the content hash, size and name of a file
    Hash { file: PathBuf },
    /// Show the cached processing record for a hash and role
    Lookup {
        hash: String,
        #[clap(long, default_value = "face")]
        role: Role,
    },
    /// Show a catalog entry and its processing record
    Entry { entry_id: String },
    /// Copy an entry's durable artifacts into a directory
    Display { entry_id: String, dest: PathBuf },
    /// List activity for a session, or for one entry with --entry
    Activity {
        session_id: Option<String>,
        #[clap(long, conflicts_with = "session_id")]
        entry: Option<String>,
    },
    /// Remove staging directories left by interrupted writes
    Sweep,
    /// Write an online backup of the database
    Backup { dest: PathBuf },
}

fn print_json<T: Serialize>(value: &T) -> CacheResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(args: Args) -> CacheResult<()> {
    // Hashing needs no cache at all.
    if let Command::Hash { file } = &args.command {
        let probed = identity::probe(file)?;
        return print_json(&json!({
            "content_hash": probed.content_hash,
            "byte_size": probed.byte_size,
            "original_filename": probed.original_filename,
        }));
    }

    let config = CacheConfig::load(args.config.as_deref())?;
    let cache = ProcessingCache::open(&config)?;

    match args.command {
        Command::Hash { .. } => Ok(()),
        Command::Init => print_json(&json!({
            "db_path": cache.database().db_path(),
            "artifact_root": cache.artifact_store().root(),
            "schema_version": cache.database().schema_version()?,
        })),
        Command::Lookup { hash, role } => {
            let hash = ContentHash::from_hex(&hash)?;
            print_json(&cache.lookup(&hash, role)?)
        }
        Command::Entry { entry_id } => {
            let entry = cache.database().get_entry(&entry_id)?;
            let record = cache.database().get_record(&entry_id)?;
            print_json(&json!({ "entry": entry, "record": record }))
        }
        Command::Display { entry_id, dest } => {
            print_json(&cache.reconstitute_for_display(&entry_id, &dest)?)
        }
        Command::Activity { session_id, entry } => {
            let records = match (session_id, entry) {
                (_, Some(entry_id)) => cache.activity().list_for_entry(&entry_id)?,
                (Some(session_id), None) => cache.list_activity(&session_id)?,
                (None, None) => Vec::new(),
            };
            print_json(&records)
        }
        Command::Sweep => {
            let removed = cache.artifact_store().sweep_staging()?;
            print_json(&json!({ "removed": removed }))
        }
        Command::Backup { dest } => {
            cache.database().backup_to(&dest)?;
            print_json(&json!({ "backup": dest }))
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}
