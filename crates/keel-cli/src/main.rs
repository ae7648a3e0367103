//! keel: operator tooling for Keel state store data files.
//!
//! # Usage
//!
//! ```text
//! keel --data state.redb kv put service/web/config '{"replicas":3}'
//! keel --data state.redb kv list service/
//! keel --data state.redb snapshot save --out backup.json
//! keel --data restored.redb snapshot load --from backup.json
//! keel --config keel.toml reap --index 120
//! ```
//!
//! Set `RUST_LOG` to adjust log verbosity (default: `info,keel=debug`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Keel: inspect and maintain state store data files",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to keel.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Data file, overrides [store].path from the config
    #[arg(short, long, global = true)]
    data: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save or load a point-in-time copy of the store
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Read and write KV entries
    Kv {
        #[command(subcommand)]
        action: KvAction,
    },
    /// Purge tombstones at or below an index
    Reap {
        #[arg(short, long)]
        index: u64,
    },
    /// Print the per-table index entries
    Indexes,
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Write the store contents as JSON
    Save {
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Restore a JSON snapshot into an empty data file
    Load {
        #[arg(short, long)]
        from: PathBuf,
    },
}

#[derive(Subcommand)]
enum KvAction {
    Get {
        key: String,
    },
    Put {
        key: String,
        value: String,
        /// Opaque flags stored alongside the value
        #[arg(short, long, default_value_t = 0)]
        flags: u64,
    },
    /// List entries under a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
        /// Print only keys, rolled up at this separator
        #[arg(short, long)]
        separator: Option<String>,
    },
    Delete {
        key: String,
        /// Treat KEY as a prefix and delete everything under it
        #[arg(short, long)]
        recurse: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,keel=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref(), cli.data)?;

    match cli.command {
        Commands::Snapshot { action } => match action {
            SnapshotAction::Save { out } => commands::snapshot::save(&config, &out),
            SnapshotAction::Load { from } => commands::snapshot::load(&config, &from),
        },
        Commands::Kv { action } => match action {
            KvAction::Get { key } => commands::kv::get(&config, &key),
            KvAction::Put { key, value, flags } => commands::kv::put(&config, &key, &value, flags),
            KvAction::List { prefix, separator } => {
                commands::kv::list(&config, &prefix, separator.as_deref())
            }
            KvAction::Delete { key, recurse } => commands::kv::delete(&config, &key, recurse),
        },
        Commands::Reap { index } => commands::maintenance::reap(&config, index),
        Commands::Indexes => commands::maintenance::indexes(&config),
    }
}
