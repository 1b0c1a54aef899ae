//! Bilingual ColBERT command line.
//!
//! # Commands
//!
//! - `train`: fine-tune on bilingual triples
//! - `pretrain`: query-side plus document-side pre-training
//! - `index`: encode a collection into a document store
//! - `retrieve`: rank a query file against an index
//!
//! # Configuration priority
//!
//! CLI flags > `COLBERT_*` environment variables > `--config` TOML > defaults
//!
//! ```bash
//! xlmr-colbert --config colbert.toml train --bsize 64 --amp
//! RUST_LOG=debug xlmr-colbert --config colbert.toml retrieve --depth 100
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "xlmr-colbert")]
#[command(version)]
#[command(about = "Bilingual XLM-R ColBERT training, indexing and retrieval")]
#[command(propagate_version = true)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "COLBERT_CONFIG")]
    config: Option<PathBuf>,

    /// Run on the first CUDA device when available.
    #[arg(long, global = true)]
    gpu: bool,

    /// Verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune on (query, positive, negative) triples
    Train(commands::train::TrainArgs),
    /// Pre-train on paired query and document triples
    Pretrain(commands::pretrain::PretrainArgs),
    /// Encode a collection and save the document store
    Index(commands::index::IndexArgs),
    /// Rank every query of a file and write ranking.tsv
    Retrieve(commands::retrieve::RetrieveArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 | 1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let global = commands::GlobalArgs {
        config: cli.config,
        gpu: cli.gpu,
    };
    let result = match cli.command {
        Commands::Train(args) => commands::train::handle_train(&global, args),
        Commands::Pretrain(args) => commands::pretrain::handle_pretrain(&global, args),
        Commands::Index(args) => commands::index::handle_index(&global, args),
        Commands::Retrieve(args) => commands::retrieve::handle_retrieve(&global, args),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
