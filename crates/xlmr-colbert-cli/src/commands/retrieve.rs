//! `retrieve` subcommand.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use xlmr_colbert::ranking::{open_index, retrieve};
use xlmr_colbert::training::Queries;
use xlmr_colbert::{ModelInference, Ranker, RankingLogger};

use super::{finalize_config, GlobalArgs};

#[derive(Args, Debug)]
pub struct RetrieveArgs {
    /// `qid \t text` queries, ranked in file order.
    #[arg(long)]
    pub queries: Option<PathBuf>,

    /// Directory written by `index`.
    #[arg(long)]
    pub index_path: Option<PathBuf>,

    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Neighbours fetched per query token.
    #[arg(long)]
    pub faiss_depth: Option<usize>,

    /// Documents kept per query in ranking.tsv.
    #[arg(long)]
    pub depth: Option<usize>,

    #[arg(long)]
    pub log_scores: bool,

    #[arg(long)]
    pub amp: bool,

    /// Where ranking.tsv goes; defaults to `<output_dir>/retrieve`.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

pub fn handle_retrieve(global: &GlobalArgs, args: RetrieveArgs) -> Result<()> {
    let mut config = global.load_config()?;
    if let Some(v) = args.queries {
        config.retrieval.queries = Some(v);
    }
    if let Some(v) = args.index_path {
        config.retrieval.index_path = Some(v);
    }
    if let Some(v) = args.checkpoint {
        config.training.checkpoint = Some(v);
    }
    if let Some(v) = args.faiss_depth {
        config.retrieval.faiss_depth = v;
    }
    if let Some(v) = args.depth {
        config.retrieval.depth = v;
    }
    config.retrieval.log_scores |= args.log_scores;
    config.training.amp |= args.amp;

    let output_dir = args
        .output_dir
        .unwrap_or_else(|| config.training.output_dir.join("retrieve"));
    let config = finalize_config(config, &output_dir)?;

    let queries_path = config
        .retrieval
        .queries
        .as_ref()
        .context("a query file is required (--queries or retrieval.queries)")?;
    let index_path = config
        .retrieval
        .index_path
        .as_ref()
        .context("an index path is required (--index-path or retrieval.index_path)")?;

    let device = global.device()?;
    let inference = ModelInference::from_config(&config, &device)?;
    let (store, index) = open_index(index_path, &config.retrieval)?;
    let ranker = Ranker::new(inference, index, store, config.retrieval.faiss_depth)?;

    let queries = Queries::load(queries_path)?;
    let logger = RankingLogger::create(&output_dir, config.retrieval.log_scores)?;
    let summary = retrieve(&ranker, &queries, config.retrieval.depth, logger)?;

    info!(
        queries = summary.queries,
        answered = summary.answered,
        avg_latency_ms = summary.avg_latency_ms,
        path = %summary.ranking_path.display(),
        "Done"
    );
    Ok(())
}
