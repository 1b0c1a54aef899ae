//! `index` subcommand.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use xlmr_colbert::ranking::index_collection;
use xlmr_colbert::training::Collection;
use xlmr_colbert::{IndexKind, ModelInference};

use super::{finalize_config, GlobalArgs};

#[derive(Args, Debug)]
pub struct IndexArgs {
    /// `pid \t passage [\t title]` collection to encode.
    #[arg(long)]
    pub collection: PathBuf,

    /// Output directory; defaults to `retrieval.index_path`.
    #[arg(long)]
    pub index_path: Option<PathBuf>,

    /// Trained checkpoint whose weights encode the collection.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Documents per inference call.
    #[arg(long)]
    pub bsize: Option<usize>,

    /// Candidate index kind recorded for retrieval (flat | hnsw).
    #[arg(long, value_parser = parse_kind)]
    pub kind: Option<IndexKind>,

    #[arg(long)]
    pub amp: bool,
}

fn parse_kind(s: &str) -> Result<IndexKind, String> {
    match s {
        "flat" => Ok(IndexKind::Flat),
        "hnsw" => Ok(IndexKind::Hnsw),
        other => Err(format!("unknown index kind '{}', expected flat or hnsw", other)),
    }
}

pub fn handle_index(global: &GlobalArgs, args: IndexArgs) -> Result<()> {
    let mut config = global.load_config()?;
    if let Some(v) = args.index_path {
        config.retrieval.index_path = Some(v);
    }
    if let Some(v) = args.checkpoint {
        config.training.checkpoint = Some(v);
    }
    if let Some(v) = args.bsize {
        config.retrieval.index_bsize = v;
    }
    if let Some(v) = args.kind {
        config.retrieval.index_kind = v;
    }
    config.training.amp |= args.amp;

    let index_path = config
        .retrieval
        .index_path
        .clone()
        .context("an index path is required (--index-path or retrieval.index_path)")?;
    let config = finalize_config(config, &index_path)?;

    let device = global.device()?;
    let inference = ModelInference::from_config(&config, &device)?;
    let collection = Collection::load(&args.collection)?;
    let store = index_collection(&inference, &collection, &config.retrieval, &index_path)?;
    info!(
        path = %index_path.display(),
        docs = store.num_docs(),
        embeddings = store.num_embeddings(),
        "Done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("flat"), Ok(IndexKind::Flat));
        assert_eq!(parse_kind("hnsw"), Ok(IndexKind::Hnsw));
        assert!(parse_kind("ivf").is_err());
    }
}
