//! `pretrain` subcommand.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use xlmr_colbert::{SingleProcess, Trainer};

use super::train::TrainingFlags;
use super::{finalize_config, GlobalArgs};

#[derive(Args, Debug)]
pub struct PretrainArgs {
    #[command(flatten)]
    pub flags: TrainingFlags,

    /// Anchor / positive / negative query ids, one example per line.
    #[arg(long)]
    pub query_triples: Option<PathBuf>,

    /// Anchor / positive / negative passage ids, aligned with
    /// `--query-triples` line by line.
    #[arg(long)]
    pub collection_triples: Option<PathBuf>,
}

pub fn handle_pretrain(global: &GlobalArgs, args: PretrainArgs) -> Result<()> {
    let mut config = global.load_config()?;
    args.flags.apply(&mut config);
    if let Some(v) = args.query_triples {
        config.data.query_triples = Some(v);
    }
    if let Some(v) = args.collection_triples {
        config.data.collection_triples = Some(v);
    }
    let output_dir = config.training.output_dir.clone();
    let config = finalize_config(config, &output_dir)?;

    let device = global.device()?;
    let summary = Trainer::new(config, &SingleProcess, device)?
        .pretrain()
        .context("pre-training failed")?;
    info!(steps = summary.steps, avg_loss = summary.avg_loss, "Done");
    Ok(())
}
