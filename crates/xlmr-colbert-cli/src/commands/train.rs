//! `train` subcommand.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use xlmr_colbert::{ColbertConfig, SingleProcess, Trainer};

use super::{finalize_config, GlobalArgs};

/// Model and optimization flags shared by `train` and `pretrain`.
#[derive(Args, Debug, Default)]
pub struct TrainingFlags {
    /// Directory with config.json and model.safetensors.
    #[arg(long)]
    pub base_model: Option<PathBuf>,

    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// Global batch size (split across ranks).
    #[arg(long)]
    pub bsize: Option<usize>,

    #[arg(long)]
    pub accumsteps: Option<usize>,

    #[arg(long)]
    pub lr: Option<f64>,

    #[arg(long)]
    pub maxsteps: Option<usize>,

    /// Mixed precision for the similarity matmuls.
    #[arg(long)]
    pub amp: bool,

    /// Checkpoint directory to start from.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Continue at the checkpoint's batch index.
    #[arg(long)]
    pub resume: bool,

    /// Also restore the optimizer moments.
    #[arg(long)]
    pub resume_optimizer: bool,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub queries_a: Option<PathBuf>,

    #[arg(long)]
    pub queries_b: Option<PathBuf>,

    #[arg(long)]
    pub collection_a: Option<PathBuf>,

    #[arg(long)]
    pub collection_b: Option<PathBuf>,
}

impl TrainingFlags {
    pub fn apply(self, config: &mut ColbertConfig) {
        if let Some(v) = self.base_model {
            config.model.base_model = Some(v);
        }
        if let Some(v) = self.tokenizer {
            config.model.tokenizer = v;
        }
        if let Some(v) = self.bsize {
            config.training.bsize = v;
        }
        if let Some(v) = self.accumsteps {
            config.training.accumsteps = v;
        }
        if let Some(v) = self.lr {
            config.training.lr = v;
        }
        if let Some(v) = self.maxsteps {
            config.training.maxsteps = v;
        }
        if self.amp {
            config.training.amp = true;
        }
        if let Some(v) = self.checkpoint {
            config.training.checkpoint = Some(v);
        }
        config.training.resume |= self.resume;
        config.training.resume_optimizer |= self.resume_optimizer;
        if let Some(v) = self.output_dir {
            config.training.output_dir = v;
        }
        if let Some(v) = self.queries_a {
            config.data.queries_lang_a = Some(v);
        }
        if let Some(v) = self.queries_b {
            config.data.queries_lang_b = Some(v);
        }
        if let Some(v) = self.collection_a {
            config.data.collection_lang_a = Some(v);
        }
        if let Some(v) = self.collection_b {
            config.data.collection_lang_b = Some(v);
        }
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub flags: TrainingFlags,

    /// `qid \t pos_pid \t neg_pid` triples.
    #[arg(long)]
    pub triples: Option<PathBuf>,
}

pub fn handle_train(global: &GlobalArgs, args: TrainArgs) -> Result<()> {
    let mut config = global.load_config()?;
    args.flags.apply(&mut config);
    if let Some(v) = args.triples {
        config.data.triples = Some(v);
    }
    let output_dir = config.training.output_dir.clone();
    let config = finalize_config(config, &output_dir)?;

    let device = global.device()?;
    let summary = Trainer::new(config, &SingleProcess, device)?
        .train()
        .context("training failed")?;
    info!(
        steps = summary.steps,
        avg_loss = summary.avg_loss,
        checkpoints = summary.checkpoints.len(),
        "Done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_values() {
        let mut config = ColbertConfig::default();
        config.training.bsize = 8;
        let flags = TrainingFlags {
            bsize: Some(64),
            amp: true,
            queries_b: Some(PathBuf::from("q.de.tsv")),
            ..Default::default()
        };
        flags.apply(&mut config);

        assert_eq!(config.training.bsize, 64);
        assert!(config.training.amp);
        assert_eq!(config.data.queries_lang_b, Some(PathBuf::from("q.de.tsv")));
        assert_eq!(config.training.accumsteps, ColbertConfig::default().training.accumsteps);
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let mut config = ColbertConfig::default();
        config.training.amp = true;
        TrainingFlags::default().apply(&mut config);
        assert!(config.training.amp);
        assert!(!config.training.resume);
    }
}
