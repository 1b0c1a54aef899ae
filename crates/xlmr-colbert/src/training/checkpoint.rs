//! Training checkpoints.
//!
//! A checkpoint is a directory:
//!
//! ```text
//! <dir>/model.safetensors      every model variable
//! <dir>/optimizer.safetensors  AdamW moments
//! <dir>/checkpoint.json        epoch, batch, optimizer step, full config
//! ```
//!
//! The saved config carries the batch size the run used, which is what a
//! resumed run needs to reposition its batcher.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ColbertConfig;
use crate::error::{ColbertError, ColbertResult};
use crate::modeling::backbone::copy_into_varmap;
use crate::modeling::ColBert;

use super::optimizer::AdamW;

pub const MODEL_FILE: &str = "model.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const METADATA_FILE: &str = "checkpoint.json";

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub epoch: usize,
    /// Number of completed optimizer steps.
    pub batch: usize,
    /// AdamW step counter, for bias correction on resume.
    #[serde(default)]
    pub optimizer_step: usize,
    /// Configuration of the run that wrote the checkpoint.
    pub arguments: ColbertConfig,
}

/// A checkpoint directory whose metadata has been read.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Read `checkpoint.json` from `dir`.
    pub fn open(dir: impl AsRef<Path>) -> ColbertResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta_path = dir.join(METADATA_FILE);
        let file = File::open(&meta_path).map_err(|e| ColbertError::Checkpoint {
            message: format!("Failed to open {}: {}", meta_path.display(), e),
        })?;
        let metadata: CheckpointMetadata =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| ColbertError::Checkpoint {
                message: format!("Failed to parse {}: {}", meta_path.display(), e),
            })?;
        info!(
            dir = %dir.display(),
            batch = metadata.batch,
            "Opened checkpoint"
        );
        Ok(Self { dir, metadata })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Batch size per rank of the run that wrote this checkpoint.
    pub fn intended_batch_size(&self) -> usize {
        self.metadata.arguments.per_rank_bsize()
    }

    /// Copy the saved weights into `model`.
    ///
    /// Returns `true` when every variable matched by name and shape with no
    /// leftovers. Otherwise the matching subset is loaded, the rest keep
    /// their current values, and a warning is logged.
    pub fn load_model(&self, model: &ColBert) -> ColbertResult<bool> {
        let path = self.dir.join(MODEL_FILE);
        let tensors = candle_core::safetensors::load(&path, model.device()).map_err(|e| {
            ColbertError::Checkpoint {
                message: format!("Failed to read {}: {}", path.display(), e),
            }
        })?;

        let problems = strict_mismatches(model, &tensors)?;
        if let Some(first) = problems.first() {
            warn!(
                checkpoint = %self.dir.display(),
                mismatches = problems.len(),
                first = %first,
                "Loading checkpoint with strict=false"
            );
        }
        copy_into_varmap(model.varmap(), "", tensors)?;
        Ok(problems.is_empty())
    }

    /// Restore AdamW moments and step counter.
    pub fn load_optimizer(&self, optimizer: &mut AdamW, model: &ColBert) -> ColbertResult<()> {
        let path = self.dir.join(OPTIMIZER_FILE);
        let state = candle_core::safetensors::load(&path, model.device()).map_err(|e| {
            ColbertError::Checkpoint {
                message: format!("Failed to read {}: {}", path.display(), e),
            }
        })?;
        optimizer.load_state(&state, self.metadata.optimizer_step)?;
        info!(step = self.metadata.optimizer_step, "Loaded optimizer state");
        Ok(())
    }
}

/// Names that would make a strict load fail: missing, unexpected, or
/// mismatched in shape.
fn strict_mismatches(model: &ColBert, tensors: &HashMap<String, Tensor>) -> ColbertResult<Vec<String>> {
    let vars = model.varmap().data().lock().map_err(|e| ColbertError::InvalidArgument {
        message: format!("variable map lock poisoned: {}", e),
    })?;

    let mut problems = Vec::new();
    for (name, var) in vars.iter() {
        match tensors.get(name) {
            None => problems.push(format!("missing {}", name)),
            Some(t) if t.shape() != var.as_tensor().shape() => problems.push(format!(
                "{}: checkpoint {:?} vs model {:?}",
                name,
                t.dims(),
                var.as_tensor().dims()
            )),
            Some(_) => {}
        }
    }
    for name in tensors.keys() {
        if !vars.contains_key(name) {
            problems.push(format!("unexpected {}", name));
        }
    }
    problems.sort();
    Ok(problems)
}

/// Write a checkpoint directory, replacing files already there.
pub fn save_checkpoint(
    dir: &Path,
    epoch: usize,
    batch: usize,
    model: &ColBert,
    optimizer: &AdamW,
    config: &ColbertConfig,
) -> ColbertResult<()> {
    fs::create_dir_all(dir)?;

    model.save(&dir.join(MODEL_FILE))?;

    let optimizer_path = dir.join(OPTIMIZER_FILE);
    candle_core::safetensors::save(&optimizer.state_tensors(), &optimizer_path)
        .map_err(ColbertError::tensor(format!("save {}", optimizer_path.display())))?;

    let metadata = CheckpointMetadata {
        epoch,
        batch,
        optimizer_step: optimizer.global_step(),
        arguments: config.clone(),
    };
    let meta_path = dir.join(METADATA_FILE);
    let file = File::create(&meta_path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &metadata)?;

    info!(dir = %dir.display(), batch, "Saved checkpoint");
    Ok(())
}

/// Periodic and milestone checkpoints after `batch_idx` completed steps.
///
/// Every `checkpoint_every` steps the rolling `colbert` checkpoint is
/// overwritten; at each step listed in `saved_checkpoints` a separate
/// `colbert-<step>` is written. Returns the directories written.
pub fn manage_checkpoints(
    config: &ColbertConfig,
    model: &ColBert,
    optimizer: &AdamW,
    batch_idx: usize,
) -> ColbertResult<Vec<PathBuf>> {
    let root = checkpoints_dir(config);
    let mut written = Vec::new();

    let every = config.training.checkpoint_every;
    if every > 0 && batch_idx % every == 0 {
        let dir = root.join("colbert");
        save_checkpoint(&dir, 0, batch_idx, model, optimizer, config)?;
        written.push(dir);
    }

    if config.training.saved_checkpoints.contains(&batch_idx) {
        let dir = root.join(format!("colbert-{}", batch_idx));
        save_checkpoint(&dir, 0, batch_idx, model, optimizer, config)?;
        written.push(dir);
    }

    Ok(written)
}

/// `<output_dir>/checkpoints`.
pub fn checkpoints_dir(config: &ColbertConfig) -> PathBuf {
    config.training.output_dir.join("checkpoints")
}
