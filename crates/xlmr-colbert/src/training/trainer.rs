//! Training loops.
//!
//! [`Trainer::train`] fine-tunes on bilingual `(query, positive, negative)`
//! triples; [`Trainer::pretrain`] runs the query-side plus document-side
//! contrastive objective. Both share one loop:
//!
//! 1. build the tokenizers and the step source for this rank
//! 2. load the model (non-main ranks wait for rank 0 first), optionally
//!    restoring a checkpoint and the optimizer state
//! 3. for every step up to `maxsteps`: accumulate the loss of each
//!    micro-batch, take one optimizer step, log metrics and write
//!    checkpoints on the main rank

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::config::ColbertConfig;
use crate::error::{ColbertError, ColbertResult};
use crate::modeling::ColBert;
use crate::tokenization::{ColbertTokenizer, DocTokenizer, QueryTokenizer};

use super::amp::{GradAccumulator, MixedPrecisionManager};
use super::batcher::{BilingualBatcher, MicroBatch, TrainingSource};
use super::checkpoint::{manage_checkpoints, Checkpoint};
use super::distributed::{derive_seed, ProcessGroup};
use super::loss::{cross_entropy_first, pairwise_scores, score_progress, tensor_to_f32};
use super::optimizer::{AdamW, AdamWConfig};
use super::pretraining::PreTrainingBatcher;

/// Which loss the loop optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Cross-entropy over `(positive, negative)` pairs of each triple.
    Triples,
    /// Query-side cross-entropy plus document-side cross-entropy.
    Pretraining,
}

/// What a finished run did.
#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    /// First step of this run (non-zero on resume).
    pub start_batch: usize,
    /// Optimizer steps attempted in this run.
    pub steps: usize,
    /// Mean loss over this run's steps.
    pub avg_loss: f32,
    /// Steps dropped because gradients were not finite.
    pub skipped_steps: usize,
    /// Checkpoint directories written, in order.
    pub checkpoints: Vec<PathBuf>,
}

pub struct Trainer<'a> {
    config: ColbertConfig,
    process_group: &'a dyn ProcessGroup,
    device: Device,
}

impl<'a> Trainer<'a> {
    /// Validate `config` and check that it agrees with `process_group`.
    pub fn new(
        config: ColbertConfig,
        process_group: &'a dyn ProcessGroup,
        device: Device,
    ) -> ColbertResult<Self> {
        config.validate()?;
        let dist = &config.distributed;
        if process_group.rank() != dist.rank || process_group.world_size() != dist.nranks {
            return Err(ColbertError::ConfigError {
                message: format!(
                    "process group is rank {}/{} but config says {}/{}",
                    process_group.rank(),
                    process_group.world_size(),
                    dist.rank,
                    dist.nranks
                ),
            });
        }
        Ok(Self {
            config,
            process_group,
            device,
        })
    }

    pub fn config(&self) -> &ColbertConfig {
        &self.config
    }

    pub fn train(&self) -> ColbertResult<TrainingSummary> {
        self.run(Objective::Triples)
    }

    pub fn pretrain(&self) -> ColbertResult<TrainingSummary> {
        self.run(Objective::Pretraining)
    }

    fn run(&self, objective: Objective) -> ColbertResult<TrainingSummary> {
        let config = &self.config;
        let pg = self.process_group;
        let distributed = config.distributed.is_distributed();

        let tokenizer = Arc::new(ColbertTokenizer::from_file(
            &config.model.tokenizer,
            &config.model.query_marker,
            &config.model.doc_marker,
        )?);
        let query_tokenizer = QueryTokenizer::new(tokenizer.clone(), config.model.query_maxlen)?;
        let doc_tokenizer = DocTokenizer::new(tokenizer.clone(), config.model.doc_maxlen)?;

        let mut source: Box<dyn TrainingSource> = match objective {
            Objective::Triples => Box::new(BilingualBatcher::from_config(
                config,
                query_tokenizer,
                doc_tokenizer,
                derive_seed(config.training.seed, pg.rank()),
            )?),
            Objective::Pretraining => Box::new(PreTrainingBatcher::from_config(
                config,
                query_tokenizer,
                doc_tokenizer,
            )?),
        };
        if distributed {
            pg.barrier()?;
        }

        // Rank 0 loads first so that a shared download or cache is filled once.
        if distributed && !pg.is_main() {
            pg.barrier()?;
        }
        let model = ColBert::from_config(&config.model, &tokenizer, &self.device)?;
        let checkpoint = config
            .training
            .checkpoint
            .as_ref()
            .map(Checkpoint::open)
            .transpose()?;
        if let Some(ckpt) = &checkpoint {
            if !config.training.resume_optimizer {
                info!(checkpoint = %ckpt.dir().display(), "Starting from checkpoint but NOT the optimizer");
            }
            ckpt.load_model(&model)?;
        }
        if distributed && pg.is_main() {
            pg.barrier()?;
        }

        let mut optimizer = AdamW::new(
            model.varmap(),
            AdamWConfig {
                lr: config.training.lr,
                epsilon: 1e-8,
                ..Default::default()
            },
        )?;
        if config.training.resume_optimizer {
            let ckpt = checkpoint.as_ref().ok_or_else(|| ColbertError::ConfigError {
                message: "training.resume_optimizer requires training.checkpoint".to_string(),
            })?;
            ckpt.load_optimizer(&mut optimizer, &model)?;
        }

        let mut amp = MixedPrecisionManager::new(config.training.amp);

        let mut start_batch = 0;
        if config.training.resume {
            let ckpt = checkpoint.as_ref().ok_or_else(|| ColbertError::ConfigError {
                message: "training.resume requires training.checkpoint".to_string(),
            })?;
            start_batch = ckpt.metadata.batch;
            source.skip_to_batch(start_batch, ckpt.intended_batch_size());
            info!(start_batch, "Resuming training");
        }

        info!(
            ?objective,
            rank = pg.rank(),
            nranks = pg.world_size(),
            triples = source.len(),
            bsize = config.per_rank_bsize(),
            accumsteps = config.training.accumsteps,
            maxsteps = config.training.maxsteps,
            amp = config.training.amp,
            "Starting training"
        );

        let vars = model.varmap().all_vars();
        let accumsteps = config.training.accumsteps as f64;
        let examples_per_step = config.per_rank_bsize() * config.distributed.nranks;
        let started = Instant::now();

        let mut summary = TrainingSummary {
            start_batch,
            ..Default::default()
        };
        let mut train_loss = 0.0f64;

        for batch_idx in start_batch..config.training.maxsteps {
            let Some(micro_batches) = source.next_step()? else {
                info!(batch_idx, "Training data exhausted");
                break;
            };

            let mut accumulator = GradAccumulator::new();
            let mut batch_loss = 0.0f64;
            for micro_batch in &micro_batches {
                let (loss, pairs) =
                    amp.context(|dtype| micro_batch_loss(&model, micro_batch, dtype))?;
                let loss = loss
                    .affine(1.0 / accumsteps, 0.0)
                    .map_err(ColbertError::tensor("scale loss by accumsteps"))?;

                if pg.is_main() {
                    let progress = score_progress(&pairs)?;
                    debug!(
                        positive_avg = progress.positive_avg,
                        negative_avg = progress.negative_avg,
                        difference = progress.difference(),
                        "Score progress"
                    );
                }

                let grads = amp.backward(&loss)?;
                accumulator.add(&vars, grads)?;

                let value = f64::from(tensor_to_f32(&loss)?);
                train_loss += value;
                batch_loss += value;
            }

            if let Some(grads) = accumulator.take() {
                if !amp.step(&mut optimizer, &vars, grads)? {
                    summary.skipped_steps += 1;
                }
            }
            summary.steps += 1;

            if pg.is_main() {
                let done = batch_idx - start_batch + 1;
                let elapsed = started.elapsed().as_secs_f64();
                let examples = done * examples_per_step;
                info!(
                    step = batch_idx,
                    "train/avg_loss" = train_loss / done as f64,
                    "train/batch_loss" = batch_loss,
                    "train/examples" = examples,
                    "train/throughput" = examples as f64 / elapsed.max(f64::EPSILON),
                    "Step"
                );
                summary
                    .checkpoints
                    .extend(manage_checkpoints(config, &model, &optimizer, batch_idx + 1)?);
            }
        }

        if summary.skipped_steps > 0 {
            warn!(skipped = summary.skipped_steps, "Some steps had non-finite gradients");
        }
        if summary.steps > 0 {
            summary.avg_loss = (train_loss / summary.steps as f64) as f32;
        }
        info!(
            steps = summary.steps,
            avg_loss = summary.avg_loss,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Training finished"
        );
        Ok(summary)
    }
}

/// Loss of one micro-batch and the `(rows, 2)` score pairs behind it.
fn micro_batch_loss(
    model: &ColBert,
    micro_batch: &MicroBatch,
    dtype: DType,
) -> ColbertResult<(Tensor, Tensor)> {
    match micro_batch {
        MicroBatch::Triples { queries, documents } => {
            let scores = model.forward(queries, documents, dtype)?;
            let pairs = pairwise_scores(&scores)?;
            Ok((cross_entropy_first(&pairs)?, pairs))
        }
        MicroBatch::QueryDocument {
            queries,
            queries_pn,
            documents,
            documents_pn,
        } => {
            let q = model.query_batch(queries)?;
            let q_pn = model.query_batch(queries_pn)?;
            let query_pairs = pairwise_scores(&model.score_pairs(&q, &q_pn, dtype)?)?;

            let d = model.doc_batch(documents)?.into_padded()?;
            let d_pn = model.doc_batch(documents_pn)?.into_padded()?;
            let doc_pairs = pairwise_scores(&model.score_pairs(&d, &d_pn, dtype)?)?;

            let loss = (cross_entropy_first(&query_pairs)? + cross_entropy_first(&doc_pairs)?)
                .map_err(ColbertError::tensor("sum pre-training losses"))?;
            Ok((loss, query_pairs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modeling::colbert::test_support::lookup_model;
    use crate::tokenization::{Tensorize, TokenizedBatch};
    use crate::training::distributed::SingleProcess;

    fn tensorize_pair(
        tokenizer: &ColbertTokenizer,
        queries: &[&str],
        docs: &[&str],
    ) -> (TokenizedBatch, TokenizedBatch) {
        let tokenizer = Arc::new(tokenizer.clone());
        let qt = QueryTokenizer::new(tokenizer.clone(), 8).unwrap();
        let dt = DocTokenizer::new(tokenizer, 8).unwrap();
        (qt.tensorize(queries).unwrap(), dt.tensorize(docs).unwrap())
    }

    #[test]
    fn test_triples_loss_is_positive_scalar() {
        let (tokenizer, model) = lookup_model(8, false);
        let (queries, documents) =
            tensorize_pair(&tokenizer, &["a b", "c"], &["the cat", "mat", "b", "sat on"]);
        let batch = MicroBatch::Triples { queries, documents };

        let (loss, pairs) = micro_batch_loss(&model, &batch, DType::F32).unwrap();
        assert_eq!(pairs.dims(), &[2, 2]);
        assert_eq!(loss.rank(), 0);
        assert!(tensor_to_f32(&loss).unwrap() > 0.0);
    }

    #[test]
    fn test_pretraining_loss_sums_both_sides() {
        let (tokenizer, model) = lookup_model(8, false);
        let (queries, documents) = tensorize_pair(&tokenizer, &["a", "a"], &["doc0", "doc0"]);
        let (queries_pn, documents_pn) =
            tensorize_pair(&tokenizer, &["a b", "c"], &["doc0 doc1", "doc2"]);
        let batch = MicroBatch::QueryDocument {
            queries,
            queries_pn,
            documents,
            documents_pn,
        };

        let (loss, pairs) = micro_batch_loss(&model, &batch, DType::F32).unwrap();
        assert_eq!(pairs.dims(), &[1, 2]);
        let single = cross_entropy_first(&pairs).unwrap();
        assert!(tensor_to_f32(&loss).unwrap() > tensor_to_f32(&single).unwrap());
    }

    #[test]
    fn test_process_group_must_match_config() {
        let mut config = ColbertConfig::default();
        config.training.bsize = 4;
        config.training.accumsteps = 1;
        config.distributed.nranks = 2;
        config.validate().unwrap();
        let err = Trainer::new(config, &SingleProcess, Device::Cpu).err();
        assert!(matches!(err, Some(ColbertError::ConfigError { .. })));
    }
}
