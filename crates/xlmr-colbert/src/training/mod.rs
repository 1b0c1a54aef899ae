//! Fine-tuning and pre-training.
//!
//! Data files are read by `data`, turned into micro-batches by the
//! batchers, and consumed by [`Trainer`]. The optimizer, loss scaling and
//! checkpoints are separate modules so that each can be tested alone.

pub mod amp;
pub mod batcher;
pub mod checkpoint;
pub mod data;
pub mod distributed;
pub mod loss;
pub mod optimizer;
pub mod pretraining;
pub mod trainer;

pub use amp::{GradAccumulator, MixedPrecisionManager};
pub use batcher::{BilingualBatcher, BilingualPools, MicroBatch, TextTriples, TrainingSource};
pub use checkpoint::{manage_checkpoints, save_checkpoint, Checkpoint, CheckpointMetadata};
pub use data::{load_triples, Collection, Queries, Triple};
pub use distributed::{derive_seed, ProcessGroup, SingleProcess};
pub use optimizer::{AdamW, AdamWConfig};
pub use pretraining::{PreTrainingBatcher, PretrainingStepTexts};
pub use trainer::{Objective, Trainer, TrainingSummary};
