//! Bilingual XLM-R ColBERT: late-interaction training and retrieval.
//!
//! # Architecture
//!
//! - **tokenization**: query/document tokenizers and the triple tensorizers
//! - **modeling**: backbone + projection head, batched inference, MaxSim
//! - **training**: data files, batchers, AdamW, mixed precision, checkpoints
//! - **ranking**: document store, candidate index, ranker, retrieval driver
//!
//! # Example
//!
//! ```rust,ignore
//! use xlmr_colbert::{ColbertConfig, ModelInference};
//!
//! let config = ColbertConfig::from_file("colbert.toml")?.with_env_overrides();
//! config.validate()?;
//! let inference = ModelInference::from_config(&config, &candle_core::Device::Cpu)?;
//! let q = inference.query_from_text(&["what is colbert"], None)?;
//! ```

pub mod config;
pub mod error;
pub mod modeling;
pub mod ranking;
pub mod tokenization;
pub mod training;

pub use config::{BackboneKind, ColbertConfig, IndexKind, Similarity};
pub use error::{ColbertError, ColbertResult};
pub use modeling::{ColBert, DocEmbeddings, ModelInference};
pub use ranking::{DocumentStore, Ranker, RankingLogger};
pub use tokenization::{ColbertTokenizer, DocTokenizer, QueryTokenizer, Tensorize, TokenizedBatch};
pub use training::{SingleProcess, Trainer, TrainingSummary};
