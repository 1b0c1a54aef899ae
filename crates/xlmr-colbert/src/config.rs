//! Root configuration for training, indexing and retrieval.
//!
//! `ColbertConfig` is built once (file, then environment, then CLI flags)
//! and handed by reference to every component constructor. Nothing mutates
//! it after validation.
//!
//! # TOML Structure
//!
//! ```toml
//! [model]
//! base_model = "./xlm-roberta-base"
//! tokenizer = "./xlm-roberta-base/tokenizer.json"
//! query_maxlen = 32
//! doc_maxlen = 180
//! dim = 128
//! similarity = "cosine"
//!
//! [training]
//! bsize = 32
//! accumsteps = 2
//! lr = 3e-6
//! amp = true
//!
//! [data]
//! triples = "triples.tsv"
//! queries_lang_a = "queries.en.tsv"
//! queries_lang_b = "queries.de.tsv"
//! collection_lang_a = "collection.en.tsv"
//! collection_lang_b = "collection.de.tsv"
//!
//! [distributed]
//! rank = 0
//! nranks = 1
//!
//! [retrieval]
//! faiss_depth = 1024
//! depth = 1000
//! index_kind = "hnsw"
//! ```
//!
//! # Design Principles
//!
//! - **FAIL FAST**: unreadable or unparsable files are errors, never defaults
//! - **VALIDATION**: every section is validated together by `validate()`

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ColbertError, ColbertResult};

/// Hard upper bound on query/document lengths for the XLM-R encoder.
pub const MAX_SEQUENCE_LENGTH: usize = 512;

/// `[CLS] marker [SEP]` leaves no room below this.
pub const MIN_SEQUENCE_LENGTH: usize = 3;

// ============================================================================
// MODEL CONFIG
// ============================================================================

/// Token-level similarity used by the late-interaction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    /// Dot product of L2-normalized token vectors.
    #[default]
    Cosine,
    /// Negative squared Euclidean distance.
    L2,
}

impl Similarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Similarity::Cosine => "cosine",
            Similarity::L2 => "l2",
        }
    }
}

/// Which encoder sits under the ColBERT projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    /// BERT-family transformer loaded from `config.json` + safetensors.
    #[default]
    Bert,
    /// Trainable embedding table. CPU smoke runs only.
    Lookup,
}

/// Encoder, tokenizer and embedding-shape settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding `config.json` and `model.safetensors`.
    #[serde(default)]
    pub base_model: Option<PathBuf>,

    /// Path to a HuggingFace `tokenizer.json`.
    #[serde(default = "default_tokenizer")]
    pub tokenizer: PathBuf,

    #[serde(default)]
    pub backbone: BackboneKind,

    /// Hidden size of the lookup backbone. Ignored for BERT.
    #[serde(default = "default_lookup_hidden")]
    pub lookup_hidden: usize,

    #[serde(default = "default_query_maxlen")]
    pub query_maxlen: usize,

    #[serde(default = "default_doc_maxlen")]
    pub doc_maxlen: usize,

    /// Output dimension of the ColBERT projection.
    #[serde(default = "default_dim")]
    pub dim: usize,

    #[serde(default)]
    pub similarity: Similarity,

    /// Zero out punctuation tokens in document embeddings.
    #[serde(default)]
    pub mask_punctuation: bool,

    #[serde(default = "default_query_marker")]
    pub query_marker: String,

    #[serde(default = "default_doc_marker")]
    pub doc_marker: String,
}

fn default_tokenizer() -> PathBuf {
    PathBuf::from("tokenizer.json")
}

fn default_lookup_hidden() -> usize {
    64
}

fn default_query_maxlen() -> usize {
    32
}

fn default_doc_maxlen() -> usize {
    180
}

fn default_dim() -> usize {
    128
}

fn default_query_marker() -> String {
    "[Q]".to_string()
}

fn default_doc_marker() -> String {
    "[D]".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_model: None,
            tokenizer: default_tokenizer(),
            backbone: BackboneKind::default(),
            lookup_hidden: default_lookup_hidden(),
            query_maxlen: default_query_maxlen(),
            doc_maxlen: default_doc_maxlen(),
            dim: default_dim(),
            similarity: Similarity::default(),
            mask_punctuation: false,
            query_marker: default_query_marker(),
            doc_marker: default_doc_marker(),
        }
    }
}

impl ModelConfig {
    /// # Errors
    /// - `ColbertError::MaxLenExceeded` if a maxlen is above 512
    /// - `ColbertError::ConfigError` for zero sizes or empty markers
    pub fn validate(&self) -> ColbertResult<()> {
        for (field, value) in [
            ("query_maxlen", self.query_maxlen),
            ("doc_maxlen", self.doc_maxlen),
        ] {
            if value < MIN_SEQUENCE_LENGTH {
                return Err(ColbertError::ConfigError {
                    message: format!("{} must be >= {}, got {}", field, MIN_SEQUENCE_LENGTH, value),
                });
            }
            if value > MAX_SEQUENCE_LENGTH {
                return Err(ColbertError::MaxLenExceeded {
                    field,
                    value,
                    max: MAX_SEQUENCE_LENGTH,
                });
            }
        }

        if self.dim == 0 {
            return Err(ColbertError::ConfigError {
                message: "dim must be > 0".to_string(),
            });
        }

        if self.backbone == BackboneKind::Lookup && self.lookup_hidden == 0 {
            return Err(ColbertError::ConfigError {
                message: "lookup_hidden must be > 0".to_string(),
            });
        }

        if self.query_marker.is_empty() || self.doc_marker.is_empty() {
            return Err(ColbertError::ConfigError {
                message: "query_marker and doc_marker cannot be empty".to_string(),
            });
        }

        if self.query_marker == self.doc_marker {
            return Err(ColbertError::ConfigError {
                message: format!(
                    "query_marker and doc_marker must differ (both '{}')",
                    self.query_marker
                ),
            });
        }

        Ok(())
    }
}

// ============================================================================
// TRAINING CONFIG
// ============================================================================

/// Optimization and checkpointing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Global batch size in triples (before the distributed split).
    #[serde(default = "default_bsize")]
    pub bsize: usize,

    /// Gradient-accumulation micro-batches per optimizer step.
    #[serde(default = "default_accumsteps")]
    pub accumsteps: usize,

    #[serde(default = "default_lr")]
    pub lr: f64,

    #[serde(default = "default_maxsteps")]
    pub maxsteps: usize,

    /// Run similarity matmuls in reduced precision.
    #[serde(default)]
    pub amp: bool,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Checkpoint directory to start from.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,

    /// Continue from the checkpoint's batch index.
    #[serde(default)]
    pub resume: bool,

    /// Restore AdamW moments from the checkpoint.
    #[serde(default)]
    pub resume_optimizer: bool,

    /// Steps between rolling `colbert` checkpoints. 0 disables them.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Steps at which a separate `colbert-<step>` checkpoint is kept.
    #[serde(default = "default_saved_checkpoints")]
    pub saved_checkpoints: Vec<usize>,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_bsize() -> usize {
    32
}

fn default_accumsteps() -> usize {
    2
}

fn default_lr() -> f64 {
    3e-6
}

fn default_maxsteps() -> usize {
    400_000
}

fn default_seed() -> u64 {
    12345
}

fn default_checkpoint_every() -> usize {
    2000
}

fn default_saved_checkpoints() -> Vec<usize> {
    vec![
        32_000, 100_000, 150_000, 200_000, 250_000, 300_000, 400_000,
    ]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./experiments/default")
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            bsize: default_bsize(),
            accumsteps: default_accumsteps(),
            lr: default_lr(),
            maxsteps: default_maxsteps(),
            amp: false,
            seed: default_seed(),
            checkpoint: None,
            resume: false,
            resume_optimizer: false,
            checkpoint_every: default_checkpoint_every(),
            saved_checkpoints: default_saved_checkpoints(),
            output_dir: default_output_dir(),
        }
    }
}

impl TrainingConfig {
    /// # Errors
    /// - `ColbertError::BatchSizeNotDivisible` if accumsteps does not divide bsize
    /// - `ColbertError::ConfigError` for zero sizes, bad lr, or resume without checkpoint
    pub fn validate(&self) -> ColbertResult<()> {
        if self.bsize == 0 || self.accumsteps == 0 {
            return Err(ColbertError::ConfigError {
                message: format!(
                    "bsize and accumsteps must be > 0, got bsize={} accumsteps={}",
                    self.bsize, self.accumsteps
                ),
            });
        }

        if self.bsize % self.accumsteps != 0 {
            return Err(ColbertError::BatchSizeNotDivisible {
                context: "training.bsize / training.accumsteps",
                total: self.bsize,
                bsize: self.accumsteps,
            });
        }

        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ColbertError::ConfigError {
                message: format!("lr must be a positive finite number, got {}", self.lr),
            });
        }

        if (self.resume || self.resume_optimizer) && self.checkpoint.is_none() {
            return Err(ColbertError::ConfigError {
                message: "resume and resume_optimizer require training.checkpoint".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// DATA CONFIG
// ============================================================================

/// Input files. Which fields are required depends on the command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub triples: Option<PathBuf>,
    #[serde(default)]
    pub queries_lang_a: Option<PathBuf>,
    #[serde(default)]
    pub queries_lang_b: Option<PathBuf>,
    #[serde(default)]
    pub collection_lang_a: Option<PathBuf>,
    #[serde(default)]
    pub collection_lang_b: Option<PathBuf>,
    /// Pre-training `(query, positive query, negative query)` id triples.
    #[serde(default)]
    pub query_triples: Option<PathBuf>,
    /// Pre-training `(doc, positive doc, negative doc)` id triples.
    #[serde(default)]
    pub collection_triples: Option<PathBuf>,
}

impl DataConfig {
    /// Resolve a required path or fail with the field name.
    pub fn require<'a>(field: &str, value: &'a Option<PathBuf>) -> ColbertResult<&'a Path> {
        value.as_deref().ok_or_else(|| ColbertError::ConfigError {
            message: format!("[data] {} is required for this command", field),
        })
    }
}

// ============================================================================
// DISTRIBUTED CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default)]
    pub rank: usize,
    #[serde(default = "default_nranks")]
    pub nranks: usize,
}

fn default_nranks() -> usize {
    1
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            nranks: default_nranks(),
        }
    }
}

impl DistributedConfig {
    pub fn is_distributed(&self) -> bool {
        self.nranks > 1
    }

    pub fn validate(&self) -> ColbertResult<()> {
        if self.nranks == 0 {
            return Err(ColbertError::ConfigError {
                message: "nranks must be >= 1".to_string(),
            });
        }
        if self.rank >= self.nranks {
            return Err(ColbertError::ConfigError {
                message: format!("rank {} out of range for nranks {}", self.rank, self.nranks),
            });
        }
        Ok(())
    }
}

// ============================================================================
// RETRIEVAL CONFIG
// ============================================================================

/// Candidate index used for first-stage token retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact inner product over every stored token vector.
    Flat,
    /// Approximate cosine search over an HNSW graph.
    #[default]
    Hnsw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Neighbours fetched per query token from the candidate index.
    #[serde(default = "default_faiss_depth")]
    pub faiss_depth: usize,

    /// Final ranking truncation.
    #[serde(default = "default_depth")]
    pub depth: usize,

    #[serde(default)]
    pub log_scores: bool,

    /// Directory written by `index` and read by `retrieve`.
    #[serde(default)]
    pub index_path: Option<PathBuf>,

    /// Queries to rank, `qid \t text`.
    #[serde(default)]
    pub queries: Option<PathBuf>,

    /// Documents encoded per inference call while indexing.
    #[serde(default = "default_index_bsize")]
    pub index_bsize: usize,

    #[serde(default)]
    pub index_kind: IndexKind,

    /// HNSW graph degree.
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,

    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,

    /// Search beam width; raised to `faiss_depth` when smaller.
    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
}

fn default_faiss_depth() -> usize {
    1024
}

fn default_depth() -> usize {
    1000
}

fn default_index_bsize() -> usize {
    128
}

fn default_hnsw_m() -> usize {
    16
}

fn default_hnsw_ef_construction() -> usize {
    200
}

fn default_hnsw_ef_search() -> usize {
    64
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            faiss_depth: default_faiss_depth(),
            depth: default_depth(),
            log_scores: false,
            index_path: None,
            queries: None,
            index_bsize: default_index_bsize(),
            index_kind: IndexKind::default(),
            hnsw_m: default_hnsw_m(),
            hnsw_ef_construction: default_hnsw_ef_construction(),
            hnsw_ef_search: default_hnsw_ef_search(),
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> ColbertResult<()> {
        if self.faiss_depth == 0 || self.depth == 0 || self.index_bsize == 0 {
            return Err(ColbertError::ConfigError {
                message: format!(
                    "faiss_depth, depth and index_bsize must be > 0, got {}/{}/{}",
                    self.faiss_depth, self.depth, self.index_bsize
                ),
            });
        }
        if self.index_kind == IndexKind::Hnsw && (self.hnsw_m == 0 || self.hnsw_ef_construction == 0) {
            return Err(ColbertError::ConfigError {
                message: "hnsw_m and hnsw_ef_construction must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// ROOT CONFIG
// ============================================================================

/// Top-level configuration shared by every command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColbertConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl ColbertConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `ColbertError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> ColbertResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| ColbertError::ConfigError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        toml::from_str(&contents).map_err(|e| ColbertError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    pub fn from_toml_str(toml: &str) -> ColbertResult<Self> {
        toml::from_str(toml).map_err(|e| ColbertError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    pub fn to_toml_string(&self) -> ColbertResult<String> {
        toml::to_string_pretty(self).map_err(|e| ColbertError::Serialization {
            message: format!("Failed to serialize config: {}", e),
        })
    }

    /// Validate every section, returning the first error found.
    ///
    /// Distributed runs additionally need `bsize % nranks == 0` and
    /// `accumsteps == 1`.
    pub fn validate(&self) -> ColbertResult<()> {
        self.model.validate()?;
        self.training.validate()?;
        self.distributed.validate()?;
        self.retrieval.validate()?;

        if self.distributed.is_distributed() {
            if self.training.bsize % self.distributed.nranks != 0 {
                return Err(ColbertError::BatchSizeNotDivisible {
                    context: "training.bsize / distributed.nranks",
                    total: self.training.bsize,
                    bsize: self.distributed.nranks,
                });
            }
            if self.training.accumsteps != 1 {
                return Err(ColbertError::ConfigError {
                    message: format!(
                        "distributed training requires accumsteps = 1, got {}",
                        self.training.accumsteps
                    ),
                });
            }
        }

        Ok(())
    }

    /// Triples per optimizer step on this rank.
    pub fn per_rank_bsize(&self) -> usize {
        self.training.bsize / self.distributed.nranks.max(1)
    }

    /// Apply `COLBERT_*` environment overrides.
    ///
    /// Unparsable values are ignored and the file value stays in place.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("COLBERT_BASE_MODEL") {
            self.model.base_model = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("COLBERT_TOKENIZER") {
            self.model.tokenizer = PathBuf::from(val);
        }
        if let Ok(val) = env::var("COLBERT_AMP") {
            if let Ok(b) = val.parse::<bool>() {
                self.training.amp = b;
            }
        }
        if let Ok(val) = env::var("COLBERT_BSIZE") {
            if let Ok(n) = val.parse::<usize>() {
                self.training.bsize = n;
            }
        }
        if let Ok(val) = env::var("COLBERT_ACCUMSTEPS") {
            if let Ok(n) = val.parse::<usize>() {
                self.training.accumsteps = n;
            }
        }
        if let Ok(val) = env::var("COLBERT_OUTPUT_DIR") {
            self.training.output_dir = PathBuf::from(val);
        }

        // Launchers export RANK / WORLD_SIZE; the prefixed names win.
        if let Some(n) = env_usize(&["COLBERT_RANK", "RANK"]) {
            self.distributed.rank = n;
        }
        if let Some(n) = env_usize(&["COLBERT_NRANKS", "WORLD_SIZE"]) {
            self.distributed.nranks = n;
        }

        self
    }
}

/// First parsable value among `names`, in order.
fn env_usize(names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| env::var(name).ok().and_then(|v| v.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = ColbertConfig::default();
        config.validate().unwrap();
        assert_eq!(config.model.query_maxlen, 32);
        assert_eq!(config.model.doc_maxlen, 180);
        assert_eq!(config.per_rank_bsize(), 32);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ColbertConfig::from_toml_str(
            r#"
            [model]
            doc_maxlen = 300
            similarity = "l2"

            [training]
            bsize = 64
            accumsteps = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.model.doc_maxlen, 300);
        assert_eq!(config.model.similarity, Similarity::L2);
        assert_eq!(config.model.query_maxlen, 32);
        assert_eq!(config.training.bsize, 64);
        assert_eq!(config.retrieval.depth, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn test_maxlen_over_limit_rejected() {
        let mut config = ColbertConfig::default();
        config.model.doc_maxlen = 513;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ColbertError::MaxLenExceeded { field: "doc_maxlen", value: 513, max: 512 }
        ));
    }

    #[test]
    fn test_accumsteps_must_divide_bsize() {
        let mut config = ColbertConfig::default();
        config.training.bsize = 30;
        config.training.accumsteps = 4;
        assert!(matches!(
            config.validate(),
            Err(ColbertError::BatchSizeNotDivisible { total: 30, bsize: 4, .. })
        ));
    }

    #[test]
    fn test_distributed_requires_single_accumstep() {
        let mut config = ColbertConfig::default();
        config.distributed.nranks = 4;
        config.distributed.rank = 1;
        config.training.accumsteps = 2;
        assert!(matches!(config.validate(), Err(ColbertError::ConfigError { .. })));

        config.training.accumsteps = 1;
        config.validate().unwrap();
        assert_eq!(config.per_rank_bsize(), 8);
    }

    #[test]
    fn test_distributed_bsize_divisible_by_nranks() {
        let mut config = ColbertConfig::default();
        config.distributed.nranks = 3;
        config.training.accumsteps = 1;
        assert!(matches!(
            config.validate(),
            Err(ColbertError::BatchSizeNotDivisible { total: 32, bsize: 3, .. })
        ));
    }

    #[test]
    fn test_rank_out_of_range() {
        let mut config = ColbertConfig::default();
        config.distributed.rank = 2;
        config.distributed.nranks = 2;
        config.training.accumsteps = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resume_requires_checkpoint() {
        let mut config = ColbertConfig::default();
        config.training.resume = true;
        assert!(config.validate().is_err());
        config.training.checkpoint = Some(PathBuf::from("ckpt"));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_roundtrip() {
        let mut config = ColbertConfig::default();
        config.retrieval.faiss_depth = 64;
        config.data.triples = Some(PathBuf::from("triples.tsv"));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", config.to_toml_string().unwrap()).unwrap();

        let loaded = ColbertConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.retrieval.faiss_depth, 64);
        assert_eq!(loaded.data.triples, Some(PathBuf::from("triples.tsv")));
    }

    #[test]
    fn test_from_file_missing() {
        let err = ColbertConfig::from_file("/nonexistent/colbert.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_require_names_missing_field() {
        let data = DataConfig::default();
        let err = DataConfig::require("triples", &data.triples).unwrap_err();
        assert!(err.to_string().contains("triples"));
    }
}
