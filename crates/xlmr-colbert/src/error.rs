//! Error type for every ColBERT pipeline failure.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Precondition | InvalidArgument, LengthMismatch, BatchSizeNotDivisible, MaxLenExceeded, MutuallyExclusive | Fix caller configuration |
//! | Data contract | DataContract, MissingId | Fix input files |
//! | Unsupported | Unsupported | Do not request the feature |
//! | Backend | Tensor, Tokenization, Index | Inspect backend message |
//! | Persistence | Checkpoint, Io, Serialization | Fix paths / artifacts |
//! | Configuration | ConfigError | Fix configuration |
//!
//! An empty retrieval result is never an error: rankers return empty
//! collections for it.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for tokenization, batching, scoring, ranking and training.
#[derive(Debug, Error)]
pub enum ColbertError {
    // === Precondition violations ===
    /// Generic caller misconfiguration.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Parallel inputs that must have equal length do not.
    #[error("Length mismatch in {context}: {lengths:?}")]
    LengthMismatch {
        context: &'static str,
        lengths: Vec<usize>,
    },

    /// A batch size does not evenly divide the quantity it must split.
    #[error("Batch size {bsize} does not divide {total} ({context})")]
    BatchSizeNotDivisible {
        context: &'static str,
        total: usize,
        bsize: usize,
    },

    /// A configured maximum sequence length is above the encoder limit.
    #[error("{field} = {value} exceeds the maximum of {max}")]
    MaxLenExceeded {
        field: &'static str,
        value: usize,
        max: usize,
    },

    /// Two options that cannot be combined were both supplied.
    #[error("Options `{first}` and `{second}` are mutually exclusive")]
    MutuallyExclusive {
        first: &'static str,
        second: &'static str,
    },

    // === Data contract violations ===
    /// A data file does not respect its on-disk contract.
    #[error("Data contract violated in {path} at line {line}: {message}")]
    DataContract {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// An id referenced by a triple is absent from its pool.
    #[error("Id {id} not found in {pool}")]
    MissingId { pool: String, id: u64 },

    // === Unsupported features ===
    /// The caller asked for a feature this pipeline does not provide.
    #[error("Not supported: {feature}")]
    Unsupported { feature: &'static str },

    // === Backend errors ===
    /// Tensor backend failure with the operation that triggered it.
    #[error("Tensor operation failed ({context}): {source}")]
    Tensor {
        context: String,
        #[source]
        source: candle_core::Error,
    },

    /// Tokenizer failure.
    #[error("Tokenization error: {message}")]
    Tokenization { message: String },

    /// Candidate index failure.
    #[error("Index error: {message}")]
    Index { message: String },

    // === Persistence ===
    /// Checkpoint read/write failure.
    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON / TOML (de)serialization failure.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    // === Configuration ===
    /// Configuration file invalid or inconsistent.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },
}

impl From<candle_core::Error> for ColbertError {
    fn from(source: candle_core::Error) -> Self {
        Self::Tensor {
            context: "candle".to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for ColbertError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl ColbertError {
    /// Wrap a candle error with the name of the failing operation.
    pub fn tensor(context: impl Into<String>) -> impl FnOnce(candle_core::Error) -> Self {
        let context = context.into();
        move |source| Self::Tensor { context, source }
    }
}

/// Result type alias for ColBERT operations.
pub type ColbertResult<T> = Result<T, ColbertError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_length_mismatch_lists_lengths() {
        let err = ColbertError::LengthMismatch {
            context: "tensorize_triples",
            lengths: vec![3, 3, 2],
        };
        let msg = err.to_string();
        assert!(msg.contains("tensorize_triples"));
        assert!(msg.contains("[3, 3, 2]"));
    }

    #[test]
    fn test_tensor_error_preserves_source() {
        let err = ColbertError::tensor("score matmul")(candle_core::Error::Msg("boom".into()));
        assert!(err.to_string().contains("score matmul"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_data_contract_mentions_location() {
        let err = ColbertError::DataContract {
            path: PathBuf::from("collection.tsv"),
            line: 7,
            message: "expected id 7, found 9".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("collection.tsv"));
        assert!(msg.contains("line 7"));
    }

    #[test]
    fn test_unsupported_feature_message() {
        let err = ColbertError::Unsupported { feature: "explain" };
        assert_eq!(err.to_string(), "Not supported: explain");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ColbertError = io.into();
        assert!(matches!(err, ColbertError::Io(_)));
    }
}
