//! Tokenizer adapters and the tensorizers built on top of them.
//!
//! Queries and documents share one HuggingFace tokenizer. Each role gets a
//! marker token right after `<s>` so the shared encoder can tell them apart:
//!
//! ```text
//! query:    <s> [Q] tok tok tok </s> <mask> <mask> ...   (fixed query_maxlen)
//! document: <s> [D] tok tok tok </s> <pad> ...           (longest in batch)
//! ```
//!
//! Every tensorizer returns [`TokenizedBatch`] values whose `ids` and `mask`
//! are `u32` tensors of identical `(rows, width)` shape on the CPU.

mod doc;
mod query;
mod utils;

use std::path::Path;

use candle_core::{Device, Tensor};
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info};

use crate::error::{ColbertError, ColbertResult};

pub use doc::DocTokenizer;
pub use query::QueryTokenizer;
pub use utils::{
    argsort_stable, sort_by_length, split_into_batches, tensorize_queries_documents,
    tensorize_triples, PretrainingTexts,
};

/// Characters whose tokens are skipped in document embeddings when
/// punctuation masking is on.
const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

// ============================================================================
// TOKENIZED BATCH
// ============================================================================

/// Padded token ids plus attention mask for a group of texts.
#[derive(Debug, Clone)]
pub struct TokenizedBatch {
    /// `(rows, width)` u32 token ids.
    pub ids: Tensor,
    /// `(rows, width)` u32, 1 on real tokens and 0 on padding.
    pub mask: Tensor,
}

impl TokenizedBatch {
    /// Build a batch from row-major host buffers.
    pub fn from_rows(ids: Vec<u32>, mask: Vec<u32>, rows: usize, width: usize) -> ColbertResult<Self> {
        if ids.len() != rows * width || mask.len() != rows * width {
            return Err(ColbertError::LengthMismatch {
                context: "TokenizedBatch::from_rows",
                lengths: vec![ids.len(), mask.len(), rows * width],
            });
        }
        let ids = Tensor::from_vec(ids, (rows, width), &Device::Cpu)
            .map_err(ColbertError::tensor("ids tensor"))?;
        let mask = Tensor::from_vec(mask, (rows, width), &Device::Cpu)
            .map_err(ColbertError::tensor("mask tensor"))?;
        Ok(Self { ids, mask })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.ids.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Padded sequence length.
    pub fn width(&self) -> usize {
        self.ids.dims().get(1).copied().unwrap_or(0)
    }

    /// Number of real (unpadded) tokens in every row.
    pub fn lengths(&self) -> ColbertResult<Vec<u32>> {
        let mask = self
            .mask
            .to_vec2::<u32>()
            .map_err(ColbertError::tensor("mask to host"))?;
        Ok(mask.iter().map(|row| row.iter().sum()).collect())
    }

    /// Gather rows in the given order.
    pub fn select(&self, indices: &[usize]) -> ColbertResult<Self> {
        let index: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let index = Tensor::from_vec(index, indices.len(), self.ids.device())
            .map_err(ColbertError::tensor("row index"))?;
        Ok(Self {
            ids: self.ids.index_select(&index, 0).map_err(ColbertError::tensor("select ids"))?,
            mask: self.mask.index_select(&index, 0).map_err(ColbertError::tensor("select mask"))?,
        })
    }

    /// Rows `start..start + len`.
    pub fn narrow(&self, start: usize, len: usize) -> ColbertResult<Self> {
        Ok(Self {
            ids: self.ids.narrow(0, start, len).map_err(ColbertError::tensor("narrow ids"))?,
            mask: self.mask.narrow(0, start, len).map_err(ColbertError::tensor("narrow mask"))?,
        })
    }

    /// Stack batches of equal width along the row axis.
    pub fn cat(parts: &[&TokenizedBatch]) -> ColbertResult<Self> {
        let ids: Vec<&Tensor> = parts.iter().map(|p| &p.ids).collect();
        let mask: Vec<&Tensor> = parts.iter().map(|p| &p.mask).collect();
        Ok(Self {
            ids: Tensor::cat(&ids, 0).map_err(ColbertError::tensor("cat ids"))?,
            mask: Tensor::cat(&mask, 0).map_err(ColbertError::tensor("cat mask"))?,
        })
    }

    /// Drop trailing columns that are padding in every row.
    pub fn trim(&self) -> ColbertResult<Self> {
        let longest = self.lengths()?.into_iter().max().unwrap_or(0) as usize;
        if longest == 0 || longest == self.width() {
            return Ok(self.clone());
        }
        Ok(Self {
            ids: self.ids.narrow(1, 0, longest).map_err(ColbertError::tensor("trim ids"))?,
            mask: self.mask.narrow(1, 0, longest).map_err(ColbertError::tensor("trim mask"))?,
        })
    }

    /// Move both tensors to `device`.
    pub fn to_device(&self, device: &Device) -> ColbertResult<Self> {
        Ok(Self {
            ids: self.ids.to_device(device).map_err(ColbertError::tensor("ids to device"))?,
            mask: self.mask.to_device(device).map_err(ColbertError::tensor("mask to device"))?,
        })
    }
}

// ============================================================================
// SHARED TOKENIZER
// ============================================================================

/// Ids of the special tokens the adapters splice in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub cls: u32,
    pub sep: u32,
    pub pad: u32,
    pub mask: u32,
    pub query_marker: u32,
    pub doc_marker: u32,
}

/// Anything that turns texts into one padded batch.
pub trait Tensorize {
    fn tensorize<S: AsRef<str>>(&self, texts: &[S]) -> ColbertResult<TokenizedBatch>;
}

/// HuggingFace tokenizer extended with the ColBERT role markers.
#[derive(Debug, Clone)]
pub struct ColbertTokenizer {
    tokenizer: Tokenizer,
    special: SpecialTokens,
}

impl ColbertTokenizer {
    /// Load `tokenizer.json` and register the markers.
    pub fn from_file(
        path: impl AsRef<Path>,
        query_marker: &str,
        doc_marker: &str,
    ) -> ColbertResult<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| ColbertError::Tokenization {
            message: format!("Failed to load tokenizer '{}': {}", path.display(), e),
        })?;
        info!(path = %path.display(), "Loaded tokenizer");
        Self::from_tokenizer(tokenizer, query_marker, doc_marker)
    }

    /// Wrap an in-memory tokenizer and register the markers.
    pub fn from_tokenizer(
        mut tokenizer: Tokenizer,
        query_marker: &str,
        doc_marker: &str,
    ) -> ColbertResult<Self> {
        let before = tokenizer.get_vocab_size(true);
        tokenizer.add_special_tokens(&[
            AddedToken::from(query_marker.to_string(), true),
            AddedToken::from(doc_marker.to_string(), true),
        ]);
        let after = tokenizer.get_vocab_size(true);
        if after != before {
            debug!(before, after, "Registered marker tokens");
        }

        let special = SpecialTokens {
            cls: resolve(&tokenizer, &["<s>", "[CLS]"])?,
            sep: resolve(&tokenizer, &["</s>", "[SEP]"])?,
            pad: resolve(&tokenizer, &["<pad>", "[PAD]"])?,
            mask: resolve(&tokenizer, &["<mask>", "[MASK]"])?,
            query_marker: resolve(&tokenizer, &[query_marker])?,
            doc_marker: resolve(&tokenizer, &[doc_marker])?,
        };

        Ok(Self { tokenizer, special })
    }

    pub fn special(&self) -> &SpecialTokens {
        &self.special
    }

    /// Vocabulary size including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Encode texts without special tokens.
    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> ColbertResult<Vec<Vec<u32>>> {
        let inputs: Vec<&str> = texts.iter().map(|t| t.as_ref()).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, false)
            .map_err(|e| ColbertError::Tokenization {
                message: format!("Batch encoding of {} texts failed: {}", texts.len(), e),
            })?;
        Ok(encodings.iter().map(|e| e.get_ids().to_vec()).collect())
    }

    /// First token id of every punctuation symbol, deduplicated.
    pub fn punctuation_ids(&self) -> ColbertResult<Vec<u32>> {
        let symbols: Vec<String> = PUNCTUATION.chars().map(String::from).collect();
        let mut ids: Vec<u32> = self
            .encode_batch(&symbols)?
            .into_iter()
            .filter_map(|ids| ids.first().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Lay out `<s> marker toks </s>` rows, truncated to `maxlen` and padded
    /// to `width` (or to the longest row when `width` is `None`).
    pub(crate) fn build_rows<S: AsRef<str>>(
        &self,
        texts: &[S],
        marker: u32,
        maxlen: usize,
        width: Option<usize>,
        pad_id: u32,
    ) -> ColbertResult<TokenizedBatch> {
        if texts.is_empty() {
            return Err(ColbertError::InvalidArgument {
                message: "cannot tensorize an empty list of texts".to_string(),
            });
        }

        let room = maxlen.saturating_sub(3);
        let rows: Vec<Vec<u32>> = self
            .encode_batch(texts)?
            .into_iter()
            .map(|toks| {
                let keep = toks.len().min(room);
                let mut row = Vec::with_capacity(keep + 3);
                row.push(self.special.cls);
                row.push(marker);
                row.extend_from_slice(&toks[..keep]);
                row.push(self.special.sep);
                row
            })
            .collect();

        let width = width.unwrap_or_else(|| rows.iter().map(Vec::len).max().unwrap_or(0));
        let mut ids = Vec::with_capacity(rows.len() * width);
        let mut mask = Vec::with_capacity(rows.len() * width);
        for row in &rows {
            ids.extend_from_slice(row);
            ids.extend(std::iter::repeat(pad_id).take(width - row.len()));
            mask.extend(std::iter::repeat(1).take(row.len()));
            mask.extend(std::iter::repeat(0).take(width - row.len()));
        }

        TokenizedBatch::from_rows(ids, mask, rows.len(), width)
    }
}

fn resolve(tokenizer: &Tokenizer, candidates: &[&str]) -> ColbertResult<u32> {
    candidates
        .iter()
        .find_map(|tok| tokenizer.token_to_id(tok))
        .ok_or_else(|| ColbertError::Tokenization {
            message: format!("tokenizer has none of the special tokens {:?}", candidates),
        })
}
