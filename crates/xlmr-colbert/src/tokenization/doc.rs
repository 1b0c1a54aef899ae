//! Document-side adapter: rows padded to the longest document in the batch.

use std::sync::Arc;

use crate::error::ColbertResult;

use super::query::check_maxlen;
use super::{sort_by_length, split_into_batches, ColbertTokenizer, Tensorize, TokenizedBatch};

/// Tokenizes documents, truncating to `doc_maxlen`.
#[derive(Debug, Clone)]
pub struct DocTokenizer {
    tokenizer: Arc<ColbertTokenizer>,
    maxlen: usize,
}

impl DocTokenizer {
    pub fn new(tokenizer: Arc<ColbertTokenizer>, doc_maxlen: usize) -> ColbertResult<Self> {
        check_maxlen("doc_maxlen", doc_maxlen)?;
        Ok(Self {
            tokenizer,
            maxlen: doc_maxlen,
        })
    }

    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    pub fn tokenizer(&self) -> &ColbertTokenizer {
        &self.tokenizer
    }

    /// Length-sorted sub-batches plus the permutation back to input order.
    ///
    /// `reverse_indices[i]` is the position, in the concatenated sub-batch
    /// output, of input text `i`. Each sub-batch is trimmed to its own
    /// longest row.
    pub fn tensorize_batched<S: AsRef<str>>(
        &self,
        texts: &[S],
        bsize: usize,
    ) -> ColbertResult<(Vec<TokenizedBatch>, Vec<usize>)> {
        let batch = self.tensorize(texts)?;
        let (sorted, reverse_indices) = sort_by_length(&batch, bsize)?;
        let batches = split_into_batches(&sorted, bsize)?
            .iter()
            .map(TokenizedBatch::trim)
            .collect::<ColbertResult<Vec<_>>>()?;
        Ok((batches, reverse_indices))
    }
}

impl Tensorize for DocTokenizer {
    fn tensorize<S: AsRef<str>>(&self, texts: &[S]) -> ColbertResult<TokenizedBatch> {
        let special = *self.tokenizer.special();
        self.tokenizer
            .build_rows(texts, special.doc_marker, self.maxlen, None, special.pad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenization::test_support::word_level_tokenizer;

    fn doc_tokenizer(maxlen: usize) -> DocTokenizer {
        DocTokenizer::new(Arc::new(word_level_tokenizer()), maxlen).unwrap()
    }

    #[test]
    fn test_pads_with_pad_id_to_longest() {
        let dt = doc_tokenizer(16);
        let batch = dt.tensorize(&["doc0", "the cat sat on the mat"]).unwrap();
        assert_eq!(batch.width(), 9);
        let ids = batch.ids.to_vec2::<u32>().unwrap();
        assert_eq!(ids[0][..5], [0, 6, 10, 2, 1]);
        assert_eq!(ids[0][8], 1);
    }

    #[test]
    fn test_truncates_to_doc_maxlen() {
        let dt = doc_tokenizer(5);
        let batch = dt.tensorize(&["the cat sat on the mat"]).unwrap();
        assert_eq!(batch.width(), 5);
        let ids = batch.ids.to_vec2::<u32>().unwrap();
        assert_eq!(ids[0], vec![0, 6, 13, 14, 2]);
    }

    #[test]
    fn test_batched_reverse_indices_restore_order() {
        let dt = doc_tokenizer(32);
        let texts = ["the cat sat on the mat", "a", "b c", "doc0 doc1 doc2"];
        let (batches, reverse) = dt.tensorize_batched(&texts, 2).unwrap();
        assert_eq!(batches.len(), 2);

        // Flatten lengths in processing order, then map back.
        let processed: Vec<u32> = batches
            .iter()
            .flat_map(|b| b.lengths().unwrap())
            .collect();
        let restored: Vec<u32> = reverse.iter().map(|&i| processed[i]).collect();
        assert_eq!(restored, vec![9, 4, 5, 6]);
    }

    #[test]
    fn test_batched_small_input_is_identity() {
        let dt = doc_tokenizer(32);
        let (batches, reverse) = dt.tensorize_batched(&["the cat sat", "a"], 4).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(reverse, vec![0, 1]);
        assert_eq!(batches[0].lengths().unwrap(), vec![6, 4]);
    }
}
