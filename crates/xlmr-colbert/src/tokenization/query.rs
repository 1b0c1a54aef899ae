//! Query-side adapter: fixed-length rows with mask-token augmentation.

use std::sync::Arc;

use crate::config::{MAX_SEQUENCE_LENGTH, MIN_SEQUENCE_LENGTH};
use crate::error::{ColbertError, ColbertResult};

use super::{split_into_batches, ColbertTokenizer, Tensorize, TokenizedBatch};

/// Tokenizes queries to exactly `query_maxlen` positions.
///
/// Padding positions carry the `<mask>` id rather than `<pad>`, so the
/// encoder produces a contextual vector for each of them. The attention mask
/// still marks them as 0.
#[derive(Debug, Clone)]
pub struct QueryTokenizer {
    tokenizer: Arc<ColbertTokenizer>,
    maxlen: usize,
}

impl QueryTokenizer {
    pub fn new(tokenizer: Arc<ColbertTokenizer>, query_maxlen: usize) -> ColbertResult<Self> {
        check_maxlen("query_maxlen", query_maxlen)?;
        Ok(Self {
            tokenizer,
            maxlen: query_maxlen,
        })
    }

    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    pub fn tokenizer(&self) -> &ColbertTokenizer {
        &self.tokenizer
    }

    /// Split into consecutive sub-batches of `bsize`, input order kept.
    pub fn tensorize_batched<S: AsRef<str>>(
        &self,
        texts: &[S],
        bsize: usize,
    ) -> ColbertResult<Vec<TokenizedBatch>> {
        let batch = self.tensorize(texts)?;
        split_into_batches(&batch, bsize)
    }
}

impl Tensorize for QueryTokenizer {
    fn tensorize<S: AsRef<str>>(&self, texts: &[S]) -> ColbertResult<TokenizedBatch> {
        let special = *self.tokenizer.special();
        self.tokenizer.build_rows(
            texts,
            special.query_marker,
            self.maxlen,
            Some(self.maxlen),
            special.mask,
        )
    }
}

pub(super) fn check_maxlen(field: &'static str, value: usize) -> ColbertResult<()> {
    if value > MAX_SEQUENCE_LENGTH {
        return Err(ColbertError::MaxLenExceeded {
            field,
            value,
            max: MAX_SEQUENCE_LENGTH,
        });
    }
    if value < MIN_SEQUENCE_LENGTH {
        return Err(ColbertError::InvalidArgument {
            message: format!("{} must be >= {}, got {}", field, MIN_SEQUENCE_LENGTH, value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenization::test_support::word_level_tokenizer;

    fn query_tokenizer(maxlen: usize) -> QueryTokenizer {
        QueryTokenizer::new(Arc::new(word_level_tokenizer()), maxlen).unwrap()
    }

    #[test]
    fn test_fixed_width_with_mask_padding() {
        let qt = query_tokenizer(8);
        let batch = qt.tensorize(&["the cat"]).unwrap();
        assert_eq!(batch.ids.dims(), &[1, 8]);

        let ids = batch.ids.to_vec2::<u32>().unwrap();
        let mask = batch.mask.to_vec2::<u32>().unwrap();
        // <s> [Q] the cat </s> <mask> <mask> <mask>
        assert_eq!(ids[0], vec![0, 5, 13, 14, 2, 4, 4, 4]);
        assert_eq!(mask[0], vec![1, 1, 1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_every_row_same_width() {
        let qt = query_tokenizer(6);
        let batch = qt.tensorize(&["a", "a b c a b c a b"]).unwrap();
        assert_eq!(batch.width(), 6);
        assert_eq!(batch.lengths().unwrap(), vec![4, 6]);
    }

    #[test]
    fn test_batched_preserves_order() {
        let qt = query_tokenizer(6);
        let batches = qt.tensorize_batched(&["a", "b", "c"], 2).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        let last = batches[1].ids.to_vec2::<u32>().unwrap();
        assert_eq!(last[0][2], 9);
    }

    #[test]
    fn test_maxlen_over_512_rejected() {
        let err = QueryTokenizer::new(Arc::new(word_level_tokenizer()), 513).unwrap_err();
        assert!(matches!(err, ColbertError::MaxLenExceeded { .. }));
    }
}
