//! Triple and pre-training tensorizers, plus the sorting/splitting helpers
//! shared with the batched inference path.

use crate::error::{ColbertError, ColbertResult};

use super::{Tensorize, TokenizedBatch};

/// Indices that sort `keys` ascending. Equal keys keep input order.
pub fn argsort_stable<K: Ord>(keys: &[K]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| keys[a].cmp(&keys[b]));
    order
}

/// Sort rows by token count when the batch spans more than one sub-batch.
///
/// Returns the sorted batch and `reverse_indices`, the inverse permutation:
/// `sorted[reverse_indices[i]]` is input row `i`.
pub fn sort_by_length(
    batch: &TokenizedBatch,
    bsize: usize,
) -> ColbertResult<(TokenizedBatch, Vec<usize>)> {
    let n = batch.len();
    if n <= bsize {
        return Ok((batch.clone(), (0..n).collect()));
    }

    let indices = argsort_stable(&batch.lengths()?);
    let reverse_indices = argsort_stable(&indices);
    Ok((batch.select(&indices)?, reverse_indices))
}

/// Consecutive chunks of `bsize` rows; the last one may be shorter.
pub fn split_into_batches(batch: &TokenizedBatch, bsize: usize) -> ColbertResult<Vec<TokenizedBatch>> {
    if bsize == 0 {
        return Err(ColbertError::InvalidArgument {
            message: "bsize must be > 0".to_string(),
        });
    }
    let n = batch.len();
    (0..n)
        .step_by(bsize)
        .map(|offset| batch.narrow(offset, bsize.min(n - offset)))
        .collect()
}

/// Tensorize `(query, positive, negative)` texts into `(Q, D)` sub-batches.
///
/// Positives and negatives are tokenized together so they share one padded
/// width. Triples are sorted (stable) by `max(len(pos), len(neg))` before
/// splitting into `bsize` chunks. In each pair, `Q` is the chunk's queries
/// twice and `D` is positives followed by negatives, so row `i` of `Q`
/// lines up with row `i` of `D`.
///
/// With `bsize = None` the whole input forms one sub-batch.
pub fn tensorize_triples<QT, DT, S>(
    query_tokenizer: &QT,
    doc_tokenizer: &DT,
    queries: &[S],
    positives: &[S],
    negatives: &[S],
    bsize: Option<usize>,
) -> ColbertResult<Vec<(TokenizedBatch, TokenizedBatch)>>
where
    QT: Tensorize,
    DT: Tensorize,
    S: AsRef<str>,
{
    let n = queries.len();
    if positives.len() != n || negatives.len() != n {
        return Err(ColbertError::LengthMismatch {
            context: "tensorize_triples",
            lengths: vec![n, positives.len(), negatives.len()],
        });
    }
    let bsize = check_bsize("tensorize_triples", n, bsize)?;
    if n == 0 {
        return Ok(Vec::new());
    }

    let q = query_tokenizer.tensorize(queries)?;
    let (pos, neg) = tensorize_pairs(doc_tokenizer, positives, negatives)?;
    let order = maxlen_order(&pos, &neg)?;

    pair_up(
        &q.select(&order)?,
        &pos.select(&order)?,
        &neg.select(&order)?,
        bsize,
    )
}

/// Texts for the pre-training objective. All six slices have equal length.
#[derive(Debug, Clone, Copy)]
pub struct PretrainingTexts<'a, S> {
    pub queries: &'a [S],
    pub queries_positive: &'a [S],
    pub queries_negative: &'a [S],
    pub documents: &'a [S],
    pub documents_positive: &'a [S],
    pub documents_negative: &'a [S],
}

impl<S> PretrainingTexts<'_, S> {
    fn lengths(&self) -> Vec<usize> {
        vec![
            self.queries.len(),
            self.queries_positive.len(),
            self.queries_negative.len(),
            self.documents.len(),
            self.documents_positive.len(),
            self.documents_negative.len(),
        ]
    }
}

/// Query-side and document-side variant of [`tensorize_triples`].
///
/// The query side (anchor, positive query, negative query) is tokenized with
/// the query tokenizer and sorted by its own pos/neg lengths; the document
/// side likewise with the document tokenizer. The two sides are zipped into
/// `((Q, Qpn), (D, Dpn))` sub-batches.
#[allow(clippy::type_complexity)]
pub fn tensorize_queries_documents<QT, DT, S>(
    query_tokenizer: &QT,
    doc_tokenizer: &DT,
    texts: PretrainingTexts<'_, S>,
    bsize: Option<usize>,
) -> ColbertResult<Vec<((TokenizedBatch, TokenizedBatch), (TokenizedBatch, TokenizedBatch))>>
where
    QT: Tensorize,
    DT: Tensorize,
    S: AsRef<str>,
{
    let lengths = texts.lengths();
    let n = lengths[0];
    if lengths.iter().any(|&l| l != n) {
        return Err(ColbertError::LengthMismatch {
            context: "tensorize_queries_documents",
            lengths,
        });
    }
    let bsize = check_bsize("tensorize_queries_documents", n, bsize)?;
    if n == 0 {
        return Ok(Vec::new());
    }

    let query_side = one_side(
        query_tokenizer,
        texts.queries,
        texts.queries_positive,
        texts.queries_negative,
        bsize,
    )?;
    let doc_side = one_side(
        doc_tokenizer,
        texts.documents,
        texts.documents_positive,
        texts.documents_negative,
        bsize,
    )?;

    Ok(query_side.into_iter().zip(doc_side).collect())
}

fn one_side<T: Tensorize, S: AsRef<str>>(
    tokenizer: &T,
    anchors: &[S],
    positives: &[S],
    negatives: &[S],
    bsize: usize,
) -> ColbertResult<Vec<(TokenizedBatch, TokenizedBatch)>> {
    let anchors = tokenizer.tensorize(anchors)?;
    let (pos, neg) = tensorize_pairs(tokenizer, positives, negatives)?;
    let order = maxlen_order(&pos, &neg)?;
    pair_up(
        &anchors.select(&order)?,
        &pos.select(&order)?,
        &neg.select(&order)?,
        bsize,
    )
}

fn check_bsize(context: &'static str, n: usize, bsize: Option<usize>) -> ColbertResult<usize> {
    match bsize {
        None => Ok(n.max(1)),
        Some(0) => Err(ColbertError::InvalidArgument {
            message: format!("{}: bsize must be > 0", context),
        }),
        Some(b) if n % b != 0 => Err(ColbertError::BatchSizeNotDivisible {
            context,
            total: n,
            bsize: b,
        }),
        Some(b) => Ok(b),
    }
}

/// Tokenize `positives ++ negatives` as one batch and split the halves.
fn tensorize_pairs<T: Tensorize, S: AsRef<str>>(
    tokenizer: &T,
    positives: &[S],
    negatives: &[S],
) -> ColbertResult<(TokenizedBatch, TokenizedBatch)> {
    let n = positives.len();
    let joined: Vec<&str> = positives
        .iter()
        .chain(negatives.iter())
        .map(|s| s.as_ref())
        .collect();
    let both = tokenizer.tensorize(&joined)?;
    Ok((both.narrow(0, n)?, both.narrow(n, n)?))
}

fn maxlen_order(pos: &TokenizedBatch, neg: &TokenizedBatch) -> ColbertResult<Vec<usize>> {
    let maxlens: Vec<u32> = pos
        .lengths()?
        .into_iter()
        .zip(neg.lengths()?)
        .map(|(p, n)| p.max(n))
        .collect();
    Ok(argsort_stable(&maxlens))
}

fn pair_up(
    anchors: &TokenizedBatch,
    pos: &TokenizedBatch,
    neg: &TokenizedBatch,
    bsize: usize,
) -> ColbertResult<Vec<(TokenizedBatch, TokenizedBatch)>> {
    let anchors = split_into_batches(anchors, bsize)?;
    let pos = split_into_batches(pos, bsize)?;
    let neg = split_into_batches(neg, bsize)?;

    anchors
        .iter()
        .zip(pos.iter().zip(neg.iter()))
        .map(|(a, (p, n))| Ok((TokenizedBatch::cat(&[a, a])?, TokenizedBatch::cat(&[p, n])?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tokenization::test_support::word_level_tokenizer;
    use crate::tokenization::{DocTokenizer, QueryTokenizer};

    fn tokenizers() -> (QueryTokenizer, DocTokenizer) {
        let tok = Arc::new(word_level_tokenizer());
        (
            QueryTokenizer::new(tok.clone(), 8).unwrap(),
            DocTokenizer::new(tok, 16).unwrap(),
        )
    }

    #[test]
    fn test_argsort_stable_keeps_ties() {
        assert_eq!(argsort_stable(&[3, 1, 3, 1, 2]), vec![1, 3, 4, 0, 2]);
        assert_eq!(argsort_stable(&argsort_stable(&[2, 0, 1])), vec![2, 0, 1]);
    }

    #[test]
    fn test_sub_batch_counts_and_shapes() {
        let (qt, dt) = tokenizers();
        let queries = ["a", "b", "c", "a b", "b c", "c a"];
        let positives = ["doc0", "doc1", "doc2", "the cat", "cat sat", "on mat"];
        let negatives = ["doc1", "doc2 doc0", "doc0", "mat", "the", "sat on the mat"];

        let batches = tensorize_triples(&qt, &dt, &queries, &positives, &negatives, Some(2)).unwrap();
        assert_eq!(batches.len(), 3);
        for (q, d) in &batches {
            assert_eq!(q.len(), 4);
            assert_eq!(d.len(), 4);
            assert_eq!(q.width(), 8);
        }
    }

    #[test]
    fn test_sorted_by_maxlen_across_sub_batches() {
        let (qt, dt) = tokenizers();
        let queries = ["a", "b", "c", "a"];
        let positives = ["the cat sat on the mat", "doc0", "doc0 doc1", "doc0"];
        let negatives = ["doc0", "doc1", "doc1", "doc0 doc1 doc2"];

        let batches = tensorize_triples(&qt, &dt, &queries, &positives, &negatives, Some(1)).unwrap();
        // maxlens: 9, 4, 5, 6 -> order 1, 2, 3, 0
        let firsts: Vec<u32> = batches
            .iter()
            .map(|(q, _)| q.ids.to_vec2::<u32>().unwrap()[0][2])
            .collect();
        assert_eq!(firsts, vec![8, 9, 7, 7]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let (qt, dt) = tokenizers();
        let err = tensorize_triples(&qt, &dt, &["a", "b"], &["doc0"], &["doc1", "doc0"], None)
            .unwrap_err();
        assert!(matches!(err, ColbertError::LengthMismatch { .. }));
    }

    #[test]
    fn test_non_divisible_bsize_rejected() {
        let (qt, dt) = tokenizers();
        let texts = ["a", "b", "c"];
        let err = tensorize_triples(&qt, &dt, &texts, &texts, &texts, Some(2)).unwrap_err();
        assert!(matches!(
            err,
            ColbertError::BatchSizeNotDivisible { total: 3, bsize: 2, .. }
        ));
    }

    #[test]
    fn test_queries_documents_zips_both_sides() {
        let (qt, dt) = tokenizers();
        let texts = PretrainingTexts {
            queries: &["a", "b"][..],
            queries_positive: &["a b", "b"][..],
            queries_negative: &["c", "c a b"][..],
            documents: &["doc0", "doc1"][..],
            documents_positive: &["the cat", "doc1"][..],
            documents_negative: &["doc2", "doc0"][..],
        };
        let batches = tensorize_queries_documents(&qt, &dt, texts, Some(1)).unwrap();
        assert_eq!(batches.len(), 2);
        for ((q, qpn), (d, dpn)) in &batches {
            assert_eq!(q.len(), 2);
            assert_eq!(qpn.len(), 2);
            assert_eq!(qpn.width(), 8);
            assert_eq!(d.len(), 2);
            assert_eq!(dpn.len(), 2);
        }
    }

    #[test]
    fn test_queries_documents_length_mismatch() {
        let (qt, dt) = tokenizers();
        let texts = PretrainingTexts {
            queries: &["a", "b"][..],
            queries_positive: &["a"][..],
            queries_negative: &["c", "a"][..],
            documents: &["doc0", "doc1"][..],
            documents_positive: &["doc1", "doc1"][..],
            documents_negative: &["doc2", "doc0"][..],
        };
        assert!(tensorize_queries_documents(&qt, &dt, texts, None).is_err());
    }
}
