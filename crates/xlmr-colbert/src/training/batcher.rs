//! Bilingual triple batcher.
//!
//! A cursor over this rank's triples. Each step takes exactly `bsize`
//! triples, resolves every query/positive/negative id against language A or
//! language B with an independent coin flip, and tensorizes the result into
//! `accumsteps` micro-batches.
//!
//! Coin flips come from a ChaCha8 stream keyed by `(seed, offset)`, so the
//! same offset always draws the same languages. That is what makes
//! [`BilingualBatcher::skip_to_batch`] an exact resume.

use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::config::{ColbertConfig, DataConfig};
use crate::error::{ColbertError, ColbertResult};
use crate::tokenization::{tensorize_triples, DocTokenizer, QueryTokenizer, TokenizedBatch};

use super::data::{load_triples, Collection, Queries, Triple};

/// One gradient-accumulation slice of a training step.
#[derive(Debug, Clone)]
pub enum MicroBatch {
    /// `Q` (queries twice) against `D` (positives then negatives).
    Triples {
        queries: TokenizedBatch,
        documents: TokenizedBatch,
    },
    /// Pre-training: query side `(Q, Qpn)` and document side `(D, Dpn)`.
    QueryDocument {
        queries: TokenizedBatch,
        queries_pn: TokenizedBatch,
        documents: TokenizedBatch,
        documents_pn: TokenizedBatch,
    },
}

impl MicroBatch {
    /// Number of `(anchor, positive, negative)` rows in the slice.
    pub fn triples(&self) -> usize {
        match self {
            MicroBatch::Triples { queries, .. } => queries.len() / 2,
            MicroBatch::QueryDocument { queries, .. } => queries.len() / 2,
        }
    }
}

/// A resumable producer of training steps.
pub trait TrainingSource {
    /// Next step's micro-batches, or `None` when fewer than `bsize`
    /// triples remain.
    fn next_step(&mut self) -> ColbertResult<Option<Vec<MicroBatch>>>;

    /// Reposition to `batch_idx * intended_batch_size`.
    fn skip_to_batch(&mut self, batch_idx: usize, intended_batch_size: usize);

    /// Triples available to this rank.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Query and document pools for both languages.
#[derive(Debug, Clone, Default)]
pub struct BilingualPools {
    pub queries_lang_a: Queries,
    pub queries_lang_b: Queries,
    pub collection_lang_a: Collection,
    pub collection_lang_b: Collection,
}

impl BilingualPools {
    pub fn load(data: &DataConfig) -> ColbertResult<Self> {
        Ok(Self {
            queries_lang_a: Queries::load(DataConfig::require("queries_lang_a", &data.queries_lang_a)?)?,
            queries_lang_b: Queries::load(DataConfig::require("queries_lang_b", &data.queries_lang_b)?)?,
            collection_lang_a: Collection::load(DataConfig::require(
                "collection_lang_a",
                &data.collection_lang_a,
            )?)?,
            collection_lang_b: Collection::load(DataConfig::require(
                "collection_lang_b",
                &data.collection_lang_b,
            )?)?,
        })
    }
}

/// Resolved texts of one step, before tensorization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextTriples {
    pub queries: Vec<String>,
    pub positives: Vec<String>,
    pub negatives: Vec<String>,
}

/// Training-step producer over bilingual triples.
#[derive(Debug)]
pub struct BilingualBatcher {
    bsize: usize,
    accumsteps: usize,
    query_tokenizer: QueryTokenizer,
    doc_tokenizer: DocTokenizer,
    position: usize,
    triples: Vec<Triple>,
    pools: BilingualPools,
    seed: u64,
}

impl BilingualBatcher {
    /// Build from in-memory triples and pools.
    ///
    /// `bsize` is this rank's batch size; it must be divisible by
    /// `accumsteps`.
    pub fn new(
        query_tokenizer: QueryTokenizer,
        doc_tokenizer: DocTokenizer,
        triples: Vec<Triple>,
        pools: BilingualPools,
        bsize: usize,
        accumsteps: usize,
        seed: u64,
    ) -> ColbertResult<Self> {
        check_step_sizes(bsize, accumsteps)?;
        Ok(Self {
            bsize,
            accumsteps,
            query_tokenizer,
            doc_tokenizer,
            position: 0,
            triples,
            pools,
            seed,
        })
    }

    /// Load this rank's triples and both language pools from `config.data`.
    pub fn from_config(
        config: &ColbertConfig,
        query_tokenizer: QueryTokenizer,
        doc_tokenizer: DocTokenizer,
        seed: u64,
    ) -> ColbertResult<Self> {
        let triples_path: &Path = DataConfig::require("triples", &config.data.triples)?;
        let triples = load_triples(
            triples_path,
            config.distributed.rank,
            config.distributed.nranks,
        )?;
        let pools = BilingualPools::load(&config.data)?;
        Self::new(
            query_tokenizer,
            doc_tokenizer,
            triples,
            pools,
            config.per_rank_bsize(),
            config.training.accumsteps,
            seed,
        )
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn has_next(&self) -> bool {
        self.position + self.bsize <= self.triples.len()
    }

    /// Advance the cursor and resolve the next step's texts.
    pub fn next_texts(&mut self) -> ColbertResult<Option<TextTriples>> {
        if !self.has_next() {
            return Ok(None);
        }
        let offset = self.position;
        self.position += self.bsize;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(offset as u64);

        let pools = &self.pools;
        let mut texts = TextTriples::default();
        for triple in &self.triples[offset..offset + self.bsize] {
            let query = if rng.gen::<f64>() < 0.5 {
                pools.queries_lang_a.resolve(triple.query, "queries_lang_a")?
            } else {
                pools.queries_lang_b.resolve(triple.query, "queries_lang_b")?
            };
            let positive = pick_passage(pools, &mut rng, triple.positive)?;
            let negative = pick_passage(pools, &mut rng, triple.negative)?;

            texts.queries.push(query.to_string());
            texts.positives.push(positive.to_string());
            texts.negatives.push(negative.to_string());
        }

        debug!(offset, bsize = self.bsize, "Resolved bilingual batch");
        Ok(Some(texts))
    }

    /// Tensorize one step into `accumsteps` micro-batches.
    pub fn collate(&self, texts: &TextTriples) -> ColbertResult<Vec<MicroBatch>> {
        let n = texts.queries.len();
        if n != self.bsize || texts.positives.len() != n || texts.negatives.len() != n {
            return Err(ColbertError::LengthMismatch {
                context: "BilingualBatcher::collate",
                lengths: vec![n, texts.positives.len(), texts.negatives.len(), self.bsize],
            });
        }

        Ok(tensorize_triples(
            &self.query_tokenizer,
            &self.doc_tokenizer,
            &texts.queries,
            &texts.positives,
            &texts.negatives,
            Some(self.bsize / self.accumsteps),
        )?
        .into_iter()
        .map(|(queries, documents)| MicroBatch::Triples { queries, documents })
        .collect())
    }
}

fn pick_passage<'a>(
    pools: &'a BilingualPools,
    rng: &mut ChaCha8Rng,
    pid: u64,
) -> ColbertResult<&'a str> {
    if rng.gen::<f64>() < 0.5 {
        pools.collection_lang_a.resolve(pid, "collection_lang_a")
    } else {
        pools.collection_lang_b.resolve(pid, "collection_lang_b")
    }
}

pub(super) fn check_step_sizes(bsize: usize, accumsteps: usize) -> ColbertResult<()> {
    if bsize == 0 || accumsteps == 0 {
        return Err(ColbertError::InvalidArgument {
            message: format!("bsize ({}) and accumsteps ({}) must be > 0", bsize, accumsteps),
        });
    }
    if bsize % accumsteps != 0 {
        return Err(ColbertError::BatchSizeNotDivisible {
            context: "bsize / accumsteps",
            total: bsize,
            bsize: accumsteps,
        });
    }
    Ok(())
}

pub(super) fn log_skip(batch_idx: usize, intended_batch_size: usize) {
    warn!(
        batch_idx,
        intended_batch_size, "Skipping to batch for training resume"
    );
}

impl TrainingSource for BilingualBatcher {
    fn next_step(&mut self) -> ColbertResult<Option<Vec<MicroBatch>>> {
        match self.next_texts()? {
            Some(texts) => self.collate(&texts).map(Some),
            None => Ok(None),
        }
    }

    fn skip_to_batch(&mut self, batch_idx: usize, intended_batch_size: usize) {
        log_skip(batch_idx, intended_batch_size);
        self.position = intended_batch_size * batch_idx;
    }

    fn len(&self) -> usize {
        self.triples.len()
    }
}

impl Iterator for BilingualBatcher {
    type Item = ColbertResult<Vec<MicroBatch>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_step().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tokenization::test_support::word_level_tokenizer;

    fn pools() -> BilingualPools {
        BilingualPools {
            queries_lang_a: [(0, "a".to_string()), (1, "b".to_string())].into_iter().collect(),
            queries_lang_b: [(0, "c".to_string()), (1, "c".to_string())].into_iter().collect(),
            collection_lang_a: Collection::from_passages(vec!["doc0".into(), "doc1".into()]),
            collection_lang_b: Collection::from_passages(vec!["doc2".into(), "doc2".into()]),
        }
    }

    fn batcher(triples: Vec<Triple>, bsize: usize, accumsteps: usize, seed: u64) -> BilingualBatcher {
        let tok = Arc::new(word_level_tokenizer());
        BilingualBatcher::new(
            QueryTokenizer::new(tok.clone(), 8).unwrap(),
            DocTokenizer::new(tok, 16).unwrap(),
            triples,
            pools(),
            bsize,
            accumsteps,
            seed,
        )
        .unwrap()
    }

    fn triples(n: usize) -> Vec<Triple> {
        (0..n as u64).map(|i| Triple::new(i % 2, i % 2, (i + 1) % 2)).collect()
    }

    #[test]
    fn test_no_partial_final_batch() {
        let mut b = batcher(triples(5), 2, 1, 7);
        let mut steps = 0;
        while let Some(step) = b.next_step().unwrap() {
            assert_eq!(step.len(), 1);
            assert_eq!(step[0].triples(), 2);
            steps += 1;
        }
        assert_eq!(steps, 2);
        assert!(!b.has_next());
        assert!(b.next_step().unwrap().is_none());
    }

    #[test]
    fn test_accumsteps_split_micro_batches() {
        let mut b = batcher(triples(8), 4, 2, 7);
        let step = b.next_step().unwrap().unwrap();
        assert_eq!(step.len(), 2);
        for micro in &step {
            match micro {
                MicroBatch::Triples { queries, documents } => {
                    assert_eq!(queries.len(), 4);
                    assert_eq!(documents.len(), 4);
                }
                other => panic!("unexpected micro-batch {:?}", other),
            }
        }
    }

    #[test]
    fn test_texts_come_from_either_language() {
        let mut b = batcher(triples(64), 64, 1, 3);
        let texts = b.next_texts().unwrap().unwrap();
        assert!(texts.queries.iter().any(|q| q == "c"));
        assert!(texts.queries.iter().any(|q| q == "a" || q == "b"));
        assert!(texts.positives.iter().any(|p| p == "doc2"));
        assert!(texts.positives.iter().any(|p| p != "doc2"));
    }

    #[test]
    fn test_skip_to_batch_reproduces_draws() {
        let mut full = batcher(triples(12), 4, 1, 99);
        full.next_texts().unwrap();
        full.next_texts().unwrap();
        let third = full.next_texts().unwrap().unwrap();

        let mut resumed = batcher(triples(12), 4, 1, 99);
        resumed.skip_to_batch(2, 4);
        assert_eq!(resumed.position(), 8);
        assert_eq!(resumed.next_texts().unwrap().unwrap(), third);
    }

    #[test]
    fn test_missing_id_surfaces() {
        let mut b = batcher(vec![Triple::new(5, 0, 1)], 1, 1, 1);
        assert!(matches!(
            b.next_step(),
            Err(ColbertError::MissingId { id: 5, .. })
        ));
    }

    #[test]
    fn test_bsize_not_divisible_by_accumsteps() {
        let tok = Arc::new(word_level_tokenizer());
        let err = BilingualBatcher::new(
            QueryTokenizer::new(tok.clone(), 8).unwrap(),
            DocTokenizer::new(tok, 16).unwrap(),
            triples(4),
            pools(),
            3,
            2,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, ColbertError::BatchSizeNotDivisible { .. }));
    }
}
