//! Pre-training batcher over paired query and document triples.
//!
//! Line `i` of the query-triple file and line `i` of the collection-triple
//! file form one example. Anchors come from language A, positives and
//! negatives from language B, so both encoders learn to align the two
//! languages.

use tracing::{debug, info};

use crate::config::{ColbertConfig, DataConfig};
use crate::error::{ColbertError, ColbertResult};
use crate::tokenization::{tensorize_queries_documents, DocTokenizer, PretrainingTexts, QueryTokenizer};

use super::batcher::{check_step_sizes, log_skip, BilingualPools, MicroBatch, TrainingSource};
use super::data::{load_triples, Triple};

/// Resolved texts of one pre-training step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PretrainingStepTexts {
    pub queries: Vec<String>,
    pub queries_positive: Vec<String>,
    pub queries_negative: Vec<String>,
    pub documents: Vec<String>,
    pub documents_positive: Vec<String>,
    pub documents_negative: Vec<String>,
}

#[derive(Debug)]
pub struct PreTrainingBatcher {
    bsize: usize,
    accumsteps: usize,
    query_tokenizer: QueryTokenizer,
    doc_tokenizer: DocTokenizer,
    position: usize,
    query_triples: Vec<Triple>,
    collection_triples: Vec<Triple>,
    pools: BilingualPools,
}

impl PreTrainingBatcher {
    pub fn new(
        query_tokenizer: QueryTokenizer,
        doc_tokenizer: DocTokenizer,
        query_triples: Vec<Triple>,
        collection_triples: Vec<Triple>,
        pools: BilingualPools,
        bsize: usize,
        accumsteps: usize,
    ) -> ColbertResult<Self> {
        check_step_sizes(bsize, accumsteps)?;
        if query_triples.len() != collection_triples.len() {
            return Err(ColbertError::LengthMismatch {
                context: "query and document triples",
                lengths: vec![query_triples.len(), collection_triples.len()],
            });
        }
        Ok(Self {
            bsize,
            accumsteps,
            query_tokenizer,
            doc_tokenizer,
            position: 0,
            query_triples,
            collection_triples,
            pools,
        })
    }

    pub fn from_config(
        config: &ColbertConfig,
        query_tokenizer: QueryTokenizer,
        doc_tokenizer: DocTokenizer,
    ) -> ColbertResult<Self> {
        let (rank, nranks) = (config.distributed.rank, config.distributed.nranks);
        let query_triples = load_triples(
            DataConfig::require("query_triples", &config.data.query_triples)?,
            rank,
            nranks,
        )?;
        let collection_triples = load_triples(
            DataConfig::require("collection_triples", &config.data.collection_triples)?,
            rank,
            nranks,
        )?;
        info!(
            examples = query_triples.len(),
            "Loaded pre-training triples"
        );
        Self::new(
            query_tokenizer,
            doc_tokenizer,
            query_triples,
            collection_triples,
            BilingualPools::load(&config.data)?,
            config.per_rank_bsize(),
            config.training.accumsteps,
        )
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn has_next(&self) -> bool {
        self.position + self.bsize <= self.query_triples.len()
    }

    pub fn next_texts(&mut self) -> ColbertResult<Option<PretrainingStepTexts>> {
        if !self.has_next() {
            return Ok(None);
        }
        let offset = self.position;
        self.position += self.bsize;

        let pools = &self.pools;
        let mut texts = PretrainingStepTexts::default();
        let range = offset..offset + self.bsize;
        for (q, d) in self.query_triples[range.clone()]
            .iter()
            .zip(&self.collection_triples[range])
        {
            texts.queries.push(pools.queries_lang_a.resolve(q.query, "queries_lang_a")?.to_string());
            texts
                .queries_positive
                .push(pools.queries_lang_b.resolve(q.positive, "queries_lang_b")?.to_string());
            texts
                .queries_negative
                .push(pools.queries_lang_b.resolve(q.negative, "queries_lang_b")?.to_string());
            texts
                .documents
                .push(pools.collection_lang_a.resolve(d.query, "collection_lang_a")?.to_string());
            texts
                .documents_positive
                .push(pools.collection_lang_b.resolve(d.positive, "collection_lang_b")?.to_string());
            texts
                .documents_negative
                .push(pools.collection_lang_b.resolve(d.negative, "collection_lang_b")?.to_string());
        }

        debug!(offset, bsize = self.bsize, "Resolved pre-training batch");
        Ok(Some(texts))
    }

    pub fn collate(&self, texts: &PretrainingStepTexts) -> ColbertResult<Vec<MicroBatch>> {
        if texts.queries.len() != self.bsize {
            return Err(ColbertError::LengthMismatch {
                context: "PreTrainingBatcher::collate",
                lengths: vec![texts.queries.len(), self.bsize],
            });
        }

        let batches = tensorize_queries_documents(
            &self.query_tokenizer,
            &self.doc_tokenizer,
            PretrainingTexts {
                queries: &texts.queries,
                queries_positive: &texts.queries_positive,
                queries_negative: &texts.queries_negative,
                documents: &texts.documents,
                documents_positive: &texts.documents_positive,
                documents_negative: &texts.documents_negative,
            },
            Some(self.bsize / self.accumsteps),
        )?;

        Ok(batches
            .into_iter()
            .map(
                |((queries, queries_pn), (documents, documents_pn))| MicroBatch::QueryDocument {
                    queries,
                    queries_pn,
                    documents,
                    documents_pn,
                },
            )
            .collect())
    }
}

impl TrainingSource for PreTrainingBatcher {
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
        self.query_triples.len()
    }
}
