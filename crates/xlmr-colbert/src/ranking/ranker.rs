//! Retrieve-then-rerank.
//!
//! Every query token probes the candidate index for its `faiss_depth`
//! nearest document tokens. The documents owning those tokens, deduplicated
//! in discovery order, are then scored exactly with MaxSim against their
//! full stored embeddings and sorted by descending score. Equal scores keep
//! discovery order.

use std::collections::HashSet;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{ColbertError, ColbertResult};
use crate::modeling::ModelInference;

use super::index::CandidateIndex;
use super::store::DocumentStore;

pub struct Ranker {
    inference: ModelInference,
    index: Box<dyn CandidateIndex>,
    store: DocumentStore,
    faiss_depth: usize,
}

impl Ranker {
    pub fn new(
        inference: ModelInference,
        index: Box<dyn CandidateIndex>,
        store: DocumentStore,
        faiss_depth: usize,
    ) -> ColbertResult<Self> {
        if index.dim() != store.dim() {
            return Err(ColbertError::LengthMismatch {
                context: "Ranker index/store dim",
                lengths: vec![index.dim(), store.dim()],
            });
        }
        if index.len() != store.num_embeddings() {
            return Err(ColbertError::Index {
                message: format!(
                    "index holds {} vectors but the store has {} embeddings",
                    index.len(),
                    store.num_embeddings()
                ),
            });
        }
        Ok(Self {
            inference,
            index,
            store,
            faiss_depth,
        })
    }

    pub fn inference(&self) -> &ModelInference {
        &self.inference
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// `(N, query_maxlen, dim)` query embeddings.
    pub fn encode<S: AsRef<str>>(&self, queries: &[S]) -> ColbertResult<Tensor> {
        self.inference.query_from_text(queries, None)
    }

    /// Candidate document positions for one query, in discovery order.
    pub fn retrieve(&self, q: &Tensor) -> ColbertResult<Vec<usize>> {
        let q = single_query(q)?;
        let vectors = q
            .to_device(&Device::Cpu)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(ColbertError::tensor("query vectors to host"))?;

        let hits = self.index.search(&vectors, self.faiss_depth)?;
        let mut seen = HashSet::new();
        let mut docs = Vec::new();
        for emb in hits.into_iter().flatten() {
            let doc = self.store.doc_of_embedding(emb).ok_or_else(|| ColbertError::Index {
                message: format!("index returned unknown embedding id {}", emb),
            })?;
            if seen.insert(doc) {
                docs.push(doc);
            }
        }
        debug!(candidates = docs.len(), "Retrieved candidates");
        Ok(docs)
    }

    /// Rank the candidates of one query: `(pids, scores)`, best first.
    /// No candidates yields two empty vectors.
    pub fn rank(&self, q: &Tensor) -> ColbertResult<(Vec<u64>, Vec<f32>)> {
        let docs = self.retrieve(q)?;
        self.rank_documents(q, &docs)
    }

    /// Exact MaxSim over the given document positions.
    pub fn rank_documents(&self, q: &Tensor, docs: &[usize]) -> ColbertResult<(Vec<u64>, Vec<f32>)> {
        if docs.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let q = single_query(q)?;
        let (d, lengths) = self.store.candidates(docs, q.device())?;
        let scores = self.inference.score(&q, &d, None, Some(&lengths), false)?;

        let mut order: Vec<usize> = (0..docs.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let mut pids = Vec::with_capacity(order.len());
        let mut sorted = Vec::with_capacity(order.len());
        for i in order {
            let pid = self.store.pid(docs[i]).ok_or_else(|| ColbertError::Index {
                message: format!("document position {} has no pid", docs[i]),
            })?;
            pids.push(pid);
            sorted.push(scores[i]);
        }
        Ok((pids, sorted))
    }
}

/// `(Lq, dim)` view of a single query given as `(Lq, dim)` or `(1, Lq, dim)`.
fn single_query(q: &Tensor) -> ColbertResult<Tensor> {
    match q.dims() {
        [_, _] => Ok(q.clone()),
        [1, _, _] => q.squeeze(0).map_err(ColbertError::tensor("squeeze query")),
        dims => Err(ColbertError::InvalidArgument {
            message: format!("expected one query of shape (Lq, dim), got {:?}", dims),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modeling::colbert::test_support::lookup_model;
    use crate::ranking::index::FlatIndex;
    use crate::tokenization::{DocTokenizer, QueryTokenizer};
    use std::sync::Arc;

    fn inference() -> ModelInference {
        let (tokenizer, model) = lookup_model(8, false);
        let tokenizer = Arc::new(tokenizer);
        ModelInference::new(
            Arc::new(model),
            QueryTokenizer::new(tokenizer.clone(), 8).unwrap(),
            DocTokenizer::new(tokenizer, 16).unwrap(),
            false,
        )
    }

    fn ranker(docs: &[&str]) -> Ranker {
        let inference = inference();
        let embeddings = inference
            .doc_from_text(docs, Some(2), false)
            .unwrap()
            .into_ragged()
            .unwrap();
        let mut store = DocumentStore::new(8);
        for (pid, d) in embeddings.iter().enumerate() {
            store.add_document(pid as u64 + 100, d).unwrap();
        }
        let mut index = FlatIndex::new(8).unwrap();
        store.fill_index(&mut index).unwrap();
        Ranker::new(inference, Box::new(index), store, 4).unwrap()
    }

    #[test]
    fn test_empty_index_ranks_nothing() {
        let ranker = Ranker::new(
            inference(),
            Box::new(FlatIndex::new(8).unwrap()),
            DocumentStore::new(8),
            4,
        )
        .unwrap();
        let q = ranker.encode(&["xyz"]).unwrap();
        let (pids, scores) = ranker.rank(&q).unwrap();
        assert!(pids.is_empty());
        assert!(scores.is_empty());
    }

    #[test]
    fn test_rank_sorted_descending_and_deduplicated() {
        let ranker = ranker(&["the cat sat", "doc0 doc1", "mat mat mat"]);
        let q = ranker.encode(&["the cat"]).unwrap();
        let (pids, scores) = ranker.rank(&q).unwrap();

        assert!(!pids.is_empty());
        let unique: HashSet<_> = pids.iter().collect();
        assert_eq!(unique.len(), pids.len());
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert!(pids.iter().all(|p| (100..103).contains(p)));
    }

    #[test]
    fn test_rank_documents_matches_exact_score() {
        let ranker = ranker(&["the cat sat", "doc0 doc1"]);
        let q = ranker.encode(&["the cat"]).unwrap();
        let (pids, scores) = ranker.rank_documents(&q, &[0, 1]).unwrap();

        let (d, lengths) = ranker.store().candidates(&[0, 1], &Device::Cpu).unwrap();
        let q2 = q.squeeze(0).unwrap();
        let exact = ranker
            .inference()
            .score(&q2, &d, None, Some(&lengths), false)
            .unwrap();
        let expected_first = if exact[0] >= exact[1] { 100 } else { 101 };
        assert_eq!(pids[0], expected_first);
        assert!((scores[0] - exact[0].max(exact[1])).abs() < 1e-5);
    }

    #[test]
    fn test_mismatched_index_rejected() {
        let err = Ranker::new(
            inference(),
            Box::new(FlatIndex::new(4).unwrap()),
            DocumentStore::new(8),
            4,
        )
        .err();
        assert!(matches!(err, Some(ColbertError::LengthMismatch { .. })));
    }
}
