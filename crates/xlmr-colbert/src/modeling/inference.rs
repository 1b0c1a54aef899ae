//! Batched text-to-embedding driver and the retrieval-time scorer.
//!
//! Documents are tokenized once, length-sorted into sub-batches for padding
//! efficiency, encoded, then put back in input order before returning. The
//! caller never sees the internal order.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::config::ColbertConfig;
use crate::error::{ColbertError, ColbertResult};
use crate::tokenization::{ColbertTokenizer, DocTokenizer, QueryTokenizer, Tensorize, TokenizedBatch};
use crate::training::amp::MixedPrecisionManager;
use crate::training::checkpoint::Checkpoint;

use super::colbert::{ColBert, DocEmbeddings};
use super::scoring;

/// Token ids matching a [`DocEmbeddings`] value, in the same layout.
#[derive(Debug, Clone)]
pub enum DocTokenIds {
    /// `(B, L)` u32 ids, padded with `<pad>` to the longest document.
    Padded(Tensor),
    /// Ids of exactly the positions kept in the ragged embeddings.
    Ragged(Vec<Vec<u32>>),
}

/// Cloning shares the model.
#[derive(Clone)]
pub struct ModelInference {
    colbert: Arc<ColBert>,
    query_tokenizer: QueryTokenizer,
    doc_tokenizer: DocTokenizer,
    amp: MixedPrecisionManager,
}

impl ModelInference {
    pub fn new(
        colbert: Arc<ColBert>,
        query_tokenizer: QueryTokenizer,
        doc_tokenizer: DocTokenizer,
        amp: bool,
    ) -> Self {
        Self {
            colbert,
            query_tokenizer,
            doc_tokenizer,
            amp: MixedPrecisionManager::new(amp),
        }
    }

    /// Build tokenizers and model from `config`, loading the weights of
    /// `training.checkpoint` when one is set.
    pub fn from_config(config: &ColbertConfig, device: &Device) -> ColbertResult<Self> {
        let tokenizer = Arc::new(ColbertTokenizer::from_file(
            &config.model.tokenizer,
            &config.model.query_marker,
            &config.model.doc_marker,
        )?);
        let colbert = ColBert::from_config(&config.model, &tokenizer, device)?;
        if let Some(dir) = &config.training.checkpoint {
            Checkpoint::open(dir)?.load_model(&colbert)?;
            info!(checkpoint = %dir.display(), "Inference weights loaded");
        }
        Ok(Self::new(
            Arc::new(colbert),
            QueryTokenizer::new(tokenizer.clone(), config.model.query_maxlen)?,
            DocTokenizer::new(tokenizer, config.model.doc_maxlen)?,
            config.training.amp,
        ))
    }

    pub fn colbert(&self) -> &ColBert {
        &self.colbert
    }

    pub fn query_tokenizer(&self) -> &QueryTokenizer {
        &self.query_tokenizer
    }

    pub fn doc_tokenizer(&self) -> &DocTokenizer {
        &self.doc_tokenizer
    }

    /// Query embeddings of an already tokenized batch, detached.
    pub fn query(&self, ids: &Tensor, mask: &Tensor) -> ColbertResult<Tensor> {
        self.amp
            .context(|_| self.colbert.query(ids, mask))
            .map(|q| q.detach())
    }

    /// Document embeddings of an already tokenized batch, detached.
    pub fn doc(&self, ids: &Tensor, mask: &Tensor, keep_dims: bool) -> ColbertResult<DocEmbeddings> {
        let d = self.amp.context(|_| self.colbert.doc(ids, mask, keep_dims))?;
        Ok(match d {
            DocEmbeddings::Padded(t) => DocEmbeddings::Padded(t.detach()),
            DocEmbeddings::Ragged(v) => DocEmbeddings::Ragged(v.iter().map(Tensor::detach).collect()),
        })
    }

    /// `(N, query_maxlen, dim)` embeddings in input order.
    pub fn query_from_text<S: AsRef<str>>(&self, queries: &[S], bsize: Option<usize>) -> ColbertResult<Tensor> {
        self.query_from_text_with_ids(queries, bsize).map(|(q, _)| q)
    }

    /// Like [`ModelInference::query_from_text`], also returning the token
    /// ids and attention mask that were encoded.
    pub fn query_from_text_with_ids<S: AsRef<str>>(
        &self,
        queries: &[S],
        bsize: Option<usize>,
    ) -> ColbertResult<(Tensor, TokenizedBatch)> {
        let batches = match bsize {
            Some(bsize) => self.query_tokenizer.tensorize_batched(queries, bsize)?,
            None => vec![self.query_tokenizer.tensorize(queries)?],
        };
        let embeddings = batches
            .iter()
            .map(|b| self.query(&b.ids, &b.mask))
            .collect::<ColbertResult<Vec<_>>>()?;
        let q = Tensor::cat(&embeddings, 0).map_err(ColbertError::tensor("cat query batches"))?;
        let parts: Vec<&TokenizedBatch> = batches.iter().collect();
        Ok((q, TokenizedBatch::cat(&parts)?))
    }

    /// Document embeddings in input order.
    ///
    /// With `bsize` the documents are encoded in length-sorted sub-batches.
    /// `keep_dims = true` returns one `(N, Lmax, dim)` tensor zero-padded to
    /// the longest document; `false` returns one `(len_i, dim)` tensor per
    /// document.
    pub fn doc_from_text<S: AsRef<str>>(
        &self,
        docs: &[S],
        bsize: Option<usize>,
        keep_dims: bool,
    ) -> ColbertResult<DocEmbeddings> {
        self.doc_from_text_with_ids(docs, bsize, keep_dims).map(|(d, _)| d)
    }

    /// Like [`ModelInference::doc_from_text`], also returning token ids laid
    /// out like the embeddings and in the same order.
    pub fn doc_from_text_with_ids<S: AsRef<str>>(
        &self,
        docs: &[S],
        bsize: Option<usize>,
        keep_dims: bool,
    ) -> ColbertResult<(DocEmbeddings, DocTokenIds)> {
        let Some(bsize) = bsize else {
            let batch = self.doc_tokenizer.tensorize(docs)?;
            let d = self.doc(&batch.ids, &batch.mask, keep_dims)?;
            let ids = self.token_ids(&[batch], keep_dims)?;
            return Ok((d, ids));
        };

        let (batches, reverse_indices) = self.doc_tokenizer.tensorize_batched(docs, bsize)?;
        debug!(
            documents = docs.len(),
            sub_batches = batches.len(),
            "Encoding documents"
        );
        let encoded = batches
            .iter()
            .map(|b| self.doc(&b.ids, &b.mask, keep_dims))
            .collect::<ColbertResult<Vec<_>>>()?;
        let ids = self.token_ids(&batches, keep_dims)?;

        if keep_dims {
            let groups = encoded
                .into_iter()
                .map(DocEmbeddings::into_padded)
                .collect::<ColbertResult<Vec<_>>>()?;
            let d = stack_3d(&groups)?;
            let index = index_tensor(&reverse_indices, d.device())?;
            let d = d.index_select(&index, 0).map_err(ColbertError::tensor("reorder docs"))?;
            let ids = match ids {
                DocTokenIds::Padded(t) => DocTokenIds::Padded(
                    t.index_select(&index_tensor(&reverse_indices, t.device())?, 0)
                        .map_err(ColbertError::tensor("reorder doc ids"))?,
                ),
                ragged => ragged,
            };
            return Ok((DocEmbeddings::Padded(d), ids));
        }

        let flat: Vec<Tensor> = encoded
            .into_iter()
            .map(DocEmbeddings::into_ragged)
            .collect::<ColbertResult<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        let d = reverse_indices.iter().map(|&i| flat[i].clone()).collect();
        let ids = match ids {
            DocTokenIds::Ragged(rows) => {
                DocTokenIds::Ragged(reverse_indices.iter().map(|&i| rows[i].clone()).collect())
            }
            padded => padded,
        };
        Ok((DocEmbeddings::Ragged(d), ids))
    }

    /// Late-interaction score of one query against padded documents.
    ///
    /// See [`scoring::score`] for the argument contract.
    pub fn score(
        &self,
        q: &Tensor,
        d: &Tensor,
        mask: Option<&Tensor>,
        lengths: Option<&[u32]>,
        explain: bool,
    ) -> ColbertResult<Vec<f32>> {
        self.amp
            .context(|dtype| scoring::score(q, d, mask, lengths, explain, dtype))
    }

    /// Compute dtype of the scoring matmul.
    pub fn compute_dtype(&self) -> DType {
        self.amp.compute_dtype()
    }

    fn token_ids(&self, batches: &[TokenizedBatch], keep_dims: bool) -> ColbertResult<DocTokenIds> {
        if keep_dims {
            let pad = self.doc_tokenizer.tokenizer().special().pad;
            return stack_ids(batches, pad).map(DocTokenIds::Padded);
        }
        let mut rows = Vec::new();
        for batch in batches {
            let keep = self.colbert.doc_keep_mask(&batch.ids, &batch.mask)?;
            let ids = batch
                .ids
                .to_vec2::<u32>()
                .map_err(ColbertError::tensor("doc ids to host"))?;
            for (row, flags) in ids.into_iter().zip(keep) {
                rows.push(
                    row.into_iter()
                        .zip(flags)
                        .filter_map(|(id, k)| k.then_some(id))
                        .collect(),
                );
            }
        }
        Ok(DocTokenIds::Ragged(rows))
    }
}

/// Concatenate `(b_i, L_i, dim)` groups into `(sum b_i, max L_i, dim)`,
/// zero-filling the tail of shorter groups.
pub fn stack_3d(groups: &[Tensor]) -> ColbertResult<Tensor> {
    let mut maxlen = 0;
    for g in groups {
        maxlen = maxlen.max(g.dim(1).map_err(ColbertError::tensor("group length"))?);
    }
    let padded = groups
        .iter()
        .map(|g| {
            let len = g.dim(1)?;
            if len == maxlen {
                Ok(g.clone())
            } else {
                g.pad_with_zeros(1, 0, maxlen - len)
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()
        .map_err(ColbertError::tensor("pad groups"))?;
    Tensor::cat(&padded, 0).map_err(ColbertError::tensor("stack groups"))
}

fn stack_ids(batches: &[TokenizedBatch], pad: u32) -> ColbertResult<Tensor> {
    let width = batches.iter().map(TokenizedBatch::width).max().unwrap_or(0);
    let mut rows = 0;
    let mut values = Vec::new();
    for batch in batches {
        let ids = batch
            .ids
            .to_vec2::<u32>()
            .map_err(ColbertError::tensor("doc ids to host"))?;
        for row in ids {
            let fill = width - row.len();
            values.extend(row);
            values.extend(std::iter::repeat(pad).take(fill));
            rows += 1;
        }
    }
    Tensor::from_vec(values, (rows, width), &Device::Cpu)
        .map_err(ColbertError::tensor("stack doc ids"))
}

fn index_tensor(indices: &[usize], device: &Device) -> ColbertResult<Tensor> {
    let index: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    Tensor::from_vec(index, indices.len(), device).map_err(ColbertError::tensor("index tensor"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modeling::colbert::test_support::lookup_model;

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

    const DOCS: [&str; 5] = ["the cat sat on the mat", "a", "doc0 doc1", "b c a b", "mat"];

    #[test]
    fn test_stack_3d_zero_fills() {
        let a = Tensor::ones((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::ones((2, 4, 3), DType::F32, &Device::Cpu).unwrap();
        let out = stack_3d(&[a, b]).unwrap();
        assert_eq!(out.dims(), &[3, 4, 3]);
        let rows = out.to_vec3::<f32>().unwrap();
        assert_eq!(rows[0][3], vec![0.0; 3]);
        assert_eq!(rows[1][3], vec![1.0; 3]);
    }

    #[test]
    fn test_padded_order_matches_unbatched() {
        let inf = inference();
        let whole = inf.doc_from_text(&DOCS, None, true).unwrap().into_padded().unwrap();
        for bsize in [1, 2, 3, 7] {
            let batched = inf.doc_from_text(&DOCS, Some(bsize), true).unwrap().into_padded().unwrap();
            assert_eq!(batched.dims(), whole.dims());
            let diff = (batched - &whole)
                .unwrap()
                .abs()
                .unwrap()
                .flatten_all()
                .unwrap()
                .max(0)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-5, "bsize {} differs by {}", bsize, diff);
        }
    }

    #[test]
    fn test_ragged_order_and_ids() {
        let inf = inference();
        let (d, ids) = inf.doc_from_text_with_ids(&DOCS, Some(2), false).unwrap();
        let d = d.into_ragged().unwrap();
        let DocTokenIds::Ragged(ids) = ids else {
            panic!("expected ragged ids");
        };
        assert_eq!(d.len(), DOCS.len());
        // "a" -> <s> [D] a </s>
        assert_eq!(ids[1], vec![0, 6, 7, 2]);
        for (emb, row) in d.iter().zip(ids.iter()) {
            assert_eq!(emb.dim(0).unwrap(), row.len());
        }
    }

    #[test]
    fn test_padded_ids_follow_input_order() {
        let inf = inference();
        let (_, ids) = inf.doc_from_text_with_ids(&DOCS, Some(2), true).unwrap();
        let DocTokenIds::Padded(ids) = ids else {
            panic!("expected padded ids");
        };
        let rows = ids.to_vec2::<u32>().unwrap();
        assert_eq!(rows.len(), DOCS.len());
        assert_eq!(rows[4][..4], [0, 6, 17, 2]);
        assert!(rows[4][4..].iter().all(|&t| t == 1));
    }

    #[test]
    fn test_query_batching_keeps_order() {
        let inf = inference();
        let queries = ["a", "the cat", "b"];
        let whole = inf.query_from_text(&queries, None).unwrap();
        let (batched, tokens) = inf.query_from_text_with_ids(&queries, Some(2)).unwrap();
        assert_eq!(whole.dims(), &[3, 8, 8]);
        assert_eq!(tokens.len(), 3);
        let diff = (batched - whole)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_score_returns_one_value_per_document() {
        let inf = inference();
        let q = inf.query_from_text(&["the cat sat"], None).unwrap();
        let d = inf
            .doc_from_text(&["the cat sat", "b"], None, true)
            .unwrap()
            .into_padded()
            .unwrap();
        let scores = inf.score(&q, &d, None, None, false).unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0].is_finite() && scores[1].is_finite());
    }
}
