//! ColBERT head: encoder, bias-free projection to `dim`, per-token L2
//! normalisation.

use std::collections::HashSet;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder, VarMap};
use tracing::info;

use crate::config::{BackboneKind, ModelConfig, Similarity};
use crate::error::{ColbertError, ColbertResult};
use crate::tokenization::{ColbertTokenizer, TokenizedBatch};

use super::backbone::{Backbone, BertBackbone, LookupBackbone};
use super::scoring::pairwise_maxsim;

const BACKBONE_PREFIX: &str = "backbone";
const LINEAR_PREFIX: &str = "linear";

/// Document embeddings in one of the two layouts.
#[derive(Debug, Clone)]
pub enum DocEmbeddings {
    /// `(B, L, dim)` with skipped and padding positions zeroed.
    Padded(Tensor),
    /// One `(len_i, dim)` tensor per document, skipped positions removed.
    Ragged(Vec<Tensor>),
}

impl DocEmbeddings {
    pub fn len(&self) -> usize {
        match self {
            DocEmbeddings::Padded(t) => t.dims().first().copied().unwrap_or(0),
            DocEmbeddings::Ragged(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_padded(self) -> ColbertResult<Tensor> {
        match self {
            DocEmbeddings::Padded(t) => Ok(t),
            DocEmbeddings::Ragged(_) => Err(ColbertError::InvalidArgument {
                message: "expected padded document embeddings".to_string(),
            }),
        }
    }

    pub fn into_ragged(self) -> ColbertResult<Vec<Tensor>> {
        match self {
            DocEmbeddings::Ragged(v) => Ok(v),
            DocEmbeddings::Padded(_) => Err(ColbertError::InvalidArgument {
                message: "expected ragged document embeddings".to_string(),
            }),
        }
    }
}

pub struct ColBert {
    backbone: Box<dyn Backbone>,
    linear: Linear,
    similarity: Similarity,
    skiplist: HashSet<u32>,
    pad_id: u32,
    dim: usize,
    varmap: VarMap,
    device: Device,
}

impl ColBert {
    /// Build the model described by `config` on `device`.
    ///
    /// With [`BackboneKind::Bert`] the encoder weights come from
    /// `config.base_model`; the projection is always freshly initialised.
    pub fn from_config(
        config: &ModelConfig,
        tokenizer: &ColbertTokenizer,
        device: &Device,
    ) -> ColbertResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let vocab_size = tokenizer.vocab_size();

        let backbone: Box<dyn Backbone> = match config.backbone {
            BackboneKind::Bert => {
                let dir = config.base_model.as_deref().ok_or_else(|| ColbertError::ConfigError {
                    message: "model.base_model is required for the bert backbone".to_string(),
                })?;
                Box::new(BertBackbone::load(
                    dir,
                    vocab_size,
                    vb.pp(BACKBONE_PREFIX),
                    &varmap,
                    BACKBONE_PREFIX,
                )?)
            }
            BackboneKind::Lookup => Box::new(LookupBackbone::new(
                vocab_size,
                config.lookup_hidden,
                vb.pp(BACKBONE_PREFIX),
            )?),
        };

        let skiplist = if config.mask_punctuation {
            tokenizer.punctuation_ids()?.into_iter().collect()
        } else {
            HashSet::new()
        };

        let model = Self::with_backbone(
            backbone,
            config.dim,
            config.similarity,
            skiplist,
            tokenizer.special().pad,
            varmap,
            vb.pp(LINEAR_PREFIX),
        )?;
        info!(
            backbone = ?config.backbone,
            dim = config.dim,
            similarity = config.similarity.as_str(),
            mask_punctuation = config.mask_punctuation,
            "Built ColBERT model"
        );
        Ok(model)
    }

    /// Assemble a model around an existing encoder.
    ///
    /// The projection is created under `vb`, which should be backed by
    /// `varmap` so that it trains and checkpoints with the encoder.
    pub fn with_backbone(
        backbone: Box<dyn Backbone>,
        dim: usize,
        similarity: Similarity,
        skiplist: HashSet<u32>,
        pad_id: u32,
        varmap: VarMap,
        vb: VarBuilder,
    ) -> ColbertResult<Self> {
        let device = vb.device().clone();
        let linear = candle_nn::linear_no_bias(backbone.hidden_size(), dim, vb)
            .map_err(ColbertError::tensor("projection"))?;
        Ok(Self {
            backbone,
            linear,
            similarity,
            skiplist,
            pad_id,
            dim,
            varmap,
            device,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    pub fn skiplist(&self) -> &HashSet<u32> {
        &self.skiplist
    }

    /// Save every variable to a safetensors file.
    pub fn save(&self, path: &Path) -> ColbertResult<()> {
        self.varmap
            .save(path)
            .map_err(ColbertError::tensor(format!("save {}", path.display())))
    }

    /// Query embeddings `(B, Lq, dim)`. Every position is kept, including
    /// the `<mask>` padding.
    pub fn query(&self, ids: &Tensor, mask: &Tensor) -> ColbertResult<Tensor> {
        let q = self.encode(ids, mask)?;
        normalize(&q)
    }

    /// Document embeddings with skip-listed, padding and masked-out
    /// positions removed (ragged) or zeroed (padded).
    pub fn doc(&self, ids: &Tensor, mask: &Tensor, keep_dims: bool) -> ColbertResult<DocEmbeddings> {
        let keep = self.doc_keep_mask(ids, mask)?;
        let d = normalize(&self.encode(ids, mask)?)?;
        let keep_t = keep_tensor(&keep, &self.device)?;
        let d = d
            .broadcast_mul(&keep_t.unsqueeze(2).map_err(ColbertError::tensor("doc mask"))?)
            .map_err(ColbertError::tensor("apply doc mask"))?;

        if keep_dims {
            return Ok(DocEmbeddings::Padded(d));
        }

        let mut ragged = Vec::with_capacity(keep.len());
        for (row, flags) in keep.iter().enumerate() {
            let positions: Vec<u32> = flags
                .iter()
                .enumerate()
                .filter(|(_, k)| **k)
                .map(|(pos, _)| pos as u32)
                .collect();
            let count = positions.len();
            let index = Tensor::from_vec(positions, count, &self.device)
                .map_err(ColbertError::tensor("ragged index"))?;
            let kept = d
                .get(row)
                .and_then(|r| r.index_select(&index, 0))
                .map_err(ColbertError::tensor("strip doc row"))?;
            ragged.push(kept);
        }
        Ok(DocEmbeddings::Ragged(ragged))
    }

    /// Scores of row-aligned query/document batches, `(rows,)` f32.
    ///
    /// `queries` may hold either the same number of rows as `documents` or
    /// half of it; in the latter case the query encoding is reused for the
    /// positive and the negative half.
    pub fn forward(
        &self,
        queries: &TokenizedBatch,
        documents: &TokenizedBatch,
        dtype: DType,
    ) -> ColbertResult<Tensor> {
        let q = self.query_batch(queries)?;
        let d = self.doc_batch(documents)?.into_padded()?;
        self.score_pairs(&q, &d, dtype)
    }

    /// Query-side encoding of a tokenized batch.
    pub fn query_batch(&self, batch: &TokenizedBatch) -> ColbertResult<Tensor> {
        let batch = batch.to_device(&self.device)?;
        self.query(&batch.ids, &batch.mask)
    }

    /// Document-side padded encoding of a tokenized batch.
    pub fn doc_batch(&self, batch: &TokenizedBatch) -> ColbertResult<DocEmbeddings> {
        let batch = batch.to_device(&self.device)?;
        self.doc(&batch.ids, &batch.mask, true)
    }

    /// Row-aligned scores of already encoded batches under the model's
    /// similarity. `q` with half the rows of `d` is used twice.
    pub fn score_pairs(&self, q: &Tensor, d: &Tensor, dtype: DType) -> ColbertResult<Tensor> {
        let q_rows = q.dim(0).map_err(ColbertError::tensor("query rows"))?;
        let d_rows = d.dim(0).map_err(ColbertError::tensor("doc rows"))?;
        let q = if q_rows * 2 == d_rows && q_rows != d_rows {
            Tensor::cat(&[q, q], 0).map_err(ColbertError::tensor("repeat queries"))?
        } else if q_rows == d_rows {
            q.clone()
        } else {
            return Err(ColbertError::LengthMismatch {
                context: "ColBert::score_pairs",
                lengths: vec![q_rows, d_rows],
            });
        };
        pairwise_maxsim(&q, d, self.similarity, dtype)
    }

    /// Which document positions contribute: attended, not padding and not
    /// in the skip-list.
    pub fn doc_keep_mask(&self, ids: &Tensor, mask: &Tensor) -> ColbertResult<Vec<Vec<bool>>> {
        let ids = ids
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec2::<u32>())
            .map_err(ColbertError::tensor("doc ids to host"))?;
        let mask = mask
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec2::<u32>())
            .map_err(ColbertError::tensor("doc mask to host"))?;
        Ok(ids
            .iter()
            .zip(mask.iter())
            .map(|(row, m)| {
                row.iter()
                    .zip(m.iter())
                    .map(|(&id, &m)| m > 0 && id != self.pad_id && !self.skiplist.contains(&id))
                    .collect()
            })
            .collect())
    }

    fn encode(&self, ids: &Tensor, mask: &Tensor) -> ColbertResult<Tensor> {
        let ids = ids.to_device(&self.device).map_err(ColbertError::tensor("ids to device"))?;
        let mask = mask.to_device(&self.device).map_err(ColbertError::tensor("mask to device"))?;
        let hidden = self.backbone.forward(&ids, &mask)?;
        self.linear
            .forward(&hidden)
            .map_err(ColbertError::tensor("projection forward"))
    }
}

/// L2-normalise the last axis. Zero rows stay zero.
///
/// The squared norm is clamped before the root: the derivative of `sqrt`
/// at 0 is infinite.
fn normalize(t: &Tensor) -> ColbertResult<Tensor> {
    let norm = t
        .sqr()
        .and_then(|s| s.sum_keepdim(D::Minus1))
        .and_then(|s| s.maximum(1e-24))
        .and_then(|s| s.sqrt())
        .map_err(ColbertError::tensor("embedding norm"))?;
    t.broadcast_div(&norm).map_err(ColbertError::tensor("normalize"))
}

fn keep_tensor(keep: &[Vec<bool>], device: &Device) -> ColbertResult<Tensor> {
    let rows = keep.len();
    let width = keep.first().map(Vec::len).unwrap_or(0);
    let values: Vec<f32> = keep
        .iter()
        .flat_map(|row| row.iter().map(|&k| if k { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_vec(values, (rows, width), device).map_err(ColbertError::tensor("keep mask"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::tokenization::test_support::word_level_tokenizer;

    /// Lookup-backbone model over the word-level test vocabulary.
    pub fn lookup_model(dim: usize, mask_punctuation: bool) -> (ColbertTokenizer, ColBert) {
        let tokenizer = word_level_tokenizer();
        let config = ModelConfig {
            backbone: BackboneKind::Lookup,
            lookup_hidden: 16,
            dim,
            mask_punctuation,
            ..Default::default()
        };
        let model = ColBert::from_config(&config, &tokenizer, &Device::Cpu).unwrap();
        (tokenizer, model)
    }
}
