//! MaxSim late-interaction scoring.
//!
//! score(q, d) = sum over query tokens i of max over document tokens j of
//! sim(q_i, d_j). The max runs along the document-token axis only and the
//! sum along the query-token axis only.

use candle_core::{DType, Device, Tensor, D};

use crate::config::Similarity;
use crate::error::{ColbertError, ColbertResult};

/// Score one query against a batch of documents.
///
/// * `q` - `(Lq, dim)` or `(1, Lq, dim)` query embeddings
/// * `d` - `(B, Ld, dim)` document embeddings
/// * `mask` - `(B, Ld)` 0/1 validity of document positions
/// * `lengths` - valid document length per row; turned into a
///   `position < length` mask
///
/// `mask` and `lengths` cannot both be given. `explain` is not supported
/// and fails before any work is done. The matmul runs in `dtype`; scores
/// come back as f32.
pub fn score(
    q: &Tensor,
    d: &Tensor,
    mask: Option<&Tensor>,
    lengths: Option<&[u32]>,
    explain: bool,
    dtype: DType,
) -> ColbertResult<Vec<f32>> {
    if explain {
        return Err(ColbertError::Unsupported {
            feature: "token-level score explanation",
        });
    }
    if mask.is_some() && lengths.is_some() {
        return Err(ColbertError::MutuallyExclusive {
            first: "mask",
            second: "lengths",
        });
    }

    let q = match q.rank() {
        2 => q.clone(),
        3 if q.dims()[0] == 1 => q.squeeze(0).map_err(ColbertError::tensor("squeeze query"))?,
        _ => {
            return Err(ColbertError::InvalidArgument {
                message: format!("query embeddings must be (Lq, dim), got {:?}", q.dims()),
            })
        }
    };
    let (batch, doc_len, dim) = d.dims3().map_err(ColbertError::tensor("document dims"))?;
    if q.dims()[1] != dim {
        return Err(ColbertError::InvalidArgument {
            message: format!("query dim {} does not match document dim {}", q.dims()[1], dim),
        });
    }
    if batch == 0 {
        return Ok(Vec::new());
    }

    let mask = match (mask, lengths) {
        (Some(mask), None) => Some(
            mask.to_dtype(DType::F32)
                .and_then(|m| m.to_device(d.device()))
                .map_err(ColbertError::tensor("mask dtype"))?,
        ),
        (None, Some(lengths)) => Some(length_mask(lengths, batch, doc_len, d.device())?),
        _ => None,
    };

    let qt = q
        .to_dtype(dtype)
        .and_then(|q| q.t())
        .and_then(|q| q.contiguous())
        .map_err(ColbertError::tensor("query transpose"))?;
    // (B, Ld, dim) @ (dim, Lq) -> (B, Ld, Lq)
    let mut sims = d
        .to_dtype(dtype)
        .and_then(|d| d.broadcast_matmul(&qt))
        .and_then(|s| s.to_dtype(DType::F32))
        .map_err(ColbertError::tensor("score matmul"))?;

    if let Some(mask) = mask {
        sims = mask
            .unsqueeze(2)
            .and_then(|m| sims.broadcast_mul(&m))
            .map_err(ColbertError::tensor("apply mask"))?;
    }

    sims.max(1)
        .and_then(|s| s.sum(D::Minus1))
        .and_then(|s| s.to_vec1::<f32>())
        .map_err(ColbertError::tensor("maxsim reduce"))
}

/// `(B, Ld)` f32 mask with 1 where `position < lengths[b]`.
pub fn length_mask(lengths: &[u32], batch: usize, doc_len: usize, device: &Device) -> ColbertResult<Tensor> {
    if lengths.len() != batch {
        return Err(ColbertError::LengthMismatch {
            context: "score lengths",
            lengths: vec![lengths.len(), batch],
        });
    }
    let mut values = Vec::with_capacity(batch * doc_len);
    for &len in lengths {
        values.extend((0..doc_len).map(|pos| if pos < len as usize { 1.0f32 } else { 0.0 }));
    }
    Tensor::from_vec(values, (batch, doc_len), device).map_err(ColbertError::tensor("length mask"))
}

/// Row-aligned training scores: row `b` of `q` against row `b` of `d`.
///
/// `q` is `(B, Lq, dim)` and `d` is `(B, Ld, dim)`; returns `(B,)` f32.
pub fn pairwise_maxsim(q: &Tensor, d: &Tensor, similarity: Similarity, dtype: DType) -> ColbertResult<Tensor> {
    let compute = || -> candle_core::Result<Tensor> {
        let q = q.to_dtype(dtype)?;
        let d = d.to_dtype(dtype)?;
        // (B, Lq, Ld)
        let sims = match similarity {
            Similarity::Cosine => q.matmul(&d.t()?.contiguous()?)?,
            Similarity::L2 => {
                let diff = q.unsqueeze(2)?.broadcast_sub(&d.unsqueeze(1)?)?;
                diff.sqr()?.sum(D::Minus1)?.neg()?
            }
        };
        sims.to_dtype(DType::F32)?.max(2)?.sum(1)
    };
    compute().map_err(ColbertError::tensor(format!(
        "pairwise {} maxsim",
        similarity.as_str()
    )))
}
