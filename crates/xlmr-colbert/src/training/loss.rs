//! In-batch pairwise softmax loss.
//!
//! The model scores `2N` rows per micro-batch: `N` positives followed by `N`
//! negatives. Those scores are reshaped to `(N, 2)` and trained with
//! cross-entropy against label 0, i.e. "the positive wins".

use candle_core::{DType, Tensor, D};

use crate::error::{ColbertError, ColbertResult};

/// Mean positive and negative scores of a micro-batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreProgress {
    pub positive_avg: f32,
    pub negative_avg: f32,
}

impl ScoreProgress {
    pub fn difference(&self) -> f32 {
        self.positive_avg - self.negative_avg
    }
}

/// `(2N,)` scores to `(N, 2)`: column 0 positive, column 1 negative.
pub fn pairwise_scores(scores: &Tensor) -> ColbertResult<Tensor> {
    let total = scores.elem_count();
    if total % 2 != 0 {
        return Err(ColbertError::InvalidArgument {
            message: format!("expected an even number of scores, got {}", total),
        });
    }
    scores
        .reshape((2, total / 2))
        .and_then(|s| s.t())
        .and_then(|s| s.contiguous())
        .map_err(ColbertError::tensor("pairwise scores"))
}

/// Mean cross-entropy of `(N, C)` logits against label 0 for every row.
pub fn cross_entropy_first(logits: &Tensor) -> ColbertResult<Tensor> {
    let n = logits.dim(0).map_err(ColbertError::tensor("logits rows"))?;
    let labels = Tensor::zeros(n, DType::U32, logits.device())
        .map_err(ColbertError::tensor("labels"))?;
    let logits = logits
        .to_dtype(DType::F32)
        .map_err(ColbertError::tensor("logits to f32"))?;
    candle_nn::loss::cross_entropy(&logits, &labels).map_err(ColbertError::tensor("cross entropy"))
}

/// Average positive/negative score of an `(N, 2)` pair tensor.
pub fn score_progress(pairs: &Tensor) -> ColbertResult<ScoreProgress> {
    let means: Vec<f32> = pairs
        .to_dtype(DType::F32)
        .and_then(|p| p.mean(0))
        .and_then(|m| m.to_vec1())
        .map_err(ColbertError::tensor("score progress"))?;
    match means.as_slice() {
        [positive_avg, negative_avg] => Ok(ScoreProgress {
            positive_avg: *positive_avg,
            negative_avg: *negative_avg,
        }),
        other => Err(ColbertError::InvalidArgument {
            message: format!("expected (N, 2) score pairs, got {} columns", other.len()),
        }),
    }
}

/// Extract a scalar (any rank with one element) as `f32`.
pub fn tensor_to_f32(t: &Tensor) -> ColbertResult<f32> {
    t.to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.sum(D::Minus1))
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(ColbertError::tensor("scalar to host"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_pairwise_layout() {
        let scores = Tensor::new(&[1.0f32, 2.0, 3.0, -1.0, -2.0, -3.0], &Device::Cpu).unwrap();
        let pairs = pairwise_scores(&scores).unwrap();
        assert_eq!(pairs.dims(), &[3, 2]);
        let rows = pairs.to_vec2::<f32>().unwrap();
        assert_eq!(rows[1], vec![2.0, -2.0]);
    }

    #[test]
    fn test_odd_scores_rejected() {
        let scores = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        assert!(pairwise_scores(&scores).is_err());
    }

    #[test]
    fn test_cross_entropy_values() {
        let even = Tensor::new(&[[0.0f32, 0.0]], &Device::Cpu).unwrap();
        let loss = tensor_to_f32(&cross_entropy_first(&even).unwrap()).unwrap();
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);

        let confident = Tensor::new(&[[10.0f32, 0.0]], &Device::Cpu).unwrap();
        let loss = tensor_to_f32(&cross_entropy_first(&confident).unwrap()).unwrap();
        assert!(loss < 1e-3);

        let wrong = Tensor::new(&[[0.0f32, 10.0]], &Device::Cpu).unwrap();
        let loss = tensor_to_f32(&cross_entropy_first(&wrong).unwrap()).unwrap();
        assert!(loss > 9.0);
    }

    #[test]
    fn test_score_progress() {
        let pairs = Tensor::new(&[[4.0f32, 1.0], [2.0, 1.0]], &Device::Cpu).unwrap();
        let progress = score_progress(&pairs).unwrap();
        assert_eq!(progress.positive_avg, 3.0);
        assert_eq!(progress.negative_avg, 1.0);
        assert_eq!(progress.difference(), 2.0);
    }
}
