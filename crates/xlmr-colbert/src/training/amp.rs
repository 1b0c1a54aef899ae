//! Mixed precision and gradient accumulation.
//!
//! [`MixedPrecisionManager::context`] hands the wrapped computation the
//! reduced compute dtype; the computation casts its outputs back to f32
//! before returning. Losses are multiplied by a dynamic scale before
//! `backward`, and gradients are unscaled before the optimizer sees them.
//! A step whose gradients are not finite is skipped and the scale halves.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use tracing::{debug, warn};

use crate::error::{ColbertError, ColbertResult};

use super::optimizer::AdamW;

const INITIAL_SCALE: f64 = 65536.0;
const GROWTH_INTERVAL: usize = 2000;

#[derive(Debug, Clone)]
pub struct MixedPrecisionManager {
    activated: bool,
    dtype: DType,
    scale: f64,
    good_steps: usize,
}

impl MixedPrecisionManager {
    /// `activated = false` runs everything in f32 with a unit scale.
    pub fn new(activated: bool) -> Self {
        Self {
            activated,
            dtype: DType::BF16,
            scale: if activated { INITIAL_SCALE } else { 1.0 },
            good_steps: 0,
        }
    }

    /// Use a different reduced dtype (f16 on most GPUs).
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn activated(&self) -> bool {
        self.activated
    }

    /// Current loss scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Dtype the wrapped computation should run its matmuls in.
    pub fn compute_dtype(&self) -> DType {
        if self.activated {
            self.dtype
        } else {
            DType::F32
        }
    }

    /// Run `f` inside the reduced-precision scope.
    ///
    /// The scope holds no state of its own, so leaving it by `?` or by
    /// return restores full precision the same way.
    pub fn context<T>(&self, f: impl FnOnce(DType) -> ColbertResult<T>) -> ColbertResult<T> {
        f(self.compute_dtype())
    }

    /// Backward pass of the scaled loss.
    pub fn backward(&self, loss: &Tensor) -> ColbertResult<GradStore> {
        let scaled = if self.activated {
            loss.affine(self.scale, 0.0)
                .map_err(ColbertError::tensor("scale loss"))?
        } else {
            loss.clone()
        };
        scaled.backward().map_err(ColbertError::tensor("backward"))
    }

    /// Unscale accumulated gradients and step the optimizer.
    ///
    /// Returns `false` when the step was skipped because of non-finite
    /// gradients.
    pub fn step(&mut self, optimizer: &mut AdamW, vars: &[Var], grads: GradStore) -> ColbertResult<bool> {
        if !self.activated {
            optimizer.step(&grads)?;
            return Ok(true);
        }

        let grads = rescale(grads, vars, 1.0 / self.scale)?;
        let norm = optimizer.grad_norm(&grads)?;
        if !norm.is_finite() {
            self.scale = (self.scale * 0.5).max(1.0);
            self.good_steps = 0;
            warn!(scale = self.scale, "Non-finite gradients, skipping optimizer step");
            return Ok(false);
        }

        optimizer.step(&grads)?;
        self.good_steps += 1;
        if self.good_steps == GROWTH_INTERVAL {
            self.scale *= 2.0;
            self.good_steps = 0;
            debug!(scale = self.scale, "Grew loss scale");
        }
        Ok(true)
    }
}

/// Sums micro-batch gradients for a fixed set of variables.
///
/// Only the variables' gradients are kept; entries for masks, inputs and
/// other constant operands are dropped in [`GradAccumulator::add`].
#[derive(Default)]
pub struct GradAccumulator {
    total: Option<GradStore>,
}

impl GradAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, vars: &[Var], grads: GradStore) -> ColbertResult<()> {
        if self.total.is_none() {
            self.total = Some(empty_grad_store(vars)?);
        }
        let Some(total) = self.total.as_mut() else {
            return Ok(());
        };
        for var in vars {
            let tensor = var.as_tensor();
            if let Some(g) = grads.get(tensor) {
                let sum = match total.get(tensor) {
                    Some(acc) => acc.add(g).map_err(ColbertError::tensor("accumulate grads"))?,
                    None => g.clone(),
                };
                total.insert(tensor, sum);
            }
        }
        Ok(())
    }

    /// Accumulated gradients, or `None` if nothing was added.
    pub fn take(&mut self) -> Option<GradStore> {
        self.total.take()
    }
}

/// A `GradStore` with no entries, on the device of `vars`.
fn empty_grad_store(vars: &[Var]) -> ColbertResult<GradStore> {
    let device = vars
        .first()
        .map(|v| v.device().clone())
        .unwrap_or(candle_core::Device::Cpu);
    let seed = Tensor::zeros((), DType::F32, &device).map_err(ColbertError::tensor("empty grads"))?;
    let mut store = seed.backward().map_err(ColbertError::tensor("empty grads"))?;
    store.remove(&seed);
    Ok(store)
}

fn rescale(mut grads: GradStore, vars: &[Var], factor: f64) -> ColbertResult<GradStore> {
    for var in vars {
        let tensor = var.as_tensor();
        if let Some(g) = grads.get(tensor) {
            let scaled = g
                .affine(factor, 0.0)
                .map_err(ColbertError::tensor("unscale grads"))?;
            grads.insert(tensor, scaled);
        }
    }
    Ok(grads)
}
