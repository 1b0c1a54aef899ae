//! AdamW over the model's candle `Var`s.
//!
//! Gradients come in as a `GradStore` (already unscaled and accumulated over
//! micro-batches), so one call to [`AdamW::step`] is one optimizer step.
//! Moments are exposed as named tensors for checkpointing.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use tracing::debug;

use crate::error::{ColbertError, ColbertResult};

#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Decoupled weight decay coefficient.
    pub weight_decay: f64,
    /// Clip the global gradient norm to this value when set.
    pub max_grad_norm: Option<f64>,
    /// Linear warmup length. 0 keeps the rate constant.
    pub warmup_steps: usize,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 3e-6,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            max_grad_norm: None,
            warmup_steps: 0,
        }
    }
}

struct TrackedParam {
    name: String,
    var: Var,
    m: Tensor,
    v: Tensor,
}

pub struct AdamW {
    config: AdamWConfig,
    params: Vec<TrackedParam>,
    step: usize,
}

impl AdamW {
    /// Track every variable in `varmap`, in name order.
    pub fn new(varmap: &VarMap, config: AdamWConfig) -> ColbertResult<Self> {
        let vars = varmap.data().lock().map_err(|e| ColbertError::InvalidArgument {
            message: format!("variable map lock poisoned: {}", e),
        })?;
        let mut named: Vec<(String, Var)> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(vars);
        named.sort_by(|a, b| a.0.cmp(&b.0));

        let mut params = Vec::with_capacity(named.len());
        for (name, var) in named {
            let m = var.as_tensor().zeros_like().map_err(ColbertError::tensor("adam m"))?;
            let v = var.as_tensor().zeros_like().map_err(ColbertError::tensor("adam v"))?;
            params.push(TrackedParam { name, var, m, v });
        }
        debug!(params = params.len(), "AdamW tracking parameters");

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn current_lr(&self) -> f64 {
        let warmup = self.config.warmup_steps;
        if warmup > 0 && self.step < warmup {
            self.config.lr * (self.step + 1) as f64 / warmup as f64
        } else {
            self.config.lr
        }
    }

    /// Global L2 norm of the gradients of tracked parameters.
    pub fn grad_norm(&self, grads: &GradStore) -> ColbertResult<f64> {
        let mut total_sq = 0.0f64;
        for param in &self.params {
            if let Some(grad) = grads.get(param.var.as_tensor()) {
                let sq: f32 = grad
                    .sqr()
                    .and_then(|g| g.sum_all())
                    .and_then(|g| g.to_dtype(candle_core::DType::F32))
                    .and_then(|g| g.to_scalar())
                    .map_err(ColbertError::tensor("grad norm"))?;
                total_sq += sq as f64;
            }
        }
        Ok(total_sq.sqrt())
    }

    /// Apply one AdamW update. Parameters without a gradient are skipped.
    pub fn step(&mut self, grads: &GradStore) -> ColbertResult<()> {
        let clip_scale = match self.config.max_grad_norm {
            Some(max_norm) => {
                let norm = self.grad_norm(grads)?;
                if norm > max_norm {
                    max_norm / (norm + self.config.epsilon)
                } else {
                    1.0
                }
            }
            None => 1.0,
        };

        let lr = self.current_lr();
        self.step += 1;
        let t = self.step as i32;
        let (beta1, beta2, eps) = (self.config.beta1, self.config.beta2, self.config.epsilon);
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let decay = self.config.weight_decay;

        for param in &mut self.params {
            let Some(grad) = grads.get(param.var.as_tensor()) else {
                continue;
            };
            let update = || -> candle_core::Result<(Tensor, Tensor, Tensor)> {
                let grad = if clip_scale != 1.0 {
                    grad.affine(clip_scale, 0.0)?
                } else {
                    grad.clone()
                };
                let m = ((param.m.affine(beta1, 0.0))? + grad.affine(1.0 - beta1, 0.0)?)?.detach();
                let v = ((param.v.affine(beta2, 0.0))? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?
                    .detach();

                let m_hat = m.affine(1.0 / bc1, 0.0)?;
                let v_hat = v.affine(1.0 / bc2, 0.0)?;
                let denom = (v_hat.sqrt()? + eps)?;
                let current = param.var.as_tensor();
                let next = ((current.affine(1.0 - lr * decay, 0.0)?)
                    - m_hat.div(&denom)?.affine(lr, 0.0)?)?
                .detach();
                Ok((m, v, next))
            };
            let (m, v, next) = update().map_err(ColbertError::tensor(format!(
                "AdamW update of {}",
                param.name
            )))?;
            param.var.set(&next).map_err(ColbertError::tensor("AdamW set"))?;
            param.m = m;
            param.v = v;
        }

        Ok(())
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Moments keyed `<param>.exp_avg` / `<param>.exp_avg_sq`.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::with_capacity(self.params.len() * 2);
        for param in &self.params {
            state.insert(format!("{}.exp_avg", param.name), param.m.clone());
            state.insert(format!("{}.exp_avg_sq", param.name), param.v.clone());
        }
        state
    }

    /// Restore moments saved by [`AdamW::state_tensors`].
    ///
    /// Every tracked parameter must be present with a matching shape.
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>, step: usize) -> ColbertResult<()> {
        for param in &mut self.params {
            let shape = param.var.as_tensor().shape().clone();
            let device = param.var.as_tensor().device().clone();
            let dtype = param.var.as_tensor().dtype();
            let fetch = |suffix: &str| -> ColbertResult<Tensor> {
                let key = format!("{}.{}", param.name, suffix);
                let t = state.get(&key).ok_or_else(|| ColbertError::Checkpoint {
                    message: format!("optimizer state is missing {}", key),
                })?;
                if t.shape() != &shape {
                    return Err(ColbertError::Checkpoint {
                        message: format!(
                            "optimizer state {} has shape {:?}, expected {:?}",
                            key,
                            t.dims(),
                            shape.dims()
                        ),
                    });
                }
                t.to_device(&device)
                    .and_then(|t| t.to_dtype(dtype))
                    .map_err(ColbertError::tensor("optimizer state to device"))
            };
            let m = fetch("exp_avg")?;
            let v = fetch("exp_avg_sq")?;
            param.m = m;
            param.v = v;
        }
        self.step = step;
        Ok(())
    }
}
