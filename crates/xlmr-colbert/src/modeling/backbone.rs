//! Token encoders that sit underneath the ColBERT head.
//!
//! The head only needs `(ids, mask) -> (batch, seq, hidden)`, so the encoder
//! is a trait. [`BertBackbone`] wraps the candle-transformers BERT encoder
//! (XLM-R checkpoints load through it); [`LookupBackbone`] is a trainable
//! embedding table for CPU smoke runs and tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ColbertError, ColbertResult};

/// Contextual token encoder.
pub trait Backbone: Send + Sync {
    /// `ids` and `mask` are `(batch, seq)` u32; returns `(batch, seq, hidden)` f32.
    fn forward(&self, ids: &Tensor, mask: &Tensor) -> ColbertResult<Tensor>;

    fn hidden_size(&self) -> usize;
}

// ============================================================================
// BERT-FAMILY ENCODER
// ============================================================================

/// BERT/RoBERTa/XLM-R encoder from a HuggingFace model directory.
pub struct BertBackbone {
    model: BertModel,
    hidden_size: usize,
}

impl BertBackbone {
    /// Build the encoder under `vb` and copy pretrained weights into it.
    ///
    /// `model_dir` must hold `config.json` and `model.safetensors`.
    /// `vocab_size` is the tokenizer's vocabulary including added marker
    /// tokens; the word-embedding table grows to match it. `prefix` is the
    /// variable prefix `vb` was created with, needed to address the
    /// variables in `varmap`.
    pub fn load(
        model_dir: &Path,
        vocab_size: usize,
        vb: VarBuilder,
        varmap: &VarMap,
        prefix: &str,
    ) -> ColbertResult<Self> {
        let config_path = model_dir.join("config.json");
        let weights_path = model_dir.join("model.safetensors");
        info!(model_dir = %model_dir.display(), "Loading encoder");

        let raw = fs::read_to_string(&config_path).map_err(|e| ColbertError::ConfigError {
            message: format!("Failed to read {}: {}", config_path.display(), e),
        })?;
        let mut config: Value = serde_json::from_str(&raw)?;

        let weights = candle_core::safetensors::load(&weights_path, vb.device()).map_err(|e| {
            ColbertError::Checkpoint {
                message: format!("Failed to read {}: {}", weights_path.display(), e),
            }
        })?;
        let mut weights = rename_pretrained(weights);

        let offset_positions = matches!(
            config.get("model_type").and_then(Value::as_str),
            Some("roberta") | Some("xlm-roberta") | Some("camembert")
        );
        if offset_positions {
            let pad = config_usize(&config, "pad_token_id").unwrap_or(1);
            if let Some(kept) = drop_leading_positions(&mut weights, pad + 1)? {
                config["max_position_embeddings"] = Value::from(kept);
            }
        }

        let pretrained_vocab = config_usize(&config, "vocab_size").unwrap_or(0);
        if vocab_size > pretrained_vocab {
            grow_word_embeddings(&mut weights, vocab_size)?;
            debug!(from = pretrained_vocab, to = vocab_size, "Resized token embeddings");
        }
        config["vocab_size"] = Value::from(vocab_size.max(pretrained_vocab));

        let hidden_size = config_usize(&config, "hidden_size").ok_or_else(|| ColbertError::ConfigError {
            message: format!("{} has no hidden_size", config_path.display()),
        })?;
        let bert_config: BertConfig = serde_json::from_value(config)?;
        let model = BertModel::load(vb, &bert_config).map_err(ColbertError::tensor("build encoder"))?;

        copy_into_varmap(varmap, prefix, weights)?;

        Ok(Self { model, hidden_size })
    }
}

impl Backbone for BertBackbone {
    fn forward(&self, ids: &Tensor, mask: &Tensor) -> ColbertResult<Tensor> {
        let token_type_ids = ids.zeros_like().map_err(ColbertError::tensor("token types"))?;
        self.model
            .forward(ids, &token_type_ids, Some(mask))
            .map_err(ColbertError::tensor("encoder forward"))
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

fn config_usize(config: &Value, key: &str) -> Option<usize> {
    config.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

/// Strip `roberta.`/`bert.` prefixes, map LayerNorm `gamma`/`beta` names,
/// cast to f32 and drop heads the encoder does not use.
fn rename_pretrained(weights: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    weights
        .into_iter()
        .filter_map(|(name, tensor)| {
            let name = name
                .strip_prefix("roberta.")
                .or_else(|| name.strip_prefix("bert."))
                .unwrap_or(&name)
                .to_string();
            if !(name.starts_with("embeddings.") || name.starts_with("encoder.")) {
                return None;
            }
            let name = if let Some(stem) = name.strip_suffix(".gamma") {
                format!("{}.weight", stem)
            } else if let Some(stem) = name.strip_suffix(".beta") {
                format!("{}.bias", stem)
            } else {
                name
            };
            let tensor = tensor.to_dtype(DType::F32).ok()?;
            Some((name, tensor))
        })
        .collect()
}

/// RoBERTa-style position ids start at `pad + 1`; the encoder counts from 0.
fn drop_leading_positions(weights: &mut HashMap<String, Tensor>, skip: usize) -> ColbertResult<Option<usize>> {
    let key = "embeddings.position_embeddings.weight";
    let Some(table) = weights.get(key) else {
        return Ok(None);
    };
    let rows = table.dim(0).map_err(ColbertError::tensor("position rows"))?;
    if rows <= skip {
        return Ok(None);
    }
    let kept = rows - skip;
    let trimmed = table
        .narrow(0, skip, kept)
        .map_err(ColbertError::tensor("trim position embeddings"))?;
    weights.insert(key.to_string(), trimmed);
    Ok(Some(kept))
}

/// Append rows initialised to the mean embedding.
fn grow_word_embeddings(weights: &mut HashMap<String, Tensor>, vocab_size: usize) -> ColbertResult<()> {
    let key = "embeddings.word_embeddings.weight";
    let Some(table) = weights.get(key) else {
        return Ok(());
    };
    let (rows, hidden) = table.dims2().map_err(ColbertError::tensor("word embedding dims"))?;
    if rows >= vocab_size {
        return Ok(());
    }
    let grown = table
        .mean_keepdim(0)
        .and_then(|mean| mean.broadcast_as((vocab_size - rows, hidden)))
        .and_then(|extra| extra.contiguous())
        .and_then(|extra| Tensor::cat(&[table, &extra], 0))
        .map_err(ColbertError::tensor("grow word embeddings"))?;
    weights.insert(key.to_string(), grown);
    Ok(())
}

/// Overwrite variables with pretrained tensors, by name.
///
/// Names the variable map does not know and shape mismatches are skipped
/// with a warning; the variable keeps its fresh initialisation.
pub(crate) fn copy_into_varmap(
    varmap: &VarMap,
    prefix: &str,
    weights: HashMap<String, Tensor>,
) -> ColbertResult<usize> {
    let vars = varmap.data().lock().map_err(|e| ColbertError::InvalidArgument {
        message: format!("variable map lock poisoned: {}", e),
    })?;
    let mut names: Vec<&String> = weights.keys().collect();
    names.sort();

    let mut copied = 0usize;
    let mut skipped = Vec::new();
    for name in names {
        let full = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        let result = match (vars.get(&full), weights.get(name)) {
            (Some(var), Some(tensor)) => var.set(tensor).map_err(|e| e.to_string()),
            _ => Err("no such variable".to_string()),
        };
        match result {
            Ok(()) => copied += 1,
            Err(reason) => {
                debug!(name = %full, %reason, "Skipping pretrained tensor");
                skipped.push(full);
            }
        }
    }

    let total = vars.len();
    if !skipped.is_empty() || copied < total {
        warn!(
            copied,
            skipped = skipped.len(),
            variables = total,
            "Pretrained weights only partially matched the encoder"
        );
    } else {
        info!(copied, "Loaded pretrained weights");
    }
    Ok(copied)
}

// ============================================================================
// LOOKUP TABLE
// ============================================================================

/// Context-free token embeddings: `hidden[b, t] = table[ids[b, t]]`.
pub struct LookupBackbone {
    embeddings: Embedding,
    hidden_size: usize,
}

impl LookupBackbone {
    /// Trainable `(vocab_size, hidden_size)` table under `vb`.
    pub fn new(vocab_size: usize, hidden_size: usize, vb: VarBuilder) -> ColbertResult<Self> {
        let embeddings = candle_nn::embedding(vocab_size, hidden_size, vb.pp("embeddings"))
            .map_err(ColbertError::tensor("lookup table"))?;
        Ok(Self {
            embeddings,
            hidden_size,
        })
    }

    /// Fixed table, not registered in any variable map.
    pub fn from_table(table: Tensor) -> ColbertResult<Self> {
        let (_, hidden_size) = table.dims2().map_err(ColbertError::tensor("lookup table dims"))?;
        Ok(Self {
            embeddings: Embedding::new(table, hidden_size),
            hidden_size,
        })
    }

    pub fn device(&self) -> &Device {
        self.embeddings.embeddings().device()
    }
}

impl Backbone for LookupBackbone {
    fn forward(&self, ids: &Tensor, _mask: &Tensor) -> ColbertResult<Tensor> {
        self.embeddings
            .forward(ids)
            .map_err(ColbertError::tensor("lookup forward"))
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}
