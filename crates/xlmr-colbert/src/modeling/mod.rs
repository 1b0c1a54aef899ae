//! ColBERT model, batched inference and MaxSim scoring.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `backbone` | [`Backbone`] trait, BERT-family and lookup encoders |
//! | `colbert` | [`ColBert`] head and the [`DocEmbeddings`] layouts |
//! | `inference` | [`ModelInference`] text-to-embedding driver |
//! | `scoring` | late-interaction operators |

pub mod backbone;
pub mod colbert;
pub mod inference;
pub mod scoring;

pub use backbone::{Backbone, BertBackbone, LookupBackbone};
pub use colbert::{ColBert, DocEmbeddings};
pub use inference::{stack_3d, DocTokenIds, ModelInference};
pub use scoring::{length_mask, pairwise_maxsim, score};
