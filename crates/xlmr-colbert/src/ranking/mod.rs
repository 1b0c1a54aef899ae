//! Indexing and retrieve-then-rerank.
//!
//! [`index_collection`] encodes a collection into a [`DocumentStore`];
//! [`build_index`] puts every stored token vector into a
//! [`CandidateIndex`]; [`Ranker`] answers one query; [`retrieve`] runs a
//! query file through the ranker into a [`RankingLogger`].

pub mod index;
pub mod indexer;
pub mod logger;
pub mod ranker;
pub mod retrieval;
pub mod store;

pub use index::{new_index, CandidateIndex, FlatIndex, HnswIndex};
pub use indexer::{build_index, index_collection, open_index};
pub use logger::{RankingLogger, RANKING_FILE};
pub use ranker::Ranker;
pub use retrieval::{retrieve, RetrievalSummary, QUERY_BLOCK};
pub use store::DocumentStore;
