//! First-stage candidate indexes over document token vectors.
//!
//! Vectors are identified by their insertion order (the embedding id used
//! by [`super::DocumentStore`]). Both the input to [`CandidateIndex::add`]
//! and the queries to [`CandidateIndex::search`] are row-major `f32`
//! slices whose length is a multiple of the index dimension.

use candle_core::{Device, Tensor};
use hnsw_rs::hnsw::Hnsw;
use hnsw_rs::prelude::*;
use tracing::{debug, info};

use crate::config::{IndexKind, RetrievalConfig};
use crate::error::{ColbertError, ColbertResult};

/// hnsw_rs refuses more layers than this.
const HNSW_MAX_LAYER: usize = 16;

/// Token-vector nearest-neighbour search returning embedding ids.
pub trait CandidateIndex: Send + Sync {
    fn dim(&self) -> usize;

    /// Number of vectors indexed.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append vectors. Their ids continue from `len()`.
    fn add(&mut self, vectors: &[f32]) -> ColbertResult<()>;

    /// Up to `k` embedding ids per query row, best first.
    fn search(&self, queries: &[f32], k: usize) -> ColbertResult<Vec<Vec<usize>>>;
}

/// Build an empty index of the configured kind.
pub fn new_index(
    config: &RetrievalConfig,
    dim: usize,
    capacity: usize,
) -> ColbertResult<Box<dyn CandidateIndex>> {
    match config.index_kind {
        IndexKind::Flat => Ok(Box::new(FlatIndex::new(dim)?)),
        IndexKind::Hnsw => Ok(Box::new(HnswIndex::new(
            dim,
            config.hnsw_m,
            config.hnsw_ef_construction,
            config.hnsw_ef_search,
            capacity,
        )?)),
    }
}

fn row_count(data: &[f32], dim: usize, what: &str) -> ColbertResult<usize> {
    if dim == 0 || data.len() % dim != 0 {
        return Err(ColbertError::Index {
            message: format!("{} has {} values, not a multiple of dim {}", what, data.len(), dim),
        });
    }
    Ok(data.len() / dim)
}

// ============================================================================
// FLAT
// ============================================================================

/// Brute-force inner-product search.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dim: usize,
    vectors: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> ColbertResult<Self> {
        if dim == 0 {
            return Err(ColbertError::Index {
                message: "index dimension must be > 0".to_string(),
            });
        }
        Ok(Self {
            dim,
            vectors: Vec::new(),
        })
    }
}

impl CandidateIndex for FlatIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.vectors.len() / self.dim
    }

    fn add(&mut self, vectors: &[f32]) -> ColbertResult<()> {
        row_count(vectors, self.dim, "flat insert")?;
        self.vectors.extend_from_slice(vectors);
        Ok(())
    }

    fn search(&self, queries: &[f32], k: usize) -> ColbertResult<Vec<Vec<usize>>> {
        let rows = row_count(queries, self.dim, "flat query")?;
        let n = self.len();
        if n == 0 || rows == 0 || k == 0 {
            return Ok(vec![Vec::new(); rows]);
        }

        let q = Tensor::from_slice(queries, (rows, self.dim), &Device::Cpu)
            .map_err(ColbertError::tensor("flat queries"))?;
        let v = Tensor::from_slice(&self.vectors, (n, self.dim), &Device::Cpu)
            .map_err(ColbertError::tensor("flat vectors"))?;
        let scores = q
            .matmul(&v.t().map_err(ColbertError::tensor("flat transpose"))?)
            .and_then(|s| s.to_vec2::<f32>())
            .map_err(ColbertError::tensor("flat inner products"))?;

        Ok(scores
            .iter()
            .map(|row| {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
                order.truncate(k);
                order
            })
            .collect())
    }
}

// ============================================================================
// HNSW
// ============================================================================

/// Approximate cosine search backed by `hnsw_rs`.
pub struct HnswIndex {
    inner: Hnsw<'static, f32, DistCosine>,
    dim: usize,
    len: usize,
    ef_search: usize,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dim", &self.dim)
            .field("len", &self.len)
            .field("ef_search", &self.ef_search)
            .finish()
    }
}

impl HnswIndex {
    /// `capacity` is a sizing hint; the graph grows past it.
    pub fn new(
        dim: usize,
        m: usize,
        ef_construction: usize,
        ef_search: usize,
        capacity: usize,
    ) -> ColbertResult<Self> {
        if dim == 0 || m == 0 || ef_construction == 0 {
            return Err(ColbertError::Index {
                message: format!(
                    "invalid HNSW parameters: dim={}, m={}, ef_construction={}",
                    dim, m, ef_construction
                ),
            });
        }
        info!(dim, m, ef_construction, capacity, "Creating HNSW index");
        let inner = Hnsw::<f32, DistCosine>::new(
            m,
            capacity.max(1),
            HNSW_MAX_LAYER,
            ef_construction,
            DistCosine {},
        );
        Ok(Self {
            inner,
            dim,
            len: 0,
            ef_search,
        })
    }
}

impl CandidateIndex for HnswIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.len
    }

    fn add(&mut self, vectors: &[f32]) -> ColbertResult<()> {
        let rows = row_count(vectors, self.dim, "hnsw insert")?;
        let items: Vec<(&[f32], usize)> = vectors
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, v)| (v, self.len + i))
            .collect();
        self.inner.parallel_insert_slice(&items);
        self.len += rows;
        debug!(inserted = rows, total = self.len, "HNSW insert");
        Ok(())
    }

    fn search(&self, queries: &[f32], k: usize) -> ColbertResult<Vec<Vec<usize>>> {
        let rows = row_count(queries, self.dim, "hnsw query")?;
        if self.len == 0 || k == 0 {
            return Ok(vec![Vec::new(); rows]);
        }
        let ef = self.ef_search.max(k);
        Ok(queries
            .chunks_exact(self.dim)
            .map(|q| {
                let mut neighbours = self.inner.search(q, k, ef);
                neighbours.sort_by(|a, b| a.distance.total_cmp(&b.distance));
                neighbours.into_iter().map(|n| n.d_id).collect()
            })
            .collect())
    }
}
