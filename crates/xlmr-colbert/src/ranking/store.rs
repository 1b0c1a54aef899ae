//! Per-token document embeddings kept for exact re-scoring.
//!
//! Documents are stored back to back in one row-major buffer. Document `i`
//! owns rows `offsets[i] .. offsets[i] + doclens[i]`; the embedding id of a
//! row is its position in the buffer, which is also its id in the
//! candidate index.
//!
//! On disk:
//!
//! ```text
//! <dir>/embeddings.safetensors   "embeddings": (rows, dim) f32
//! <dir>/store.json               dim, doclens, pids
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ColbertError, ColbertResult};

use super::index::CandidateIndex;

pub const EMBEDDINGS_FILE: &str = "embeddings.safetensors";
pub const STORE_METADATA_FILE: &str = "store.json";
const EMBEDDINGS_KEY: &str = "embeddings";

#[derive(Debug, Serialize, Deserialize)]
struct StoreMetadata {
    dim: usize,
    doclens: Vec<usize>,
    pids: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    dim: usize,
    embeddings: Vec<f32>,
    doclens: Vec<usize>,
    offsets: Vec<usize>,
    pids: Vec<u64>,
    emb2doc: Vec<usize>,
}

impl DocumentStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            embeddings: Vec::new(),
            doclens: Vec::new(),
            offsets: Vec::new(),
            pids: Vec::new(),
            emb2doc: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_docs(&self) -> usize {
        self.doclens.len()
    }

    pub fn num_embeddings(&self) -> usize {
        self.emb2doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doclens.is_empty()
    }

    pub fn doclens(&self) -> &[usize] {
        &self.doclens
    }

    /// Collection id of the document at `doc`.
    pub fn pid(&self, doc: usize) -> Option<u64> {
        self.pids.get(doc).copied()
    }

    /// Document owning embedding `emb`.
    pub fn doc_of_embedding(&self, emb: usize) -> Option<usize> {
        self.emb2doc.get(emb).copied()
    }

    /// Rows of embeddings starting at embedding id `start`.
    pub fn embedding_rows(&self, start: usize) -> &[f32] {
        let from = (start * self.dim).min(self.embeddings.len());
        &self.embeddings[from..]
    }

    /// Append one document's `(len, dim)` embeddings. A zero-length
    /// document is kept so that document positions stay aligned with pids.
    pub fn add_document(&mut self, pid: u64, embeddings: &Tensor) -> ColbertResult<()> {
        let (len, dim) = embeddings
            .dims2()
            .map_err(ColbertError::tensor("document embedding shape"))?;
        if dim != self.dim {
            return Err(ColbertError::LengthMismatch {
                context: "DocumentStore::add_document dim",
                lengths: vec![self.dim, dim],
            });
        }
        let values = embeddings
            .to_device(&Device::Cpu)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(ColbertError::tensor("document embeddings to host"))?;

        let doc = self.doclens.len();
        self.offsets.push(self.emb2doc.len());
        self.doclens.push(len);
        self.pids.push(pid);
        self.emb2doc.extend(std::iter::repeat(doc).take(len));
        self.embeddings.extend_from_slice(&values);
        Ok(())
    }

    /// Padded `(docs.len(), max_len, dim)` tensor of the given documents
    /// plus their lengths, in the order given.
    pub fn candidates(&self, docs: &[usize], device: &Device) -> ColbertResult<(Tensor, Vec<u32>)> {
        let max_len = docs
            .iter()
            .map(|&d| self.doclens.get(d).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ColbertError::InvalidArgument {
                message: format!("candidate outside store of {} documents", self.num_docs()),
            })?
            .into_iter()
            .max()
            .unwrap_or(0);

        let mut values = vec![0.0f32; docs.len() * max_len * self.dim];
        let mut lengths = Vec::with_capacity(docs.len());
        for (row, &doc) in docs.iter().enumerate() {
            let len = self.doclens[doc];
            let src = &self.embeddings[self.offsets[doc] * self.dim..(self.offsets[doc] + len) * self.dim];
            let dst = row * max_len * self.dim;
            values[dst..dst + src.len()].copy_from_slice(src);
            lengths.push(len as u32);
        }

        let tensor = Tensor::from_vec(values, (docs.len(), max_len, self.dim), device)
            .map_err(ColbertError::tensor("candidate tensor"))?;
        Ok((tensor, lengths))
    }

    /// Insert every stored embedding not yet in `index`.
    pub fn fill_index(&self, index: &mut dyn CandidateIndex) -> ColbertResult<usize> {
        let start = index.len();
        let rows = self.embedding_rows(start);
        index.add(rows)?;
        Ok(self.num_embeddings() - start)
    }

    pub fn save(&self, dir: &Path) -> ColbertResult<()> {
        fs::create_dir_all(dir)?;

        let embeddings = Tensor::from_slice(&self.embeddings, (self.num_embeddings(), self.dim), &Device::Cpu)
            .map_err(ColbertError::tensor("store embeddings"))?;
        let path = dir.join(EMBEDDINGS_FILE);
        candle_core::safetensors::save(
            &std::collections::HashMap::from([(EMBEDDINGS_KEY.to_string(), embeddings)]),
            &path,
        )
        .map_err(ColbertError::tensor(format!("save {}", path.display())))?;

        let metadata = StoreMetadata {
            dim: self.dim,
            doclens: self.doclens.clone(),
            pids: self.pids.clone(),
        };
        let file = File::create(dir.join(STORE_METADATA_FILE))?;
        serde_json::to_writer(BufWriter::new(file), &metadata)?;

        info!(
            dir = %dir.display(),
            docs = self.num_docs(),
            embeddings = self.num_embeddings(),
            "Saved document store"
        );
        Ok(())
    }

    pub fn load(dir: &Path) -> ColbertResult<Self> {
        let meta_path = dir.join(STORE_METADATA_FILE);
        let file = File::open(&meta_path).map_err(|e| ColbertError::Index {
            message: format!("Failed to open {}: {}", meta_path.display(), e),
        })?;
        let metadata: StoreMetadata = serde_json::from_reader(BufReader::new(file))?;
        if metadata.doclens.len() != metadata.pids.len() {
            return Err(ColbertError::LengthMismatch {
                context: "store.json doclens/pids",
                lengths: vec![metadata.doclens.len(), metadata.pids.len()],
            });
        }

        let path = dir.join(EMBEDDINGS_FILE);
        let tensors = candle_core::safetensors::load(&path, &Device::Cpu)
            .map_err(ColbertError::tensor(format!("load {}", path.display())))?;
        let embeddings = tensors.get(EMBEDDINGS_KEY).ok_or_else(|| ColbertError::Index {
            message: format!("{} has no '{}' tensor", path.display(), EMBEDDINGS_KEY),
        })?;

        let mut store = Self::new(metadata.dim);
        let mut start = 0;
        for (len, pid) in metadata.doclens.iter().zip(metadata.pids.iter()) {
            let rows = embeddings
                .narrow(0, start, *len)
                .map_err(|_| ColbertError::Index {
                    message: format!(
                        "{} holds fewer rows than store.json doclens require",
                        path.display()
                    ),
                })?;
            store.add_document(*pid, &rows)?;
            start += len;
        }
        if start != embeddings.dims()[0] {
            return Err(ColbertError::LengthMismatch {
                context: "store embeddings rows vs doclens",
                lengths: vec![embeddings.dims()[0], start],
            });
        }

        info!(dir = %dir.display(), docs = store.num_docs(), "Loaded document store");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::index::FlatIndex;

    fn doc(rows: &[[f32; 2]]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), 2), &Device::Cpu).unwrap()
    }

    fn store() -> DocumentStore {
        let mut store = DocumentStore::new(2);
        store.add_document(10, &doc(&[[1.0, 0.0], [0.0, 1.0]])).unwrap();
        store.add_document(11, &doc(&[[0.6, 0.8]])).unwrap();
        store.add_document(12, &doc(&[[0.0, 1.0], [1.0, 0.0], [0.6, 0.8]])).unwrap();
        store
    }

    #[test]
    fn test_embedding_to_document_map() {
        let store = store();
        assert_eq!(store.num_docs(), 3);
        assert_eq!(store.num_embeddings(), 6);
        assert_eq!(store.doc_of_embedding(2), Some(1));
        assert_eq!(store.doc_of_embedding(5), Some(2));
        assert_eq!(store.doc_of_embedding(6), None);
        assert_eq!(store.pid(2), Some(12));
    }

    #[test]
    fn test_candidates_pad_to_longest_in_given_order() {
        let store = store();
        let (t, lengths) = store.candidates(&[1, 0], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 2, 2]);
        assert_eq!(lengths, vec![1, 2]);
        let rows = t.to_vec3::<f32>().unwrap();
        assert_eq!(rows[0], vec![vec![0.6, 0.8], vec![0.0, 0.0]]);
        assert_eq!(rows[1][1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_unknown_candidate_rejected() {
        assert!(store().candidates(&[3], &Device::Cpu).is_err());
    }

    #[test]
    fn test_wrong_dim_rejected() {
        let mut store = DocumentStore::new(3);
        assert!(matches!(
            store.add_document(0, &doc(&[[1.0, 0.0]])),
            Err(ColbertError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_fill_index_is_incremental() {
        let mut store = store();
        let mut index = FlatIndex::new(2).unwrap();
        assert_eq!(store.fill_index(&mut index).unwrap(), 6);
        store.add_document(13, &doc(&[[1.0, 0.0]])).unwrap();
        assert_eq!(store.fill_index(&mut index).unwrap(), 1);
        assert_eq!(index.len(), 7);
    }

    #[test]
    fn test_save_load_preserves_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store();
        store.save(tmp.path()).unwrap();

        let loaded = DocumentStore::load(tmp.path()).unwrap();
        assert_eq!(loaded.doclens(), store.doclens());
        assert_eq!(loaded.pid(1), Some(11));
        assert_eq!(loaded.embedding_rows(5), &[0.6, 0.8]);
    }
}
