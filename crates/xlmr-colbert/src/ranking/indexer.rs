//! Collection encoding into a [`DocumentStore`] and a candidate index.

use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::RetrievalConfig;
use crate::error::ColbertResult;
use crate::modeling::ModelInference;
use crate::training::data::Collection;

use super::index::{new_index, CandidateIndex};
use super::store::DocumentStore;

/// Encode every passage of `collection` and save the store under `dir`.
///
/// Passages go through the inference driver `index_bsize` at a time in
/// ragged layout, so only kept token positions are stored.
pub fn index_collection(
    inference: &ModelInference,
    collection: &Collection,
    config: &RetrievalConfig,
    dir: &Path,
) -> ColbertResult<DocumentStore> {
    let started = Instant::now();
    let mut store = DocumentStore::new(inference.colbert().dim());

    let passages: Vec<(u64, &str)> = collection.iter().collect();
    for (chunk_idx, chunk) in passages.chunks(config.index_bsize).enumerate() {
        let texts: Vec<&str> = chunk.iter().map(|(_, text)| *text).collect();
        let embeddings = inference
            .doc_from_text(&texts, Some(config.index_bsize), false)?
            .into_ragged()?;
        for ((pid, _), d) in chunk.iter().zip(embeddings.iter()) {
            store.add_document(*pid, d)?;
        }
        debug!(
            chunk = chunk_idx,
            docs = store.num_docs(),
            embeddings = store.num_embeddings(),
            "Encoded chunk"
        );
    }

    store.save(dir)?;
    info!(
        docs = store.num_docs(),
        embeddings = store.num_embeddings(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Indexed collection"
    );
    Ok(store)
}

/// Build the configured candidate index over every embedding in `store`.
pub fn build_index(
    store: &DocumentStore,
    config: &RetrievalConfig,
) -> ColbertResult<Box<dyn CandidateIndex>> {
    let started = Instant::now();
    let mut index = new_index(config, store.dim(), store.num_embeddings())?;
    let added = store.fill_index(index.as_mut())?;
    info!(
        kind = ?config.index_kind,
        vectors = added,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Built candidate index"
    );
    Ok(index)
}

/// Load a saved store and rebuild its candidate index.
pub fn open_index(
    dir: &Path,
    config: &RetrievalConfig,
) -> ColbertResult<(DocumentStore, Box<dyn CandidateIndex>)> {
    let store = DocumentStore::load(dir)?;
    let index = build_index(&store, config)?;
    Ok((store, index))
}
