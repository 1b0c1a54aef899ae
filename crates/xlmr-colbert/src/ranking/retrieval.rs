//! End-to-end retrieval over a query file.

use std::path::PathBuf;
use std::time::Instant;

use tracing::info;

use crate::error::ColbertResult;
use crate::training::data::Queries;

use super::logger::RankingLogger;
use super::ranker::Ranker;

/// Queries handled between two rounds of ranking-log writes.
pub const QUERY_BLOCK: usize = 100;

#[derive(Debug, Clone)]
pub struct RetrievalSummary {
    pub queries: usize,
    /// Queries for which at least one candidate was found.
    pub answered: usize,
    /// Mean `encode` + `rank` latency.
    pub avg_latency_ms: f64,
    pub ranking_path: PathBuf,
}

/// Rank every query in file order and log the top `depth` of each.
///
/// Queries without candidates still get an (empty) ranking block.
pub fn retrieve(
    ranker: &Ranker,
    queries: &Queries,
    depth: usize,
    mut logger: RankingLogger,
) -> ColbertResult<RetrievalSummary> {
    let qids = queries.qids();
    let mut milliseconds = 0.0f64;
    let mut answered = 0;

    for (block_idx, block) in qids.chunks(QUERY_BLOCK).enumerate() {
        let offset = block_idx * QUERY_BLOCK;
        let mut rankings = Vec::with_capacity(block.len());

        for (i, &qid) in block.iter().enumerate() {
            let query_idx = offset + i;
            let text = queries.resolve(qid, "queries")?;

            let started = Instant::now();
            let q = ranker.encode(&[text])?;
            let (pids, scores) = ranker.rank(&q)?;
            milliseconds += started.elapsed().as_secs_f64() * 1000.0;

            if let (Some(&best_pid), Some(&best_score)) = (pids.first(), scores.first()) {
                answered += 1;
                info!(
                    query_idx,
                    query = text,
                    candidates = pids.len(),
                    best_pid,
                    best_score,
                    avg_ms = milliseconds / (query_idx + 1) as f64,
                    "Ranked query"
                );
            }

            let ranking: Vec<(f32, u64)> = scores
                .into_iter()
                .zip(pids)
                .take(depth)
                .collect();
            rankings.push(ranking);
        }

        for (i, (&qid, ranking)) in block.iter().zip(&rankings).enumerate() {
            let query_idx = offset + i;
            if query_idx % QUERY_BLOCK == 0 {
                info!(query_idx, qid, "Logging query");
            }
            logger.log(qid, ranking)?;
        }
    }

    let (ranking_path, logged) = logger.finish()?;
    Ok(RetrievalSummary {
        queries: logged,
        answered,
        avg_latency_ms: if logged > 0 {
            milliseconds / logged as f64
        } else {
            0.0
        },
        ranking_path,
    })
}
