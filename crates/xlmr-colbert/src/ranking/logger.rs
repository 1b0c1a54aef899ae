//! `ranking.tsv` writer.
//!
//! One line per ranked document: `qid \t pid \t rank` with a 1-based rank,
//! plus `\t score` when scores are logged. A query with no candidates
//! writes no lines but still counts as a ranking block.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::ColbertResult;

pub const RANKING_FILE: &str = "ranking.tsv";

pub struct RankingLogger {
    path: PathBuf,
    writer: BufWriter<File>,
    log_scores: bool,
    blocks: usize,
}

impl RankingLogger {
    /// Create `<dir>/ranking.tsv`, truncating an existing file.
    pub fn create(dir: &Path, log_scores: bool) -> ColbertResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(RANKING_FILE);
        let writer = BufWriter::new(File::create(&path)?);
        info!(path = %path.display(), "Logging rankings");
        Ok(Self {
            path,
            writer,
            log_scores,
            blocks: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ranking blocks written so far.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Record the ranking of `qid`, already sorted best first, as
    /// `(score, pid)` pairs.
    pub fn log(&mut self, qid: u64, ranking: &[(f32, u64)]) -> ColbertResult<()> {
        for (rank, (score, pid)) in ranking.iter().enumerate() {
            if self.log_scores {
                writeln!(self.writer, "{}\t{}\t{}\t{}", qid, pid, rank + 1, score)?;
            } else {
                writeln!(self.writer, "{}\t{}\t{}", qid, pid, rank + 1)?;
            }
        }
        self.blocks += 1;
        Ok(())
    }

    /// Flush and return the file path with the number of blocks logged.
    pub fn finish(mut self) -> ColbertResult<(PathBuf, usize)> {
        self.writer.flush()?;
        info!(path = %self.path.display(), queries = self.blocks, "Ranking log complete");
        Ok((self.path, self.blocks))
    }
}
