//! On-disk training inputs: id triples, query pools and collections.
//!
//! All three are tab-separated text files. Pools are loaded once and stay
//! read-only for the life of a batcher.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ColbertError, ColbertResult};

/// `(query id, positive id, negative id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub query: u64,
    pub positive: u64,
    pub negative: u64,
}

impl Triple {
    pub fn new(query: u64, positive: u64, negative: u64) -> Self {
        Self {
            query,
            positive,
            negative,
        }
    }
}

/// Load the triples owned by `rank`: every line with `line_idx % nranks == rank`.
///
/// The file is expected to be pre-shuffled, so the stride behaves like a
/// random split while staying reproducible for resume.
pub fn load_triples(path: &Path, rank: usize, nranks: usize) -> ColbertResult<Vec<Triple>> {
    if nranks == 0 || rank >= nranks {
        return Err(ColbertError::InvalidArgument {
            message: format!("rank {} invalid for nranks {}", rank, nranks),
        });
    }
    info!(path = %path.display(), rank, nranks, "Loading triples");

    let mut triples = Vec::new();
    for (line_idx, line) in read_lines(path)?.enumerate() {
        let line = line?;
        if line_idx % nranks != rank {
            continue;
        }
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        if fields.len() != 3 {
            return Err(contract(
                path,
                line_idx,
                format!("expected 3 tab-separated ids, found {} fields", fields.len()),
            ));
        }
        let query = parse_id(path, line_idx, fields[0])?;
        let positive = parse_id(path, line_idx, fields[1])?;
        let negative = parse_id(path, line_idx, fields[2])?;
        triples.push(Triple::new(query, positive, negative));
    }

    info!(count = triples.len(), "Loaded triples");
    Ok(triples)
}

/// `qid -> text`, remembering file order for retrieval.
#[derive(Debug, Clone, Default)]
pub struct Queries {
    order: Vec<u64>,
    texts: HashMap<u64, String>,
}

impl Queries {
    /// Load `qid \t text` lines. A repeated qid keeps its first position and
    /// its last text.
    pub fn load(path: &Path) -> ColbertResult<Self> {
        info!(path = %path.display(), "Loading queries");

        let mut queries = Self::default();
        for (line_idx, line) in read_lines(path)?.enumerate() {
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            let (qid, text) = line.split_once('\t').ok_or_else(|| {
                contract(path, line_idx, "expected `qid \\t text`".to_string())
            })?;
            let qid = parse_id(path, line_idx, qid)?;
            queries.insert(qid, text.to_string());
        }

        info!(count = queries.len(), "Loaded queries");
        Ok(queries)
    }

    pub fn insert(&mut self, qid: u64, text: String) {
        if self.texts.insert(qid, text).is_none() {
            self.order.push(qid);
        }
    }

    pub fn get(&self, qid: u64) -> Option<&str> {
        self.texts.get(&qid).map(String::as_str)
    }

    /// Text for `qid` or `MissingId`.
    pub fn resolve(&self, qid: u64, pool: &str) -> ColbertResult<&str> {
        self.get(qid).ok_or_else(|| ColbertError::MissingId {
            pool: pool.to_string(),
            id: qid,
        })
    }

    /// Qids in file order.
    pub fn qids(&self) -> &[u64] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.order
            .iter()
            .filter_map(move |qid| self.get(*qid).map(|text| (*qid, text)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl FromIterator<(u64, String)> for Queries {
    fn from_iter<I: IntoIterator<Item = (u64, String)>>(iter: I) -> Self {
        let mut queries = Self::default();
        for (qid, text) in iter {
            queries.insert(qid, text);
        }
        queries
    }
}

/// Passages addressed by their line index.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    passages: Vec<String>,
    has_header: bool,
}

impl Collection {
    /// Load `pid \t passage [\t title]` lines.
    ///
    /// A first line whose id column is the literal `id` is a header. It still
    /// occupies line 0, so data rows must carry `pid == line index`. Any other
    /// id fails the load. A third column is folded in as `title | passage`.
    pub fn load(path: &Path) -> ColbertResult<Self> {
        info!(path = %path.display(), "Loading collection");

        let mut passages = Vec::new();
        let mut has_header = false;
        for (line_idx, line) in read_lines(path)?.enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
            if fields.len() < 2 {
                return Err(contract(
                    path,
                    line_idx,
                    "expected `pid \\t passage [\\t title]`".to_string(),
                ));
            }

            if line_idx == 0 && fields[0] == "id" {
                has_header = true;
                passages.push(String::new());
                continue;
            }

            let pid = parse_id(path, line_idx, fields[0])?;
            if pid != line_idx as u64 {
                return Err(contract(
                    path,
                    line_idx,
                    format!("expected pid {}, found {}", line_idx, pid),
                ));
            }

            let passage = match fields.get(2).filter(|t| !t.is_empty()) {
                Some(title) => format!("{} | {}", title, fields[1]),
                None => fields[1].to_string(),
            };
            passages.push(passage);
        }

        let collection = Self {
            passages,
            has_header,
        };
        info!(count = collection.len(), has_header, "Loaded collection");
        Ok(collection)
    }

    /// Build from passages whose pids are `0..n`.
    pub fn from_passages(passages: Vec<String>) -> Self {
        Self {
            passages,
            has_header: false,
        }
    }

    pub fn get(&self, pid: u64) -> Option<&str> {
        if self.has_header && pid == 0 {
            return None;
        }
        self.passages.get(pid as usize).map(String::as_str)
    }

    pub fn resolve(&self, pid: u64, pool: &str) -> ColbertResult<&str> {
        self.get(pid).ok_or_else(|| ColbertError::MissingId {
            pool: pool.to_string(),
            id: pid,
        })
    }

    /// `(pid, passage)` in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        let skip = usize::from(self.has_header);
        self.passages
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(pid, p)| (pid as u64, p.as_str()))
    }

    /// Number of passages, excluding the header.
    pub fn len(&self) -> usize {
        self.passages.len() - usize::from(self.has_header)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_lines(path: &Path) -> ColbertResult<std::io::Lines<BufReader<File>>> {
    let file = File::open(path).map_err(|e| ColbertError::DataContract {
        path: path.to_path_buf(),
        line: 0,
        message: format!("cannot open: {}", e),
    })?;
    Ok(BufReader::new(file).lines())
}

fn parse_id(path: &Path, line_idx: usize, field: &str) -> ColbertResult<u64> {
    field
        .trim()
        .parse::<u64>()
        .map_err(|_| contract(path, line_idx, format!("`{}` is not an integer id", field)))
}

fn contract(path: &Path, line_idx: usize, message: String) -> ColbertError {
    ColbertError::DataContract {
        path: PathBuf::from(path),
        line: line_idx,
        message,
    }
}
