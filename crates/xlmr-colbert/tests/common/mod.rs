//! Shared fixtures: a word-level tokenizer on disk, small data files and a
//! lookup-backbone configuration that runs on CPU.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use xlmr_colbert::config::{BackboneKind, IndexKind};
use xlmr_colbert::{ColbertConfig, ColbertTokenizer, DocTokenizer, QueryTokenizer};

/// Vocabulary of the test tokenizer; the id of a word is its position.
pub const VOCAB: &[&str] = &[
    "<s>", "<pad>", "</s>", "<unk>", "<mask>", "[Q]", "[D]", "a", "b", "c", "doc0", "doc1",
    "doc2", "the", "cat", "sat", "on", "mat", ".", ",", "!", "?",
];

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

/// Whitespace WordLevel `tokenizer.json` over [`VOCAB`].
pub fn write_tokenizer(dir: &Path) -> PathBuf {
    let vocab: Vec<String> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, w)| format!("{:?}: {}", w, i))
        .collect();
    let json = format!(
        r#"{{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {{"type": "WhitespaceSplit"}},
            "post_processor": null,
            "decoder": null,
            "model": {{"type": "WordLevel", "vocab": {{{}}}, "unk_token": "<unk>"}}
        }}"#,
        vocab.join(", ")
    );
    write_file(dir, "tokenizer.json", &json)
}

pub fn tokenizers(dir: &Path, query_maxlen: usize, doc_maxlen: usize) -> (QueryTokenizer, DocTokenizer) {
    let path = write_tokenizer(dir);
    let tokenizer = Arc::new(ColbertTokenizer::from_file(path, "[Q]", "[D]").expect("tokenizer"));
    (
        QueryTokenizer::new(tokenizer.clone(), query_maxlen).expect("query tokenizer"),
        DocTokenizer::new(tokenizer, doc_maxlen).expect("doc tokenizer"),
    )
}

/// Lookup-backbone configuration with bilingual data files under `dir`.
///
/// Both languages share ids; language B uses different words so that
/// either draw produces a valid text.
pub fn lookup_config(dir: &Path) -> ColbertConfig {
    let mut config = ColbertConfig::default();

    config.model.tokenizer = write_tokenizer(dir);
    config.model.backbone = BackboneKind::Lookup;
    config.model.lookup_hidden = 16;
    config.model.dim = 8;
    config.model.query_maxlen = 6;
    config.model.doc_maxlen = 10;

    config.training.bsize = 2;
    config.training.accumsteps = 1;
    config.training.lr = 1e-2;
    config.training.maxsteps = 4;
    config.training.checkpoint_every = 2;
    config.training.saved_checkpoints = vec![3];
    config.training.output_dir = dir.join("run");

    config.data.triples = Some(write_file(dir, "triples.tsv", "0\t0\t1\n1\t1\t0\n2\t2\t0\n0\t2\t1\n1\t0\t2\n2\t1\t2\n0\t0\t2\n1\t1\t2\n"));
    config.data.queries_lang_a = Some(write_file(dir, "queries.a.tsv", "0\ta\n1\tb\n2\tc\n"));
    config.data.queries_lang_b = Some(write_file(dir, "queries.b.tsv", "0\ta b\n1\tb c\n2\tc a\n"));
    config.data.collection_lang_a = Some(write_file(
        dir,
        "collection.a.tsv",
        "0\tdoc0 the cat\n1\tdoc1 sat on\n2\tdoc2 mat\n",
    ));
    config.data.collection_lang_b = Some(write_file(
        dir,
        "collection.b.tsv",
        "0\tthe cat doc0\n1\tsat on doc1\n2\tmat doc2\n",
    ));

    config.retrieval.index_kind = IndexKind::Flat;
    config.retrieval.faiss_depth = 4;
    config.retrieval.depth = 2;
    config.retrieval.index_bsize = 2;

    config
}
