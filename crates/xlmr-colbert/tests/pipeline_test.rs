//! Tensorization, scoring and inference properties on the public API.

mod common;

use candle_core::{DType, Device, Tensor};
use xlmr_colbert::modeling::{score, DocEmbeddings};
use xlmr_colbert::tokenization::tensorize_triples;
use xlmr_colbert::training::{Collection, Queries};
use xlmr_colbert::{ColbertError, ModelInference, Tensorize, TokenizedBatch};

fn ids(t: &Tensor) -> Vec<Vec<u32>> {
    t.to_vec2::<u32>().unwrap()
}

#[test]
fn test_two_triple_scenario_pairs_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let (qt, dt) = common::tokenizers(tmp.path(), 6, 10);

    let triples = [(0u64, 0u64, 1u64), (1, 1, 0)];
    let queries: Queries = [(0, "a".to_string()), (1, "b".to_string())].into_iter().collect();
    let collection = Collection::from_passages(vec!["doc0".to_string(), "doc1".to_string()]);

    let q_texts: Vec<&str> = triples.iter().map(|t| queries.get(t.0).unwrap()).collect();
    let pos: Vec<&str> = triples.iter().map(|t| collection.get(t.1).unwrap()).collect();
    let neg: Vec<&str> = triples.iter().map(|t| collection.get(t.2).unwrap()).collect();

    let batches = tensorize_triples(&qt, &dt, &q_texts, &pos, &neg, Some(2)).unwrap();
    assert_eq!(batches.len(), 1);
    let (q, d) = &batches[0];
    assert_eq!(q.len(), 4);
    assert_eq!(d.len(), 4);

    // a=7, b=8, doc0=10, doc1=11; token 2 of each row is the first word.
    let q_words: Vec<u32> = ids(&q.ids).iter().map(|r| r[2]).collect();
    let d_words: Vec<u32> = ids(&d.ids).iter().map(|r| r[2]).collect();
    assert_eq!(&q_words[..2], &q_words[2..]);
    for (row, (&qw, &dw)) in q_words.iter().zip(&d_words).enumerate() {
        let expected = match (qw, row < 2) {
            (7, true) | (8, false) => 10,
            (7, false) | (8, true) => 11,
            other => panic!("unexpected query token {:?}", other),
        };
        assert_eq!(dw, expected, "row {}", row);
    }
}

/// Token ids of `row` without padding.
fn real_tokens(batch: &TokenizedBatch, row: usize) -> Vec<u32> {
    let ids = ids(&batch.ids);
    let mask = batch.mask.to_vec2::<u32>().unwrap();
    ids[row]
        .iter()
        .zip(&mask[row])
        .filter(|(_, m)| **m > 0)
        .map(|(id, _)| *id)
        .collect()
}

#[test]
fn test_sorted_sub_batches_keep_triples_together() {
    let tmp = tempfile::tempdir().unwrap();
    let (qt, dt) = common::tokenizers(tmp.path(), 6, 10);

    // max(len(pos), len(neg)) in words: 5, 2, 3, 1, 4, 6.
    let queries = ["a", "b", "c", "a b", "b c", "c a"];
    let positives = ["the cat sat on mat", "mat", "the cat sat", "doc2", "on the mat", "a b c doc0 doc1 doc2"];
    let negatives = ["doc0", "doc0 doc1", "on", "cat", "doc1 doc2 the mat", "sat"];
    let bsize = 2;

    let batches = tensorize_triples(&qt, &dt, &queries, &positives, &negatives, Some(bsize)).unwrap();
    assert_eq!(batches.len(), 3);

    let expected_query: Vec<Vec<u32>> = queries
        .iter()
        .map(|q| real_tokens(&qt.tensorize(&[*q]).unwrap(), 0))
        .collect();
    let expected_doc = |text: &str| real_tokens(&dt.tensorize(&[text]).unwrap(), 0);

    let mut seen = Vec::new();
    for (q, d) in &batches {
        assert_eq!(q.len(), 2 * bsize);
        assert_eq!(d.len(), 2 * bsize);
        for i in 0..bsize {
            let query = real_tokens(q, i);
            assert_eq!(real_tokens(q, i + bsize), query);
            let t = expected_query
                .iter()
                .position(|e| *e == query)
                .expect("query row comes from an input triple");
            assert_eq!(real_tokens(d, i), expected_doc(positives[t]), "positive of triple {}", t);
            assert_eq!(real_tokens(d, i + bsize), expected_doc(negatives[t]), "negative of triple {}", t);
            seen.push(t);
        }
    }
    assert_eq!(seen, vec![3, 1, 2, 4, 0, 5]);
}

#[test]
fn test_sub_batch_sizes_when_bsize_divides() {
    let tmp = tempfile::tempdir().unwrap();
    let (qt, dt) = common::tokenizers(tmp.path(), 6, 10);
    let queries = ["a", "b", "c", "a b", "b c", "c a"];
    let positives = ["doc0", "doc1 the", "doc2", "cat", "sat on the mat", "mat"];
    let negatives = ["doc1", "doc2", "the cat sat", "doc0", "doc0", "on"];

    let batches = tensorize_triples(&qt, &dt, &queries, &positives, &negatives, Some(3)).unwrap();
    assert_eq!(batches.len(), 2);
    for (q, d) in &batches {
        assert_eq!(q.len(), 6);
        assert_eq!(d.len(), 6);
    }
}

#[test]
fn test_score_all_ones_mask_equals_no_mask() {
    let q = Tensor::new(&[[1.0f32, 0.0], [0.6, 0.8]], &Device::Cpu).unwrap();
    let d = Tensor::new(
        &[[[0.0f32, 1.0], [1.0, 0.0], [0.8, 0.6]], [[0.6, 0.8], [0.0, 0.0], [0.0, 1.0]]],
        &Device::Cpu,
    )
    .unwrap();
    let ones = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();

    let masked = score(&q, &d, Some(&ones), None, false, DType::F32).unwrap();
    let plain = score(&q, &d, None, None, false, DType::F32).unwrap();
    assert_eq!(masked, plain);
}

#[test]
fn test_single_token_score_is_dot_product() {
    let q = Tensor::new(&[[0.3f32, 0.4, 0.5]], &Device::Cpu).unwrap();
    let d = Tensor::new(&[[[0.3f32, 0.4, 0.5]]], &Device::Cpu).unwrap();
    let scores = score(&q, &d, None, None, false, DType::F32).unwrap();
    assert!((scores[0] - 0.5).abs() < 1e-6);
}

#[test]
fn test_score_rejects_mask_with_lengths() {
    let q = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
    let d = Tensor::ones((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
    let mask = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
    let err = score(&q, &d, Some(&mask), Some(&[3]), false, DType::F32).unwrap_err();
    assert!(matches!(err, ColbertError::MutuallyExclusive { .. }));
}

#[test]
fn test_doc_from_text_order_independent_of_bsize() {
    let tmp = tempfile::tempdir().unwrap();
    let config = common::lookup_config(tmp.path());
    let inference = ModelInference::from_config(&config, &Device::Cpu).unwrap();
    let docs = ["the cat sat on the mat", "a", "doc0 doc1", "b c a b", "mat", "doc2 the"];

    let reference = inference.doc_from_text(&docs, None, true).unwrap().into_padded().unwrap();
    for bsize in [1, 2, 4, 5, 6, 9] {
        let batched = inference
            .doc_from_text(&docs, Some(bsize), true)
            .unwrap()
            .into_padded()
            .unwrap();
        assert_eq!(batched.dims(), reference.dims(), "bsize {}", bsize);
        let diff: f32 = (&batched - &reference)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "bsize {} differs by {}", bsize, diff);
    }

    let ragged = match inference.doc_from_text(&docs, Some(4), false).unwrap() {
        DocEmbeddings::Ragged(rows) => rows,
        DocEmbeddings::Padded(_) => panic!("expected ragged output"),
    };
    // <s> [D] words </s>
    let lengths: Vec<usize> = ragged.iter().map(|t| t.dims()[0]).collect();
    assert_eq!(lengths, vec![9, 4, 5, 7, 4, 5]);
}

#[test]
fn test_collection_header_with_non_sequential_ids_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let path = common::write_file(tmp.path(), "collection.tsv", "id\tpassage\n4\tdoc0\n9\tdoc1\n");
    let err = Collection::load(&path).unwrap_err();
    assert!(matches!(err, ColbertError::DataContract { line: 1, .. }));
}
