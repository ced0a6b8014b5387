use ndarray::Array3;
use proptest::prelude::*;
use tagger::mask::{label_masks, length_mask, sentence_lengths, word_masks};

fn aux_from_rows(rows: &[Vec<bool>], dim: usize) -> Array3<f32> {
    let len = rows.first().map_or(0, Vec::len);
    Array3::from_shape_fn((rows.len(), len, dim), |(b, t, e)| {
        if rows[b][t] && e == t % dim { 0.5 + e as f32 } else { 0.0 }
    })
}

proptest! {
    #[test]
    fn prop_lengths_count_nonzero_rows(rows in prop::collection::vec(prop::collection::vec(any::<bool>(), 6), 1..5)) {
        let aux = aux_from_rows(&rows, 3);
        let expected: Vec<usize> = rows.iter().map(|r| r.iter().filter(|&&x| x).count()).collect();
        prop_assert_eq!(sentence_lengths(&aux), expected);
    }

    #[test]
    fn prop_scaling_aux_keeps_lengths(
        rows in prop::collection::vec(prop::collection::vec(any::<bool>(), 5), 1..4),
        scale in 0.01f32..100.0,
    ) {
        let aux = aux_from_rows(&rows, 2);
        prop_assert_eq!(sentence_lengths(&aux), sentence_lengths(&(&aux * scale)));
    }
}

#[test]
fn test_zero_rows_do_not_count() {
    let mut aux = Array3::<f32>::zeros((1, 4, 2));
    aux[[0, 0, 0]] = 1.0;
    assert_eq!(sentence_lengths(&aux), vec![1]);
    // a negative feature still marks a real token
    aux[[0, 2, 1]] = -3.0;
    assert_eq!(sentence_lengths(&aux), vec![2]);
}

#[test]
fn test_word_masks_use_padding_id() {
    let mut chars = Array3::<usize>::zeros((1, 2, 4));
    chars[[0, 0, 0]] = 5;
    chars[[0, 0, 1]] = 1;
    let masks = word_masks(&chars, 0);
    assert_eq!(masks.row(0).to_vec(), vec![1.0, 1.0, 0.0, 0.0]);
    assert!(masks.row(1).iter().all(|&x| x == 0.0));
}

#[test]
fn test_label_and_length_masks() {
    let mut labels = Array3::<f32>::zeros((1, 3, 2));
    labels[[0, 1, 1]] = 1.0;
    assert_eq!(label_masks(&labels).row(0).to_vec(), vec![0.0, 1.0, 0.0]);
    assert_eq!(length_mask(&[2], 3).row(0).to_vec(), vec![1.0, 1.0, 0.0]);
}
