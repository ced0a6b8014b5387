use ndarray::Array2;
use proptest::prelude::*;
use tagger::gradient_clipping::global_norm;
use tagger::{GlobalNormClipping, GradientClipping};

fn grads_from(values: &[f32], scale: f32) -> Vec<Vec<Array2<f32>>> {
    let (head, tail) = values.split_at(values.len() / 2);
    vec![
        vec![Array2::from_shape_vec((1, head.len()), head.iter().map(|v| v * scale).collect()).unwrap()],
        vec![
            Array2::from_shape_vec((tail.len(), 1), tail.iter().map(|v| v * scale).collect()).unwrap(),
            Array2::from_elem((2, 2), scale),
        ],
    ]
}

proptest! {
    #[test]
    fn clipped_norm_never_exceeds_limit(
        values in prop::collection::vec(-1.0f32..1.0, 2..40),
        scale in prop_oneof![Just(1e-3f32), Just(1.0), Just(1e3), Just(1e6)],
    ) {
        let mut grads = grads_from(&values, scale);
        let mut clipping = GlobalNormClipping::new(10.0);
        let before = global_norm(&grads);
        let reported = clipping.clip_gradients(&mut grads);
        let after = global_norm(&grads);

        prop_assert!((reported - before).abs() <= before * 1e-5 + 1e-6);
        prop_assert!(after <= 10.0 * (1.0 + 1e-4));
        if before <= 10.0 {
            prop_assert!((after - before).abs() <= before * 1e-5 + 1e-6);
        }
    }
}

#[test]
fn test_direction_is_preserved() {
    let mut grads = vec![vec![Array2::from_shape_vec((1, 2), vec![30.0, 40.0]).unwrap()]];
    let mut clipping = GlobalNormClipping::new(10.0);
    let norm = clipping.clip_gradients(&mut grads);
    assert!((norm - 50.0).abs() < 1e-4);
    assert!((grads[0][0][[0, 0]] - 6.0).abs() < 1e-5);
    assert!((grads[0][0][[0, 1]] - 8.0).abs() < 1e-5);
}

#[test]
fn test_non_finite_entries_are_zeroed() {
    let mut grads = vec![vec![Array2::from_shape_vec((1, 3), vec![f32::NAN, 3.0, f32::INFINITY]).unwrap()]];
    let mut clipping = GlobalNormClipping::new(10.0);
    let norm = clipping.clip_gradients(&mut grads);
    assert!((norm - 3.0).abs() < 1e-6);
    assert_eq!(grads[0][0].row(0).to_vec(), vec![0.0, 3.0, 0.0]);
}
