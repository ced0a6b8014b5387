use ndarray::{Array2, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tagger::recurrent::RecurrentEncoder;
use tagger::{Mode, RecurrentKind, TaggerConfig};

fn config(kind: RecurrentKind) -> TaggerConfig {
    TaggerConfig {
        word_dim: 3,
        num_filters: 2,
        pos_dim: 2,
        aux_dim: 1,
        recurrent_size: 4,
        recurrent_depth: 2,
        recurrent_kind: kind,
        keep_prob: 1.0,
        ..TaggerConfig::default()
    }
}

const LENGTHS: [usize; 3] = [5, 2, 0];
const STEPS: usize = 5;

fn input(dim: usize) -> Array2<f32> {
    Array2::from_shape_fn((LENGTHS.len() * STEPS, dim), |(r, d)| ((r * 7 + d * 3) as f32 * 0.13).sin())
}

fn assert_close(a: &Array2<f32>, b: &Array2<f32>, tol: f32) {
    assert_eq!(a.dim(), b.dim());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tol, "{x} vs {y}");
    }
}

#[test]
fn test_simple_and_fused_agree() {
    let mut rng = StdRng::seed_from_u64(8);
    let cfg = config(RecurrentKind::Simple);
    let mut simple = RecurrentEncoder::new(&cfg, &mut rng);
    let mut fused = simple.clone();
    fused.set_kind(RecurrentKind::Fused);

    let x = input(cfg.input_dim());
    let out_simple = simple.forward(&x, &LENGTHS, Mode::Inference, &mut rng);
    let out_fused = fused.forward(&x, &LENGTHS, Mode::Inference, &mut rng);
    assert_eq!(out_simple.dim(), (LENGTHS.len() * STEPS, 8));
    assert_close(&out_simple, &out_fused, 1e-5);

    let grads = Array2::from_shape_fn(out_simple.dim(), |(r, c)| ((r + c) as f32 * 0.21).cos());
    let (dx_simple, params_simple) = simple.compute_gradients(&grads);
    let (dx_fused, params_fused) = fused.compute_gradients(&grads);
    assert_close(&dx_simple, &dx_fused, 1e-4);
    assert_eq!(params_simple.len(), 8);
    for (a, b) in params_simple.iter().zip(&params_fused) {
        assert_close(a, b, 1e-4);
    }
}

#[test]
fn test_padding_positions_are_zero_and_inert() {
    for kind in [RecurrentKind::Simple, RecurrentKind::Fused] {
        let mut rng = StdRng::seed_from_u64(3);
        let cfg = config(kind);
        let mut encoder = RecurrentEncoder::new(&cfg, &mut rng);
        let mut x = input(cfg.input_dim());
        let before = encoder.forward(&x, &LENGTHS, Mode::Inference, &mut rng);

        // sentence 1 occupies rows 5..10 with length 2; sentence 2 is empty
        assert!(before.slice(s![7..15, ..]).iter().all(|&v| v == 0.0));

        x.slice_mut(s![7..15, ..]).fill(3.0);
        let after = encoder.forward(&x, &LENGTHS, Mode::Inference, &mut rng);
        assert_close(&before, &after, 1e-6);
    }
}

#[test]
fn test_backward_direction_sees_later_tokens() {
    let mut rng = StdRng::seed_from_u64(5);
    // a second layer would mix the backward half into the forward half
    let mut cfg = config(RecurrentKind::Fused);
    cfg.recurrent_depth = 1;
    let mut encoder = RecurrentEncoder::new(&cfg, &mut rng);
    let mut x = input(cfg.input_dim());
    let before = encoder.forward(&x, &LENGTHS, Mode::Inference, &mut rng);
    x.row_mut(4).fill(-2.0);
    let after = encoder.forward(&x, &LENGTHS, Mode::Inference, &mut rng);

    // forward half of the first token is unchanged, backward half moves
    let h = cfg.recurrent_size;
    assert_close(
        &before.slice(s![0..1, ..h]).to_owned(),
        &after.slice(s![0..1, ..h]).to_owned(),
        1e-6,
    );
    let moved: f32 = (&before.slice(s![0, h..]) - &after.slice(s![0, h..])).mapv(f32::abs).sum();
    assert!(moved > 1e-4);
}

#[test]
fn test_input_gradient_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(13);
    let mut cfg = config(RecurrentKind::Fused);
    cfg.recurrent_depth = 1;
    let mut encoder = RecurrentEncoder::new(&cfg, &mut rng);
    let x = input(cfg.input_dim());
    let weights = Array2::from_shape_fn((x.nrows(), 2 * cfg.recurrent_size), |(r, c)| ((r * 3 + c) as f32 * 0.7).sin());

    let out = encoder.forward(&x, &LENGTHS, Mode::Inference, &mut rng);
    assert_eq!(out.dim(), weights.dim());
    let (dx, _) = encoder.compute_gradients(&weights);

    let eps = 1e-2;
    for &(r, c) in &[(0, 0), (2, 3), (4, 7), (5, 1), (6, 5)] {
        let mut plus = x.clone();
        plus[[r, c]] += eps;
        let mut minus = x.clone();
        minus[[r, c]] -= eps;
        let f_plus = (encoder.forward(&plus, &LENGTHS, Mode::Inference, &mut rng) * &weights).sum();
        let f_minus = (encoder.forward(&minus, &LENGTHS, Mode::Inference, &mut rng) * &weights).sum();
        let numeric = (f_plus - f_minus) / (2.0 * eps);
        assert!((dx[[r, c]] - numeric).abs() < 2e-2, "({r}, {c}): {} vs {numeric}", dx[[r, c]]);
    }
    // padding rows receive no gradient
    assert!(dx.slice(s![7..15, ..]).iter().all(|&g| g == 0.0));
}
