use ndarray::{Array2, Array3, s};
use tagger::{Batch, CharEncoderKind, DecodingMode, Mode, ModelError, RecurrentKind, SequenceTagger, TaggerConfig};

const SENTENCE_LENGTH: usize = 4;
const WORD_LENGTH: usize = 5;
const CLASSES: usize = 3;

fn config() -> TaggerConfig {
    TaggerConfig {
        sentence_length: SENTENCE_LENGTH,
        word_length: WORD_LENGTH,
        word_vocab_size: 10,
        word_dim: 4,
        char_vocab_size: 12,
        char_dim: 3,
        pos_vocab_size: 5,
        pos_dim: 2,
        aux_dim: 2,
        class_count: CLASSES,
        keep_prob: 1.0,
        filter_sizes: vec![2],
        num_filters: 3,
        recurrent_size: 4,
        recurrent_depth: 1,
        attention_depth: 1,
        attention_heads: 2,
        attention_unit_size: 3,
        attention_keep_prob: 1.0,
        starter_learning_rate: 0.01,
        seed: Some(7),
        ..TaggerConfig::default()
    }
}

fn word_table(config: &TaggerConfig) -> Array2<f32> {
    Array2::from_shape_fn((config.word_vocab_size, config.word_dim), |(w, d)| ((w * 3 + d) as f32 * 0.31).sin())
}

fn build_tagger(config: TaggerConfig) -> SequenceTagger {
    let table = word_table(&config);
    SequenceTagger::new(config, table).unwrap()
}

/// One sentence per entry of `tags`; token `t` of sentence `b` gets deterministic ids.
fn make_batch(tags: &[Vec<usize>]) -> Batch {
    let b = tags.len();
    let real = |s: usize, t: usize| t < tags[s].len();
    let word_ids = Array2::from_shape_fn((b, SENTENCE_LENGTH), |(s, t)| if real(s, t) { 1 + (s + 2 * t) % 9 } else { 0 });
    let char_ids = Array3::from_shape_fn((b, SENTENCE_LENGTH, WORD_LENGTH), |(s, t, c)| {
        if real(s, t) && c < 2 + (s + t) % 3 { 1 + (s + t + c) % 11 } else { 0 }
    });
    let pos_ids = Array2::from_shape_fn((b, SENTENCE_LENGTH), |(s, t)| if real(s, t) { 1 + (s + t) % 4 } else { 0 });
    let aux = Array3::from_shape_fn((b, SENTENCE_LENGTH, 2), |(s, t, d)| match (real(s, t), d) {
        (true, 0) => 1.0,
        (true, _) => (t == 0) as u8 as f32,
        (false, _) => 0.0,
    });
    let labels = Array3::from_shape_fn((b, SENTENCE_LENGTH, CLASSES), |(s, t, c)| {
        if tags[s].get(t) == Some(&c) { 1.0 } else { 0.0 }
    });
    Batch::new(word_ids, char_ids, pos_ids, aux, Some(labels)).unwrap()
}

#[test]
fn test_single_real_token() {
    let mut tagger = build_tagger(config());
    let batch = make_batch(&[vec![2]]);
    let output = tagger.forward(&batch, Mode::Inference).unwrap();
    assert_eq!(output.logits.dim(), (1, SENTENCE_LENGTH, CLASSES));
    assert_eq!(output.predictions.dim(), (1, SENTENCE_LENGTH));
    assert_eq!(output.sentence_lengths, vec![1]);
    assert!(output.logits.iter().all(|v| v.is_finite()));

    let paths = tagger.decode(&batch).unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].len(), 1);
}

/// Same batch with every padding position carrying non-zero word, char and POS ids.
fn with_noisy_padding(batch: &Batch, real: usize) -> Batch {
    let mut word_ids = batch.word_ids().clone();
    let mut char_ids = batch.char_ids().clone();
    let mut pos_ids = batch.pos_ids().clone();
    for t in real..SENTENCE_LENGTH {
        word_ids[[0, t]] = 7;
        pos_ids[[0, t]] = 3;
        char_ids.slice_mut(s![0, t, ..]).fill(9);
    }
    Batch::new(word_ids, char_ids, pos_ids, batch.aux().clone(), batch.labels().cloned()).unwrap()
}

#[test]
fn test_single_real_token_metrics_use_only_that_token() {
    let gold = 2;
    for mode in [DecodingMode::Structured, DecodingMode::Independent] {
        let mut tagger = build_tagger(TaggerConfig {
            decoding_mode: mode,
            ..config()
        });
        let batch = make_batch(&[vec![gold]]);
        let metrics = tagger.evaluate(&batch).unwrap();

        // a one-token path has no transitions, so both objectives reduce to softmax cross-entropy
        let output = tagger.forward(&batch, Mode::Inference).unwrap();
        let row = output.logits.slice(s![0, 0, ..]);
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        let log_z = max + row.mapv(|x| (x - max).exp()).sum().ln();
        let expected_loss = log_z - row[gold];
        let expected_accuracy = (output.predictions[[0, 0]] == gold) as u8 as f32;
        assert!((metrics.loss - expected_loss).abs() < 1e-5, "{mode:?}: {} vs {expected_loss}", metrics.loss);
        assert_eq!(metrics.accuracy, expected_accuracy, "{mode:?}");

        let noisy = with_noisy_padding(&batch, 1);
        let noisy_metrics = tagger.evaluate(&noisy).unwrap();
        assert!((noisy_metrics.loss - metrics.loss).abs() < 1e-6, "{mode:?}");
        assert_eq!(noisy_metrics.accuracy, metrics.accuracy, "{mode:?}");
    }
}

#[test]
fn test_training_reduces_loss() {
    for mode in [DecodingMode::Structured, DecodingMode::Independent] {
        let mut tagger = build_tagger(TaggerConfig {
            decoding_mode: mode,
            ..config()
        });
        let batch = make_batch(&[vec![0, 1, 2], vec![2, 2], vec![1, 0, 0, 1]]);
        let before = tagger.evaluate(&batch).unwrap();
        for _ in 0..40 {
            let report = tagger.train_step(&batch).unwrap();
            assert!(report.loss.is_finite());
            assert!(report.global_norm.is_finite());
        }
        let after = tagger.evaluate(&batch).unwrap();
        assert!(after.loss < before.loss, "{mode:?}: {} -> {}", before.loss, after.loss);
        assert!((0.0..=1.0).contains(&after.accuracy));
    }
}

#[test]
fn test_global_step_and_learning_rate_schedule() {
    let mut tagger = build_tagger(TaggerConfig {
        decay_steps: 2,
        decay_rate: 0.5,
        ..config()
    });
    let batch = make_batch(&[vec![0, 1]]);
    assert_eq!(tagger.global_step(), 0);

    let first = tagger.train_step(&batch).unwrap();
    assert_eq!(first.global_step, 1);
    assert!((first.learning_rate - 0.01).abs() < 1e-8);

    let second = tagger.train_step(&batch).unwrap();
    assert!((second.learning_rate - 0.01).abs() < 1e-8);

    let third = tagger.train_step(&batch).unwrap();
    assert_eq!(third.global_step, 3);
    assert!((third.learning_rate - 0.005).abs() < 1e-8);
    assert_eq!(tagger.global_step(), 3);
}

#[test]
fn test_word_table_stays_frozen() {
    let mut tagger = build_tagger(config());
    let original = tagger.word_embeddings().clone();
    let batch = make_batch(&[vec![0, 1, 2, 1]]);
    for _ in 0..3 {
        tagger.train_step(&batch).unwrap();
    }
    assert_eq!(tagger.word_embeddings(), &original);
    assert_eq!(
        tagger.total_parameters() - tagger.trainable_parameters(),
        original.len()
    );
}

#[test]
fn test_out_of_range_ids_are_rejected() {
    let mut tagger = build_tagger(config());
    let good = make_batch(&[vec![0, 1]]);
    let mut word_ids = good.word_ids().clone();
    word_ids[[0, 0]] = 10;
    let bad = Batch::new(
        word_ids,
        good.char_ids().clone(),
        good.pos_ids().clone(),
        good.aux().clone(),
        good.labels().cloned(),
    )
    .unwrap();
    assert!(matches!(
        tagger.forward(&bad, Mode::Inference),
        Err(ModelError::InvalidInput { .. })
    ));
    assert!(tagger.train_step(&bad).is_err());
    assert_eq!(tagger.global_step(), 0);
}

#[test]
fn test_mismatched_aux_width_is_rejected() {
    let mut tagger = build_tagger(config());
    let good = make_batch(&[vec![0]]);
    let bad = Batch::new(
        good.word_ids().clone(),
        good.char_ids().clone(),
        good.pos_ids().clone(),
        Array3::from_elem((1, SENTENCE_LENGTH, 3), 1.0),
        None,
    )
    .unwrap();
    assert!(matches!(
        tagger.forward(&bad, Mode::Inference),
        Err(ModelError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_evaluate_requires_labels() {
    let mut tagger = build_tagger(config());
    let good = make_batch(&[vec![0]]);
    let unlabelled = Batch::new(
        good.word_ids().clone(),
        good.char_ids().clone(),
        good.pos_ids().clone(),
        good.aux().clone(),
        None,
    )
    .unwrap();
    assert!(tagger.evaluate(&unlabelled).is_err());
    assert!(tagger.forward(&unlabelled, Mode::Inference).is_ok());
}

#[test]
fn test_recurrent_strategies_share_weights() {
    let mut simple = build_tagger(TaggerConfig {
        recurrent_kind: RecurrentKind::Simple,
        ..config()
    });
    let mut fused = simple.clone();
    fused.set_recurrent_kind(RecurrentKind::Fused);
    assert_eq!(fused.config().recurrent_kind, RecurrentKind::Fused);

    let batch = make_batch(&[vec![0, 1, 2], vec![1], vec![]]);
    let a = simple.forward(&batch, Mode::Inference).unwrap();
    let b = fused.forward(&batch, Mode::Inference).unwrap();
    assert_eq!(a.sentence_lengths, vec![3, 1, 0]);
    for (x, y) in a.logits.iter().zip(b.logits.iter()) {
        assert!((x - y).abs() < 1e-5);
    }
}

#[test]
fn test_inference_is_deterministic_with_dropout_configured() {
    let mut tagger = build_tagger(TaggerConfig {
        keep_prob: 0.5,
        attention_keep_prob: 0.5,
        ..config()
    });
    let batch = make_batch(&[vec![0, 1, 2]]);
    let a = tagger.forward(&batch, Mode::Inference).unwrap();
    let b = tagger.forward(&batch, Mode::Inference).unwrap();
    assert_eq!(a.logits, b.logits);
}

#[test]
fn test_transition_params_follow_decoding_mode() {
    let structured = build_tagger(config());
    assert_eq!(structured.transition_params().map(|t| t.dim()), Some((CLASSES, CLASSES)));
    assert!(structured.architecture().ends_with("LinearChainCrf"));

    let independent = build_tagger(TaggerConfig {
        decoding_mode: DecodingMode::Independent,
        ..config()
    });
    assert!(independent.transition_params().is_none());
    assert!(independent.architecture().ends_with("SoftmaxCrossEntropy"));
}

#[test]
fn test_optional_encoders_can_be_disabled() {
    let mut tagger = build_tagger(TaggerConfig {
        use_recurrent: false,
        use_attention: false,
        ..config()
    });
    let batch = make_batch(&[vec![1, 2]]);
    let report = tagger.train_step(&batch).unwrap();
    assert!(report.loss.is_finite());
    assert!(!tagger.architecture().contains("BiLstm"));
}

#[test]
fn test_conv2d_rejects_words_narrower_than_filters() {
    let mut tagger = build_tagger(TaggerConfig {
        char_encoder: CharEncoderKind::Conv2d,
        filter_sizes: vec![2, 3],
        ..config()
    });
    let good = make_batch(&[vec![0]]);
    assert!(tagger.forward(&good, Mode::Inference).is_ok());

    let narrow = Batch::new(
        good.word_ids().clone(),
        Array3::from_elem((1, SENTENCE_LENGTH, 2), 1),
        good.pos_ids().clone(),
        good.aux().clone(),
        None,
    )
    .unwrap();
    assert!(matches!(
        tagger.forward(&narrow, Mode::Inference),
        Err(ModelError::InvalidInput { .. })
    ));
}

#[test]
fn test_rejects_wrong_word_table_shape() {
    let result = SequenceTagger::new(config(), Array2::zeros((3, 4)));
    assert!(matches!(result, Err(ModelError::ShapeMismatch { .. })));
}
