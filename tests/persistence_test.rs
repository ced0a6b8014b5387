use std::fs;

use ndarray::{Array2, Array3};
use tagger::{Batch, Format, Mode, SequenceTagger, TaggerConfig, VersionedCheckpoint};
use tempfile::NamedTempFile;

fn small_config() -> TaggerConfig {
    TaggerConfig {
        sentence_length: 3,
        word_length: 4,
        word_vocab_size: 6,
        word_dim: 3,
        char_vocab_size: 8,
        char_dim: 2,
        pos_vocab_size: 4,
        pos_dim: 2,
        aux_dim: 1,
        class_count: 3,
        keep_prob: 1.0,
        filter_sizes: vec![2],
        num_filters: 2,
        recurrent_size: 3,
        recurrent_depth: 1,
        attention_heads: 1,
        attention_unit_size: 2,
        attention_keep_prob: 1.0,
        seed: Some(11),
        ..TaggerConfig::default()
    }
}

fn trained_tagger() -> (SequenceTagger, Batch) {
    let config = small_config();
    let table = Array2::from_shape_fn((6, 3), |(w, d)| (w as f32 - d as f32) * 0.1);
    let mut tagger = SequenceTagger::new(config, table).unwrap();
    let batch = Batch::new(
        Array2::from_shape_vec((1, 3), vec![1, 2, 0]).unwrap(),
        Array3::from_shape_fn((1, 3, 4), |(_, t, c)| if t < 2 && c < 3 { 1 + t + c } else { 0 }),
        Array2::from_shape_vec((1, 3), vec![1, 3, 0]).unwrap(),
        Array3::from_shape_fn((1, 3, 1), |(_, t, _)| if t < 2 { 1.0 } else { 0.0 }),
        Some(Array3::from_shape_fn((1, 3, 3), |(_, t, c)| if t < 2 && c == t { 1.0 } else { 0.0 })),
    )
    .unwrap();
    tagger.train_step(&batch).unwrap();
    tagger.train_step(&batch).unwrap();
    (tagger, batch)
}

fn temp_path(extension: &str) -> (NamedTempFile, String) {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().with_extension(extension).to_str().unwrap().to_string();
    (file, path)
}

fn assert_same_outputs(a: &mut SequenceTagger, b: &mut SequenceTagger, batch: &Batch) {
    let x = a.forward(batch, Mode::Inference).unwrap();
    let y = b.forward(batch, Mode::Inference).unwrap();
    for (p, q) in x.logits.iter().zip(y.logits.iter()) {
        assert!((p - q).abs() < 1e-5, "{p} vs {q}");
    }
    assert_eq!(a.global_step(), b.global_step());
    match (a.transition_params(), b.transition_params()) {
        (Some(p), Some(q)) => assert!(p.iter().zip(q.iter()).all(|(x, y)| (x - y).abs() < 1e-6)),
        (p, q) => assert_eq!(p.is_none(), q.is_none()),
    }
}

#[test]
fn test_save_load_json() {
    let (mut original, batch) = trained_tagger();
    let (_file, path) = temp_path("json");
    original.save(&path).unwrap();
    let mut loaded = SequenceTagger::load(&path).unwrap();

    assert_eq!(loaded.config(), original.config());
    assert_eq!(loaded.total_parameters(), original.total_parameters());
    assert_same_outputs(&mut original, &mut loaded, &batch);
    fs::remove_file(&path).ok();
}

#[test]
fn test_save_load_binary() {
    let (mut original, batch) = trained_tagger();
    let (_file, path) = temp_path("bin");
    original.save(&path).unwrap();
    let mut loaded = SequenceTagger::load(&path).unwrap();

    assert_same_outputs(&mut original, &mut loaded, &batch);
    fs::remove_file(&path).ok();
}

#[test]
fn test_loaded_tagger_keeps_training() {
    let (original, batch) = trained_tagger();
    let (_file, path) = temp_path("bin");
    original.save_binary(&path).unwrap();
    let mut loaded = SequenceTagger::load_binary(&path).unwrap();

    let report = loaded.train_step(&batch).unwrap();
    assert_eq!(report.global_step, 3);
    fs::remove_file(&path).ok();
}

#[test]
fn test_versioned_round_trip() {
    for extension in ["json", "bin"] {
        let (mut original, batch) = trained_tagger();
        let (_file, path) = temp_path(extension);
        original
            .save_versioned(&path, Some("two steps".to_string()))
            .unwrap();

        let checkpoint = VersionedCheckpoint::load_from_file(&path).unwrap();
        assert_eq!(checkpoint.format, Format::from_path(&path));
        assert_eq!(checkpoint.metadata.global_step, 2);
        assert_eq!(checkpoint.metadata.class_count, 3);
        assert_eq!(checkpoint.metadata.architecture, original.architecture());
        assert_eq!(checkpoint.metadata.description.as_deref(), Some("two steps"));

        let mut loaded = SequenceTagger::load_versioned(&path).unwrap();
        assert_same_outputs(&mut original, &mut loaded, &batch);
        fs::remove_file(&path).ok();
    }
}

#[test]
fn test_tampered_checkpoint_is_rejected() {
    let (original, _) = trained_tagger();
    let mut checkpoint = VersionedCheckpoint::from_tagger(&original, Format::Binary, None).unwrap();
    assert!(checkpoint.validate_checksum().is_ok());

    let last = checkpoint.data.len() - 1;
    checkpoint.data[last] ^= 0xff;
    assert!(checkpoint.validate_checksum().is_err());
    assert!(checkpoint.to_tagger().is_err());
}

#[test]
fn test_newer_version_is_rejected() {
    let (original, _) = trained_tagger();
    let mut checkpoint = VersionedCheckpoint::from_tagger(&original, Format::Json, None).unwrap();
    checkpoint.version += 1;
    assert!(checkpoint.validate_version().is_err());
    assert!(checkpoint.to_tagger().is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(SequenceTagger::load("/nonexistent/dir/tagger.json").is_err());
    assert!(SequenceTagger::load_versioned("/nonexistent/dir/tagger.bin").is_err());
}
