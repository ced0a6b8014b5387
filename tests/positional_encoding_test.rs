use tagger::PositionalEncoding;

#[test]
fn test_rows_past_length_are_zero() {
    let pe = PositionalEncoding::new(6);
    let encoded = pe.encode(&[3], 5);
    assert_eq!(encoded.dim(), (5, 6));
    for pos in 0..3 {
        assert!(encoded.row(pos).iter().any(|&v| v != 0.0), "position {pos} should be encoded");
    }
    assert!(encoded.row(3).iter().all(|&v| v == 0.0));
    assert!(encoded.row(4).iter().all(|&v| v == 0.0));
}

#[test]
fn test_known_values() {
    let pe = PositionalEncoding::new(4);
    let encoded = pe.encode(&[2], 2);
    // position 0: sin(0), cos(0) pairs
    assert_eq!(encoded.row(0).to_vec(), vec![0.0, 1.0, 0.0, 1.0]);
    assert!((encoded[[1, 0]] - 1f32.sin()).abs() < 1e-6);
    assert!((encoded[[1, 1]] - 1f32.cos()).abs() < 1e-6);
    assert!((encoded[[1, 2]] - (0.01f32).sin()).abs() < 1e-6);
    assert!((encoded[[1, 3]] - (0.01f32).cos()).abs() < 1e-6);
}

#[test]
fn test_each_sentence_uses_its_own_length() {
    let pe = PositionalEncoding::new(2);
    let encoded = pe.encode(&[1, 3, 0], 3);
    assert_eq!(encoded.dim(), (9, 2));
    assert_eq!(encoded.row(0), encoded.row(3));
    assert!(encoded.row(1).iter().all(|&v| v == 0.0));
    assert!(encoded.row(5).iter().any(|&v| v != 0.0));
    assert!(encoded.slice(ndarray::s![6.., ..]).iter().all(|&v| v == 0.0));
}

#[test]
fn test_flags() {
    let pe = PositionalEncoding::with_flags(4, true, true);
    let encoded = pe.encode(&[2], 2);
    assert!(encoded.row(0).iter().all(|&v| v == 0.0));
    assert!((encoded[[1, 0]] - 1f32.sin() * 2.0).abs() < 1e-6);
}
