//! CoNLL-style corpora: one `word pos chunk tag` line per token, blank lines
//! between sentences.

use std::fs;

use ndarray::{Array2, Array3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::errors::{ModelError, Result};
use crate::vocab::{LabelSet, PAD_ID, Vocab};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub word: String,
    pub pos: String,
    pub chunk: String,
    pub tag: String,
}

pub type Sentence = Vec<Token>;

/// Parse CoNLL text. `-DOCSTART-` lines act as sentence breaks.
pub fn parse_conll(text: &str) -> Result<Vec<Sentence>> {
    let mut sentences = Vec::new();
    let mut current = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("-DOCSTART-") {
            if !current.is_empty() {
                sentences.push(std::mem::take(&mut current));
            }
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let &[word, pos, chunk, tag] = fields.as_slice() else {
            return Err(ModelError::InvalidInput {
                message: format!("line {}: expected 4 columns, found {}", line_no + 1, fields.len()),
            });
        };
        current.push(Token {
            word: word.to_string(),
            pos: pos.to_string(),
            chunk: chunk.to_string(),
            tag: tag.to_string(),
        });
    }
    if !current.is_empty() {
        sentences.push(current);
    }
    Ok(sentences)
}

fn read_text(path: &str, limit: u64) -> Result<String> {
    let metadata = fs::metadata(path)?;
    if metadata.len() > limit {
        return Err(ModelError::InvalidInput {
            message: format!("File size {} exceeds maximum allowed size {}", metadata.len(), limit),
        });
    }
    Ok(fs::read_to_string(path)?)
}

pub fn read_conll(path: &str) -> Result<Vec<Sentence>> {
    let text = read_text(path, crate::MAX_FILE_SIZE)?;
    let sentences = parse_conll(&text)?;
    tracing::info!(path = path, sentences = sentences.len(), "Loaded CoNLL corpus");
    Ok(sentences)
}

/// Id tables for every column of a corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabularies {
    /// Lowercased words
    pub words: Vocab,
    pub chars: Vocab,
    pub pos: Vocab,
    pub chunks: LabelSet,
    pub tags: LabelSet,
}

impl Vocabularies {
    pub fn build(sentences: &[Sentence]) -> Self {
        let tokens = || sentences.iter().flatten();
        let vocabs = Self {
            words: Vocab::new(tokens().map(|t| t.word.to_lowercase())),
            chars: Vocab::new(tokens().flat_map(|t| t.word.chars()).map(String::from)),
            pos: Vocab::new(tokens().map(|t| t.pos.as_str())),
            chunks: LabelSet::new(tokens().map(|t| t.chunk.as_str())),
            tags: LabelSet::new(tokens().map(|t| t.tag.as_str())),
        };
        tracing::info!(
            words = vocabs.words.size(),
            chars = vocabs.chars.size(),
            pos = vocabs.pos.size(),
            chunks = vocabs.chunks.len(),
            tags = vocabs.tags.len(),
            "Vocabularies built"
        );
        vocabs
    }

    /// Presence bit, capitalisation bit and a one-hot chunk type.
    pub fn aux_dim(&self) -> usize {
        2 + self.chunks.len()
    }

    pub fn class_count(&self) -> usize {
        self.tags.len()
    }
}

struct EncodedSentence {
    words: Vec<usize>,
    chars: Vec<Vec<usize>>,
    pos: Vec<usize>,
    aux: Vec<Vec<f32>>,
    tags: Vec<usize>,
}

fn encode_sentence(sentence: &[Token], vocabs: &Vocabularies, sentence_length: usize, word_length: usize) -> Result<EncodedSentence> {
    let tokens = &sentence[..sentence.len().min(sentence_length)];
    let mut encoded = EncodedSentence {
        words: Vec::with_capacity(tokens.len()),
        chars: Vec::with_capacity(tokens.len()),
        pos: Vec::with_capacity(tokens.len()),
        aux: Vec::with_capacity(tokens.len()),
        tags: Vec::with_capacity(tokens.len()),
    };
    for token in tokens {
        let tag = vocabs.tags.id(&token.tag).ok_or_else(|| ModelError::InvalidInput {
            message: format!("unknown tag {:?}", token.tag),
        })?;
        encoded.words.push(vocabs.words.encode_or_unknown(&token.word.to_lowercase()));
        encoded.chars.push(
            token
                .word
                .chars()
                .take(word_length)
                .map(|c| vocabs.chars.encode_or_unknown(c.encode_utf8(&mut [0; 4])))
                .collect(),
        );
        encoded.pos.push(vocabs.pos.encode_or_unknown(&token.pos));

        let mut aux = vec![0.0; vocabs.aux_dim()];
        aux[0] = 1.0;
        if token.word.chars().next().is_some_and(char::is_uppercase) {
            aux[1] = 1.0;
        }
        if let Some(chunk) = vocabs.chunks.id(&token.chunk) {
            aux[2 + chunk] = 1.0;
        }
        encoded.aux.push(aux);
        encoded.tags.push(tag);
    }
    Ok(encoded)
}

/// Pad and encode `sentences` into one labelled batch. Longer sentences and words
/// are truncated; padding uses id 0 and all-zero auxiliary and label vectors.
pub fn encode_batch(
    sentences: &[Sentence],
    vocabs: &Vocabularies,
    sentence_length: usize,
    word_length: usize,
) -> Result<Batch> {
    let truncated = sentences.iter().filter(|s| s.len() > sentence_length).count();
    if truncated > 0 {
        tracing::warn!(truncated, sentence_length, "Sentences truncated to the maximum length");
    }

    let encoded = sentences
        .par_iter()
        .map(|s| encode_sentence(s, vocabs, sentence_length, word_length))
        .collect::<Result<Vec<_>>>()?;

    let batch = encoded.len();
    let (aux_dim, classes) = (vocabs.aux_dim(), vocabs.class_count());
    let mut word_ids = Array2::from_elem((batch, sentence_length), PAD_ID);
    let mut pos_ids = Array2::from_elem((batch, sentence_length), PAD_ID);
    let mut char_ids = Array3::from_elem((batch, sentence_length, word_length), PAD_ID);
    let mut aux = Array3::zeros((batch, sentence_length, aux_dim));
    let mut labels = Array3::zeros((batch, sentence_length, classes));

    for (b, sentence) in encoded.iter().enumerate() {
        for t in 0..sentence.words.len() {
            word_ids[[b, t]] = sentence.words[t];
            pos_ids[[b, t]] = sentence.pos[t];
            for (w, &c) in sentence.chars[t].iter().enumerate() {
                char_ids[[b, t, w]] = c;
            }
            for (e, &value) in sentence.aux[t].iter().enumerate() {
                aux[[b, t, e]] = value;
            }
            labels[[b, t, sentence.tags[t]]] = 1.0;
        }
    }

    Batch::new(word_ids, char_ids, pos_ids, aux, Some(labels))
}

/// Frozen word table from a whitespace-separated text embedding file (`word v1 v2 ...`).
/// Words are matched lowercased, like the vocabulary. Rows of words missing from
/// the file stay zero.
pub fn load_word_vectors(path: &str, vocab: &Vocab, dim: usize) -> Result<Array2<f32>> {
    let text = read_text(path, crate::MAX_FILE_SIZE)?;
    let mut table = Array2::zeros((vocab.size(), dim));
    let mut found = 0;
    for (line_no, line) in text.lines().enumerate() {
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else { continue };
        let Some(id) = vocab.encode(&word.to_lowercase()) else { continue };
        let values = parts
            .map(str::parse::<f32>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ModelError::InvalidInput {
                message: format!("line {}: {e}", line_no + 1),
            })?;
        if values.len() != dim {
            return Err(ModelError::shape("word vector", &[dim], &[values.len()]));
        }
        for (d, v) in values.into_iter().enumerate() {
            table[[id, d]] = v;
        }
        found += 1;
    }
    tracing::info!(path = path, found, vocab_size = vocab.size(), "Loaded word vectors");
    Ok(table)
}
