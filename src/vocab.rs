use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";
pub const PAD_ID: usize = 0;
pub const UNK_ID: usize = 1;

/// String-to-id table with reserved padding (0) and unknown (1) entries.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Vocab {
    pub encode: HashMap<String, usize>,
    words_buffer: String,
    word_ranges: Vec<(usize, usize)>, // (start, len)
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

impl Vocab {
    /// Reserved entries first, then `words` in first-seen order without duplicates.
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vocab = Vocab {
            encode: HashMap::new(),
            words_buffer: String::new(),
            word_ranges: Vec::new(),
        };
        vocab.insert(PAD_TOKEN);
        vocab.insert(UNK_TOKEN);
        for word in words {
            vocab.insert(word.as_ref());
        }

        tracing::debug!(vocab_size = vocab.size(), "Vocabulary initialized");
        vocab
    }

    /// Id of `word`, adding it when new.
    pub fn insert(&mut self, word: &str) -> usize {
        if let Some(&id) = self.encode.get(word) {
            return id;
        }
        let id = self.word_ranges.len();
        let start = self.words_buffer.len();
        self.words_buffer.push_str(word);
        self.word_ranges.push((start, word.len()));
        self.encode.insert(word.to_string(), id);
        id
    }

    /// Convert a word to its token index
    #[inline]
    pub fn encode(&self, word: &str) -> Option<usize> {
        self.encode.get(word).copied()
    }

    /// Convert a word to its token index, falling back to the unknown id
    pub fn encode_or_unknown(&self, word: &str) -> usize {
        self.encode(word).unwrap_or(UNK_ID)
    }

    pub fn contains(&self, word: &str) -> bool {
        self.encode.contains_key(word)
    }

    /// Convert a token index back to a word
    #[inline]
    pub fn decode(&self, token_id: usize) -> Option<&str> {
        self.word_ranges
            .get(token_id)
            .map(|&(start, len)| &self.words_buffer[start..start + len])
    }

    pub fn size(&self) -> usize {
        self.word_ranges.len()
    }

    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.word_ranges
            .iter()
            .map(|&(start, len)| &self.words_buffer[start..start + len])
    }
}

/// Closed, ordered label set (tags, chunk types) without reserved entries.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct LabelSet {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelSet {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = LabelSet::default();
        for label in labels {
            let label = label.as_ref();
            if !set.index.contains_key(label) {
                set.index.insert(label.to_string(), set.labels.len());
                set.labels.push(label.to_string());
            }
        }
        set
    }

    pub fn id(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, id: usize) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        let vocab = Vocab::new(["the", "cat", "the"]);
        assert_eq!(vocab.encode(PAD_TOKEN), Some(PAD_ID));
        assert_eq!(vocab.encode(UNK_TOKEN), Some(UNK_ID));
        assert_eq!(vocab.encode("the"), Some(2));
        assert_eq!(vocab.size(), 4);
        assert_eq!(vocab.encode_or_unknown("dog"), UNK_ID);
        assert_eq!(vocab.decode(3), Some("cat"));
    }

    #[test]
    fn test_label_set_keeps_first_seen_order() {
        let tags = LabelSet::new(["O", "B-PER", "O", "I-PER"]);
        assert_eq!(tags.len(), 3);
        assert_eq!(tags.id("I-PER"), Some(2));
        assert_eq!(tags.label(1), Some("B-PER"));
    }
}
