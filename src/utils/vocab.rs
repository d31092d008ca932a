use std::{fs, path::Path};

use indexmap::IndexSet;

use crate::error::Result;

/// Collapses every run of spaces into a single space.
///
/// Only the ASCII space is touched; tabs and newlines are left as they are.
pub fn normalize_label(text: &str) -> String {
    let mut res = String::with_capacity(text.len());
    let mut prev_space = false;
    for ch in text.chars() {
        if ch == ' ' {
            if prev_space {
                continue;
            }
            prev_space = true;
        } else {
            prev_space = false;
        }
        res.push(ch);
    }

    res
}

/// Splits a normalized label into the tokens the recognizer predicts.
pub fn tokenize(label: &str) -> impl Iterator<Item = &str> {
    label.trim().split(' ').filter(|token| !token.is_empty())
}

/// Distinct label tokens in the order they were first seen.
#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    tokens: IndexSet<String>,
}

impl Vocabulary {
    pub fn from_labels<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut tokens = IndexSet::new();
        for label in labels {
            for token in tokenize(label) {
                if !tokens.contains(token) {
                    tokens.insert(token.to_string());
                }
            }
        }

        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    /// Writes the tokens joined by single spaces.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let joined = self.tokens().collect::<Vec<_>>().join(" ");
        fs::write(path, joined)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("a   b  c"), "a b c");
        assert_eq!(normalize_label("  lead"), " lead");
        assert_eq!(normalize_label("tab\t\tkept"), "tab\t\tkept");
        assert_eq!(normalize_label(""), "");
    }

    #[test]
    fn test_vocabulary_keeps_first_seen_order() {
        let labels = ["안 녕 하", "하 세 요 ", " 안 요"];
        let vocab = Vocabulary::from_labels(labels.iter().copied());

        assert_eq!(vocab.tokens().collect::<Vec<_>>(), vec!["안", "녕", "하", "세", "요"]);
    }

    #[test]
    fn test_vocabulary_skips_empty_tokens() {
        let vocab = Vocabulary::from_labels(["", "   ", "x"].iter().copied());

        assert_eq!(vocab.len(), 1);
    }

    #[test]
    fn test_write_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        let vocab = Vocabulary::from_labels(["hello world", "world peace"].iter().copied());
        vocab.write(&path).unwrap();

        assert_eq!(fs::read_to_string(path).unwrap(), "hello world peace");
    }
}
