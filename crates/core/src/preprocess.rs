use crate::error::IngestError;
use regex::{Captures, Regex};

const PLACEHOLDERS: [&str; 2] = ["<!-- missing-text -->", "<!-- image -->"];

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cleans converter output before chunking.
///
/// Converter placeholders are dropped, camel-case joins left by layout
/// extraction are split, words made of a unit repeated back to back
/// (`thethe`, `PainPain`) collapse to the unit, and stray single letters
/// are removed.
#[derive(Debug, Clone)]
pub struct TextPreprocessor {
    camel_join: Regex,
    word: Regex,
    single_letter: Regex,
}

impl TextPreprocessor {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            camel_join: Regex::new(r"([a-z]+)([A-Z])")?,
            word: Regex::new(r"\w+")?,
            single_letter: Regex::new(r"\b[a-zA-Z]\b")?,
        })
    }

    pub fn clean(&self, text: &str) -> String {
        let mut cleaned = text.to_string();
        for placeholder in PLACEHOLDERS {
            cleaned = cleaned.replace(placeholder, "");
        }

        let cleaned = self.camel_join.replace_all(&cleaned, "$1 $2");
        let cleaned = self.collapse_repeated_units(&cleaned);
        self.single_letter.replace_all(&cleaned, "").into_owned()
    }

    /// Replaces every word that is two or more copies of one unit with that unit.
    /// The longest repeating unit wins, so `aaaa` becomes `aa`.
    pub fn collapse_repeated_units(&self, text: &str) -> String {
        self.word
            .replace_all(text, |captures: &Captures| {
                let token = &captures[0];
                repeated_unit(token).unwrap_or(token).to_string()
            })
            .into_owned()
    }
}

pub fn text_preprocessor(text: &str) -> Result<String, IngestError> {
    Ok(TextPreprocessor::new()?.clean(text))
}

fn repeated_unit(token: &str) -> Option<&str> {
    let boundaries: Vec<usize> = token
        .char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(token.len()))
        .collect();
    let char_count = boundaries.len() - 1;

    for unit_chars in (1..=char_count / 2).rev() {
        if char_count % unit_chars != 0 {
            continue;
        }
        let unit = &token[..boundaries[unit_chars]];
        if unit.repeat(char_count / unit_chars) == token {
            return Some(unit);
        }
    }

    None
}
