//! Fixtures shared by the unit tests.
use std::{fs, path::{Path, PathBuf}, str::FromStr};

use tokenizers::Tokenizer;

pub const WORDS: &[&str] = &[
    "the", "cat", "sat", "on", "a", "mat", "dog", "ran", "far", "away",
    "big", "red", "small", "blue", "fox", "jumps", "over", "lazy",
];

/// A word level tokenizer with bert-like special tokens: [PAD]=0, [UNK]=1,
/// [CLS]=2, [SEP]=3, [MASK]=4 and the WORDS from id 5 on.
pub fn word_level_tokenizer() -> Tokenizer {
    let specials = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"];
    let vocab = specials.iter().chain(WORDS)
        .enumerate()
        .map(|(i, w)| format!("\"{w}\": {i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let added = specials.iter()
        .enumerate()
        .map(|(i, w)| format!(
            r#"{{"id": {i}, "content": "{w}", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}}"#))
        .collect::<Vec<_>>()
        .join(", ");

    let json = format!(r#"{{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{added}],
        "normalizer": null,
        "pre_tokenizer": {{"type": "WhitespaceSplit"}},
        "post_processor": {{"type": "BertProcessing", "sep": ["[SEP]", 3], "cls": ["[CLS]", 2]}},
        "decoder": null,
        "model": {{"type": "WordLevel", "vocab": {{{vocab}}}, "unk_token": "[UNK]"}}
    }}"#);

    Tokenizer::from_str(&json).unwrap()
}

/// Writes the given lines to `dir/name`
pub fn write_lines(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, lines.join("\n")).unwrap();
    path
}
