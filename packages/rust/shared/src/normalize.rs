//! Question text canonicalization, hashing, and classification.
//!
//! [`normalize`] produces the semantic identity of a question. [`question_hash`]
//! derives a compact storage key from it; two questions are the same question
//! when their normalized forms are equal, never merely because hashes match.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::types::QuestionType;

/// Length of the hex-encoded question hash.
pub const HASH_LEN: usize = 16;

/// Upper bound on canonicalization passes.
const MAX_PASSES: usize = 4;

/// Quote-like characters folded to a plain apostrophe.
const QUOTE_VARIANTS: &[char] = &[
    '\u{2018}', '\u{2019}', '\u{201A}', '\u{201B}', '\u{2032}', '\u{2035}', '`', '\u{00B4}',
    '"', '\u{201C}', '\u{201D}', '\u{201E}', '\u{201F}', '\u{2033}', '\u{00AB}', '\u{00BB}',
    '\u{2039}', '\u{203A}', '\u{FF02}', '\u{FF07}',
];

/// Canonicalize question text into its comparison key.
///
/// NFKC, lowercase, quote folding, removal of everything except letters,
/// numbers, whitespace, `?` and `'`, whitespace collapsing, trim. Passes repeat
/// until the output is stable, so `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(text: &str) -> String {
    let mut current = normalize_pass(text);
    for _ in 1..MAX_PASSES {
        let next = normalize_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn normalize_pass(text: &str) -> String {
    let folded: String = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .map(|c| if QUOTE_VARIANTS.contains(&c) { '\'' } else { c })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '?' || *c == '\'')
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable short identifier for a question, derived from its normalized form.
pub fn question_hash(text: &str) -> String {
    hash_normalized(&normalize(text))
}

/// Hash an already-normalized key.
pub fn hash_normalized(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(HASH_LEN);
    hex
}

/// Case- and diacritic-insensitive form used for fuzzy text matching.
pub fn fold_for_match(text: &str) -> String {
    let stripped: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classify a question by its leading interrogative.
pub fn detect_question_type(text: &str) -> QuestionType {
    let folded = fold_for_match(&normalize(text));

    const COST: &[&str] = &["cost", "price", "how much", "combien", "cuanto", "quanto", "wie viel"];
    if COST.iter().any(|w| folded.contains(w)) {
        return QuestionType::Cost;
    }

    let first = folded
        .split(|c: char| c.is_whitespace() || c == '\'')
        .next()
        .unwrap_or("");

    match first {
        "what" | "que" | "quoi" | "quel" | "quelle" | "cosa" | "wat" => QuestionType::What,
        "how" | "como" | "comment" | "wie" | "come" | "hoe" => QuestionType::How,
        "why" | "por" | "pourquoi" | "warum" | "perche" | "waarom" => QuestionType::Why,
        "when" | "cuando" | "quand" | "wann" | "quando" | "wanneer" => QuestionType::When,
        "where" | "donde" | "ou" | "wo" | "dove" | "waar" => QuestionType::Where,
        "who" | "quien" | "qui" | "wer" | "chi" | "wie's" => QuestionType::Who,
        "which" | "cual" | "welche" | "welcher" | "quale" => QuestionType::Which,
        "can" | "could" | "puedo" | "peut" | "kann" | "posso" => QuestionType::Can,
        "is" | "are" | "do" | "does" | "did" | "should" | "will" | "would" | "has" | "have"
        | "est" | "ist" => QuestionType::YesNo,
        _ => QuestionType::Other,
    }
}
