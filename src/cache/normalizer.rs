//! Text normalization pipeline for cache key generation.
//!
//! A fingerprint is the canonical form of request text: numerically-varying
//! but semantically-identical phrases ("3 kaynak buldum" / "5 kaynak buldum")
//! share a key, and vendor pause/interjection markup is stripped before key
//! computation so marked-up and plain variants share cache state.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::NormalizeOptions;

/// `<#2.4#>` pause markers with decimal delays.
static PAUSE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#[0-9]+(?:\.[0-9]+)?#>").expect("pause pattern compiles"));

/// `(laughs)` / `(clears_throat)` interjection tags.
static INTERJECTION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([a-z_]+\)").expect("interjection pattern compiles"));

/// Turkish-aware lowercase.
///
/// Unicode default lowercasing folds both `I` and `İ` to `i`, destroying the
/// Turkish dotted/dotless distinction. Map those two code points first, then
/// lowercase the rest.
pub fn turkish_lower(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'I' => out.push('ı'),
            'İ' => out.push('i'),
            _ => out.extend(c.to_lowercase()),
        }
    }
    out
}

/// Fold the six Turkish diacritic letters to their ASCII base.
fn fold_diacritics(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'ç' => 'c',
            'ğ' => 'g',
            'ı' => 'i',
            'ö' => 'o',
            'ş' => 's',
            'ü' => 'u',
            other => other,
        })
        .collect()
}

/// Collapse whitespace runs to a single space.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

/// Drop characters that are neither word characters nor whitespace.
///
/// `#` survives because it is the digit-collapse sentinel; dropping it would
/// make normalization non-idempotent.
fn strip_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_' || *c == '#')
        .collect()
}

/// Replace every maximal digit run with a single `#`.
fn replace_numbers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_digits = false;
    for c in text.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
        } else {
            out.push(c);
            in_digits = false;
        }
    }
    out
}

/// Full normalization pipeline for cache key generation.
///
/// Stages run in a fixed order; each is toggleable through
/// [`NormalizeOptions`]. The function is pure and idempotent.
pub fn normalize(text: &str, options: &NormalizeOptions) -> String {
    let mut text = text.trim().to_owned();
    if text.is_empty() {
        return text;
    }
    if options.strip_minimax {
        text = PAUSE_MARKER.replace_all(&text, "").into_owned();
        text = INTERJECTION_TAG.replace_all(&text, "").into_owned();
    }
    if options.lowercase {
        text = fold_diacritics(&turkish_lower(&text));
    }
    if options.collapse_whitespace {
        text = collapse_whitespace(&text);
    }
    if options.strip_punctuation {
        text = strip_punctuation(&text);
        // Dropped punctuation can leave doubled spaces behind.
        if options.collapse_whitespace {
            text = collapse_whitespace(&text);
        }
    }
    if options.replace_numbers {
        text = replace_numbers(&text);
    }
    text.trim().to_owned()
}
