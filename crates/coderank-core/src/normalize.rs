//! Text and code normalization.
//!
//! Every function here is pure and deterministic: no I/O, no global state
//! beyond compiled regexes. The index builder and the Stage 0 retriever both
//! go through these functions, which is what makes a code written as
//! `hrd–442` in a PDF and `HRD-442` in a query meet at the same key.
//!
//! # Boundary padding
//!
//! [`pad_boundaries`] maps a normalized string onto a space-delimited token
//! form wrapped in sentinel spaces (`" HRD-442 "`). Substring search between
//! two padded strings can then only match on whole tokens, so `HRD-442`
//! never matches inside `HRD-4420`.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

use crate::models::Code;

/// ASCII alphanumeric runs joined by single hyphens. Anything else
/// (underscores, dots, Hangul, CJK, accented Latin) ends the run.
static CODE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]+(?:-[A-Za-z0-9]+)*").expect("static regex"));

static HYPHEN_SPACING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" ?- ?").expect("static regex"));

/// Minimum number of alphanumeric characters for a token to count as a code.
const MIN_CODE_ALNUM: usize = 3;

/// Longest all-letter prefix that may be joined with a following numeric
/// token (`EX 3`, `SM 100`).
const MAX_PREFIX_LETTERS: usize = 5;

fn is_dash_like(c: char) -> bool {
    matches!(
        c,
        '\u{2010}'..='\u{2015}' | '\u{2212}' | '\u{FE58}' | '\u{FE63}' | '\u{FF0D}'
    )
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// NFKC canonicalization, dash unification and whitespace collapse.
pub fn normalize_text(s: &str) -> String {
    let unified: String = s
        .nfkc()
        .map(|c| if is_dash_like(c) { '-' } else { c })
        .collect();
    collapse_whitespace(&unified)
}

/// Canonical key form of a code: [`normalize_text`], uppercased, `_`
/// unified to `-`, and whitespace around hyphens removed.
///
/// Idempotent: `normalize_code(normalize_code(x)) == normalize_code(x)`.
pub fn normalize_code(s: &str) -> String {
    let upper = normalize_text(s).to_uppercase();
    let text = normalize_text(&upper).replace('_', "-");
    HYPHEN_SPACING.replace_all(&text, "-").into_owned()
}

/// Space-delimited token form wrapped in sentinel spaces.
///
/// Characters other than ASCII alphanumerics and `-` become token breaks,
/// so `manual_HRD-442.pdf` pads to `" MANUAL HRD-442 PDF "`.
pub fn pad_boundaries(s: &str) -> String {
    let upper = normalize_text(s).to_uppercase();
    let tokens: String = upper
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();
    let body = collapse_whitespace(&tokens);
    if body.is_empty() {
        return String::new();
    }
    format!(" {body} ")
}

/// Split a normalized code into its alphanumeric segments.
///
/// Separators split first; a code with no separator is split once at its
/// first letter/digit transition (`EX3` → `EX`, `3`).
fn split_segments(norm: &str) -> Vec<String> {
    let parts: Vec<String> = norm
        .split(|c: char| matches!(c, '-' | ' ' | '.' | '/'))
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if parts.len() != 1 {
        return parts;
    }

    let single = &parts[0];
    let chars: Vec<char> = single.chars().collect();
    for i in 1..chars.len() {
        let prev = chars[i - 1];
        let cur = chars[i];
        if prev.is_ascii_alphabetic() != cur.is_ascii_alphabetic()
            && prev.is_ascii_alphanumeric()
            && cur.is_ascii_alphanumeric()
        {
            let head: String = chars[..i].iter().collect();
            let tail: String = chars[i..].iter().collect();
            return vec![head, tail];
        }
    }
    parts
}

/// Plausible alternate spellings of a code.
///
/// Always contains the hyphenated, space-separated and concatenated forms
/// (when the code has more than one segment), the normalized form, and the
/// raw spelling in its original, upper and lower case. The result is sorted
/// and deduplicated, so it is the same no matter how or when it is called.
pub fn generate_variants(code: &str) -> Vec<String> {
    let raw = normalize_text(code);
    let mut variants: BTreeSet<String> = BTreeSet::new();
    if raw.is_empty() {
        return Vec::new();
    }

    let norm = normalize_code(&raw);
    let segments = split_segments(&norm);
    if segments.len() > 1 {
        variants.insert(segments.join("-"));
        variants.insert(segments.join(" "));
        variants.insert(segments.concat());
    }

    variants.insert(norm.clone());
    variants.insert(norm.to_lowercase());
    variants.insert(raw.to_uppercase());
    variants.insert(raw.to_lowercase());
    variants.insert(raw);

    variants.into_iter().collect()
}

/// One occurrence of a code inside a piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeMatch {
    pub code: Code,
    /// Byte offset into the output of [`normalize_text`].
    pub position: usize,
}

fn qualifies_as_code(token: &str) -> bool {
    let alnum = token.chars().filter(char::is_ascii_alphanumeric).count();
    alnum >= MIN_CODE_ALNUM
        && token.chars().any(|c| c.is_ascii_alphabetic())
        && token.chars().any(|c| c.is_ascii_digit())
}

/// Single-case letters only: `EX` and `ex` join with a following number,
/// `Ex` (a capitalized word) does not.
fn is_letter_prefix(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_PREFIX_LETTERS
        && (token.chars().all(|c| c.is_ascii_uppercase())
            || token.chars().all(|c| c.is_ascii_lowercase()))
}

/// Every code-shaped token in `text`, in order of appearance.
///
/// Tokens are maximal ASCII alphanumeric runs, optionally joined by `-`,
/// so neighbouring Hangul or other non-Latin characters end a token
/// instead of being absorbed into it. A short uppercase letter
/// token directly followed by a space and a numeric token is read as one
/// code (`EX 3`).
pub fn scan_codes(text: &str) -> Vec<CodeMatch> {
    let normalized = normalize_text(text);
    let tokens: Vec<regex::Match<'_>> = CODE_TOKEN.find_iter(&normalized).collect();

    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i];
        if let Some(next) = tokens.get(i + 1) {
            let gap = &normalized[tok.end()..next.start()];
            if gap == " "
                && is_letter_prefix(tok.as_str())
                && next.as_str().starts_with(|c: char| c.is_ascii_digit())
            {
                let joined = &normalized[tok.start()..next.end()];
                if qualifies_as_code(joined) {
                    out.push(CodeMatch {
                        code: Code::new(joined),
                        position: tok.start(),
                    });
                    i += 2;
                    continue;
                }
            }
        }
        if qualifies_as_code(tok.as_str()) {
            out.push(CodeMatch {
                code: Code::new(tok.as_str()),
                position: tok.start(),
            });
        }
        i += 1;
    }
    out
}

/// Distinct codes in `text`, first occurrence wins.
pub fn extract_codes(text: &str) -> Vec<Code> {
    let mut seen = BTreeSet::new();
    scan_codes(text)
        .into_iter()
        .filter(|m| seen.insert(m.code.norm.clone()))
        .map(|m| m.code)
        .collect()
}
