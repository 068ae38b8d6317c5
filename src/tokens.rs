//! Token budget helpers
//!
//! A tokenizer-free estimate: about four characters per token for prose and
//! SQL, with CJK characters counted one token each. Good enough for choosing
//! between the full schema, its DDL form and the per-table fallback.

const TRUNCATION_MARKER: &str = "\n... (output truncated)";

/// Estimate how many tokens `text` costs.
pub fn estimate(text: &str) -> usize {
    let mut ascii_like = 0usize;
    let mut wide = 0usize;
    for c in text.chars() {
        if (c as u32) >= 0x2E80 {
            wide += 1;
        } else {
            ascii_like += 1;
        }
    }
    (ascii_like + 3) / 4 + wide
}

/// Truncate `text` so that its estimate fits in `max_tokens`, keeping the
/// head. A marker line is appended when anything was cut.
pub fn truncate(text: &str, max_tokens: usize) -> String {
    if estimate(text) <= max_tokens {
        return text.to_string();
    }
    let marker_cost = estimate(TRUNCATION_MARKER);
    let budget = max_tokens.saturating_sub(marker_cost);

    let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).chain([text.len()]).collect();
    let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if estimate(&text[..boundaries[mid]]) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    format!("{}{}", &text[..boundaries[lo]], TRUNCATION_MARKER)
}
