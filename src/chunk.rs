//! Recursive-separator text chunker with overlap and page attribution.
//!
//! Text is split at the coarsest separator that keeps pieces within the
//! character budget, falling back through progressively finer separators
//! (paragraph, line, sentence, clause, word) before resorting to a hard
//! character split. Adjacent pieces are then greedily merged back up to
//! the budget, and each chunk after the first is prefixed with the tail of
//! its predecessor so that boundary-straddling clauses stay retrievable.
//!
//! Chunking is fully deterministic: the same pages and settings always
//! produce the same chunk texts in the same order.

use std::ops::Range;

/// Separators in coarse-to-fine order. The empty fallback is a hard split
/// at the character budget.
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", ", ", " "];

/// One chunk of text with its majority source page (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub text: String,
    pub page: Option<i64>,
}

/// Split page texts into overlapping chunks.
///
/// Returns an empty vec for whitespace-only input; callers treat that as
/// an empty document. `overlap_chars` must be less than `max_chars`
/// (enforced by config validation).
pub fn chunk_pages(pages: &[String], max_chars: usize, overlap_chars: usize) -> Vec<ChunkPiece> {
    let mut full = String::new();
    let mut page_ranges: Vec<Range<usize>> = Vec::with_capacity(pages.len());
    for (i, page) in pages.iter().enumerate() {
        if i > 0 && !full.ends_with("\n\n") {
            full.push_str("\n\n");
        }
        let start = full.len();
        full.push_str(page);
        page_ranges.push(start..full.len());
    }

    if full.trim().is_empty() {
        return Vec::new();
    }

    let fragments = split_recursive(&full, 0..full.len(), 0, max_chars);

    // Greedy merge back up to the budget; fragments are contiguous
    let mut merged: Vec<Range<usize>> = Vec::new();
    for frag in fragments {
        match merged.last_mut() {
            Some(last)
                if last.end == frag.start
                    && char_len(&full[last.start..frag.end]) <= max_chars =>
            {
                last.end = frag.end;
            }
            _ => merged.push(frag),
        }
    }

    let mut out: Vec<ChunkPiece> = Vec::new();
    let mut prev_tail: Option<String> = None;
    for range in merged {
        let body = &full[range.clone()];
        if body.trim().is_empty() {
            continue;
        }

        let mut text = String::new();
        if let Some(tail) = prev_tail.take() {
            text.push_str(&tail);
        }
        text.push_str(body);

        prev_tail = Some(tail_chars(body, overlap_chars).to_string());
        out.push(ChunkPiece {
            text,
            page: majority_page(&range, &page_ranges),
        });
    }

    out
}

/// Page (1-based) contributing the most bytes to the span; earlier page
/// wins ties.
fn majority_page(span: &Range<usize>, page_ranges: &[Range<usize>]) -> Option<i64> {
    let mut best: Option<(usize, i64)> = None;
    for (i, page) in page_ranges.iter().enumerate() {
        let start = span.start.max(page.start);
        let end = span.end.min(page.end);
        if end <= start {
            continue;
        }
        let overlap = end - start;
        if best.map_or(true, |(b, _)| overlap > b) {
            best = Some((overlap, i as i64 + 1));
        }
    }
    best.map(|(_, page)| page)
}

fn split_recursive(
    full: &str,
    range: Range<usize>,
    sep_idx: usize,
    max_chars: usize,
) -> Vec<Range<usize>> {
    if char_len(&full[range.clone()]) <= max_chars {
        return vec![range];
    }
    if sep_idx >= SEPARATORS.len() {
        return hard_split(full, range, max_chars);
    }

    let sep = SEPARATORS[sep_idx];
    let s = &full[range.clone()];
    let mut parts: Vec<Range<usize>> = Vec::new();
    let mut start = range.start;
    for (pos, m) in s.match_indices(sep) {
        // Separator stays attached to the preceding piece
        let end = range.start + pos + m.len();
        if end > start {
            parts.push(start..end);
        }
        start = end;
    }
    if start < range.end {
        parts.push(start..range.end);
    }

    if parts.len() <= 1 {
        return split_recursive(full, range, sep_idx + 1, max_chars);
    }

    let mut out = Vec::new();
    for part in parts {
        if char_len(&full[part.clone()]) > max_chars {
            out.extend(split_recursive(full, part, sep_idx + 1, max_chars));
        } else {
            out.push(part);
        }
    }
    out
}

/// Last-resort split every `max_chars` characters, on char boundaries.
fn hard_split(full: &str, range: Range<usize>, max_chars: usize) -> Vec<Range<usize>> {
    let s = &full[range.clone()];
    let mut out = Vec::new();
    let mut start = range.start;
    let mut count = 0;
    for (off, _) in s.char_indices() {
        if count == max_chars {
            out.push(start..range.start + off);
            start = range.start + off;
            count = 0;
        }
        count += 1;
    }
    if start < range.end {
        out.push(start..range.end);
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of `s`, respecting char boundaries.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let total = char_len(s);
    if total <= n {
        return s;
    }
    let skip = total - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}
