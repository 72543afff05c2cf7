//! Paragraph-boundary text chunker with adjacent-chunk overlap.
//!
//! Splits record text into [`Chunk`]s that respect a `max_tokens` budget.
//! Splitting happens on paragraph boundaries (`\n\n`), which for chat
//! threads are message boundaries, so each chunk stays coherent. Paragraphs
//! longer than the budget are hard-split on the last newline or space.
//!
//! Every chunk after the first starts with the word-aligned tail (about
//! `overlap_tokens` worth) of the previous chunk, so a passage that
//! straddles a boundary is retrievable from either side. The body budget
//! is reduced by the overlap so the final text stays within `max_tokens`.
//!
//! Chunk ids are `{document_id}#{seq}` and each chunk carries a SHA-256 of
//! its text.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks with contiguous sequence numbers starting at 0.
///
/// Blank text yields no chunks.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);
    // One extra byte for the newline joining overlap and body.
    let body_chars = if overlap_chars > 0 {
        max_chars.saturating_sub(overlap_chars + 1).max(1)
    } else {
        max_chars
    };

    let pieces = pack_paragraphs(text, body_chars);

    let mut chunks = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        let body = if i > 0 && overlap_chars > 0 {
            let tail = word_tail(&pieces[i - 1], overlap_chars);
            if tail.is_empty() {
                piece.clone()
            } else {
                format!("{}\n{}", tail, piece)
            }
        } else {
            piece.clone()
        };
        chunks.push(make_chunk(document_id, i as i64, &body));
    }
    chunks
}

/// Greedy paragraph packing within `max_chars`.
fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = split_point(remaining, max_chars);
                let piece = remaining[..split_at].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = remaining[split_at..].trim_start();
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }
    pieces
}

/// Byte offset to cut `s` at: the last newline or space before `max_chars`,
/// else the hard limit. Always a char boundary and always > 0.
fn split_point(s: &str, max_chars: usize) -> usize {
    if s.len() <= max_chars {
        return s.len();
    }
    let limit = floor_char_boundary(s, max_chars);
    let head = &s[..limit];
    let at = head
        .rfind('\n')
        .or_else(|| head.rfind(' '))
        .map(|pos| pos + 1)
        .unwrap_or(limit);
    if at == 0 {
        // A single char wider than the budget.
        s.chars().next().map_or(s.len(), char::len_utf8)
    } else {
        at
    }
}

/// Last `n` bytes of `s`, moved forward to the next word start.
fn word_tail(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s.trim();
    }
    let mut start = s.len() - n;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    let tail = &s[start..];
    let mid_word = s[..start]
        .chars()
        .next_back()
        .is_some_and(|c| !c.is_whitespace());
    if mid_word {
        match tail.find(char::is_whitespace) {
            Some(pos) => tail[pos..].trim(),
            None => "",
        }
    } else {
        tail.trim()
    }
}

fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(document_id: &str, seq: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: format!("{}#{}", document_id, seq),
        document_id: document_id.to_string(),
        seq,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("docs:intro", "Hello, world!", 256, 32);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[0].id, "docs:intro#0");
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_text("doc1", "", 256, 32).is_empty());
        assert!(chunk_text("doc1", "  \n\n \n", 256, 32).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text("doc1", text, 256, 0);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_seq_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("doc1", &text, 10, 2);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.seq, i as i64, "seq mismatch at position {}", i);
            assert_eq!(c.id, format!("doc1#{}", i));
        }
    }

    #[test]
    fn test_chunks_respect_budget() {
        let text = "word ".repeat(2_000);
        let chunks = chunk_text("doc1", &text, 16, 4);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.len() <= 16 * CHARS_PER_TOKEN, "{}", c.text.len());
        }
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let text = "alpha beta gamma delta.\n\nepsilon zeta eta theta.\n\niota kappa lambda mu.";
        // max 8 tokens => 32 chars, overlap 2 tokens => 8 chars
        let chunks = chunk_text("doc1", text, 8, 2);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.starts_with("alpha"));
        // Second chunk opens with the tail of the first.
        assert!(chunks[1].text.starts_with("delta."), "{}", chunks[1].text);
        assert!(chunks[1].text.contains("epsilon"));
    }

    #[test]
    fn test_no_overlap_when_disabled() {
        let text = "alpha beta gamma delta.\n\nepsilon zeta eta theta.";
        let chunks = chunk_text("doc1", text, 6, 0);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with("epsilon"));
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let text = "ünïcödé ".repeat(200);
        let chunks = chunk_text("doc1", &text, 5, 1);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc1", text, 2, 1);
        let c2 = chunk_text("doc1", text, 2, 1);
        assert_eq!(c1, c2);
    }
}
