//! Length-adaptive text chunker.
//!
//! Splits normalized document text into overlapping chunks. The chunk size
//! and overlap are picked from the document's total length so short notes
//! produce fine-grained chunks while long manuals produce fewer, larger
//! ones. Splitting prefers paragraph boundaries (`\n\n`); paragraphs larger
//! than the chunk size are hard-split at space/newline boundaries.

use crate::config::ChunkingConfig;

/// Size and overlap, both in bytes of UTF-8 text (boundary-snapped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub size: usize,
    pub overlap: usize,
}

/// Picks the policy tier for a document of `len` bytes.
pub fn policy_for(len: usize) -> ChunkPolicy {
    if len < 2_000 {
        ChunkPolicy {
            size: 400,
            overlap: 50,
        }
    } else if len < 10_000 {
        ChunkPolicy {
            size: 800,
            overlap: 120,
        }
    } else if len < 50_000 {
        ChunkPolicy {
            size: 1_200,
            overlap: 200,
        }
    } else {
        ChunkPolicy {
            size: 1_600,
            overlap: 280,
        }
    }
}

/// Splits text using the configured override when present, otherwise the
/// adaptive tier for the text's length.
pub fn split(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let policy = match config.size {
        Some(size) => ChunkPolicy {
            size,
            overlap: config.overlap.unwrap_or(size / 8),
        },
        None => policy_for(text.len()),
    };
    split_with(text, policy)
}

/// Splits text under an explicit policy. Chunks come back in document order
/// and are never empty after trimming.
pub fn split_with(text: &str, policy: ChunkPolicy) -> Vec<String> {
    let mut chunks = accumulate_paragraphs(text, policy);

    // Degenerate input (for example a single run of separators) can leave
    // the accumulator with nothing; fall back to a bare blank-line split.
    if chunks.is_empty() {
        chunks = text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }
    if chunks.is_empty() && !text.trim().is_empty() {
        chunks.push(text.trim().to_string());
    }

    chunks
}

fn accumulate_paragraphs(text: &str, policy: ChunkPolicy) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut buf = String::new();

    let mut flush = |buf: &mut String, chunks: &mut Vec<String>| {
        let trimmed = buf.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        let tail = overlap_tail(trimmed, policy.overlap);
        buf.clear();
        buf.push_str(&tail);
    };

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if would_be > policy.size && !buf.trim().is_empty() {
            flush(&mut buf, &mut chunks);
        }

        if para.len() > policy.size {
            if !buf.trim().is_empty() {
                flush(&mut buf, &mut chunks);
            }
            buf.clear();
            for piece in hard_split(para, policy.size, policy.overlap) {
                chunks.push(piece);
            }
            // Seed the next chunk with the tail of the last hard piece.
            if let Some(last) = chunks.last() {
                buf.push_str(&overlap_tail(last, policy.overlap));
            }
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(para);
        }
    }

    let trimmed = buf.trim();
    if !trimmed.is_empty() {
        // An all-overlap remainder would duplicate the previous chunk's tail.
        let is_pure_overlap = chunks
            .last()
            .map(|last| last.ends_with(trimmed))
            .unwrap_or(false);
        if !is_pure_overlap {
            chunks.push(trimmed.to_string());
        }
    }

    chunks
}

/// Hard-splits an oversized paragraph at space/newline boundaries, stepping
/// back by `overlap` bytes between pieces.
fn hard_split(para: &str, size: usize, overlap: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < para.len() {
        let mut end = floor_char_boundary(para, (start + size).min(para.len()));
        if end < para.len() {
            // Prefer breaking at whitespace inside the window.
            if let Some(pos) = para[start..end].rfind(['\n', ' ']) {
                if pos > 0 {
                    end = start + pos + 1;
                }
            }
        }
        if end <= start {
            end = floor_char_boundary(para, (start + size).min(para.len())).max(start + 1);
            end = ceil_char_boundary(para, end);
        }

        let piece = para[start..end].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        if end >= para.len() {
            break;
        }
        let next = end.saturating_sub(overlap).max(start + 1);
        start = ceil_char_boundary(para, next);
    }

    pieces
}

/// Last `overlap` bytes of a chunk, snapped to a word start.
fn overlap_tail(chunk: &str, overlap: usize) -> String {
    if overlap == 0 || chunk.is_empty() {
        return String::new();
    }
    if chunk.len() <= overlap {
        return chunk.to_string();
    }
    let cut = ceil_char_boundary(chunk, chunk.len() - overlap);
    let tail = &chunk[cut..];
    match tail.find(' ') {
        Some(pos) if pos + 1 < tail.len() => tail[pos + 1..].to_string(),
        _ => tail.to_string(),
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_is_one_chunk() {
        let chunks = split(&"Hello, world!".to_string(), &ChunkingConfig::default());
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn tier_selection() {
        assert_eq!(policy_for(100).size, 400);
        assert_eq!(policy_for(5_000).size, 800);
        assert_eq!(policy_for(20_000).size, 1_200);
        assert_eq!(policy_for(80_000).size, 1_600);
    }

    #[test]
    fn paragraphs_pack_up_to_size() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird paragraph here.";
        let policy = ChunkPolicy {
            size: 50,
            overlap: 0,
        };
        let chunks = split_with(text, policy);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(!c.trim().is_empty());
        }
    }

    #[test]
    fn order_is_preserved() {
        let text = (0..40)
            .map(|i| format!("Paragraph number {} with some padding text.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = split_with(
            &text,
            ChunkPolicy {
                size: 120,
                overlap: 0,
            },
        );
        let mut last_seen = -1i64;
        for c in &chunks {
            if let Some(n) = c
                .split("Paragraph number ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|n| n.parse::<i64>().ok())
            {
                assert!(n >= last_seen, "paragraph {} seen after {}", n, last_seen);
                last_seen = n;
            }
        }
        assert!(last_seen >= 0);
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let para = "word ".repeat(200);
        let chunks = split_with(
            para.trim(),
            ChunkPolicy {
                size: 100,
                overlap: 10,
            },
        );
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.len() <= 110, "chunk too large: {} bytes", c.len());
            assert!(!c.trim().is_empty());
        }
    }

    #[test]
    fn overlap_carries_trailing_words() {
        let text = "alpha beta gamma delta.\n\nepsilon zeta eta theta.";
        let chunks = split_with(
            text,
            ChunkPolicy {
                size: 24,
                overlap: 12,
            },
        );
        assert!(chunks.len() >= 2);
        // The second chunk starts with words from the end of the first.
        let first_tail_word = chunks[0].split_whitespace().last().unwrap();
        assert!(
            chunks[1].contains(first_tail_word),
            "expected overlap of '{}' in '{}'",
            first_tail_word,
            chunks[1]
        );
    }

    #[test]
    fn multibyte_text_never_splits_inside_a_char() {
        let text = "日本語のテキスト ".repeat(100);
        let chunks = split_with(
            text.trim(),
            ChunkPolicy {
                size: 64,
                overlap: 16,
            },
        );
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.chars().count() > 0);
        }
    }

    #[test]
    fn config_override_wins_over_tiers() {
        let cfg = ChunkingConfig {
            size: Some(60),
            overlap: Some(0),
        };
        let text = "one two three four five six seven eight.\n\nnine ten eleven twelve thirteen fourteen fifteen.";
        let chunks = split(text, &cfg);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn deterministic() {
        let text = "Alpha alpha alpha.\n\nBeta beta beta.\n\nGamma gamma gamma.";
        let policy = ChunkPolicy {
            size: 30,
            overlap: 8,
        };
        assert_eq!(split_with(text, policy), split_with(text, policy));
    }
}
