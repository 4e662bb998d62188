pub mod ast;

use tracing::warn;

use common::utils::config::{ChunkStrategy, ChunkerConfig};
use common::utils::tokens;

use ast::ParsedSource;

/// A cut region of one file, before it becomes a stored chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    /// 1-based, inclusive.
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub token_count: u32,
    pub truncated: bool,
}

#[derive(Debug, Default)]
pub struct ChunkerOutput {
    pub drafts: Vec<ChunkDraft>,
    pub used_ast: bool,
    pub truncated_count: usize,
}

/// Cut one file into chunks. `parsed` is the shared tree-sitter parse; when
/// absent (or empty) in `ast`/`hybrid` mode the file falls through to greedy.
pub fn chunk_file(
    parsed: Option<&ParsedSource>,
    content: &str,
    config: &ChunkerConfig,
    path_for_log: &str,
) -> ChunkerOutput {
    let use_ast = match config.strategy {
        ChunkStrategy::Greedy => false,
        ChunkStrategy::Ast | ChunkStrategy::Hybrid => {
            let parse_ok = parsed.is_some_and(|p| !p.declarations.is_empty());
            if !parse_ok && config.strategy == ChunkStrategy::Ast {
                warn!(path = path_for_log, "unparseable file in ast mode; falling back to greedy");
            }
            parse_ok
        }
    };

    let mut output = if use_ast {
        // `parsed` is Some here by construction.
        match parsed {
            Some(parsed) => ast_chunks(parsed, content, config),
            None => greedy_chunks(content, config),
        }
    } else {
        greedy_chunks(content, config)
    };

    merge_small_fragments(&mut output.drafts, config.min_chunk_chars);
    output.drafts.retain(|d| !d.content.trim().is_empty());
    output.truncated_count = output.drafts.iter().filter(|d| d.truncated).count();
    output
}

fn line_token_counts(lines: &[&str]) -> Vec<u32> {
    lines
        .iter()
        .map(|line| u32::try_from(tokens::count(line)).unwrap_or(u32::MAX))
        .collect()
}

/// Build a draft straight from 0-based inclusive line indices.
fn draft_from_lines(
    lines: &[&str],
    counts: &[u32],
    start: usize,
    end: usize,
    config: &ChunkerConfig,
) -> ChunkDraft {
    let content = lines[start..=end].join("\n");
    let token_count: u32 = counts[start..=end].iter().sum();
    ChunkDraft {
        start_line: start as u32 + 1,
        end_line: end as u32 + 1,
        content,
        token_count,
        truncated: token_count as usize > config.max_chunk_tokens,
    }
}

fn greedy_chunks(content: &str, config: &ChunkerConfig) -> ChunkerOutput {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return ChunkerOutput::default();
    }
    let counts = line_token_counts(&lines);

    let mut drafts = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let mut end = start;
        let mut total: u32 = 0;
        // Windows never break inside a line; a window always advances by at
        // least one line even when that line alone exceeds the budget.
        while end < lines.len() {
            let next = total.saturating_add(counts[end]);
            if end > start && next > config.chunk_size as u32 {
                break;
            }
            total = next;
            end += 1;
        }

        drafts.push(draft_from_lines(&lines, &counts, start, end - 1, config));

        if end >= lines.len() {
            break;
        }

        // Back up enough trailing lines to cover the configured token overlap.
        let mut overlap_tokens: u32 = 0;
        let mut next_start = end;
        while next_start > start + 1 && overlap_tokens < config.chunk_overlap as u32 {
            next_start -= 1;
            overlap_tokens = overlap_tokens.saturating_add(counts[next_start]);
        }
        start = next_start.max(start + 1);
    }

    ChunkerOutput {
        drafts,
        used_ast: false,
        truncated_count: 0,
    }
}

fn ast_chunks(parsed: &ParsedSource, content: &str, config: &ChunkerConfig) -> ChunkerOutput {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return ChunkerOutput::default();
    }
    let counts = line_token_counts(&lines);
    let total_lines = lines.len() as u32;

    let preamble_text = match (config.preserve_imports, parsed.preamble) {
        (true, Some((p_start, p_end))) => {
            let text = slice_lines(&lines, p_start, p_end.min(total_lines));
            if text.trim().is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    };

    // One chunk per outermost declaration: a declaration contained in an
    // already-covered span (a method inside its class body) is skipped.
    let mut spans: Vec<&ast::Declaration> = parsed.declarations.iter().collect();
    spans.sort_by_key(|d| (d.start_line, std::cmp::Reverse(d.end_line)));

    let mut covered: Vec<(u32, u32)> = Vec::new();
    let mut drafts = Vec::new();
    for decl in spans {
        let start = decl.start_line.clamp(1, total_lines);
        let end = decl.end_line.clamp(start, total_lines);
        if covered.iter().any(|(s, e)| *s <= start && end <= *e) {
            continue;
        }
        covered.push((start, end));

        emit_declaration(
            &lines,
            &counts,
            decl,
            start,
            end,
            preamble_text.as_deref(),
            config,
            &mut drafts,
        );
    }

    // Code outside any declaration (top-level statements, trailing script
    // sections) still gets indexed, greedily per uncovered region.
    if preamble_text.is_some() {
        if let Some((p_start, p_end)) = parsed.preamble {
            covered.push((p_start, p_end));
        }
    }
    covered.sort_unstable();
    let mut cursor: u32 = 1;
    let mut gaps: Vec<(u32, u32)> = Vec::new();
    for (s, e) in &covered {
        if *s > cursor {
            gaps.push((cursor, s - 1));
        }
        cursor = cursor.max(e + 1);
    }
    if cursor <= total_lines {
        gaps.push((cursor, total_lines));
    }
    for (gap_start, gap_end) in gaps {
        let text = slice_lines(&lines, gap_start, gap_end);
        if text.trim().is_empty() || text.len() < config.min_chunk_chars {
            continue;
        }
        let inner = greedy_chunks(&text, config);
        for mut draft in inner.drafts {
            draft.start_line += gap_start - 1;
            draft.end_line += gap_start - 1;
            drafts.push(draft);
        }
    }

    drafts.sort_by_key(|d| (d.start_line, d.end_line));

    ChunkerOutput {
        drafts,
        used_ast: true,
        truncated_count: 0,
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_declaration(
    lines: &[&str],
    counts: &[u32],
    decl: &ast::Declaration,
    start: u32,
    end: u32,
    preamble: Option<&str>,
    config: &ChunkerConfig,
    drafts: &mut Vec<ChunkDraft>,
) {
    let span_tokens: u32 = counts[(start - 1) as usize..end as usize].iter().sum();

    if span_tokens as usize <= config.max_chunk_tokens {
        drafts.push(assemble_draft(lines, start, end, preamble, config, false));
        return;
    }

    // Over-large declaration: split at statement boundaries, duplicating
    // `ast_overlap_lines` of context across adjacent pieces.
    let mut boundaries: Vec<u32> = decl
        .statement_starts
        .iter()
        .copied()
        .filter(|line| *line > start && *line <= end)
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();

    if boundaries.is_empty() {
        // Nothing to split on; emit whole with the truncation flag.
        drafts.push(assemble_draft(lines, start, end, preamble, config, true));
        return;
    }

    // Contiguous statement segments covering [start, end].
    let mut segments: Vec<(u32, u32)> = Vec::new();
    let mut segment_start = start;
    for boundary in &boundaries {
        if *boundary > segment_start {
            segments.push((segment_start, boundary - 1));
            segment_start = *boundary;
        }
    }
    segments.push((segment_start, end));

    let segment_tokens =
        |s: u32, e: u32| counts[(s - 1) as usize..e as usize].iter().sum::<u32>();

    let mut i = 0usize;
    while i < segments.len() {
        let piece_start = segments[i].0;
        let mut piece_end = segments[i].1;
        let mut total = segment_tokens(piece_start, piece_end);
        let mut j = i + 1;
        while j < segments.len() {
            let with_next = total.saturating_add(segment_tokens(segments[j].0, segments[j].1));
            if with_next > config.max_chunk_tokens as u32 {
                break;
            }
            total = with_next;
            piece_end = segments[j].1;
            j += 1;
        }

        // Duplicate a few lines of leading context across adjacent pieces.
        let context_start = piece_start
            .saturating_sub(config.ast_overlap_lines as u32)
            .max(start);
        let still_oversized = total as usize > config.max_chunk_tokens;
        drafts.push(assemble_draft(
            lines,
            context_start,
            piece_end,
            preamble,
            config,
            still_oversized,
        ));
        i = j;
    }
}

fn assemble_draft(
    lines: &[&str],
    start: u32,
    end: u32,
    preamble: Option<&str>,
    config: &ChunkerConfig,
    truncated: bool,
) -> ChunkDraft {
    let body = slice_lines(lines, start, end);
    // The chunk covering the file head already contains the import block.
    let content = match preamble {
        Some(preamble) if start > 1 => format!("{preamble}\n\n{body}"),
        _ => body,
    };
    let token_count = u32::try_from(tokens::count(&content)).unwrap_or(u32::MAX);
    let truncated = truncated || token_count as usize > config.max_chunk_tokens;
    ChunkDraft {
        start_line: start,
        end_line: end,
        content,
        token_count,
        truncated,
    }
}

fn slice_lines(lines: &[&str], start: u32, end: u32) -> String {
    let start_idx = (start.saturating_sub(1)) as usize;
    let end_idx = (end as usize).min(lines.len());
    lines[start_idx..end_idx].join("\n")
}

fn merge_small_fragments(drafts: &mut Vec<ChunkDraft>, min_chunk_chars: usize) {
    let mut merged: Vec<ChunkDraft> = Vec::with_capacity(drafts.len());
    for draft in drafts.drain(..) {
        let too_small = draft.content.len() < min_chunk_chars;
        match merged.last_mut() {
            Some(previous) if too_small && previous.end_line + 1 >= draft.start_line => {
                previous.content.push('\n');
                previous.content.push_str(&draft.content);
                previous.end_line = previous.end_line.max(draft.end_line);
                previous.token_count = previous.token_count.saturating_add(draft.token_count);
                previous.truncated |= draft.truncated;
            }
            _ => merged.push(draft),
        }
    }
    *drafts = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::ChunkerConfig;

    fn config() -> ChunkerConfig {
        ChunkerConfig {
            strategy: ChunkStrategy::Hybrid,
            chunk_size: 40,
            chunk_overlap: 8,
            min_chunk_chars: 10,
            max_chunk_tokens: 120,
            ast_overlap_lines: 1,
            preserve_imports: true,
            summaries: false,
        }
    }

    const PY_SRC: &str = r#"import os

def login(user):
    token = os.urandom(16)
    return token

def logout(user):
    return None
"#;

    #[test]
    fn chunking_is_deterministic() {
        let parsed = ast::parse_source("python", "m", PY_SRC);
        let first = chunk_file(parsed.as_ref(), PY_SRC, &config(), "m.py");
        let second = chunk_file(parsed.as_ref(), PY_SRC, &config(), "m.py");
        assert_eq!(first.drafts, second.drafts);
        assert!(first.used_ast);
    }

    #[test]
    fn ast_mode_emits_one_chunk_per_declaration() {
        let parsed = ast::parse_source("python", "m", PY_SRC);
        let output = chunk_file(parsed.as_ref(), PY_SRC, &config(), "m.py");

        let spans: Vec<(u32, u32)> = output
            .drafts
            .iter()
            .map(|d| (d.start_line, d.end_line))
            .collect();
        assert!(spans.contains(&(3, 5)), "login span missing: {spans:?}");
        assert!(spans.contains(&(7, 8)), "logout span missing: {spans:?}");
    }

    #[test]
    fn preamble_is_prepended_when_preserve_imports_is_on() {
        let parsed = ast::parse_source("python", "m", PY_SRC);
        let output = chunk_file(parsed.as_ref(), PY_SRC, &config(), "m.py");

        let login = output
            .drafts
            .iter()
            .find(|d| d.content.contains("def login"))
            .expect("login chunk");
        assert!(login.content.starts_with("import os"));
    }

    #[test]
    fn greedy_mode_never_breaks_inside_a_line() {
        let content = (0..30)
            .map(|i| format!("let value_{i} = compute({i});"))
            .collect::<Vec<_>>()
            .join("\n");
        let cfg = ChunkerConfig {
            strategy: ChunkStrategy::Greedy,
            ..config()
        };
        let output = chunk_file(None, &content, &cfg, "gen.rs");

        assert!(output.drafts.len() > 1);
        for draft in &output.drafts {
            for line in draft.content.lines() {
                assert!(
                    line.is_empty() || line.ends_with(';'),
                    "line was split mid-way: {line:?}"
                );
            }
        }
    }

    #[test]
    fn greedy_windows_overlap() {
        let content = (0..40)
            .map(|i| format!("statement_number_{i}();"))
            .collect::<Vec<_>>()
            .join("\n");
        let cfg = ChunkerConfig {
            strategy: ChunkStrategy::Greedy,
            ..config()
        };
        let output = chunk_file(None, &content, &cfg, "gen.rs");

        assert!(output.drafts.len() >= 2);
        for pair in output.drafts.windows(2) {
            assert!(
                pair[1].start_line <= pair[0].end_line,
                "expected overlapping windows: {:?} then {:?}",
                (pair[0].start_line, pair[0].end_line),
                (pair[1].start_line, pair[1].end_line)
            );
        }
    }

    #[test]
    fn oversized_declaration_splits_at_statement_boundaries() {
        let mut body = String::from("def massive():\n");
        for i in 0..200 {
            body.push_str(&format!("    value_{i} = compute_{i}(a, b, c, d)\n"));
        }
        let parsed = ast::parse_source("python", "m", &body);
        let output = chunk_file(parsed.as_ref(), &body, &config(), "m.py");

        assert!(
            output.drafts.len() > 1,
            "oversized declaration should split into several chunks"
        );
        assert!(output.drafts.iter().all(|d| !d.truncated));
    }

    #[test]
    fn unsplittable_oversize_sets_truncation_flag() {
        let giant_line = format!("x = [{}]", vec!["1"; 2000].join(", "));
        let cfg = ChunkerConfig {
            strategy: ChunkStrategy::Greedy,
            max_chunk_tokens: 100,
            ..config()
        };
        let output = chunk_file(None, &giant_line, &cfg, "m.py");

        assert_eq!(output.drafts.len(), 1);
        assert!(output.drafts[0].truncated);
        assert_eq!(output.truncated_count, 1);
    }

    #[test]
    fn small_trailing_fragment_merges_into_previous() {
        let content = "fn first() {\n    work();\n    more();\n}\nok\n";
        let cfg = ChunkerConfig {
            strategy: ChunkStrategy::Greedy,
            chunk_size: 8,
            chunk_overlap: 0,
            ..config()
        };
        let output = chunk_file(None, content, &cfg, "m.rs");

        let last = output.drafts.last().expect("chunks");
        assert!(
            last.content.len() >= cfg.min_chunk_chars || output.drafts.len() == 1,
            "trailing fragment should merge into the previous chunk"
        );
    }
}
