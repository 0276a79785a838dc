//! Literal text search with surrounding context.
//!
//! Searches workspace files for a literal query, emitting a few lines of
//! context around each match. Binary files are detected with a heuristic
//! (a NUL byte in the first 8 KiB, or more than 5% replacement characters
//! when the sample is long enough) and skipped; the heuristic is exactly
//! that, not a guarantee.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::{split_lines, NumberedLine, ToolError};
use crate::vpath;
use crate::workspace::{EntryKind, FsError, Workspace};

const BINARY_SAMPLE_BYTES: usize = 8 * 1024;
const BINARY_MIN_SAMPLE_CHARS: usize = 64;
const BINARY_REPLACEMENT_RATIO: f64 = 0.05;

/// Search parameters. Unset `case_sensitive` selects smart case: sensitive
/// iff the query contains an uppercase character.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub query: String,
    pub path_prefix: String,
    pub max_results: usize,
    pub context_lines: usize,
    pub max_line_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_sensitive: Option<bool>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            query: String::new(),
            path_prefix: "/".to_string(),
            max_results: 8,
            context_lines: 2,
            max_line_length: 240,
            case_sensitive: None,
        }
    }
}

impl SearchOptions {
    /// Convenience constructor for a query over the whole workspace.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// One match with its context window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub path: String,
    pub match_line: usize,
    pub context_start_line: usize,
    pub context_end_line: usize,
    pub lines: Vec<NumberedLine>,
}

/// Search outcome: completed matches plus scan statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSummary {
    pub results: Vec<SearchMatch>,
    pub truncated: bool,
    pub scanned_files: usize,
    pub matched_files: usize,
    pub skipped_binary_files: usize,
}

pub(crate) fn looks_binary(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(BINARY_SAMPLE_BYTES)];
    if sample.contains(&0) {
        return true;
    }
    let decoded = String::from_utf8_lossy(sample);
    let total = decoded.chars().count();
    if total < BINARY_MIN_SAMPLE_CHARS {
        return false;
    }
    let replacements = decoded.chars().filter(|&c| c == '\u{FFFD}').count();
    replacements as f64 / total as f64 > BINARY_REPLACEMENT_RATIO
}

fn clip_line(line: &str, max_len: usize) -> String {
    if line.chars().count() <= max_len {
        return line.to_string();
    }
    let mut clipped: String = line.chars().take(max_len).collect();
    clipped.push('…');
    clipped
}

struct FileScan {
    halted_at: Option<usize>,
    line_count: usize,
}

/// Search workspace files for a literal query.
pub fn search(ws: &Workspace, opts: &SearchOptions) -> Result<SearchSummary, ToolError> {
    if opts.query.is_empty() {
        return Err(ToolError::BadRequest("empty search query".to_string()));
    }
    let prefix = vpath::normalize(&opts.path_prefix);
    if vpath::is_reserved(&prefix) {
        return Err(ToolError::AccessDenied(prefix));
    }

    let candidates: Vec<String> = match ws.stat(&prefix).map(|s| s.kind) {
        Some(EntryKind::File) => vec![prefix.clone()],
        Some(EntryKind::Dir) => {
            let child_prefix = if prefix == "/" {
                "/".to_string()
            } else {
                format!("{prefix}/")
            };
            ws.file_paths()
                .filter(|p| p.starts_with(&child_prefix) && !vpath::is_reserved(p))
                .map(str::to_string)
                .collect()
        }
        None => return Err(ToolError::Fs(FsError::NotFound(prefix))),
    };

    let case_sensitive = opts
        .case_sensitive
        .unwrap_or_else(|| opts.query.chars().any(char::is_uppercase));
    let needle = if case_sensitive {
        opts.query.clone()
    } else {
        opts.query.to_lowercase()
    };
    let is_match = |line: &str| {
        if case_sensitive {
            line.contains(needle.as_str())
        } else {
            line.to_lowercase().contains(needle.as_str())
        }
    };

    let mut summary = SearchSummary {
        results: Vec::new(),
        truncated: false,
        scanned_files: 0,
        matched_files: 0,
        skipped_binary_files: 0,
    };

    for (file_index, path) in candidates.iter().enumerate() {
        let data = ws.read_file(path)?;
        if looks_binary(data) {
            summary.skipped_binary_files += 1;
            continue;
        }
        summary.scanned_files += 1;

        let text = String::from_utf8_lossy(data);
        let scan = scan_file(path, &text, opts, &is_match, &mut summary);

        if let Some(halted_line) = scan.halted_at {
            let more_in_file = halted_line < scan.line_count;
            let more_files = file_index + 1 < candidates.len();
            summary.truncated = more_in_file || more_files;
            break;
        }
    }

    Ok(summary)
}

fn scan_file(
    path: &str,
    text: &str,
    opts: &SearchOptions,
    is_match: &dyn Fn(&str) -> bool,
    summary: &mut SearchSummary,
) -> FileScan {
    let lines = split_lines(text);
    let line_count = lines.len();

    let mut before: VecDeque<NumberedLine> = VecDeque::with_capacity(opts.context_lines + 1);
    // Matches still collecting after-context. Windows may overlap when
    // matches sit closer together than the context width.
    let mut pending: Vec<(SearchMatch, usize)> = Vec::new();
    let mut matched_this_file = false;

    for (index, raw) in lines.iter().enumerate() {
        let line_number = index + 1;
        let clipped = clip_line(raw, opts.max_line_length);

        for (result, remaining) in pending.iter_mut() {
            result.lines.push(NumberedLine {
                line_number,
                content: clipped.clone(),
            });
            result.context_end_line = line_number;
            *remaining -= 1;
        }

        if is_match(raw) {
            let mut window: Vec<NumberedLine> = before.iter().cloned().collect();
            let context_start_line = window.first().map_or(line_number, |l| l.line_number);
            window.push(NumberedLine {
                line_number,
                content: clipped.clone(),
            });
            let result = SearchMatch {
                path: path.to_string(),
                match_line: line_number,
                context_start_line,
                context_end_line: line_number,
                lines: window,
            };
            pending.push((result, opts.context_lines));
        }

        let mut halted = false;
        pending.retain_mut(|(result, remaining)| {
            if *remaining > 0 || halted {
                return true;
            }
            summary.results.push(result.clone());
            if !matched_this_file {
                matched_this_file = true;
                summary.matched_files += 1;
            }
            if summary.results.len() >= opts.max_results {
                halted = true;
            }
            false
        });
        if halted {
            return FileScan {
                halted_at: Some(line_number),
                line_count,
            };
        }

        before.push_back(NumberedLine {
            line_number,
            content: clipped,
        });
        while before.len() > opts.context_lines {
            before.pop_front();
        }
    }

    // Matches near the end of the file keep whatever context existed.
    for (result, _) in pending {
        summary.results.push(result);
        if !matched_this_file {
            matched_this_file = true;
            summary.matched_files += 1;
        }
        if summary.results.len() >= opts.max_results {
            return FileScan {
                halted_at: Some(line_count),
                line_count,
            };
        }
    }

    FileScan {
        halted_at: None,
        line_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws_with(files: &[(&str, &str)]) -> Workspace {
        let mut ws = Workspace::new();
        for (path, content) in files {
            ws.write_file(path, content.as_bytes().to_vec(), true)
                .unwrap();
        }
        ws
    }

    #[test]
    fn test_smart_case_lowercase_query_is_insensitive() {
        let ws = ws_with(&[("/x.txt", "Hello\nhello\nHELLO\n")]);
        let summary = search(&ws, &SearchOptions::new("hello")).unwrap();
        let match_lines: Vec<usize> = summary.results.iter().map(|r| r.match_line).collect();
        assert_eq!(match_lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_smart_case_uppercase_query_is_sensitive() {
        let ws = ws_with(&[("/x.txt", "Hello\nhello\nHELLO\n")]);
        let summary = search(&ws, &SearchOptions::new("Hello")).unwrap();
        let match_lines: Vec<usize> = summary.results.iter().map(|r| r.match_line).collect();
        assert_eq!(match_lines, vec![1]);
    }

    #[test]
    fn test_explicit_case_overrides_smart_case() {
        let ws = ws_with(&[("/x.txt", "Hello\nhello\n")]);
        let opts = SearchOptions {
            case_sensitive: Some(false),
            ..SearchOptions::new("HELLO")
        };
        assert_eq!(search(&ws, &opts).unwrap().results.len(), 2);
    }

    #[test]
    fn test_context_window() {
        let ws = ws_with(&[("/f", "a\nb\nneedle\nc\nd\ne")]);
        let summary = search(&ws, &SearchOptions::new("needle")).unwrap();
        let result = &summary.results[0];
        assert_eq!(result.match_line, 3);
        assert_eq!(result.context_start_line, 1);
        assert_eq!(result.context_end_line, 5);
        let contents: Vec<&str> = result.lines.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "needle", "c", "d"]);
    }

    #[test]
    fn test_match_at_start_and_end_of_file() {
        let ws = ws_with(&[("/f", "needle\nx\ny")]);
        let summary = search(&ws, &SearchOptions::new("needle")).unwrap();
        assert_eq!(summary.results[0].context_start_line, 1);

        let ws = ws_with(&[("/f", "x\ny\nneedle")]);
        let summary = search(&ws, &SearchOptions::new("needle")).unwrap();
        let result = &summary.results[0];
        assert_eq!(result.context_end_line, 3);
        assert_eq!(result.lines.len(), 3);
    }

    #[test]
    fn test_max_results_and_truncated() {
        let body = "needle\n".repeat(20);
        let ws = ws_with(&[("/f", body.as_str())]);
        let opts = SearchOptions {
            max_results: 3,
            context_lines: 0,
            ..SearchOptions::new("needle")
        };
        let summary = search(&ws, &opts).unwrap();
        assert_eq!(summary.results.len(), 3);
        assert!(summary.truncated);
    }

    #[test]
    fn test_not_truncated_when_scan_completes() {
        let ws = ws_with(&[("/f", "needle\n")]);
        let summary = search(&ws, &SearchOptions::new("needle")).unwrap();
        assert_eq!(summary.results.len(), 1);
        assert!(!summary.truncated);
    }

    #[test]
    fn test_skips_binary_files() {
        let mut ws = ws_with(&[("/text.txt", "needle\n")]);
        ws.write_file("/blob.bin", b"needle\0needle".to_vec(), true)
            .unwrap();
        let summary = search(&ws, &SearchOptions::new("needle")).unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.skipped_binary_files, 1);
        assert_eq!(summary.scanned_files, 1);
    }

    #[test]
    fn test_never_matches_reserved_namespace() {
        let mut ws = ws_with(&[("/a.txt", "needle")]);
        ws.write_file("/.time/entries/e.json", b"needle".to_vec(), true)
            .unwrap();
        let summary = search(&ws, &SearchOptions::new("needle")).unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].path, "/a.txt");
    }

    #[test]
    fn test_file_scoped_search() {
        let ws = ws_with(&[("/a.txt", "needle"), ("/b.txt", "needle")]);
        let opts = SearchOptions {
            path_prefix: "/a.txt".to_string(),
            ..SearchOptions::new("needle")
        };
        let summary = search(&ws, &opts).unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.scanned_files, 1);
    }

    #[test]
    fn test_directory_scope_is_ascending_path_order() {
        let ws = ws_with(&[
            ("/src/z.txt", "needle"),
            ("/src/a.txt", "needle"),
            ("/other.txt", "needle"),
        ]);
        let opts = SearchOptions {
            path_prefix: "/src".to_string(),
            ..SearchOptions::new("needle")
        };
        let summary = search(&ws, &opts).unwrap();
        let paths: Vec<&str> = summary.results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/src/a.txt", "/src/z.txt"]);
    }

    #[test]
    fn test_long_lines_clipped() {
        let long = format!("{}needle{}", "x".repeat(300), "y".repeat(100));
        let ws = ws_with(&[("/f", long.as_str())]);
        let summary = search(&ws, &SearchOptions::new("needle")).unwrap();
        let content = &summary.results[0].lines[0].content;
        assert_eq!(content.chars().count(), 241); // 240 + ellipsis
        assert!(content.ends_with('…'));
    }

    #[test]
    fn test_missing_prefix_not_found() {
        let ws = Workspace::new();
        let err = search(&ws, &SearchOptions::new("x")).err();
        assert!(err.is_none()); // root always exists, zero candidates
        let opts = SearchOptions {
            path_prefix: "/nope".to_string(),
            ..SearchOptions::new("x")
        };
        assert_eq!(search(&ws, &opts).unwrap_err().code(), "not-found");
    }

    #[test]
    fn test_empty_query_rejected() {
        let ws = Workspace::new();
        assert!(matches!(
            search(&ws, &SearchOptions::new("")),
            Err(ToolError::BadRequest(_))
        ));
    }
}
