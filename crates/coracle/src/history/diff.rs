//! Human-readable view of a journal entry's changes.

use serde::{Deserialize, Serialize};

use super::{Change, HistoryError, TimeMachine};
use crate::tools::{looks_binary, split_lines};
use crate::workspace::Workspace;

/// Kind of a diff operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    #[serde(rename = "file+")]
    FileAdded,
    #[serde(rename = "file-")]
    FileRemoved,
    #[serde(rename = "file~")]
    FileModified,
    #[serde(rename = "dir+")]
    DirAdded,
    #[serde(rename = "dir-")]
    DirRemoved,
}

/// A short excerpt of both sides around the first differing line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffPreview {
    /// 1-based line where the two sides first diverge.
    pub start_line: usize,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

/// One changed path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffOp {
    pub op: DiffKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<DiffPreview>,
}

/// Diff view of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffReport {
    pub id: String,
    pub ops: Vec<DiffOp>,
    /// Set when more file changes existed than the caller's cap allowed.
    pub truncated: bool,
}

pub(super) fn build_report(
    ws: &Workspace,
    id: &str,
    max_files: usize,
    max_preview_lines: usize,
) -> Result<DiffReport, HistoryError> {
    let entry = TimeMachine::load_entry(ws, id)?;
    let mut ops = Vec::new();
    let mut file_ops = 0;
    let mut truncated = false;

    for change in &entry.changes {
        match change {
            Change::File {
                path,
                before_exists,
                after_exists,
                before_blob,
                after_blob,
                ..
            } => {
                if file_ops >= max_files {
                    truncated = true;
                    continue;
                }
                file_ops += 1;

                let op = match (before_exists, after_exists) {
                    (false, true) => DiffKind::FileAdded,
                    (true, false) => DiffKind::FileRemoved,
                    _ => DiffKind::FileModified,
                };
                let before_bytes = load_side(ws, *before_exists, before_blob.as_deref());
                let after_bytes = load_side(ws, *after_exists, after_blob.as_deref());
                let preview = text_preview(
                    before_bytes.as_deref(),
                    after_bytes.as_deref(),
                    max_preview_lines,
                );
                ops.push(DiffOp {
                    op,
                    path: path.clone(),
                    preview,
                });
            }
            Change::Dir {
                path, after_exists, ..
            } => {
                ops.push(DiffOp {
                    op: if *after_exists {
                        DiffKind::DirAdded
                    } else {
                        DiffKind::DirRemoved
                    },
                    path: path.clone(),
                    preview: None,
                });
            }
        }
    }

    Ok(DiffReport {
        id: entry.id,
        ops,
        truncated,
    })
}

fn load_side(ws: &Workspace, exists: bool, blob: Option<&str>) -> Option<Vec<u8>> {
    if !exists {
        return None;
    }
    blob.and_then(|b| ws.read_file(b).ok().map(<[u8]>::to_vec))
}

/// Compute the preview windows: the first differing line from the top, the
/// last differing line from the bottom of each side, and up to
/// `max_preview_lines` lines of each side starting at the divergence point.
/// Binary content on either side yields no preview.
fn text_preview(
    before: Option<&[u8]>,
    after: Option<&[u8]>,
    max_preview_lines: usize,
) -> Option<DiffPreview> {
    if before.is_none() && after.is_none() {
        return None;
    }
    if before.is_some_and(looks_binary) || after.is_some_and(looks_binary) {
        return None;
    }

    let before_text = before.map(|b| String::from_utf8_lossy(b).into_owned());
    let after_text = after.map(|a| String::from_utf8_lossy(a).into_owned());
    let before_lines: Vec<&str> = before_text.as_deref().map(split_lines).unwrap_or_default();
    let after_lines: Vec<&str> = after_text.as_deref().map(split_lines).unwrap_or_default();

    let common = before_lines.len().min(after_lines.len());
    let mut start = 0;
    while start < common && before_lines[start] == after_lines[start] {
        start += 1;
    }

    let mut suffix = 0;
    while suffix < common - start.min(common)
        && before_lines[before_lines.len() - 1 - suffix] == after_lines[after_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }
    let end_before = before_lines.len().saturating_sub(suffix);
    let end_after = after_lines.len().saturating_sub(suffix);

    let window = |lines: &[&str], end: usize| -> Vec<String> {
        lines[start.min(lines.len())..end.min(lines.len()).min(start + max_preview_lines)]
            .iter()
            .map(|l| (*l).to_string())
            .collect()
    };

    Some(DiffPreview {
        start_line: start + 1,
        before: window(&before_lines, end_before),
        after: window(&after_lines, end_after),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_divergence_window() {
        let before = b"same\nold line\ntail\n";
        let after = b"same\nnew line\ntail\n";
        let preview = text_preview(Some(before), Some(after), 10).unwrap();
        assert_eq!(preview.start_line, 2);
        assert_eq!(preview.before, vec!["old line"]);
        assert_eq!(preview.after, vec!["new line"]);
    }

    #[test]
    fn test_preview_added_file() {
        let preview = text_preview(None, Some(b"one\ntwo"), 10).unwrap();
        assert_eq!(preview.start_line, 1);
        assert!(preview.before.is_empty());
        assert_eq!(preview.after, vec!["one", "two"]);
    }

    #[test]
    fn test_preview_caps_lines() {
        let after = b"a\nb\nc\nd\ne";
        let preview = text_preview(None, Some(after), 2).unwrap();
        assert_eq!(preview.after, vec!["a", "b"]);
    }

    #[test]
    fn test_preview_binary_skipped() {
        assert!(text_preview(Some(b"\0\0\0"), Some(b"text"), 10).is_none());
    }

    #[test]
    fn test_preview_identical_lengths_differ_midway() {
        let before = b"a\nb\nc";
        let after = b"a\nB\nc";
        let preview = text_preview(Some(before), Some(after), 10).unwrap();
        assert_eq!(preview.start_line, 2);
        assert_eq!(preview.before, vec!["b"]);
        assert_eq!(preview.after, vec!["B"]);
    }
}
