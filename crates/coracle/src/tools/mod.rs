//! Tool facade over the workspace.
//!
//! This is the surface an orchestrator calls on behalf of an agent. Every
//! operation normalizes its path arguments, enforces the hidden history
//! namespace, and returns serde-shaped records. Reads and mutations that
//! target the reserved namespace directly fail with access denied; listing
//! the root simply elides it, and [`search`](search::search) never scans it.
//!
//! All operations are synchronous and borrow the workspace for the duration
//! of a single call.

mod search;

pub use search::{search, SearchMatch, SearchOptions, SearchSummary};

pub(crate) use search::looks_binary;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vpath;
use crate::workspace::{FsError, StatInfo, Workspace};

/// Default byte cap for whole-file reads.
pub const DEFAULT_MAX_READ_BYTES: u64 = 256 * 1024;

/// Errors surfaced by the tool facade.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The path targets the reserved history namespace.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// The file exceeds the caller's byte cap.
    #[error("{path} is {size} bytes, larger than the {max} byte limit")]
    TooLarge { path: String, size: u64, max: u64 },
    /// Base64 payload could not be decoded.
    #[error("invalid base64 content: {0}")]
    BadEncoding(String),
    /// Malformed arguments (e.g. an inverted line range).
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Underlying filesystem failure.
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl ToolError {
    /// Stable machine-readable code for the wire-level error object.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "access-denied",
            Self::TooLarge { .. } => "too-large",
            Self::BadEncoding(_) => "bad-encoding",
            Self::BadRequest(_) => "bad-request",
            Self::Fs(FsError::NotFound(_)) => "not-found",
            Self::Fs(FsError::NotADirectory(_) | FsError::IsADirectory(_)) => "not-a-directory",
            Self::Fs(FsError::NotEmpty(_)) => "non-empty",
            Self::Fs(FsError::AlreadyExists(_)) => "already-exists",
            Self::Fs(FsError::RootDelete) => "bad-request",
            Self::Fs(FsError::CorruptArchive(_)) => "corrupt-archive",
        }
    }
}

/// Content encoding for reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Text,
    Base64,
}

/// A single line with its 1-based number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberedLine {
    pub line_number: usize,
    pub content: String,
}

/// Result of [`fs_read_lines`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadLinesResult {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
    pub lines: Vec<NumberedLine>,
}

fn guard_reserved(path: &str) -> Result<(), ToolError> {
    if vpath::is_reserved(path) {
        return Err(ToolError::AccessDenied(path.to_string()));
    }
    Ok(())
}

/// Split file text on CRLF or LF line endings.
///
/// A trailing newline yields a final empty line, so `"a\nb\n"` has three
/// lines. Line numbers across the facade are 1-based indices into this
/// split.
pub(crate) fn split_lines(text: &str) -> Vec<&str> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect()
}

/// Read a whole file as text or base64.
pub fn fs_read(
    ws: &Workspace,
    path: &str,
    enc: Encoding,
    max_bytes: u64,
) -> Result<String, ToolError> {
    let path = vpath::normalize(path);
    guard_reserved(&path)?;
    let data = ws.read_file(&path)?;
    if data.len() as u64 > max_bytes {
        return Err(ToolError::TooLarge {
            path,
            size: data.len() as u64,
            max: max_bytes,
        });
    }
    Ok(match enc {
        Encoding::Text => String::from_utf8_lossy(data).into_owned(),
        Encoding::Base64 => BASE64.encode(data),
    })
}

/// Read an inclusive 1-based line range, clamped to the file length.
pub fn fs_read_lines(
    ws: &Workspace,
    path: &str,
    start_line: usize,
    end_line: usize,
    max_bytes: u64,
) -> Result<ReadLinesResult, ToolError> {
    let path = vpath::normalize(path);
    guard_reserved(&path)?;
    let data = ws.read_file(&path)?;
    if data.len() as u64 > max_bytes {
        return Err(ToolError::TooLarge {
            path,
            size: data.len() as u64,
            max: max_bytes,
        });
    }
    let text = String::from_utf8_lossy(data);
    let lines = split_lines(&text);
    let total_lines = lines.len();

    let start = start_line.max(1).min(total_lines.max(1));
    let end = end_line.max(start).min(total_lines);
    let selected = if total_lines == 0 || start > total_lines {
        Vec::new()
    } else {
        lines[start - 1..end]
            .iter()
            .enumerate()
            .map(|(offset, content)| NumberedLine {
                line_number: start + offset,
                content: (*content).to_string(),
            })
            .collect()
    };

    Ok(ReadLinesResult {
        path,
        start_line: start,
        end_line: end,
        total_lines,
        lines: selected,
    })
}

/// Write a file from text or base64 content.
pub fn fs_write(
    ws: &mut Workspace,
    path: &str,
    content: &str,
    enc: Encoding,
    overwrite: bool,
) -> Result<(), ToolError> {
    let path = vpath::normalize(path);
    guard_reserved(&path)?;
    let data = match enc {
        Encoding::Text => content.as_bytes().to_vec(),
        Encoding::Base64 => BASE64
            .decode(content)
            .map_err(|e| ToolError::BadEncoding(e.to_string()))?,
    };
    ws.write_file(&path, data, overwrite)?;
    Ok(())
}

/// List the children of a directory. Listing the root elides the reserved
/// history directory.
pub fn fs_list(ws: &Workspace, path: &str) -> Result<Vec<String>, ToolError> {
    let path = vpath::normalize(path);
    guard_reserved(&path)?;
    let mut names = ws.list(&path)?;
    if path == "/" {
        names.retain(|name| name != ".time");
    }
    Ok(names)
}

/// Stat a path. The reserved namespace stats as nonexistent.
pub fn fs_stat(ws: &Workspace, path: &str) -> Result<Option<StatInfo>, ToolError> {
    let path = vpath::normalize(path);
    if vpath::is_reserved(&path) {
        return Ok(None);
    }
    Ok(ws.stat(&path))
}

/// Create a directory.
pub fn fs_mkdir(ws: &mut Workspace, path: &str, recursive: bool) -> Result<(), ToolError> {
    let path = vpath::normalize(path);
    guard_reserved(&path)?;
    ws.mkdir(&path, recursive)?;
    Ok(())
}

/// Delete a file or empty directory.
pub fn fs_delete(ws: &mut Workspace, path: &str) -> Result<(), ToolError> {
    let path = vpath::normalize(path);
    guard_reserved(&path)?;
    ws.delete(&path)?;
    Ok(())
}

/// Replace an inclusive 1-based line range with a replacement block.
///
/// The replacement may span any number of lines. Surrounding lines are kept
/// verbatim; line endings are normalized to LF on rejoin. A `start_line`
/// past the last line appends the replacement after the end of the file.
/// Files containing NUL bytes are treated as text all the same.
pub fn fs_patch_lines(
    ws: &mut Workspace,
    path: &str,
    start_line: usize,
    end_line: usize,
    replacement: &str,
) -> Result<(), ToolError> {
    let path = vpath::normalize(path);
    guard_reserved(&path)?;
    if end_line < start_line {
        return Err(ToolError::BadRequest(format!(
            "endLine {end_line} precedes startLine {start_line}"
        )));
    }
    let text = String::from_utf8_lossy(ws.read_file(&path)?).into_owned();
    let lines = split_lines(&text);
    let total = lines.len();

    let start = start_line.max(1);
    let mut patched: Vec<&str> = Vec::with_capacity(total + 1);
    if start > total {
        // Append after end.
        patched.extend(lines.iter());
        patched.extend(replacement.split('\n'));
    } else {
        let end = end_line.min(total);
        patched.extend(&lines[..start - 1]);
        patched.extend(replacement.split('\n'));
        patched.extend(&lines[end..]);
    }
    let joined = patched.join("\n");
    ws.write_file(&path, joined.into_bytes(), true)?;
    Ok(())
}
