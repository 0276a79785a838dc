//! Reversible history of workspace mutations.
//!
//! The time machine records before/after snapshots of every mutating tool
//! call as journal entries with content blobs, all persisted inside the
//! workspace itself under the reserved `/.time` directory:
//!
//! ```text
//! /.time/
//! ├── state.json            # summaries, cursor, retention policy
//! ├── entries/<id>.json     # full change list per entry
//! └── blobs/<id>/
//!     ├── before/<path>     # file bytes before the mutation
//!     └── after/<path>      # file bytes after the mutation
//! ```
//!
//! Entries form an ordered log with a cursor: everything strictly before
//! the cursor can be undone, everything at and after it can be redone.
//! Recording while the cursor sits below the head discards the redo tail.
//! Old entries are folded together by [compaction](Retention) so the
//! journal stays bounded.

mod diff;
mod entry;

pub use diff::{DiffKind, DiffOp, DiffPreview, DiffReport};
pub use entry::{
    now_rfc3339, Change, Entry, EntrySummary, IdGenerator, JournalState, Retention, Snapshot,
    STATE_SCHEMA_VERSION,
};

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, warn};

use crate::vpath;
use crate::workspace::{FsError, Workspace};

/// Path of the persisted journal state inside the workspace.
pub const STATE_PATH: &str = "/.time/state.json";
const ENTRIES_DIR: &str = "/.time/entries";
const BLOBS_DIR: &str = "/.time/blobs";

/// Errors from history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// No entry with the given id exists in the journal.
    #[error("unknown history entry: {0}")]
    UnknownEntry(String),
    /// `state.json` or an entry record could not be decoded.
    #[error("corrupt journal state: {0}")]
    CorruptState(String),
    /// A change references a blob that is not present.
    #[error("missing blob: {0}")]
    MissingBlob(String),
    /// Underlying filesystem failure.
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// One line of the history listing.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub created_at: String,
    pub tool: String,
    pub compacted: bool,
    pub changed_paths: Vec<String>,
    /// Whether this entry sits below the cursor (currently applied).
    pub applied: bool,
}

/// Which side of an entry to apply to the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Before,
    After,
}

/// The journal engine. Owns nothing but the id generator; all persistent
/// state lives inside the workspace under `/.time`.
#[derive(Debug, Default)]
pub struct TimeMachine {
    ids: IdGenerator,
}

impl TimeMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted journal state, or a fresh one if none exists.
    pub fn load_state(ws: &Workspace) -> Result<JournalState, HistoryError> {
        match ws.read_file(STATE_PATH) {
            Ok(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| HistoryError::CorruptState(e.to_string()))
            }
            Err(FsError::NotFound(_)) => Ok(JournalState::new(&now_rfc3339())),
            Err(e) => Err(e.into()),
        }
    }

    fn save_state(ws: &mut Workspace, state: &JournalState) -> Result<(), HistoryError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| HistoryError::CorruptState(e.to_string()))?;
        ws.write_file(STATE_PATH, bytes, true)?;
        Ok(())
    }

    /// Load a full entry record by id.
    pub fn load_entry(ws: &Workspace, id: &str) -> Result<Entry, HistoryError> {
        let path = entry_path(id);
        match ws.read_file(&path) {
            Ok(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| HistoryError::CorruptState(e.to_string()))
            }
            Err(FsError::NotFound(_)) => Err(HistoryError::UnknownEntry(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Newest-last listing of the journal, capped at `limit` entries.
    pub fn log(ws: &Workspace, limit: usize) -> Result<Vec<LogEntry>, HistoryError> {
        let state = Self::load_state(ws)?;
        let skip = state.entries.len().saturating_sub(limit);
        Ok(state
            .entries
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(index, summary)| LogEntry {
                id: summary.id.clone(),
                created_at: summary.created_at.clone(),
                tool: summary.tool.clone(),
                compacted: summary.compacted,
                changed_paths: summary.changed_paths.clone(),
                applied: index < state.cursor,
            })
            .collect())
    }

    /// Record a mutation from partial before/after snapshots.
    ///
    /// Returns the new entry id, or `None` when the snapshots describe no
    /// effective change. Any redo tail above the cursor is discarded first.
    pub fn record(
        &mut self,
        ws: &mut Workspace,
        tool: &str,
        note: Option<&str>,
        before: &Snapshot,
        after: &Snapshot,
    ) -> Result<Option<String>, HistoryError> {
        ensure_scaffold(ws)?;
        let mut state = Self::load_state(ws)?;

        if state.cursor < state.entries.len() {
            let discarded: Vec<String> = state.entries[state.cursor..]
                .iter()
                .map(|s| s.id.clone())
                .collect();
            debug!(count = discarded.len(), "discarding redo tail");
            for id in &discarded {
                remove_entry_files(ws, id);
            }
            state.entries.truncate(state.cursor);
        }

        let (id, created_at) = self.ids.next_id();
        let changes = compute_changes(&id, before, after);
        if changes.is_empty() {
            return Ok(None);
        }

        for change in &changes {
            if let Change::File {
                path,
                before_blob,
                after_blob,
                ..
            } = change
            {
                if let Some(blob) = before_blob {
                    let bytes = before.files.get(path).cloned().unwrap_or_default();
                    ws.write_file(blob, bytes, true)?;
                }
                if let Some(blob) = after_blob {
                    let bytes = after.files.get(path).cloned().unwrap_or_default();
                    ws.write_file(blob, bytes, true)?;
                }
            }
        }

        let changed_paths: Vec<String> = changes.iter().map(|c| c.path().to_string()).collect();
        let entry = Entry {
            id: id.clone(),
            created_at: created_at.clone(),
            tool: tool.to_string(),
            note: note.map(str::to_string),
            changes,
            compacted_from: None,
        };
        write_entry(ws, &entry)?;

        state.entries.push(EntrySummary {
            id: id.clone(),
            created_at,
            tool: tool.to_string(),
            compacted: false,
            changed_paths,
        });
        state.cursor = state.entries.len();

        self.compact(ws, &mut state)?;

        state.updated_at = now_rfc3339();
        Self::save_state(ws, &state)?;
        debug!(%id, tool, "recorded history entry");
        Ok(Some(id))
    }

    /// Undo up to `steps` entries. Returns how many were applied.
    pub fn undo(&mut self, ws: &mut Workspace, steps: usize) -> Result<usize, HistoryError> {
        let mut state = Self::load_state(ws)?;
        let mut applied = 0;
        while applied < steps && state.cursor > 0 {
            let id = state.entries[state.cursor - 1].id.clone();
            let entry = Self::load_entry(ws, &id)?;
            apply_side(ws, &entry, Side::Before)?;
            state.cursor -= 1;
            applied += 1;
        }
        if applied > 0 {
            state.updated_at = now_rfc3339();
            Self::save_state(ws, &state)?;
        }
        Ok(applied)
    }

    /// Redo up to `steps` entries. Returns how many were applied.
    pub fn redo(&mut self, ws: &mut Workspace, steps: usize) -> Result<usize, HistoryError> {
        let mut state = Self::load_state(ws)?;
        let mut applied = 0;
        while applied < steps && state.cursor < state.entries.len() {
            let id = state.entries[state.cursor].id.clone();
            let entry = Self::load_entry(ws, &id)?;
            apply_side(ws, &entry, Side::After)?;
            state.cursor += 1;
            applied += 1;
        }
        if applied > 0 {
            state.updated_at = now_rfc3339();
            Self::save_state(ws, &state)?;
        }
        Ok(applied)
    }

    /// Move the workspace to the state just after `id` was recorded.
    pub fn restore(&mut self, ws: &mut Workspace, id: &str) -> Result<(), HistoryError> {
        let state = Self::load_state(ws)?;
        let index = state
            .entries
            .iter()
            .position(|summary| summary.id == id)
            .ok_or_else(|| HistoryError::UnknownEntry(id.to_string()))?;
        let target = index + 1;
        if state.cursor > target {
            self.undo(ws, state.cursor - target)?;
        } else if state.cursor < target {
            self.redo(ws, target - state.cursor)?;
        }
        Ok(())
    }

    /// Human-readable view of one entry's changes.
    pub fn diff(
        ws: &Workspace,
        id: &str,
        max_files: usize,
        max_preview_lines: usize,
    ) -> Result<DiffReport, HistoryError> {
        diff::build_report(ws, id, max_files, max_preview_lines)
    }

    /// Fold the oldest entries together while the journal exceeds its
    /// retention bounds. Compaction never crosses the cursor, so a pending
    /// redo tail is never merged away.
    fn compact(&mut self, ws: &mut Workspace, state: &mut JournalState) -> Result<(), HistoryError> {
        loop {
            let retention = state.retention;
            if state.entries.len() <= retention.max_entries {
                return Ok(());
            }
            let outside_tail = state.entries.len().saturating_sub(retention.keep_recent);
            let mergeable = outside_tail.min(state.cursor);
            if mergeable < 2 {
                return Ok(());
            }
            let group = retention.merge_group.clamp(2, mergeable);

            let old: Vec<Entry> = state.entries[..group]
                .iter()
                .map(|summary| Self::load_entry(ws, &summary.id))
                .collect::<Result<_, _>>()?;
            let (new_id, created_at) = self.ids.next_id();
            let merged = fold_entries(ws, &new_id, &created_at, &old)?;
            write_entry(ws, &merged)?;
            for entry in &old {
                remove_entry_files(ws, &entry.id);
            }

            let summary = EntrySummary {
                id: merged.id.clone(),
                created_at: merged.created_at.clone(),
                tool: merged.tool.clone(),
                compacted: true,
                changed_paths: merged.changes.iter().map(|c| c.path().to_string()).collect(),
            };
            state.entries.splice(..group, [summary]);
            let adjusted = state.cursor.saturating_sub(group - 1);
            state.cursor = adjusted.min(state.entries.len());
            debug!(id = %merged.id, group, "compacted journal prefix");
        }
    }
}

fn entry_path(id: &str) -> String {
    format!("{ENTRIES_DIR}/{id}.json")
}

fn blob_path(id: &str, side: &str, path: &str) -> String {
    format!("{BLOBS_DIR}/{id}/{side}{path}")
}

fn ensure_scaffold(ws: &mut Workspace) -> Result<(), HistoryError> {
    ws.mkdir(vpath::RESERVED_PREFIX, true)?;
    ws.mkdir(ENTRIES_DIR, true)?;
    ws.mkdir(BLOBS_DIR, true)?;
    Ok(())
}

fn write_entry(ws: &mut Workspace, entry: &Entry) -> Result<(), HistoryError> {
    let bytes =
        serde_json::to_vec_pretty(entry).map_err(|e| HistoryError::CorruptState(e.to_string()))?;
    ws.write_file(&entry_path(&entry.id), bytes, true)?;
    Ok(())
}

/// Delete an entry's JSON record and blob subtree. Best-effort: a missing
/// piece is not an error.
fn remove_entry_files(ws: &mut Workspace, id: &str) {
    let _ = ws.delete(&entry_path(id));
    remove_subtree(ws, &format!("{BLOBS_DIR}/{id}"));
}

fn remove_subtree(ws: &mut Workspace, root: &str) {
    let prefix = format!("{root}/");
    let files: Vec<String> = ws
        .file_paths()
        .filter(|p| p.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    for file in files {
        let _ = ws.delete(&file);
    }
    let mut dirs: Vec<String> = ws
        .dir_paths()
        .filter(|d| *d == root || d.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.len()));
    for dir in dirs {
        let _ = ws.delete(&dir);
    }
}

fn compute_changes(id: &str, before: &Snapshot, after: &Snapshot) -> Vec<Change> {
    let mut changes = Vec::new();

    let paths: BTreeSet<&String> = before.files.keys().chain(after.files.keys()).collect();
    for path in paths {
        if vpath::is_reserved(path) {
            continue;
        }
        let before_bytes = before.files.get(path);
        let after_bytes = after.files.get(path);
        match (before_bytes, after_bytes) {
            (None, None) => continue,
            (Some(b), Some(a)) if b == a => continue,
            _ => {}
        }
        changes.push(Change::File {
            path: path.clone(),
            before_exists: before_bytes.is_some(),
            after_exists: after_bytes.is_some(),
            before_blob: before_bytes.map(|_| blob_path(id, "before", path)),
            after_blob: after_bytes.map(|_| blob_path(id, "after", path)),
            before_size: before_bytes.map(|b| b.len() as u64),
            after_size: after_bytes.map(|a| a.len() as u64),
        });
    }

    for dir in before.dirs.symmetric_difference(&after.dirs) {
        if dir == "/" || vpath::is_reserved(dir) {
            continue;
        }
        changes.push(Change::Dir {
            path: dir.clone(),
            before_exists: before.dirs.contains(dir),
            after_exists: after.dirs.contains(dir),
        });
    }

    changes
}

fn apply_side(ws: &mut Workspace, entry: &Entry, side: Side) -> Result<(), HistoryError> {
    for change in &entry.changes {
        if let Change::File {
            path,
            before_exists,
            after_exists,
            before_blob,
            after_blob,
            ..
        } = change
        {
            let (exists, blob) = match side {
                Side::Before => (*before_exists, before_blob),
                Side::After => (*after_exists, after_blob),
            };
            if exists {
                let blob = blob
                    .as_deref()
                    .ok_or_else(|| HistoryError::MissingBlob(path.clone()))?;
                let bytes = ws
                    .read_file(blob)
                    .map_err(|_| HistoryError::MissingBlob(blob.to_string()))?
                    .to_vec();
                ws.write_file(path, bytes, true)?;
            } else if ws.stat(path).is_some() {
                ws.delete(path)?;
            }
        }
    }

    let mut to_create: Vec<&str> = Vec::new();
    let mut to_delete: Vec<&str> = Vec::new();
    for change in &entry.changes {
        if let Change::Dir {
            path,
            before_exists,
            after_exists,
        } = change
        {
            let exists = match side {
                Side::Before => *before_exists,
                Side::After => *after_exists,
            };
            if exists {
                to_create.push(path);
            } else {
                to_delete.push(path);
            }
        }
    }
    to_create.sort_by_key(|p| p.len());
    for path in to_create {
        ws.mkdir(path, true)?;
    }
    to_delete.sort_by_key(|p| std::cmp::Reverse(p.len()));
    for path in to_delete {
        // Best-effort: unrelated files may occupy the directory by now.
        match ws.delete(path) {
            Ok(()) | Err(FsError::NotFound(_)) => {}
            Err(FsError::NotEmpty(_)) => {
                warn!(path, "skipping non-empty directory during history apply");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Fold a group of entries into one equivalent entry: first-seen `before`
/// sides, last-seen `after` sides, no-ops dropped, blobs rewritten under
/// the new id.
fn fold_entries(
    ws: &mut Workspace,
    new_id: &str,
    created_at: &str,
    old: &[Entry],
) -> Result<Entry, HistoryError> {
    struct FoldedFile {
        before_exists: bool,
        before_bytes: Option<Vec<u8>>,
        after_exists: bool,
        after_bytes: Option<Vec<u8>>,
    }

    let mut files: BTreeMap<String, FoldedFile> = BTreeMap::new();
    let mut dirs: BTreeMap<String, (bool, bool)> = BTreeMap::new();

    for entry in old {
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
                    let before_bytes = match (before_exists, before_blob) {
                        (true, Some(blob)) => Some(
                            ws.read_file(blob)
                                .map_err(|_| HistoryError::MissingBlob(blob.clone()))?
                                .to_vec(),
                        ),
                        _ => None,
                    };
                    let after_bytes = match (after_exists, after_blob) {
                        (true, Some(blob)) => Some(
                            ws.read_file(blob)
                                .map_err(|_| HistoryError::MissingBlob(blob.clone()))?
                                .to_vec(),
                        ),
                        _ => None,
                    };
                    match files.get_mut(path) {
                        Some(folded) => {
                            folded.after_exists = *after_exists;
                            folded.after_bytes = after_bytes;
                        }
                        None => {
                            files.insert(
                                path.clone(),
                                FoldedFile {
                                    before_exists: *before_exists,
                                    before_bytes,
                                    after_exists: *after_exists,
                                    after_bytes,
                                },
                            );
                        }
                    }
                }
                Change::Dir {
                    path,
                    before_exists,
                    after_exists,
                } => match dirs.get_mut(path) {
                    Some(folded) => folded.1 = *after_exists,
                    None => {
                        dirs.insert(path.clone(), (*before_exists, *after_exists));
                    }
                },
            }
        }
    }

    let mut changes = Vec::new();
    for (path, folded) in files {
        let unchanged = match (&folded.before_bytes, &folded.after_bytes) {
            (Some(b), Some(a)) => b == a,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            continue;
        }
        let before_blob = folded.before_bytes.as_ref().map(|bytes| {
            let blob = blob_path(new_id, "before", &path);
            (blob, bytes.clone())
        });
        let after_blob = folded.after_bytes.as_ref().map(|bytes| {
            let blob = blob_path(new_id, "after", &path);
            (blob, bytes.clone())
        });
        if let Some((blob, bytes)) = &before_blob {
            ws.write_file(blob, bytes.clone(), true)?;
        }
        if let Some((blob, bytes)) = &after_blob {
            ws.write_file(blob, bytes.clone(), true)?;
        }
        changes.push(Change::File {
            path,
            before_exists: folded.before_exists,
            after_exists: folded.after_exists,
            before_size: folded.before_bytes.as_ref().map(|b| b.len() as u64),
            after_size: folded.after_bytes.as_ref().map(|a| a.len() as u64),
            before_blob: before_blob.map(|(blob, _)| blob),
            after_blob: after_blob.map(|(blob, _)| blob),
        });
    }
    for (path, (before_exists, after_exists)) in dirs {
        if before_exists == after_exists {
            continue;
        }
        changes.push(Change::Dir {
            path,
            before_exists,
            after_exists,
        });
    }

    Ok(Entry {
        id: new_id.to_string(),
        created_at: created_at.to_string(),
        tool: "compact".to_string(),
        note: Some(format!("merged {} entries", old.len())),
        changes,
        compacted_from: Some(old.iter().map(|e| e.id.clone()).collect()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Record a single-file mutation the way the session does: snapshot the
    /// target path before and after.
    fn record_write(
        tm: &mut TimeMachine,
        ws: &mut Workspace,
        path: &str,
        content: &str,
    ) -> Option<String> {
        let before = Snapshot::of_paths(ws, &[path]);
        ws.write_file(path, content.as_bytes().to_vec(), true)
            .unwrap();
        let after = Snapshot::of_paths(ws, &[path]);
        tm.record(ws, "fs_write", None, &before, &after).unwrap()
    }

    fn record_delete(tm: &mut TimeMachine, ws: &mut Workspace, path: &str) -> Option<String> {
        let before = Snapshot::of_paths(ws, &[path]);
        ws.delete(path).unwrap();
        let after = Snapshot::of_paths(ws, &[path]);
        tm.record(ws, "fs_delete", None, &before, &after).unwrap()
    }

    #[test]
    fn test_record_then_undo_restores_bytes() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        ws.write_file("/a", b"v1".to_vec(), true).unwrap();

        record_write(&mut tm, &mut ws, "/a", "v2").expect("entry recorded");
        assert_eq!(ws.read_file("/a").unwrap(), b"v2");

        let state = TimeMachine::load_state(&ws).unwrap();
        assert_eq!(state.cursor, state.entries.len());

        assert_eq!(tm.undo(&mut ws, 1).unwrap(), 1);
        assert_eq!(ws.read_file("/a").unwrap(), b"v1");
        let state = TimeMachine::load_state(&ws).unwrap();
        assert_eq!(state.cursor, 0);
    }

    #[test]
    fn test_no_op_record_returns_none() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        ws.write_file("/a", b"same".to_vec(), true).unwrap();
        let snap = Snapshot::of_paths(&ws, &["/a"]);
        assert!(tm.record(&mut ws, "fs_write", None, &snap, &snap).unwrap().is_none());
        assert!(TimeMachine::load_state(&ws).unwrap().entries.is_empty());
    }

    #[test]
    fn test_undo_redo_round_trip_is_byte_identical() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/f", "v1");
        record_write(&mut tm, &mut ws, "/g/nested.txt", "v2");
        record_delete(&mut tm, &mut ws, "/f");

        let files_at_head = Snapshot::full(&ws).files;
        assert_eq!(tm.undo(&mut ws, 3).unwrap(), 3);
        assert!(ws.stat("/g/nested.txt").is_none());
        assert_eq!(tm.redo(&mut ws, 3).unwrap(), 3);
        assert_eq!(Snapshot::full(&ws).files, files_at_head);
    }

    #[test]
    fn test_undo_bounded_by_log() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/f", "v1");
        assert_eq!(tm.undo(&mut ws, 10).unwrap(), 1);
        assert_eq!(tm.undo(&mut ws, 1).unwrap(), 0);
        assert_eq!(tm.redo(&mut ws, 10).unwrap(), 1);
        assert_eq!(tm.redo(&mut ws, 1).unwrap(), 0);
    }

    #[test]
    fn test_record_discards_redo_tail() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/f", "v1");
        let id2 = record_write(&mut tm, &mut ws, "/f", "v2").unwrap();

        tm.undo(&mut ws, 1).unwrap();
        record_write(&mut tm, &mut ws, "/f", "v3");

        let state = TimeMachine::load_state(&ws).unwrap();
        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.cursor, 2);
        assert!(!state.entries.iter().any(|s| s.id == id2));
        assert!(matches!(
            TimeMachine::load_entry(&ws, &id2),
            Err(HistoryError::UnknownEntry(_))
        ));
        // The discarded entry's blobs are gone too.
        assert!(!ws.file_paths().any(|p| p.contains(&id2)));
    }

    #[test]
    fn test_restore_across_gap() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/f", "v1");
        let id_v2 = record_write(&mut tm, &mut ws, "/f", "v2").unwrap();
        record_write(&mut tm, &mut ws, "/f", "v3");

        tm.restore(&mut ws, &id_v2).unwrap();
        assert_eq!(ws.read_file("/f").unwrap(), b"v2");
        let state = TimeMachine::load_state(&ws).unwrap();
        assert_eq!(state.cursor, 2);

        // Restoring forward again works off the preserved redo tail.
        let id_v3 = state.entries[2].id.clone();
        tm.restore(&mut ws, &id_v3).unwrap();
        assert_eq!(ws.read_file("/f").unwrap(), b"v3");
        assert_eq!(TimeMachine::load_state(&ws).unwrap().cursor, 3);
    }

    #[test]
    fn test_restore_unknown_id() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/f", "v1");
        assert!(matches!(
            tm.restore(&mut ws, "nope"),
            Err(HistoryError::UnknownEntry(_))
        ));
    }

    #[test]
    fn test_undo_recreates_deleted_file_and_dirs() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/d/f.txt", "data");
        record_delete(&mut tm, &mut ws, "/d/f.txt");

        assert!(ws.stat("/d/f.txt").is_none());
        tm.undo(&mut ws, 1).unwrap();
        assert_eq!(ws.read_file("/d/f.txt").unwrap(), b"data");
    }

    #[test]
    fn test_dir_only_record_and_undo() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        let before = Snapshot::full(&ws);
        ws.mkdir("/new/deep", true).unwrap();
        let after = Snapshot::full(&ws);
        tm.record(&mut ws, "fs_mkdir", None, &before, &after)
            .unwrap()
            .expect("dir change recorded");

        tm.undo(&mut ws, 1).unwrap();
        assert!(ws.stat("/new").is_none());
        tm.redo(&mut ws, 1).unwrap();
        assert_eq!(ws.stat("/new/deep").map(|s| s.kind), Some(crate::workspace::EntryKind::Dir));
    }

    fn small_retention() -> Retention {
        Retention {
            keep_recent: 2,
            max_entries: 4,
            merge_group: 3,
        }
    }

    fn with_retention(ws: &mut Workspace, retention: Retention) {
        let mut state = TimeMachine::load_state(ws).unwrap();
        state.retention = retention;
        let bytes = serde_json::to_vec_pretty(&state).unwrap();
        ws.write_file(STATE_PATH, bytes, true).unwrap();
    }

    #[test]
    fn test_compaction_folds_oldest_entries() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/f", "v1");
        with_retention(&mut ws, small_retention());

        for version in 2..=6 {
            record_write(&mut tm, &mut ws, "/f", &format!("v{version}"));
        }

        let state = TimeMachine::load_state(&ws).unwrap();
        assert!(state.entries.len() <= 4, "len = {}", state.entries.len());
        assert!(state.entries[0].compacted);
        assert_eq!(state.cursor, state.entries.len());

        let merged = TimeMachine::load_entry(&ws, &state.entries[0].id).unwrap();
        let lineage = merged.compacted_from.as_ref().unwrap();
        assert_eq!(lineage.len(), 3);

        // The folded entry spans v-first .. v-last of the merged group and
        // undoing through it lands back on the original content.
        tm.undo(&mut ws, state.entries.len()).unwrap();
        assert!(ws.stat("/f").is_none());
    }

    #[test]
    fn test_compaction_drops_no_op_folds() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        ws.write_file("/f", b"base".to_vec(), true).unwrap();
        with_retention(
            &mut ws,
            Retention {
                keep_recent: 0,
                max_entries: 2,
                merge_group: 3,
            },
        );

        // v -> x -> v folds to a no-op on /f.
        record_write(&mut tm, &mut ws, "/f", "x");
        record_write(&mut tm, &mut ws, "/f", "base");
        record_write(&mut tm, &mut ws, "/g", "other");

        let state = TimeMachine::load_state(&ws).unwrap();
        let merged_summary = state.entries.iter().find(|s| s.compacted);
        if let Some(summary) = merged_summary {
            let merged = TimeMachine::load_entry(&ws, &summary.id).unwrap();
            assert!(
                !merged.changes.iter().any(|c| c.path() == "/f"
                    && matches!(c, Change::File { before_exists: true, after_exists: true, .. })
                    && {
                        let Change::File { before_size, after_size, .. } = c else {
                            unreachable!()
                        };
                        before_size == after_size
                    }),
                "byte-identical fold should have been dropped"
            );
        }
    }

    #[test]
    fn test_compaction_stops_at_cursor() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        with_retention(
            &mut ws,
            Retention {
                keep_recent: 0,
                max_entries: 2,
                merge_group: 5,
            },
        );
        for version in 1..=4 {
            record_write(&mut tm, &mut ws, "/f", &format!("v{version}"));
        }
        // Rewind fully: nothing below the cursor is mergeable now.
        tm.undo(&mut ws, 10).unwrap();
        let before = TimeMachine::load_state(&ws).unwrap();

        // A record with the cursor at zero discards the tail instead.
        record_write(&mut tm, &mut ws, "/g", "x");
        let state = TimeMachine::load_state(&ws).unwrap();
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.cursor, 1);
        assert!(before.entries.len() > state.entries.len());
    }

    #[test]
    fn test_log_marks_applied_entries() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/f", "v1");
        record_write(&mut tm, &mut ws, "/f", "v2");
        tm.undo(&mut ws, 1).unwrap();

        let log = TimeMachine::log(&ws, 10).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].applied);
        assert!(!log[1].applied);

        let capped = TimeMachine::log(&ws, 1).unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, log[1].id);
    }

    #[test]
    fn test_diff_report_shapes() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        ws.write_file("/f", b"one\nold\nthree".to_vec(), true)
            .unwrap();
        let before = Snapshot::of_paths(&ws, &["/f", "/new.txt"]);
        ws.write_file("/f", b"one\nnew\nthree".to_vec(), true)
            .unwrap();
        ws.write_file("/new.txt", b"fresh".to_vec(), true).unwrap();
        let after = Snapshot::of_paths(&ws, &["/f", "/new.txt"]);
        let id = tm
            .record(&mut ws, "fs_patch_lines", None, &before, &after)
            .unwrap()
            .unwrap();

        let report = TimeMachine::diff(&ws, &id, 10, 5).unwrap();
        assert_eq!(report.ops.len(), 2);
        let modified = report.ops.iter().find(|o| o.path == "/f").unwrap();
        assert_eq!(modified.op, DiffKind::FileModified);
        let preview = modified.preview.as_ref().unwrap();
        assert_eq!(preview.start_line, 2);
        assert_eq!(preview.before, vec!["old"]);
        assert_eq!(preview.after, vec!["new"]);

        let added = report.ops.iter().find(|o| o.path == "/new.txt").unwrap();
        assert_eq!(added.op, DiffKind::FileAdded);

        let capped = TimeMachine::diff(&ws, &id, 1, 5).unwrap();
        assert!(capped.truncated);
    }

    #[test]
    fn test_journal_survives_zip_round_trip() {
        let mut tm = TimeMachine::new();
        let mut ws = Workspace::new();
        record_write(&mut tm, &mut ws, "/f", "v1");
        record_write(&mut tm, &mut ws, "/f", "v2");

        let buf = ws.export_zip_buffer().unwrap();
        let mut restored = Workspace::new();
        restored.import_zip(&buf).unwrap();

        let state = TimeMachine::load_state(&restored).unwrap();
        assert_eq!(state.entries.len(), 2);
        tm.undo(&mut restored, 2).unwrap();
        assert!(restored.stat("/f").is_none());
    }
}
