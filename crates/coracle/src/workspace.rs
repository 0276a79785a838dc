//! In-memory workspace filesystem backed by a ZIP container.
//!
//! A [`Workspace`] is two structures: a map from file path to bytes and a
//! set of directory paths. The directory set always contains `/`, and every
//! ancestor of a file path is kept present (writes materialize missing
//! ancestors). A path is never both a file and a directory.
//!
//! The whole tree round-trips through a standard ZIP archive whose member
//! names are the workspace paths without the leading slash. Directories are
//! implicit in member paths, so empty directories do not survive a
//! round-trip.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::vpath;

/// Errors from workspace filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// No file or directory at the given path.
    #[error("not found: {0}")]
    NotFound(String),
    /// Attempted to list a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// Attempted to read or overwrite a directory as a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),
    /// Deleting a directory that still has children.
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    /// Write with `overwrite=false` over an existing file.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The root directory cannot be removed.
    #[error("refusing to delete the root directory")]
    RootDelete,
    /// The archive buffer could not be decoded.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
}

/// Kind of a workspace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// Result of a `stat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
}

/// An in-memory POSIX-like file tree.
#[derive(Debug, Clone)]
pub struct Workspace {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    /// Create an empty workspace containing only the root directory.
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            files: BTreeMap::new(),
            dirs,
        }
    }

    /// Stat a path. Returns `None` when nothing exists there.
    pub fn stat(&self, path: &str) -> Option<StatInfo> {
        let path = vpath::normalize(path);
        if let Some(data) = self.files.get(&path) {
            return Some(StatInfo {
                kind: EntryKind::File,
                size: data.len() as u64,
            });
        }
        if self.dirs.contains(&path) {
            return Some(StatInfo {
                kind: EntryKind::Dir,
                size: 0,
            });
        }
        None
    }

    /// Sorted unique names of the immediate children of a directory.
    pub fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = vpath::normalize(path);
        if self.files.contains_key(&path) {
            return Err(FsError::NotADirectory(path));
        }
        if !self.dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }
        let mut names = BTreeSet::new();
        for candidate in self.files.keys().chain(self.dirs.iter()) {
            if candidate != &path && vpath::dirname(candidate) == path {
                names.insert(vpath::basename(candidate));
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Read a file's bytes.
    pub fn read_file(&self, path: &str) -> Result<&[u8], FsError> {
        let path = vpath::normalize(path);
        if self.dirs.contains(&path) {
            return Err(FsError::IsADirectory(path));
        }
        self.files
            .get(&path)
            .map(Vec::as_slice)
            .ok_or(FsError::NotFound(path))
    }

    /// Write a file, materializing any missing ancestor directories.
    pub fn write_file(&mut self, path: &str, data: Vec<u8>, overwrite: bool) -> Result<(), FsError> {
        let path = vpath::normalize(path);
        if path == "/" || self.dirs.contains(&path) {
            return Err(FsError::IsADirectory(path));
        }
        if !overwrite && self.files.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        for ancestor in vpath::ancestors(&path) {
            if self.files.contains_key(&ancestor) {
                return Err(FsError::NotADirectory(ancestor));
            }
        }
        for ancestor in vpath::ancestors(&path) {
            self.dirs.insert(ancestor);
        }
        self.files.insert(path, data);
        Ok(())
    }

    /// Create a directory. With `recursive`, missing ancestors are created
    /// and an existing directory is accepted silently.
    pub fn mkdir(&mut self, path: &str, recursive: bool) -> Result<(), FsError> {
        let path = vpath::normalize(path);
        if self.files.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        if self.dirs.contains(&path) {
            if recursive {
                return Ok(());
            }
            return Err(FsError::AlreadyExists(path));
        }
        for ancestor in vpath::ancestors(&path) {
            if self.files.contains_key(&ancestor) {
                return Err(FsError::NotADirectory(ancestor));
            }
        }
        if recursive {
            for ancestor in vpath::ancestors(&path) {
                self.dirs.insert(ancestor);
            }
        } else {
            let parent = vpath::dirname(&path);
            if !self.dirs.contains(&parent) {
                return Err(FsError::NotFound(parent));
            }
        }
        self.dirs.insert(path);
        Ok(())
    }

    /// Delete a file or an empty directory.
    pub fn delete(&mut self, path: &str) -> Result<(), FsError> {
        let path = vpath::normalize(path);
        if path == "/" {
            return Err(FsError::RootDelete);
        }
        if self.files.remove(&path).is_some() {
            return Ok(());
        }
        if self.dirs.contains(&path) {
            let child_prefix = format!("{path}/");
            let occupied = self.files.keys().any(|f| f.starts_with(&child_prefix))
                || self.dirs.iter().any(|d| d.starts_with(&child_prefix));
            if occupied {
                return Err(FsError::NotEmpty(path));
            }
            self.dirs.remove(&path);
            return Ok(());
        }
        Err(FsError::NotFound(path))
    }

    /// Replace the workspace contents with the contents of a ZIP buffer.
    pub fn import_zip(&mut self, buf: &[u8]) -> Result<(), FsError> {
        let mut archive = ZipArchive::new(Cursor::new(buf))
            .map_err(|e| FsError::CorruptArchive(e.to_string()))?;

        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| FsError::CorruptArchive(e.to_string()))?;
            let path = vpath::normalize(entry.name());
            if path == "/" {
                continue;
            }
            if entry.is_dir() {
                for ancestor in vpath::ancestors(&path) {
                    dirs.insert(ancestor);
                }
                dirs.insert(path);
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| FsError::CorruptArchive(e.to_string()))?;
            for ancestor in vpath::ancestors(&path) {
                dirs.insert(ancestor);
            }
            files.insert(path, data);
        }

        self.files = files;
        self.dirs = dirs;
        Ok(())
    }

    /// Serialize the workspace to a ZIP buffer. Only file entries are
    /// emitted; directories are implicit in member paths.
    pub fn export_zip_buffer(&self) -> Result<Vec<u8>, FsError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (path, data) in &self.files {
            let member = path.trim_start_matches('/');
            writer
                .start_file(member, options)
                .map_err(|e| FsError::CorruptArchive(e.to_string()))?;
            writer
                .write_all(data)
                .map_err(|e| FsError::CorruptArchive(e.to_string()))?;
        }
        let cursor = writer
            .finish()
            .map_err(|e| FsError::CorruptArchive(e.to_string()))?;
        Ok(cursor.into_inner())
    }

    /// Iterate all file paths in ascending order.
    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Iterate all directory paths in ascending order.
    pub fn dir_paths(&self) -> impl Iterator<Item = &str> {
        self.dirs.iter().map(String::as_str)
    }

    /// Snapshot the full file mapping.
    pub fn file_map(&self) -> BTreeMap<String, Vec<u8>> {
        self.files.clone()
    }

    /// Snapshot the directory set.
    pub fn dir_set(&self) -> BTreeSet<String> {
        self.dirs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_root() {
        let ws = Workspace::new();
        assert_eq!(
            ws.stat("/"),
            Some(StatInfo {
                kind: EntryKind::Dir,
                size: 0
            })
        );
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut ws = Workspace::new();
        ws.write_file("/a/b/c.txt", b"hello".to_vec(), true).unwrap();
        assert_eq!(ws.read_file("/a/b/c.txt").unwrap(), b"hello");
    }

    #[test]
    fn test_write_materializes_ancestors() {
        let mut ws = Workspace::new();
        ws.write_file("/a/b/c.txt", vec![], true).unwrap();
        assert_eq!(ws.stat("/a").map(|s| s.kind), Some(EntryKind::Dir));
        assert_eq!(ws.stat("/a/b").map(|s| s.kind), Some(EntryKind::Dir));
    }

    #[test]
    fn test_write_no_overwrite() {
        let mut ws = Workspace::new();
        ws.write_file("/x", b"1".to_vec(), true).unwrap();
        let err = ws.write_file("/x", b"2".to_vec(), false).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
        assert_eq!(ws.read_file("/x").unwrap(), b"1");
    }

    #[test]
    fn test_write_over_directory_fails() {
        let mut ws = Workspace::new();
        ws.mkdir("/d", true).unwrap();
        assert!(matches!(
            ws.write_file("/d", vec![], true),
            Err(FsError::IsADirectory(_))
        ));
    }

    #[test]
    fn test_write_through_file_fails() {
        let mut ws = Workspace::new();
        ws.write_file("/a", b"x".to_vec(), true).unwrap();
        assert!(matches!(
            ws.write_file("/a/b", vec![], true),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_list_sorted_children() {
        let mut ws = Workspace::new();
        ws.write_file("/b.txt", vec![], true).unwrap();
        ws.write_file("/a/nested.txt", vec![], true).unwrap();
        ws.mkdir("/c", true).unwrap();
        assert_eq!(ws.list("/").unwrap(), vec!["a", "b.txt", "c"]);
        assert_eq!(ws.list("/a").unwrap(), vec!["nested.txt"]);
    }

    #[test]
    fn test_list_file_is_error() {
        let mut ws = Workspace::new();
        ws.write_file("/f", vec![], true).unwrap();
        assert!(matches!(ws.list("/f"), Err(FsError::NotADirectory(_))));
        assert!(matches!(ws.list("/missing"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_mkdir_non_recursive_needs_parent() {
        let mut ws = Workspace::new();
        assert!(matches!(
            ws.mkdir("/a/b", false),
            Err(FsError::NotFound(_))
        ));
        ws.mkdir("/a", false).unwrap();
        ws.mkdir("/a/b", false).unwrap();
        assert_eq!(ws.stat("/a/b").map(|s| s.kind), Some(EntryKind::Dir));
    }

    #[test]
    fn test_mkdir_recursive_idempotent() {
        let mut ws = Workspace::new();
        ws.mkdir("/a/b/c", true).unwrap();
        ws.mkdir("/a/b/c", true).unwrap();
        assert!(matches!(
            ws.mkdir("/a/b/c", false),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_delete_file_and_empty_dir() {
        let mut ws = Workspace::new();
        ws.write_file("/a/f.txt", vec![1], true).unwrap();
        ws.delete("/a/f.txt").unwrap();
        assert!(ws.stat("/a/f.txt").is_none());
        ws.delete("/a").unwrap();
        assert!(ws.stat("/a").is_none());
    }

    #[test]
    fn test_delete_non_empty_dir_fails() {
        let mut ws = Workspace::new();
        ws.write_file("/a/f.txt", vec![], true).unwrap();
        assert!(matches!(ws.delete("/a"), Err(FsError::NotEmpty(_))));
    }

    #[test]
    fn test_delete_root_refused() {
        let mut ws = Workspace::new();
        assert!(matches!(ws.delete("/"), Err(FsError::RootDelete)));
        assert!(matches!(ws.delete("~"), Err(FsError::RootDelete)));
    }

    #[test]
    fn test_delete_missing() {
        let mut ws = Workspace::new();
        assert!(matches!(ws.delete("/nope"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_zip_round_trip_preserves_files() {
        let mut ws = Workspace::new();
        ws.write_file("/data/in.csv", b"a,b\n1,2\n".to_vec(), true)
            .unwrap();
        ws.write_file("/main.ts", b"console.log(1)".to_vec(), true)
            .unwrap();
        ws.mkdir("/empty", true).unwrap();

        let buf = ws.export_zip_buffer().unwrap();
        let mut restored = Workspace::new();
        restored.import_zip(&buf).unwrap();

        assert_eq!(restored.file_map(), ws.file_map());
        // Empty directories are not preserved across a round-trip.
        assert!(restored.stat("/empty").is_none());
        assert_eq!(restored.stat("/data").map(|s| s.kind), Some(EntryKind::Dir));
    }

    #[test]
    fn test_import_zip_replaces_state() {
        let mut source = Workspace::new();
        source.write_file("/keep.txt", b"k".to_vec(), true).unwrap();
        let buf = source.export_zip_buffer().unwrap();

        let mut ws = Workspace::new();
        ws.write_file("/old.txt", b"o".to_vec(), true).unwrap();
        ws.import_zip(&buf).unwrap();
        assert!(ws.stat("/old.txt").is_none());
        assert_eq!(ws.read_file("/keep.txt").unwrap(), b"k");
    }

    #[test]
    fn test_import_corrupt_archive() {
        let mut ws = Workspace::new();
        assert!(matches!(
            ws.import_zip(b"definitely not a zip"),
            Err(FsError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_ancestor_closure_invariant() {
        let mut ws = Workspace::new();
        ws.write_file("/deep/tree/of/files/x.bin", vec![0], true)
            .unwrap();
        for file in ws.file_paths().map(str::to_string).collect::<Vec<_>>() {
            for ancestor in vpath::ancestors(&file) {
                assert!(ws.dir_set().contains(&ancestor), "missing {ancestor}");
            }
        }
    }
}
