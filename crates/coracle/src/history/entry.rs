//! Journal data model: persisted state, entry records, and change sets.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::vpath;
use crate::workspace::Workspace;

/// Current schema version of `state.json`.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Journal retention policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Retention {
    /// Newest entries that compaction never touches.
    pub keep_recent: usize,
    /// Entry count above which compaction kicks in.
    pub max_entries: usize,
    /// How many oldest entries are folded together per compaction step.
    pub merge_group: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_recent: 50,
            max_entries: 200,
            merge_group: 5,
        }
    }
}

/// Entry summary held by value inside `state.json`.
///
/// Full entries are addressed by id and loaded on demand from
/// `/.time/entries/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub id: String,
    pub created_at: String,
    pub tool: String,
    #[serde(default)]
    pub compacted: bool,
    pub changed_paths: Vec<String>,
}

/// Persisted journal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalState {
    pub schema_version: u32,
    pub created_at: String,
    pub updated_at: String,
    pub entries: Vec<EntrySummary>,
    /// Count of entries currently applied. Entries strictly before the
    /// cursor are undoable; entries at and after it are redoable.
    pub cursor: usize,
    pub retention: Retention,
}

impl JournalState {
    pub fn new(now: &str) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            entries: Vec::new(),
            cursor: 0,
            retention: Retention::default(),
        }
    }
}

/// One recorded mutation of the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Change {
    #[serde(rename_all = "camelCase")]
    File {
        path: String,
        before_exists: bool,
        after_exists: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        before_blob: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        after_blob: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        before_size: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        after_size: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Dir {
        path: String,
        before_exists: bool,
        after_exists: bool,
    },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::File { path, .. } | Change::Dir { path, .. } => path,
        }
    }
}

/// Full journal entry, persisted as `/.time/entries/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub created_at: String,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub changes: Vec<Change>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compacted_from: Option<Vec<String>>,
}

/// A partial picture of workspace state: the files and directories a caller
/// observed before or after a mutation.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
}

impl Snapshot {
    /// Snapshot specific paths: file bytes if present, directory membership
    /// of the path and its parent chain.
    pub fn of_paths(ws: &Workspace, paths: &[&str]) -> Self {
        let mut snap = Self::default();
        for raw in paths {
            let path = vpath::normalize(raw);
            if let Ok(bytes) = ws.read_file(&path) {
                snap.files.insert(path.clone(), bytes.to_vec());
            }
            for dir in ws.dir_paths() {
                if dir == path || (path.starts_with(&format!("{dir}/")) && dir != "/") {
                    snap.dirs.insert(dir.to_string());
                }
            }
        }
        snap
    }

    /// Snapshot the whole workspace, excluding the reserved namespace.
    pub fn full(ws: &Workspace) -> Self {
        let mut snap = Self::default();
        for path in ws.file_paths() {
            if !vpath::is_reserved(path) {
                snap.files.insert(path.to_string(), ws.read_file(path).unwrap_or(&[]).to_vec());
            }
        }
        for dir in ws.dir_paths() {
            if dir != "/" && !vpath::is_reserved(dir) {
                snap.dirs.insert(dir.to_string());
            }
        }
        snap
    }
}

/// Monotonic id and timestamp generator.
///
/// Ids look like `2026-08-02T14-03-07-412Z_a91f3c` and sort
/// lexicographically in creation order within one process. Across process
/// restarts monotonicity is not guaranteed.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last_millis: u64,
    sequence: u64,
}

impl IdGenerator {
    pub fn next_id(&mut self) -> (String, String) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let millis = if now <= self.last_millis {
            self.last_millis + 1
        } else {
            now
        };
        self.last_millis = millis;
        self.sequence += 1;

        let mut hasher = DefaultHasher::new();
        (millis, self.sequence, std::process::id()).hash(&mut hasher);
        let suffix = hasher.finish() & 0xff_ffff;

        let id = format!("{}_{suffix:06x}", id_stamp(millis));
        (id, rfc3339(millis))
    }
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (year + i64::from(month <= 2), month, day)
}

fn split_millis(millis: u64) -> (i64, u32, u32, u64, u64, u64, u64) {
    let secs = millis / 1000;
    let ms = millis % 1000;
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let tod = secs % 86_400;
    (year, month, day, tod / 3600, (tod % 3600) / 60, tod % 60, ms)
}

/// RFC 3339 timestamp with millisecond precision.
pub fn rfc3339(millis: u64) -> String {
    let (y, mo, d, h, mi, s, ms) = split_millis(millis);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}.{ms:03}Z")
}

/// Filesystem-safe timestamp used as the id prefix (no colons or dots).
fn id_stamp(millis: u64) -> String {
    let (y, mo, d, h, mi, s, ms) = split_millis(millis);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}-{mi:02}-{s:02}-{ms:03}Z")
}

/// Current wall-clock time as RFC 3339.
pub fn now_rfc3339() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    rfc3339(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_civil_from_days_epoch() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(365), (1971, 1, 1));
        // 2000-02-29 was day 11016.
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
    }

    #[test]
    fn test_rfc3339_format() {
        // 2026-08-02T00:00:00.000Z
        let millis = 1_785_542_400_000u64;
        assert_eq!(rfc3339(millis), "2026-08-02T00:00:00.000Z");
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut generator = IdGenerator::default();
        let mut previous = String::new();
        for _ in 0..100 {
            let (id, _) = generator.next_id();
            assert!(id > previous, "{id} not after {previous}");
            previous = id;
        }
    }

    #[test]
    fn test_id_shape() {
        let mut generator = IdGenerator::default();
        let (id, created_at) = generator.next_id();
        let (stamp, suffix) = id.split_once('_').expect("separator");
        assert_eq!(stamp.len(), "2026-08-02T14-03-07-412Z".len());
        assert!(stamp.ends_with('Z'));
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(created_at.ends_with('Z'));
    }

    #[test]
    fn test_retention_defaults() {
        let retention = Retention::default();
        assert_eq!(retention.keep_recent, 50);
        assert_eq!(retention.max_entries, 200);
        assert_eq!(retention.merge_group, 5);
    }

    #[test]
    fn test_change_serialization_tags() {
        let change = Change::Dir {
            path: "/a".into(),
            before_exists: false,
            after_exists: true,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "dir");
        assert_eq!(json["beforeExists"], false);
    }

    #[test]
    fn test_snapshot_full_excludes_reserved() {
        let mut ws = Workspace::new();
        ws.write_file("/a.txt", b"a".to_vec(), true).unwrap();
        ws.write_file("/.time/state.json", b"{}".to_vec(), true)
            .unwrap();
        let snap = Snapshot::full(&ws);
        assert!(snap.files.contains_key("/a.txt"));
        assert!(!snap.files.keys().any(|k| k.starts_with("/.time")));
        assert!(!snap.dirs.iter().any(|d| d.starts_with("/.time")));
    }
}
