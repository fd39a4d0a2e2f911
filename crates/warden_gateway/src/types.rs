//! Operation options and results.

use serde::{Deserialize, Serialize};
use warden_core::{ContentDigest, QuotaLimits, Timestamp};
use warden_storage::{EntryKind, Metadata};

/// Options for [`crate::Gateway::list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    /// Include names starting with `.`
    pub show_hidden: bool,
    /// Stop after this many entries
    pub max_items: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            show_hidden: false,
            max_items: 100,
        }
    }
}

/// Options for [`crate::Gateway::read_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// Return at most this many lines; `None` returns the whole file
    pub max_lines: Option<usize>,
}

impl ReadOptions {
    /// Stop after `max_lines` lines
    #[must_use]
    pub fn lines(max_lines: usize) -> Self {
        Self {
            max_lines: Some(max_lines),
        }
    }

    /// Length of the prefix of `content` to return
    pub(crate) fn cut(&self, content: &[u8]) -> usize {
        let Some(max_lines) = self.max_lines else {
            return content.len();
        };
        if max_lines == 0 {
            return 0;
        }
        content
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte == b'\n')
            .nth(max_lines - 1)
            .map_or(content.len(), |(i, _)| i + 1)
    }
}

/// Options for [`crate::Gateway::search`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Glob matched against entry names
    pub pattern: String,
    /// Skip directories
    pub files_only: bool,
    /// Stop after this many matches
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            pattern: "*".to_string(),
            files_only: true,
            max_results: 50,
        }
    }
}

impl SearchOptions {
    /// Search for a pattern with default limits
    #[must_use]
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Self::default()
        }
    }

    /// Include directories in the results
    #[must_use]
    pub fn with_directories(mut self) -> Self {
        self.files_only = false;
        self
    }

    /// Set the result limit
    #[must_use]
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

fn rfc3339(ts: Option<Timestamp>) -> Option<String> {
    ts.map(|ts| ts.to_rfc3339())
}

/// Result of `stat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Tenant-relative path
    pub path: String,
    /// Final component, `.` for the root
    pub name: String,
    /// Entry kind
    pub kind: EntryKind,
    /// Size in bytes
    pub size: u64,
    /// Last modification (RFC 3339)
    pub modified: Option<String>,
    /// Creation (RFC 3339), where known
    pub created: Option<String>,
    /// Permission bits in octal, where known
    pub permissions: Option<String>,
    /// Number of direct entries, for directories
    pub entries: Option<u64>,
}

impl FileStat {
    pub(crate) fn new(path: String, name: String, meta: &Metadata, entries: Option<u64>) -> Self {
        Self {
            path,
            name,
            kind: meta.kind,
            size: meta.len,
            modified: rfc3339(meta.modified),
            created: rfc3339(meta.created),
            permissions: meta.permissions.map(|mode| format!("{mode:o}")),
            entries,
        }
    }
}

/// One entry of a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Entry name
    pub name: String,
    /// Entry kind; links are reported, not followed
    pub kind: EntryKind,
    /// Size, for regular files
    pub size: Option<u64>,
    /// Last modification (RFC 3339)
    pub modified: Option<String>,
}

impl ListEntry {
    pub(crate) fn new(name: String, meta: &Metadata) -> Self {
        Self {
            name,
            kind: meta.kind,
            size: meta.is_file().then_some(meta.len),
            modified: rfc3339(meta.modified),
        }
    }
}

/// Result of `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    /// Tenant-relative directory
    pub path: String,
    /// Entries sorted by name
    pub entries: Vec<ListEntry>,
    /// Whether `max_items` cut the listing short
    pub truncated: bool,
}

/// Result of `read`.
///
/// With a line limit `content` may be a prefix; `size` and `digest` always
/// describe the whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResult {
    /// Tenant-relative path
    pub path: String,
    /// File content
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
    /// File size
    pub size: u64,
    /// BLAKE3 digest of the file
    pub digest: ContentDigest,
    /// Whether `content` stops at the line limit
    #[serde(default)]
    pub truncated: bool,
}

/// Result of `write` and `append`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    /// Tenant-relative path
    pub path: String,
    /// File size after the operation
    pub size: u64,
    /// Bytes written by this operation
    pub bytes_written: u64,
    /// BLAKE3 digest of the bytes written
    pub digest: ContentDigest,
    /// Whether the file did not exist before
    pub created: bool,
}

/// Result of `delete`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReceipt {
    /// Tenant-relative path
    pub path: String,
    /// Kind of the removed entry
    pub kind: EntryKind,
    /// Bytes credited back to the quota
    pub bytes_freed: u64,
    /// Files credited back to the quota
    pub files_removed: u64,
}

/// Result of `move` and `copy`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Tenant-relative source
    pub from: String,
    /// Tenant-relative destination
    pub to: String,
    /// Kind of the transferred entry
    pub kind: EntryKind,
    /// Bytes copied; zero for moves
    pub bytes_copied: u64,
    /// Whether an existing file was replaced
    pub replaced: bool,
}

/// Result of `create_dir`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirReceipt {
    /// Tenant-relative path
    pub path: String,
    /// Permission bits in octal, where known
    pub permissions: Option<String>,
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    /// Tenant-relative path
    pub path: String,
    /// Entry kind
    pub kind: EntryKind,
    /// Size, for regular files
    pub size: Option<u64>,
    /// Last modification (RFC 3339)
    pub modified: Option<String>,
}

/// Result of `search`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Tenant-relative directory searched
    pub directory: String,
    /// Pattern used
    pub pattern: String,
    /// Matches sorted by path
    pub matches: Vec<SearchMatch>,
    /// Whether `max_results` cut the search short
    pub truncated: bool,
}

/// Result of `usage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// Tenant id
    pub tenant: String,
    /// Committed bytes
    pub bytes_used: u64,
    /// Committed regular files
    pub file_count: u64,
    /// Bytes claimed by in-flight operations
    pub reserved_bytes: u64,
    /// Files claimed by in-flight operations
    pub reserved_files: u64,
    /// Effective quota
    pub limits: QuotaLimits,
    /// Rate tokens currently available
    pub rate_tokens: u64,
    /// Rate bucket capacity
    pub rate_capacity: u32,
    /// Largest file that may be read or produced
    pub max_file_size: u64,
    /// Extension allowlist; `None` when every extension is accepted
    pub allowed_extensions: Option<Vec<String>>,
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_defaults() {
        let list: ListOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(list, ListOptions::default());
        assert_eq!(list.max_items, 100);

        let search: SearchOptions = serde_json::from_str(r#"{"pattern": "*.rs"}"#).unwrap();
        assert!(search.files_only);
        assert_eq!(search.max_results, 50);
    }

    #[test]
    fn test_read_result_hex_content() {
        let result = ReadResult {
            path: "a.txt".to_string(),
            content: vec![0, 255],
            size: 2,
            digest: ContentDigest::compute(&[0, 255]),
            truncated: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["content"], "00ff");
        let back: ReadResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_read_options_cut() {
        let text = b"one\ntwo\nthree";
        assert_eq!(ReadOptions::default().cut(text), text.len());
        assert_eq!(ReadOptions::lines(0).cut(text), 0);
        assert_eq!(ReadOptions::lines(1).cut(text), 4);
        assert_eq!(ReadOptions::lines(2).cut(text), 8);
        // The unterminated last line counts as a line
        assert_eq!(ReadOptions::lines(3).cut(text), text.len());
        assert_eq!(ReadOptions::lines(10).cut(text), text.len());
        assert_eq!(ReadOptions::lines(1).cut(b""), 0);
    }

    #[test]
    fn test_file_stat_permissions_octal() {
        let meta = Metadata {
            kind: EntryKind::File,
            len: 3,
            modified: Some(Timestamp::new(0, 0)),
            created: None,
            permissions: Some(0o644),
        };
        let stat = FileStat::new("a".to_string(), "a".to_string(), &meta, None);
        assert_eq!(stat.permissions.as_deref(), Some("644"));
        assert_eq!(stat.modified.as_deref(), Some("1970-01-01T00:00:00.000Z"));
    }
}
