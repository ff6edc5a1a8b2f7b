//! Validated, path-normalized sets of site files.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, SiteError};

/// How a [`FileEntry`]'s `content` string is encoded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
}

/// One file of a generated site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the site root.
    pub path: String,

    /// File content, interpreted according to `encoding`.
    pub content: String,

    #[serde(default)]
    pub encoding: FileEncoding,
}

impl FileEntry {
    /// A text file.
    pub fn utf8(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            encoding: FileEncoding::Utf8,
        }
    }

    /// A binary file; `bytes` are stored base64-encoded.
    pub fn binary(path: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            path: path.into(),
            content: STANDARD.encode(bytes),
            encoding: FileEncoding::Base64,
        }
    }

    /// The raw bytes of this file.
    pub fn decoded(&self) -> Result<Vec<u8>> {
        match self.encoding {
            FileEncoding::Utf8 => Ok(self.content.as_bytes().to_vec()),
            FileEncoding::Base64 => STANDARD.decode(self.content.trim()).map_err(|e| {
                SiteError::Validation(format!("invalid base64 content for {}: {e}", self.path))
            }),
        }
    }
}

/// Normalize a site-relative path.
///
/// Unifies separators, strips leading slashes and `.` segments, and collapses
/// empty segments. Returns `Ok(None)` for paths that normalize to nothing and
/// rejects `..` segments.
pub fn normalize_path(raw: &str) -> Result<Option<String>> {
    let unified = raw.trim().replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment.trim() {
            "" | "." => continue,
            ".." => {
                return Err(SiteError::Validation(format!(
                    "path escapes the site root: {raw}"
                )))
            }
            _ => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Ok(None);
    }
    Ok(Some(segments.join("/")))
}

/// An ordered, non-empty set of files with unique normalized paths.
///
/// When the input names a path more than once, the last entry wins but keeps
/// the position of the first occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Vec<FileEntry>", into = "Vec<FileEntry>")]
pub struct FileSet {
    entries: Vec<FileEntry>,
}

impl FileSet {
    /// Normalize and deduplicate `entries`. Fails with
    /// [`SiteError::Validation`] when no valid entry remains.
    pub fn new(entries: impl IntoIterator<Item = FileEntry>) -> Result<Self> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut normalized: Vec<FileEntry> = Vec::new();

        for mut entry in entries {
            let Some(path) = normalize_path(&entry.path)? else {
                continue;
            };
            entry.path = path;
            match index.get(&entry.path) {
                Some(&pos) => normalized[pos] = entry,
                None => {
                    index.insert(entry.path.clone(), normalized.len());
                    normalized.push(entry);
                }
            }
        }

        if normalized.is_empty() {
            return Err(SiteError::Validation(
                "file set contains no valid entries".to_string(),
            ));
        }
        Ok(Self {
            entries: normalized,
        })
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.path.as_str())
    }

    /// Look up an entry by (already normalized) path.
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileEntry> {
        self.entries.iter()
    }
}

impl TryFrom<Vec<FileEntry>> for FileSet {
    type Error = SiteError;

    fn try_from(entries: Vec<FileEntry>) -> Result<Self> {
        FileSet::new(entries)
    }
}

impl From<FileSet> for Vec<FileEntry> {
    fn from(set: FileSet) -> Self {
        set.entries
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a FileEntry;
    type IntoIter = std::slice::Iter<'a, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_unifies_and_strips() {
        assert_eq!(
            normalize_path("  /app\\page.tsx ").unwrap(),
            Some("app/page.tsx".to_string())
        );
        assert_eq!(
            normalize_path("./src//lib/./util.ts").unwrap(),
            Some("src/lib/util.ts".to_string())
        );
        assert_eq!(normalize_path("///").unwrap(), None);
        assert_eq!(normalize_path("").unwrap(), None);
    }

    #[test]
    fn normalize_rejects_parent_segments() {
        assert!(matches!(
            normalize_path("../etc/passwd"),
            Err(SiteError::Validation(_))
        ));
        assert!(normalize_path("app/../../x").is_err());
    }

    #[test]
    fn duplicate_paths_last_write_wins_first_position_kept() {
        let set = FileSet::new(vec![
            FileEntry::utf8("/index.html", "one"),
            FileEntry::utf8("style.css", "body{}"),
            FileEntry::utf8("index.html", "two"),
        ])
        .unwrap();

        assert_eq!(set.len(), 2);
        let paths: Vec<_> = set.paths().collect();
        assert_eq!(paths, vec!["index.html", "style.css"]);
        assert_eq!(set.get("index.html").unwrap().content, "two");
    }

    #[test]
    fn empty_file_set_rejected() {
        assert!(matches!(FileSet::new(vec![]), Err(SiteError::Validation(_))));
        assert!(matches!(
            FileSet::new(vec![FileEntry::utf8("  / ", "x")]),
            Err(SiteError::Validation(_))
        ));
    }

    #[test]
    fn binary_entry_decodes() {
        let entry = FileEntry::binary("favicon.ico", &[0, 159, 146, 150]);
        assert_eq!(entry.encoding, FileEncoding::Base64);
        assert_eq!(entry.decoded().unwrap(), vec![0, 159, 146, 150]);

        let bad = FileEntry {
            path: "x.bin".into(),
            content: "!!!".into(),
            encoding: FileEncoding::Base64,
        };
        assert!(bad.decoded().is_err());
    }

    #[test]
    fn deserialization_validates() {
        let json = r#"[{"path":"/a.txt","content":"hi"},{"path":"a.txt","content":"bye"}]"#;
        let set: FileSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.entries()[0].content, "bye");
        assert_eq!(set.entries()[0].encoding, FileEncoding::Utf8);

        assert!(serde_json::from_str::<FileSet>("[]").is_err());
    }
}
