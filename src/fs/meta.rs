//! File and directory records of the module's flash filesystem.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDateTime;

/// Drive of the module's flash filesystem.
pub const ROOT_DRIVE: &str = "A:";

/// Immutable snapshot of one filesystem entry.
///
/// Entries order directories before files, then by case-insensitive name,
/// with a case-sensitive tie-break. Equality follows the ordering: two
/// entries are equal when they are the same kind with the same name, so a
/// listing holds each name once.
#[derive(Debug, Clone)]
pub struct FileMeta {
    name: String,
    modified: Option<NaiveDateTime>,
    is_directory: bool,
    size: u64,
    parent: Option<Arc<FileMeta>>,
}

impl FileMeta {
    /// Root directory of `drive`. The drive letter is upper-cased.
    pub fn root(drive: &str) -> Self {
        Self {
            name: drive.to_uppercase(),
            modified: None,
            is_directory: true,
            size: 0,
            parent: None,
        }
    }

    pub fn directory(
        name: impl Into<String>,
        modified: Option<NaiveDateTime>,
        parent: Arc<FileMeta>,
    ) -> Self {
        Self {
            name: name.into(),
            modified,
            is_directory: true,
            size: 0,
            parent: Some(parent),
        }
    }

    pub fn file(
        name: impl Into<String>,
        size: u64,
        modified: Option<NaiveDateTime>,
        parent: Option<Arc<FileMeta>>,
    ) -> Self {
        Self {
            name: name.into(),
            modified,
            is_directory: false,
            size,
            parent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        self.modified
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn parent(&self) -> Option<&Arc<FileMeta>> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none() && self.is_directory
    }

    /// Full path such as `A:/data/log.txt`.
    pub fn path(&self) -> String {
        match &self.parent {
            None => self.name.clone(),
            Some(parent) => format!("{}/{}", parent.path(), self.name),
        }
    }
}

impl fmt::Display for FileMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl Ord for FileMeta {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .is_directory
            .cmp(&self.is_directory)
            .then_with(|| self.name.to_lowercase().cmp(&other.name.to_lowercase()))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for FileMeta {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FileMeta {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FileMeta {}

/// A file together with its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    meta: FileMeta,
    data: Bytes,
}

impl FileContent {
    /// Content for upload, stamped with the current local time.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let modified = chrono::Local::now().naive_local();
        Self {
            meta: FileMeta::file(name, data.len() as u64, Some(modified), None),
            data,
        }
    }

    /// Content with an explicit modification time.
    pub fn with_modified(name: impl Into<String>, data: impl Into<Bytes>, modified: NaiveDateTime) -> Self {
        let data = data.into();
        Self {
            meta: FileMeta::file(name, data.len() as u64, Some(modified), None),
            data,
        }
    }

    pub(crate) fn from_parts(meta: FileMeta, data: Bytes) -> Self {
        Self { meta, data }
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        self.meta.name()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}
