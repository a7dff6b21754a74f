use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use super::ScanError;
use crate::util::hash::sha256_hex;

/// Recursive listing of a directory tree with modification times, keyed by
/// path relative to the root. The first path component of an entry names
/// the application it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    files: BTreeMap<PathBuf, SystemTime>,
}

impl DirectorySnapshot {
    /// Capture the current state of `root`. A missing root yields an empty
    /// snapshot rather than an error so that a deployment directory created
    /// later is picked up as a change.
    pub fn capture(root: &Path) -> Result<Self, ScanError> {
        let mut files = BTreeMap::new();
        if root.exists() {
            walk(root, root, &mut files).map_err(|source| ScanError {
                path: root.to_path_buf(),
                source,
            })?;
        }
        Ok(Self { files })
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Names of the applications that differ between the two snapshots:
    /// entries added, removed, or carrying a new modification time.
    pub fn changed_applications(&self, newer: &Self) -> Vec<String> {
        let mut changed = std::collections::BTreeSet::new();
        for (path, mtime) in &self.files {
            match newer.files.get(path) {
                Some(new_mtime) if new_mtime == mtime => {}
                _ => {
                    changed.insert(application_of(path));
                }
            }
        }
        for path in newer.files.keys() {
            if !self.files.contains_key(path) {
                changed.insert(application_of(path));
            }
        }
        changed.into_iter().collect()
    }

    /// Content fingerprint of one application's entries, stable across
    /// captures of an unchanged tree.
    pub fn application_digest(&self, application: &str) -> String {
        let mut material = String::new();
        for (path, mtime) in &self.files {
            if application_of(path) != application {
                continue;
            }
            let stamp = mtime
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            material.push_str(&format!("{}:{stamp}\n", path.display()));
        }
        sha256_hex(material.as_bytes())
    }
}

fn application_of(path: &Path) -> String {
    match path.components().next() {
        Some(first) => first.as_os_str().to_string_lossy().into_owned(),
        None => String::new(),
    }
}

fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, SystemTime>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            walk(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("walked path escapes its root")
                .to_path_buf();
            files.insert(relative, metadata.modified()?);
        }
    }
    Ok(())
}
