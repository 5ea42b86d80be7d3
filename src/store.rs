//! Content-addressed artifact store boundary.
//!
//! The real system supplies its own store; [`LocalStore`] is the built-in
//! directory-backed implementation used by the CLI and the tests. Store
//! paths are named `<base32-sha256>-<name>` so an artifact's hash is
//! recoverable from its path alone.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

#[cfg(test)]
use mockall::automock;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::paths::to_base32;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("'{0}' is not a store path")]
    BadStorePath(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath(PathBuf);

impl StorePath {
    pub fn new(path: impl Into<PathBuf>) -> StorePath {
        StorePath(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Which entries of a materialized tree are ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngestFilter {
    #[default]
    All,
    /// Drop every `.git` entry (files and directories alike), as required
    /// for checked-out submodule trees.
    ExcludeDotGit,
}

impl IngestFilter {
    pub fn allows(&self, file_name: &std::ffi::OsStr) -> bool {
        match self {
            IngestFilter::All => true,
            IngestFilter::ExcludeDotGit => file_name != ".git",
        }
    }
}

#[cfg_attr(test, automock)]
pub trait Store {
    /// Ingest `source` under `name`, returning the (possibly pre-existing)
    /// store path. Ingestion is at-most-once per content hash.
    fn add_to_store(
        &self,
        name: &str,
        source: &Path,
        filter: IngestFilter,
    ) -> Result<StorePath, StoreError>;

    /// The content hash recorded for a store path.
    fn nar_hash(&self, path: &StorePath) -> Result<String, StoreError>;
}

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<LocalStore, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalStore { root })
    }
}

impl Store for LocalStore {
    fn add_to_store(
        &self,
        name: &str,
        source: &Path,
        filter: IngestFilter,
    ) -> Result<StorePath, StoreError> {
        let digest = hash_tree(source, filter)?;
        let dest = self.root.join(format!("{}-{}", to_base32(&digest), name));
        if dest.exists() {
            debug!("store path {} already present", dest.display());
            return Ok(StorePath(dest));
        }

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)?;
        let staged = staging.path().join("tree");
        copy_tree(source, &staged, filter)?;

        match fs::rename(&staged, &dest) {
            Ok(()) => {}
            // Another invocation materialized the same content first.
            Err(_) if dest.exists() => {}
            Err(error) => return Err(error.into()),
        }
        info!("added '{}' to the store at {}", name, dest.display());
        Ok(StorePath(dest))
    }

    fn nar_hash(&self, path: &StorePath) -> Result<String, StoreError> {
        let base = path
            .as_path()
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::BadStorePath(path.to_string()))?;
        let (digest, _name) = base
            .split_once('-')
            .ok_or_else(|| StoreError::BadStorePath(path.to_string()))?;
        if digest.len() != 52 {
            return Err(StoreError::BadStorePath(path.to_string()));
        }
        Ok(format!("sha256:{digest}"))
    }
}

/// Deterministic recursive hash of a directory tree: a canonical
/// depth-first serialization (sorted entries, length-prefixed fields, file
/// type, executable bit, symlink targets) fed through SHA-256.
fn hash_tree(root: &Path, filter: IngestFilter) -> Result<[u8; 32], StoreError> {
    let mut hasher = Sha256::new();
    hash_dir(&mut hasher, root, filter)?;
    Ok(hasher.finalize().into())
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_dir(hasher: &mut Sha256, dir: &Path, filter: IngestFilter) -> Result<(), StoreError> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|e| filter.allows(&e.file_name()))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        feed(hasher, name.to_string_lossy().as_bytes());
        if meta.file_type().is_symlink() {
            feed(hasher, b"l");
            feed(hasher, fs::read_link(&path)?.to_string_lossy().as_bytes());
        } else if meta.is_dir() {
            feed(hasher, b"d");
            hash_dir(hasher, &path, filter)?;
            feed(hasher, b"e");
        } else {
            feed(hasher, if is_executable(&meta) { b"x" } else { b"f" });
            let mut file = fs::File::open(&path)?;
            let mut buf = [0u8; 64 * 1024];
            hasher.update(meta.len().to_le_bytes());
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path, filter: IngestFilter) -> Result<(), StoreError> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !filter.allows(&entry.file_name()) {
            continue;
        }
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        if meta.file_type().is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if meta.is_dir() {
            copy_tree(&from, &to, filter)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}
