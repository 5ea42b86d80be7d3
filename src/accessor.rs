//! Read-only filesystem views over a fetched snapshot.
//!
//! Three shapes: a view synthesized directly from Git objects in the mirror
//! (no extraction cost), a filtered view over a local working tree restricted
//! to the tracked file set, and a plain view over a store path.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use git2::{ObjectType, Repository};
use thiserror::Error;

use crate::input::Revision;

#[derive(Error, Debug)]
pub enum AccessorError {
    #[error("path '{path}' does not exist in Git repository '{repo}'")]
    NotFound { path: String, repo: String },
    #[error(
        "access to path '{path}' is forbidden because it is not under Git control; \
         maybe you should 'git add' it to the repository '{repo}'?"
    )]
    NotTracked { path: String, repo: String },
    #[error("'{path}' is not a directory")]
    NotADirectory { path: String },
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular { executable: bool },
    Directory,
    Symlink,
}

/// A read-only view of one snapshot. Paths are relative to the snapshot
/// root, `""` naming the root itself.
pub trait SnapshotAccessor {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, AccessorError>;
    fn entry_kind(&self, path: &Path) -> Result<Option<EntryKind>, AccessorError>;
    fn list_dir(&self, path: &Path) -> Result<Vec<String>, AccessorError>;
}

/// View over the objects of a (possibly bare) repository, pinned to a rev.
pub struct GitObjectAccessor {
    repo: Repository,
    rev: Revision,
    display: String,
}

impl GitObjectAccessor {
    pub fn open(repo_dir: &Path, rev: Revision) -> Result<GitObjectAccessor, AccessorError> {
        let repo = Repository::open(repo_dir)?;
        Ok(GitObjectAccessor {
            repo,
            display: repo_dir.display().to_string(),
            rev,
        })
    }

    fn root_tree(&self) -> Result<git2::Tree<'_>, AccessorError> {
        let oid = git2::Oid::from_str(self.rev.as_str())?;
        Ok(self.repo.find_commit(oid)?.tree()?)
    }

    fn entry_at<'a>(
        &self,
        tree: &'a git2::Tree<'_>,
        path: &Path,
    ) -> Result<Option<git2::TreeEntry<'a>>, AccessorError> {
        match tree.get_path(path) {
            Ok(entry) => Ok(Some(entry)),
            Err(error) if error.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

impl SnapshotAccessor for GitObjectAccessor {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, AccessorError> {
        let tree = self.root_tree()?;
        let entry = self
            .entry_at(&tree, path)?
            .ok_or_else(|| AccessorError::NotFound {
                path: path.display().to_string(),
                repo: self.display.clone(),
            })?;
        let blob = self.repo.find_blob(entry.id())?;
        Ok(blob.content().to_vec())
    }

    fn entry_kind(&self, path: &Path) -> Result<Option<EntryKind>, AccessorError> {
        let tree = self.root_tree()?;
        if path.as_os_str().is_empty() {
            return Ok(Some(EntryKind::Directory));
        }
        let Some(entry) = self.entry_at(&tree, path)? else {
            return Ok(None);
        };
        let kind = match entry.kind() {
            Some(ObjectType::Tree) => EntryKind::Directory,
            // Submodule commits read as directories to the consumer.
            Some(ObjectType::Commit) => EntryKind::Directory,
            _ => match entry.filemode() {
                0o120000 => EntryKind::Symlink,
                0o100755 => EntryKind::Regular { executable: true },
                _ => EntryKind::Regular { executable: false },
            },
        };
        Ok(Some(kind))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, AccessorError> {
        let root = self.root_tree()?;
        let tree = if path.as_os_str().is_empty() {
            root
        } else {
            let entry = self
                .entry_at(&root, path)?
                .ok_or_else(|| AccessorError::NotFound {
                    path: path.display().to_string(),
                    repo: self.display.clone(),
                })?;
            match entry.to_object(&self.repo)?.into_tree() {
                Ok(tree) => tree,
                Err(_) => {
                    return Err(AccessorError::NotADirectory {
                        path: path.display().to_string(),
                    })
                }
            }
        };
        Ok(tree
            .iter()
            .filter_map(|entry| entry.name().map(str::to_string))
            .collect())
    }
}

/// View over a working tree, restricted to an explicit allowed set (the
/// output of `git ls-files`). Directories exist exactly when they are a
/// prefix of an allowed path.
pub struct WorkTreeAccessor {
    root: PathBuf,
    allowed: Option<BTreeSet<PathBuf>>,
    display: String,
}

impl WorkTreeAccessor {
    pub fn new(root: impl Into<PathBuf>, allowed: Option<BTreeSet<PathBuf>>) -> WorkTreeAccessor {
        let root = root.into();
        WorkTreeAccessor {
            display: root.display().to_string(),
            root,
            allowed,
        }
    }

    fn check_allowed(&self, path: &Path) -> Result<(), AccessorError> {
        let Some(allowed) = &self.allowed else {
            return Ok(());
        };
        if allowed.contains(path) {
            return Ok(());
        }
        if self.root.join(path).exists() {
            Err(AccessorError::NotTracked {
                path: path.display().to_string(),
                repo: self.display.clone(),
            })
        } else {
            Err(AccessorError::NotFound {
                path: path.display().to_string(),
                repo: self.display.clone(),
            })
        }
    }

    fn is_allowed_dir(&self, path: &Path) -> bool {
        match &self.allowed {
            None => true,
            Some(allowed) => allowed.iter().any(|p| p.starts_with(path)),
        }
    }
}

impl SnapshotAccessor for WorkTreeAccessor {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, AccessorError> {
        self.check_allowed(path)?;
        Ok(std::fs::read(self.root.join(path))?)
    }

    fn entry_kind(&self, path: &Path) -> Result<Option<EntryKind>, AccessorError> {
        if path.as_os_str().is_empty() {
            return Ok(Some(EntryKind::Directory));
        }
        let on_disk = self.root.join(path);
        let meta = match std::fs::symlink_metadata(&on_disk) {
            Ok(meta) => meta,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };
        if meta.is_dir() {
            return Ok(self.is_allowed_dir(path).then_some(EntryKind::Directory));
        }
        if self
            .allowed
            .as_ref()
            .is_some_and(|allowed| !allowed.contains(path))
        {
            return Ok(None);
        }
        let kind = if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Regular {
                executable: is_executable(&meta),
            }
        };
        Ok(Some(kind))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, AccessorError> {
        let on_disk = self.root.join(path);
        if !on_disk.is_dir() {
            return Err(AccessorError::NotADirectory {
                path: path.display().to_string(),
            });
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&on_disk)? {
            let entry = entry?;
            let rel = path.join(entry.file_name());
            let visible = match &self.allowed {
                None => true,
                Some(allowed) => {
                    allowed.contains(&rel) || allowed.iter().any(|p| p.starts_with(&rel))
                }
            };
            if visible {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Unrestricted view over an ingested store artifact.
pub fn store_path_accessor(store_path: &crate::store::StorePath) -> WorkTreeAccessor {
    WorkTreeAccessor::new(store_path.as_path(), None)
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::process::Command;

    fn git_in(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn committed_repo(root: &Path) -> (PathBuf, Revision) {
        let repo = root.join("repo");
        std::fs::create_dir_all(repo.join("docs")).unwrap();
        std::fs::write(repo.join("README.md"), "# hello\n").unwrap();
        std::fs::write(repo.join("docs/guide.md"), "guide\n").unwrap();
        git_in(&repo, &["init", "-q", "-b", "master"]);
        git_in(&repo, &["add", "."]);
        git_in(
            &repo,
            &[
                "-c",
                "user.email=test@example.org",
                "-c",
                "user.name=Test",
                "commit",
                "-q",
                "-m",
                "initial",
            ],
        );
        let head = Command::new("git")
            .arg("-C")
            .arg(&repo)
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        let rev = Revision::parse(String::from_utf8_lossy(&head.stdout).trim()).unwrap();
        (repo, rev)
    }

    #[test]
    fn git_object_accessor_reads_pinned_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, rev) = committed_repo(dir.path());

        // Later working-tree edits must be invisible through the accessor.
        std::fs::write(repo.join("README.md"), "# changed\n").unwrap();

        let accessor = GitObjectAccessor::open(&repo, rev).unwrap();
        assert_eq!(
            accessor.read_file(Path::new("README.md")).unwrap(),
            b"# hello\n"
        );
        assert_eq!(
            accessor.entry_kind(Path::new("docs")).unwrap(),
            Some(EntryKind::Directory)
        );
        assert_eq!(accessor.entry_kind(Path::new("missing")).unwrap(), None);

        let mut names = accessor.list_dir(Path::new("")).unwrap();
        names.sort();
        assert_eq!(names, vec!["README.md", "docs"]);
        assert_eq!(accessor.list_dir(Path::new("docs")).unwrap(), vec!["guide.md"]);
    }

    #[test]
    fn work_tree_accessor_enforces_the_allowed_set() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("tracked.txt"), "yes\n").unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(root.join("untracked.txt"), "no\n").unwrap();

        let allowed: BTreeSet<PathBuf> =
            [PathBuf::from("tracked.txt"), PathBuf::from("src/main.rs")]
                .into_iter()
                .collect();
        let accessor = WorkTreeAccessor::new(&root, Some(allowed));

        assert_eq!(accessor.read_file(Path::new("tracked.txt")).unwrap(), b"yes\n");
        let err = accessor.read_file(Path::new("untracked.txt")).unwrap_err();
        assert!(matches!(err, AccessorError::NotTracked { .. }));
        let err = accessor.read_file(Path::new("absent.txt")).unwrap_err();
        assert!(matches!(err, AccessorError::NotFound { .. }));

        assert_eq!(
            accessor.entry_kind(Path::new("untracked.txt")).unwrap(),
            None
        );
        assert_eq!(
            accessor.entry_kind(Path::new("src")).unwrap(),
            Some(EntryKind::Directory)
        );
        assert_eq!(
            accessor.list_dir(Path::new("")).unwrap(),
            vec!["src", "tracked.txt"]
        );
    }
}
