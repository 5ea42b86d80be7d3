//! The per-URL bare mirror repository.
//!
//! One mirror per upstream URL, living at
//! `<cache-root>/gitv4/<base32-sha256(url)>`. All mutations happen under the
//! sibling `.lock` file (acquired by the dispatcher); readers of immutable
//! commit objects take no lock.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::{
    error::FetchError,
    exec::{ExitKind, GitRunner, RunOptions},
    head::INITIAL_BRANCH,
    input::Revision,
    paths,
    probe::CacheMode,
};

pub struct Mirror {
    pub dir: PathBuf,
    url: String,
}

/// Remote-side refspec for a fetch.
pub fn fetch_ref_for(reference: &str, all_refs: bool) -> String {
    if all_refs {
        "refs/*".to_string()
    } else if reference.starts_with("refs/") || reference == "HEAD" {
        reference.to_string()
    } else {
        format!("refs/heads/{reference}")
    }
}

impl Mirror {
    pub fn open(cache_root: &Path, url: &str) -> Mirror {
        Mirror {
            dir: paths::mirror_dir(cache_root, url),
            url: url.to_string(),
        }
    }

    /// The lock sentinel next to the mirror directory.
    pub fn lock_path(&self) -> PathBuf {
        let mut path = self.dir.clone().into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }

    /// Create the bare repository if it does not exist yet. Caller holds the
    /// mirror lock.
    pub fn ensure(&self, git: &GitRunner) -> Result<(), FetchError> {
        if let Some(parent) = self.dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !self.dir.exists() {
            git.run_ok(
                &[
                    "-c",
                    &format!("init.defaultBranch={INITIAL_BRANCH}"),
                    "init",
                    "--bare",
                    &self.dir.to_string_lossy(),
                ],
                RunOptions::default(),
            )?;
        }
        Ok(())
    }

    /// Whether `rev` is already present in the mirror's object store. A
    /// clean non-zero exit means "no"; a signaled git is a real error.
    pub fn has_rev(&self, git: &GitRunner, rev: &Revision) -> Result<bool, FetchError> {
        let dir = self.dir.to_string_lossy();
        let args = [
            "-C",
            dir.as_ref(),
            "--git-dir",
            ".",
            "cat-file",
            "-e",
            rev.as_str(),
        ];
        let output = git.run(&args, RunOptions::default())?;
        match output.exit {
            ExitKind::Exited(0) => Ok(true),
            ExitKind::Exited(_) => Ok(false),
            ExitKind::Signaled(_) => Err(git.failure(&args, &output).into()),
        }
    }

    pub fn is_shallow(&self, git: &GitRunner) -> Result<bool, FetchError> {
        let out = git.run_ok(
            &[
                "-C",
                &self.dir.to_string_lossy(),
                "--git-dir",
                ".",
                "rev-parse",
                "--is-shallow-repository",
            ],
            RunOptions::default(),
        )?;
        Ok(out == "true")
    }

    /// Whether anything has ever been fetched into the mirror. Distinguishes
    /// a freshly-initialized mirror from one holding full history.
    pub fn has_refs(&self, git: &GitRunner) -> Result<bool, FetchError> {
        let dir = self.dir.to_string_lossy();
        let out = git.run_ok(
            &[
                "-C",
                dir.as_ref(),
                "--git-dir",
                ".",
                "for-each-ref",
                "--count=1",
                "--format=%(refname)",
            ],
            RunOptions::default(),
        )?;
        Ok(!out.is_empty())
    }

    /// The loose ref file whose mtime anchors the per-ref fetch TTL.
    pub fn local_ref_file(&self, reference: &str) -> PathBuf {
        if reference.starts_with("refs/") {
            self.dir.join(reference)
        } else {
            self.dir.join("refs/heads").join(reference)
        }
    }

    pub fn ref_is_fresh(&self, reference: &str, ttl: Duration) -> bool {
        match std::fs::metadata(self.local_ref_file(reference)).and_then(|m| m.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(age) => age <= ttl,
                Err(_) => true,
            },
            Err(_) => false,
        }
    }

    /// Read the rev a previously-fetched ref resolved to.
    pub fn read_ref(&self, reference: &str) -> Result<Revision, FetchError> {
        let contents = std::fs::read_to_string(self.local_ref_file(reference))?;
        Ok(Revision::parse(contents.trim())?)
    }

    /// Whether a remote round-trip is needed for this invocation.
    pub fn decide_fetch(
        &self,
        git: &GitRunner,
        rev: Option<&Revision>,
        reference: &str,
        mode: CacheMode,
        ttl: Duration,
    ) -> Result<bool, FetchError> {
        let mut fetch = match rev {
            // A pinned rev only needs the network while it is absent.
            Some(rev) => !self.has_rev(git, rev)?,
            None if mode.all_refs => true,
            None => {
                // A full-depth mirror already satisfies a shallow request, so
                // an expired TTL alone must not force a round-trip that would
                // re-shallow it. A ref never fetched before still needs one.
                !self.ref_is_fresh(reference, ttl)
                    && !(mode.shallow
                        && self.local_ref_file(reference).exists()
                        && !self.is_shallow(git)?)
            }
        };

        // A full-depth snapshot out of a shallow mirror needs an unshallowing
        // fetch no matter how fresh the ref is.
        if !fetch && !mode.shallow && self.is_shallow(git)? {
            fetch = true;
        }

        Ok(fetch)
    }

    /// Fetch `reference` (or every ref) from the upstream URL into the
    /// mirror. On network failure with a previously-fetched ref on disk the
    /// stale state is kept with a warning; otherwise the error propagates.
    pub fn fetch(
        &self,
        git: &GitRunner,
        reference: &str,
        rev: Option<&Revision>,
        mode: CacheMode,
        num_jobs: &str,
    ) -> Result<(), FetchError> {
        let fetch_ref = fetch_ref_for(reference, mode.all_refs);
        let dir = self.dir.to_string_lossy().into_owned();

        let mut args: Vec<String> = vec![
            "-C".into(),
            dir,
            "--git-dir".into(),
            ".".into(),
            "fetch".into(),
            "--quiet".into(),
            "--force".into(),
            "--jobs".into(),
            num_jobs.into(),
        ];

        if mode.shallow {
            // Depth 1 applies while the mirror is shallow or brand new; a
            // mirror that already holds full history is never re-shallowed.
            if self.is_shallow(git)? || !self.has_refs(git)? {
                args.push("--depth=1".into());
            }
        } else if self.is_shallow(git)? {
            args.push("--unshallow".into());
        }

        let src = match (mode.shallow, rev) {
            (true, Some(rev)) => rev.to_string(),
            _ => fetch_ref.clone(),
        };
        args.push("--".into());
        args.push(self.url.clone());
        args.push(format!("{src}:{fetch_ref}"));

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match git.run_ok(&arg_refs, RunOptions::default()) {
            Ok(_) => {}
            Err(source) => {
                if !self.local_ref_file(reference).exists() {
                    return Err(FetchError::FetchFailed {
                        url: self.url.clone(),
                        source,
                    });
                }
                warn!(
                    "could not update local clone of Git repository '{}'; \
                     continuing with the most recent version",
                    self.url
                );
            }
        }

        self.touch_ref_file(reference);
        Ok(())
    }

    /// Reset the TTL anchor of a ref file to now.
    pub fn touch_ref_file(&self, reference: &str) {
        let path = self.local_ref_file(reference);
        let touched = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(error) = touched {
            warn!("could not update mtime for file '{}': {}", path.display(), error);
        }
    }
}
