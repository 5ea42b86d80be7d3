//! Default-branch resolution with a TTL-governed cache.
//!
//! The resolved HEAD of a remote is persisted as the mirror's own `HEAD`
//! symref; its mtime anchors the TTL. Network failures here never abort the
//! outer fetch: an expired cached value is better than nothing.

use std::{path::Path, time::Duration};

use crate::exec::{GitRunner, RunOptions};

/// Initial branch given to freshly-created bare mirrors. The value never
/// matters (mirrors are only ever fetched into), but it doubles as the
/// sentinel for "HEAD was never resolved".
pub const INITIAL_BRANCH: &str = "__nix_dummy_branch";

/// One parsed line of `git ls-remote --symref` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LsRemoteLine {
    /// `ref: refs/heads/main\tHEAD`
    Symbolic(String),
    /// `<oid>\tHEAD`
    Object(String),
}

impl LsRemoteLine {
    pub fn target(self) -> String {
        match self {
            LsRemoteLine::Symbolic(target) | LsRemoteLine::Object(target) => target,
        }
    }
}

pub fn parse_ls_remote_line(line: &str) -> Option<LsRemoteLine> {
    let (front, _name) = line.split_once(['\t', ' '])?;
    if let Some(target) = front.strip_prefix("ref:") {
        let target = target.trim();
        let rest = line.strip_prefix("ref:")?.trim_start();
        // `ref: <target>\t<name>`; the target may itself have been consumed
        // by the first split when separated by a space.
        let target = if target.is_empty() {
            rest.split_once(['\t', ' '])?.0
        } else {
            target
        };
        Some(LsRemoteLine::Symbolic(target.to_string()))
    } else {
        Some(LsRemoteLine::Object(front.trim().to_string()))
    }
}

/// Ask `url_or_path` (a remote URL or a repository directory) what its HEAD
/// points at. Returns the symbolic target if there is one, otherwise the
/// object id from the first line.
pub fn read_head(git: &GitRunner, url_or_path: &str) -> Option<String> {
    let output = git
        .run(
            &["ls-remote", "--symref", url_or_path, "HEAD"],
            RunOptions::default(),
        )
        .ok()?;
    if !output.success() {
        return None;
    }
    let line = output.stdout.lines().next()?;
    let parsed = parse_ls_remote_line(line)?;
    match &parsed {
        LsRemoteLine::Symbolic(target) => {
            debug!("resolved HEAD ref '{}' for repo '{}'", target, url_or_path)
        }
        LsRemoteLine::Object(target) => {
            debug!("resolved HEAD rev '{}' for repo '{}'", target, url_or_path)
        }
    }
    Some(parsed.target())
}

/// Persist the resolved HEAD on the mirror. `git symbolic-ref` refreshes the
/// mtime of `HEAD`, which is exactly the TTL anchor.
pub fn store_cached_head(git: &GitRunner, mirror_dir: &Path, head_ref: &str) -> bool {
    git.run_ok(
        &[
            "-C",
            &mirror_dir.to_string_lossy(),
            "--git-dir",
            ".",
            "symbolic-ref",
            "--",
            "HEAD",
            head_ref,
        ],
        RunOptions::default(),
    )
    .is_ok()
}

fn cached_head_is_fresh(mirror_dir: &Path, ttl: Duration) -> bool {
    let head_file = mirror_dir.join("HEAD");
    match std::fs::metadata(&head_file).and_then(|m| m.modified()) {
        Ok(modified) => match modified.elapsed() {
            Ok(age) => age <= ttl,
            // An mtime in the future counts as fresh.
            Err(_) => true,
        },
        Err(_) => false,
    }
}

/// Resolve the default branch of a remote, consulting the mirror's cached
/// HEAD first. Never fails hard: `None` means "no default could be
/// determined" and the caller picks its own fallback.
pub fn resolve_default_ref(
    git: &GitRunner,
    mirror_dir: &Path,
    url: &str,
    ttl: Duration,
) -> Option<String> {
    let mut cached: Option<String> = None;
    if mirror_dir.join("HEAD").exists() {
        cached = read_head(git, &mirror_dir.to_string_lossy());
        if let Some(cached_ref) = &cached {
            if cached_ref != INITIAL_BRANCH && cached_head_is_fresh(mirror_dir, ttl) {
                debug!("using cached HEAD ref '{}' for repo '{}'", cached_ref, url);
                return cached;
            }
        }
    }

    if let Some(head_ref) = read_head(git, url) {
        // An uninitialized mirror cannot hold the symref yet; the fetch path
        // persists it right after the first fetch instead.
        if mirror_dir.join("HEAD").exists() && !store_cached_head(git, mirror_dir, &head_ref) {
            warn!("could not update cached HEAD '{}' for '{}'", head_ref, url);
        }
        return Some(head_ref);
    }

    if let Some(cached_ref) = cached {
        // The fetch path falls back to the most recent local state when the
        // remote is unreachable; resolving HEAD has to behave the same way.
        warn!(
            "could not get HEAD ref for repository '{}'; using expired cached ref '{}'",
            url, cached_ref
        );
        return Some(cached_ref);
    }

    None
}
