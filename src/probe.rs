//! Input classification: remote URL, local working tree, dirty tree.

use url::Url;

use crate::{
    error::FetchError,
    exec::{ExitKind, GitRunner, RunOptions},
    input::GitInput,
};

/// The cache-partitioning flags of an input. Artifacts produced under
/// different modes never alias in the locked-input cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMode {
    pub shallow: bool,
    pub submodules: bool,
    pub all_refs: bool,
}

impl CacheMode {
    pub fn of(input: &GitInput) -> CacheMode {
        CacheMode {
            shallow: input.shallow,
            submodules: input.submodules,
            all_refs: input.all_refs,
        }
    }

    /// Cache namespace tag; the suffix order is fixed so the tag is a stable
    /// function of the flag set.
    pub fn tag(&self) -> String {
        let mut tag = String::from("git");
        if self.shallow {
            tag.push_str("-shallow");
        }
        if self.submodules {
            tag.push_str("-submodules");
        }
        if self.all_refs {
            tag.push_str("-all-refs");
        }
        tag
    }
}

/// What the probe learned about an input. Mutated only here; the dispatcher
/// treats it as frozen.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub mode: CacheMode,
    /// Local, non-bare working tree.
    pub is_local: bool,
    /// Local working tree with uncommitted changes (or no ref/rev to pin it).
    pub is_dirty: bool,
    /// False when the working tree has no commits yet.
    pub has_head: bool,
    /// Filesystem path when local, the remote URL otherwise.
    pub url: String,
    /// `.git` for working trees, `.` inside a bare mirror.
    pub git_dir: String,
}

/// Classify an input. `force_remote_file_urls` is the explicit testing hook
/// that pushes `file://` URLs down the remote code path.
pub fn probe(
    input: &GitInput,
    force_remote_file_urls: bool,
    git: &GitRunner,
) -> Result<RepoInfo, FetchError> {
    let url = Url::parse(&input.url).map_err(crate::input::InputError::from)?;

    // file:// URLs whose target is a bare repo (no .git subdirectory) are
    // mirrored like remote URLs.
    let is_bare_repository =
        url.scheme() == "file" && !std::path::Path::new(url.path()).join(".git").exists();
    let is_local = url.scheme() == "file" && !force_remote_file_urls && !is_bare_repository;

    let mut info = RepoInfo {
        mode: CacheMode::of(input),
        is_local,
        is_dirty: false,
        has_head: true,
        url: if is_local {
            url.path().to_string()
        } else {
            input.url.clone()
        },
        git_dir: ".git".to_string(),
    };

    // Only a local directory with neither ref nor rev may be consumed as a
    // (possibly unclean) working tree.
    if input.reference.is_none() && input.rev.is_none() && info.is_local {
        info.is_dirty = true;
        classify_working_tree(&mut info, git)?;
    }

    Ok(info)
}

/// Run `git rev-parse` / `git diff` in the candidate directory and settle
/// `has_head` / `is_dirty`. LC_ALL=C pins the error messages we classify on.
fn classify_working_tree(info: &mut RepoInfo, git: &GitRunner) -> Result<(), FetchError> {
    let output = git.run(
        &[
            "-C",
            &info.url,
            "--git-dir",
            &info.git_dir,
            "rev-parse",
            "--verify",
            "--no-revs",
            "HEAD^{commit}",
        ],
        RunOptions {
            env: vec![("LC_ALL".to_string(), "C".to_string())],
            merge_stderr: true,
            ..RunOptions::default()
        },
    )?;

    let message = output.stdout.clone();
    match output.exit {
        _ if message.contains("fatal: not a git repository") => {
            return Err(FetchError::NotARepo {
                path: info.url.clone(),
            });
        }
        // A repository without any commits; stays dirty, has no HEAD.
        _ if message.contains("fatal: Needed a single revision") => {
            info.has_head = false;
            return Ok(());
        }
        ExitKind::Exited(0) => {}
        ExitKind::Exited(code) => {
            return Err(FetchError::HeadProbeFailed {
                path: info.url.clone(),
                code,
                message,
            });
        }
        ExitKind::Signaled(_) => {
            return Err(git.failure(&["rev-parse", "--verify", "HEAD^{commit}"], &output).into());
        }
    }

    let mut diff_args: Vec<&str> = vec![
        "-C",
        &info.url,
        "--git-dir",
        &info.git_dir,
        "diff",
        "HEAD",
        "--quiet",
    ];
    if !info.mode.submodules {
        // Submodule-only changes do not make the tree dirty unless the
        // submodules are going to be part of the snapshot.
        diff_args.push("--ignore-submodules");
    }
    diff_args.push("--");

    let diff = git.run(&diff_args, RunOptions::default())?;
    match diff.exit {
        ExitKind::Exited(0) => {
            info.is_dirty = false;
            Ok(())
        }
        ExitKind::Exited(1) => Ok(()),
        _ => Err(git.failure(&diff_args, &diff).into()),
    }
}
