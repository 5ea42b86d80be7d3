//! Materializing a commit into a plain directory tree.
//!
//! The simple path pipes `git archive` into a tar extractor. The submodule
//! path drives a full checkout in a two-repo layout: a throwaway work tree
//! plus a git-dir that is either the mirror itself (remote sources) or a
//! temporary directory borrowing objects from the user's repository (local
//! sources, which must never be mutated).

use std::path::{Path, PathBuf};

use crate::{
    error::FetchError,
    exec::{ExecError, ExitKind, GitRunner, RunOptions},
    head::INITIAL_BRANCH,
    input::Revision,
    probe::RepoInfo,
};

/// Pipe `git archive <rev>` into `dest`.
pub fn extract_archive(
    git: &GitRunner,
    repo_dir: &Path,
    git_dir: &str,
    rev: &Revision,
    dest: &Path,
) -> Result<(), FetchError> {
    let dir = repo_dir.to_string_lossy();
    let args = [
        "-C",
        dir.as_ref(),
        "--git-dir",
        git_dir,
        "archive",
        rev.as_str(),
    ];
    let mut child = git.spawn_piped(&args, RunOptions::default())?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let unpack_result = tar::Archive::new(stdout).unpack(dest);
    let status = child.wait().map_err(|source| ExecError::Io {
        program: "git".to_string(),
        source,
    })?;

    if !status.success() {
        return Err(ExecError::Failed {
            program: "git".to_string(),
            args: args.join(" "),
            exit: status
                .code()
                .map(ExitKind::Exited)
                .unwrap_or(ExitKind::Signaled(-1)),
            detail: "archive pipeline failed".to_string(),
        }
        .into());
    }
    unpack_result?;
    Ok(())
}

/// Check out `rev` (including submodules) into `work_tree`.
///
/// Preconditions: `rev` is present in `repo_dir`'s object store. For local
/// sources the object store is only ever *borrowed* (via alternates); every
/// write lands in the temporary git-dir or the work tree.
pub fn checkout_with_submodules(
    git: &GitRunner,
    info: &RepoInfo,
    repo_dir: &Path,
    rev: &Revision,
    work_tree: &Path,
    num_jobs: &str,
) -> Result<(), FetchError> {
    // Keeps the temporary git-dir alive for the whole checkout.
    let _separate_git_dir_guard;

    let git_folder: PathBuf = if info.is_local {
        let guard = tempfile::tempdir()?;
        let git_folder = guard.path().join("git");
        _separate_git_dir_guard = Some(guard);

        init_borrowing_git_dir(git, info, repo_dir, work_tree, &git_folder)?;
        git_folder
    } else {
        _separate_git_dir_guard = None;
        repo_dir.join(&info.git_dir)
    };
    let git_folder_str = git_folder.to_string_lossy().into_owned();
    let work_tree_str = work_tree.to_string_lossy().into_owned();

    if !info.is_local {
        // Relative submodule URLs resolve against origin; point it at the
        // canonical upstream rather than wherever the mirror came from.
        git.run_ok(
            &[
                "--git-dir",
                &git_folder_str,
                "--work-tree",
                &work_tree_str,
                "config",
                "remote.origin.url",
                &info.url,
            ],
            RunOptions::default(),
        )?;
    }

    git.run_ok(
        &[
            "--git-dir",
            &git_folder_str,
            "--work-tree",
            &work_tree_str,
            "checkout",
            "--quiet",
            rev.as_str(),
            ".",
        ],
        RunOptions::in_dir(work_tree),
    )?;

    if !info.mode.shallow {
        // Submodules previously initialized as shallow must be deepened
        // before `submodule update` pins them; untouched or full-depth
        // submodules are skipped by the guard, missing ones are a no-op.
        let deepen = format!(
            "if test \"$(git rev-parse --is-shallow-repository)\" = true; \
             then git fetch --unshallow --jobs={num_jobs}; fi"
        );
        git.run_ok(
            &[
                "--git-dir",
                &git_folder_str,
                "--work-tree",
                &work_tree_str,
                "-C",
                &work_tree_str,
                "submodule",
                "foreach",
                "--recursive",
                &deepen,
            ],
            RunOptions::default(),
        )?;
    }

    let mut update_args: Vec<String> = vec![
        "--git-dir".into(),
        git_folder_str.clone(),
        "--work-tree".into(),
        work_tree_str.clone(),
        "-C".into(),
        work_tree_str.clone(),
        "submodule".into(),
        "update".into(),
        "--init".into(),
        "--recursive".into(),
        "--quiet".into(),
        "--recommend-shallow".into(),
        "--jobs".into(),
        num_jobs.into(),
    ];
    if info.mode.shallow {
        update_args.push("--depth=1".into());
    }

    // Try without fetching first: a submodule commit that is present but
    // unreachable otherwise triggers a pointless network round-trip.
    let mut no_fetch_args = update_args.clone();
    no_fetch_args.push("--no-fetch".into());
    let no_fetch_refs: Vec<&str> = no_fetch_args.iter().map(String::as_str).collect();
    if let Err(error) = git.run_ok(&no_fetch_refs, RunOptions::default()) {
        debug!("submodule update without fetching failed ({error}); retrying with fetch");
        let update_refs: Vec<&str> = update_args.iter().map(String::as_str).collect();
        git.run_ok(&update_refs, RunOptions::default())?;
    }

    Ok(())
}

/// `git init` a work tree whose separate git-dir borrows objects from the
/// source repository via alternates, transitively for submodules.
fn init_borrowing_git_dir(
    git: &GitRunner,
    info: &RepoInfo,
    repo_dir: &Path,
    work_tree: &Path,
    git_folder: &Path,
) -> Result<(), FetchError> {
    let work_tree_str = work_tree.to_string_lossy().into_owned();
    let git_folder_str = git_folder.to_string_lossy().into_owned();
    git.run_ok(
        &[
            "-c",
            &format!("init.defaultBranch={INITIAL_BRANCH}"),
            "init",
            "--quiet",
            "--separate-git-dir",
            &git_folder_str,
            &work_tree_str,
        ],
        RunOptions::default(),
    )?;

    // Borrow the source's objects instead of copying them.
    let source_git_dir = repo_dir.join(&info.git_dir);
    let alternates = git_folder.join("objects/info");
    std::fs::create_dir_all(&alternates)?;
    std::fs::write(
        alternates.join("alternates"),
        format!("{}\n", source_git_dir.join("objects").display()),
    )?;

    // Start from the source's configuration so submodule state carries over,
    // then undo the two settings that must differ here.
    let source_config = source_git_dir.join("config");
    if source_config.exists() {
        std::fs::copy(&source_config, git_folder.join("config"))?;
    }
    git.run_ok(
        &[
            "--git-dir",
            &git_folder_str,
            "--work-tree",
            &work_tree_str,
            "config",
            "core.bare",
            "false",
        ],
        RunOptions::default(),
    )?;
    // Submodule clones inherit the superproject's alternates.
    git.run_ok(
        &[
            "--git-dir",
            &git_folder_str,
            "--work-tree",
            &work_tree_str,
            "config",
            "submodule.alternateLocation",
            "superproject",
        ],
        RunOptions::default(),
    )?;

    Ok(())
}
