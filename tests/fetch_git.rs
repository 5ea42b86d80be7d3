//! End-to-end tests against real repositories.
//!
//! Remote behavior is exercised through `file://` URLs pushed onto the
//! mirror path via the explicit probe override, so no network access is
//! needed anywhere.

use std::{
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use pretty_assertions::assert_eq;
use revfetch::{FetchConfig, FetchError, GitFetcher, GitInput, Revision};

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args([
            "-c",
            "user.email=test@example.org",
            "-c",
            "user.name=Test",
            "-c",
            "protocol.file.allow=always",
        ])
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed in {}: {}",
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_out(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").arg("-C").arg(dir).args(args).output().unwrap();
    assert!(output.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn head_rev(dir: &Path) -> Revision {
    Revision::parse(&git_out(dir, &["rev-parse", "HEAD"])).unwrap()
}

struct Upstream {
    dir: PathBuf,
}

impl Upstream {
    fn create(root: &Path) -> Upstream {
        let dir = root.join("upstream");
        std::fs::create_dir_all(&dir).unwrap();
        git(&dir, &["init", "-q", "-b", "master"]);
        let upstream = Upstream { dir };
        upstream.commit_file("file.txt", "one\n");
        upstream
    }

    fn commit_file(&self, name: &str, contents: &str) -> Revision {
        let path = self.dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
        git(&self.dir, &["add", "."]);
        git(&self.dir, &["commit", "-q", "-m", name]);
        head_rev(&self.dir)
    }

    fn url(&self) -> String {
        format!("file://{}", self.dir.display())
    }
}

/// A fetcher rooted in its own temp directory, with `file://` URLs forced
/// down the remote code path unless the test says otherwise.
fn remote_fetcher(root: &Path, configure: impl FnOnce(&mut FetchConfig)) -> GitFetcher {
    let mut config = FetchConfig::rooted_at(root.join("fetcher").join("cache"));
    config.force_remote_file_urls = true;
    config.max_jobs = 1;
    configure(&mut config);
    GitFetcher::builder().config(config).try_build().unwrap()
}

fn local_fetcher(root: &Path, configure: impl FnOnce(&mut FetchConfig)) -> GitFetcher {
    remote_fetcher(root, |config| {
        config.force_remote_file_urls = false;
        configure(config);
    })
}

fn input(url: &str) -> GitInput {
    GitInput::new(url)
}

/// The single mirror directory created under the fetcher's cache root.
fn mirror_dir(root: &Path) -> PathBuf {
    let namespace = root.join("fetcher/cache").join("gitv4");
    let mut entries: Vec<_> = std::fs::read_dir(namespace)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one mirror");
    entries.remove(0)
}

fn cache_root(root: &Path) -> PathBuf {
    root.join("fetcher/cache")
}

// ---------------------------------------------------------------------
// Shallow fetching
// ---------------------------------------------------------------------

#[test]
fn shallow_fetch_is_depth_one_and_cache_hits_skip_the_network() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let first = head_rev(&upstream.dir);
    let second = upstream.commit_file("file.txt", "two\n");

    let fetcher = remote_fetcher(tmp.path(), |_| {});

    let mut req = input(&upstream.url());
    req.reference = Some("master".to_string());
    req.rev = Some(second.clone());
    req.shallow = true;

    let fetched = fetcher.fetch(req.clone()).unwrap();
    let store_path = fetched.store_path.clone().unwrap();
    assert_eq!(fetched.input.rev, Some(second.clone()));
    assert!(fetched.input.last_modified.is_some());
    // Shallow snapshots carry no revCount.
    assert_eq!(fetched.input.rev_count, None);
    assert!(store_path.exists());

    // Depth 1: the mirror must not contain the parent commit.
    let mirror = mirror_dir(tmp.path());
    assert_eq!(
        git_out(&mirror, &["rev-parse", "--is-shallow-repository"]),
        "true"
    );
    assert!(!Command::new("git")
        .arg("-C")
        .arg(&mirror)
        .args(["cat-file", "-e", first.as_str()])
        .status()
        .unwrap()
        .success());

    // Re-running the same locked fetch must not need the upstream at all.
    std::fs::rename(&upstream.dir, tmp.path().join("offline")).unwrap();
    let again = fetcher.fetch(req).unwrap();
    assert_eq!(again.store_path.unwrap(), store_path);
    assert_eq!(again.input.last_modified, fetched.input.last_modified);
}

#[test]
fn shallow_mirror_upgrades_to_full_without_downgrading_back() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let rev = upstream.commit_file("file.txt", "two\n");

    let fetcher = remote_fetcher(tmp.path(), |_| {});

    let mut shallow_req = input(&upstream.url());
    shallow_req.reference = Some("master".to_string());
    shallow_req.rev = Some(rev.clone());
    shallow_req.shallow = true;
    let shallow_fetched = fetcher.fetch(shallow_req.clone()).unwrap();

    let mirror = mirror_dir(tmp.path());
    assert_eq!(
        git_out(&mirror, &["rev-parse", "--is-shallow-repository"]),
        "true"
    );

    // Same rev, full depth: the mirror transitions via --unshallow.
    let mut full_req = shallow_req.clone();
    full_req.shallow = false;
    let full_fetched = fetcher.fetch(full_req.clone()).unwrap();
    assert_eq!(
        git_out(&mirror, &["rev-parse", "--is-shallow-repository"]),
        "false"
    );
    // Full-depth snapshots regain their revCount.
    assert_eq!(full_fetched.input.rev_count, Some(2));

    // Both snapshots of the same tree are content-addressed to one artifact.
    assert_eq!(
        shallow_fetched.store_path.unwrap(),
        full_fetched.store_path.unwrap()
    );

    // A later shallow request is served from its own cache partition and
    // never downgrades the mirror.
    std::fs::rename(&upstream.dir, tmp.path().join("offline")).unwrap();
    fetcher.fetch(shallow_req).unwrap();
    fetcher.fetch(full_req).unwrap();
    assert_eq!(
        git_out(&mirror, &["rev-parse", "--is-shallow-repository"]),
        "false"
    );
}

#[test]
fn full_mirror_serves_expired_shallow_requests_without_reshallowing() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let rev = upstream.commit_file("file.txt", "two\n");

    // Warm a full-depth mirror by ref.
    let fetcher = remote_fetcher(tmp.path(), |_| {});
    let mut full_req = input(&upstream.url());
    full_req.reference = Some("master".to_string());
    fetcher.fetch(full_req).unwrap();

    let mirror = mirror_dir(tmp.path());
    assert_eq!(
        git_out(&mirror, &["rev-parse", "--is-shallow-repository"]),
        "false"
    );

    // Shallow request for the same ref with everything expired: the full
    // mirror satisfies it with no network round-trip and no depth downgrade.
    std::fs::rename(&upstream.dir, tmp.path().join("offline")).unwrap();
    let expired = remote_fetcher(tmp.path(), |c| c.ref_ttl = Duration::ZERO);
    let mut shallow_req = input(&upstream.url());
    shallow_req.reference = Some("master".to_string());
    shallow_req.shallow = true;

    let fetched = expired.fetch(shallow_req).unwrap();
    assert_eq!(fetched.input.rev, Some(rev));
    assert_eq!(
        git_out(&mirror, &["rev-parse", "--is-shallow-repository"]),
        "false"
    );
}

// ---------------------------------------------------------------------
// Rev/ref interplay
// ---------------------------------------------------------------------

#[test]
fn rev_unreachable_from_ref_suggests_all_refs() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    git(&upstream.dir, &["checkout", "-q", "-b", "side"]);
    let side_rev = upstream.commit_file("side.txt", "side\n");
    git(&upstream.dir, &["checkout", "-q", "master"]);

    let fetcher = remote_fetcher(tmp.path(), |_| {});

    let mut req = input(&upstream.url());
    req.reference = Some("master".to_string());
    req.rev = Some(side_rev.clone());

    let err = fetcher.fetch(req.clone()).unwrap_err();
    match err {
        FetchError::RevNotFound { rev, reference, .. } => {
            assert_eq!(rev, side_rev.as_str());
            assert_eq!(reference, "master");
        }
        other => panic!("expected RevNotFound, got {other}"),
    }
    // The diagnostic names the escape hatch.
    assert!(err_to_string(&fetcher, req.clone()).contains("allRefs"));

    // With allRefs the fetch pulls refs/* and finds the commit.
    req.all_refs = true;
    let fetched = fetcher.fetch(req).unwrap();
    assert_eq!(fetched.input.rev, Some(side_rev));
    assert!(fetched
        .accessor
        .read_file(Path::new("side.txt"))
        .is_ok());
}

fn err_to_string(fetcher: &GitFetcher, req: GitInput) -> String {
    fetcher.fetch(req).unwrap_err().to_string()
}

#[test]
fn unreachable_remote_with_warm_cache_returns_the_prior_rev() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let rev = head_rev(&upstream.dir);

    // Warm the cache by ref only.
    let fetcher = remote_fetcher(tmp.path(), |_| {});
    let mut req = input(&upstream.url());
    req.reference = Some("master".to_string());
    let fetched = fetcher.fetch(req.clone()).unwrap();
    assert_eq!(fetched.input.rev, Some(rev.clone()));

    // Outage: same identity, upstream gone, everything expired.
    std::fs::rename(&upstream.dir, tmp.path().join("offline")).unwrap();
    let expired = remote_fetcher(tmp.path(), |c| c.ref_ttl = Duration::ZERO);
    let again = expired.fetch(req).unwrap();
    assert_eq!(again.input.rev, Some(rev));
    assert_eq!(again.store_path, fetched.store_path);
}

#[test]
fn fresh_head_and_ref_serve_unpinned_fetches_without_the_remote() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let rev = head_rev(&upstream.dir);

    // No ref, no rev: HEAD is resolved remotely once and cached.
    let fetcher = remote_fetcher(tmp.path(), |_| {});
    let fetched = fetcher.fetch(input(&upstream.url())).unwrap();
    assert_eq!(fetched.input.reference.as_deref(), Some("refs/heads/master"));
    assert_eq!(fetched.input.rev, Some(rev));

    let mirror = mirror_dir(tmp.path());
    assert_eq!(
        git_out(&mirror, &["symbolic-ref", "HEAD"]),
        "refs/heads/master"
    );

    // Within the TTL neither HEAD resolution nor the fetch needs the remote.
    std::fs::rename(&upstream.dir, tmp.path().join("offline")).unwrap();
    let again = fetcher.fetch(input(&upstream.url())).unwrap();
    assert_eq!(again.store_path, fetched.store_path);
}

// ---------------------------------------------------------------------
// Local working trees
// ---------------------------------------------------------------------

#[test]
fn dirty_tree_serves_tracked_files_only_and_is_never_cached() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let commit_time: u64 = git_out(&upstream.dir, &["log", "-1", "--format=%ct"])
        .parse()
        .unwrap();

    // Uncommitted edit to a tracked file plus an untracked file.
    std::fs::write(upstream.dir.join("file.txt"), "dirty edit\n").unwrap();
    std::fs::write(upstream.dir.join("untracked.txt"), "nope\n").unwrap();

    let fetcher = local_fetcher(tmp.path(), |_| {});
    let fetched = fetcher.fetch(input(&upstream.url())).unwrap();

    // Not addressed by a commit: no rev, no revCount, no store artifact.
    assert_eq!(fetched.input.rev, None);
    assert_eq!(fetched.input.rev_count, None);
    assert_eq!(fetched.store_path, None);
    assert_eq!(fetched.input.last_modified, Some(commit_time));

    // The view shows the dirty content of tracked files...
    assert_eq!(
        fetched.accessor.read_file(Path::new("file.txt")).unwrap(),
        b"dirty edit\n"
    );
    // ...and refuses untracked paths.
    assert!(fetched
        .accessor
        .read_file(Path::new("untracked.txt"))
        .is_err());

    // Nothing may be written into the locked-input cache for dirty trees.
    let records = cache_root(tmp.path()).join("inputs-v1");
    assert_eq!(std::fs::read_dir(records).unwrap().count(), 0);
}

#[test]
fn dirty_tree_is_refused_when_not_allowed() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    std::fs::write(upstream.dir.join("file.txt"), "dirty edit\n").unwrap();

    let fetcher = local_fetcher(tmp.path(), |c| c.allow_dirty = false);
    let err = fetcher.fetch(input(&upstream.url())).unwrap_err();
    assert!(matches!(err, FetchError::DirtyNotAllowed { .. }));
}

#[test]
fn clean_local_tree_locks_to_head_without_a_store_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let second = upstream.commit_file("more.txt", "more\n");

    let fetcher = local_fetcher(tmp.path(), |_| {});
    let fetched = fetcher.fetch(input(&upstream.url())).unwrap();

    assert_eq!(fetched.input.rev, Some(second));
    assert_eq!(fetched.input.rev_count, Some(2));
    assert!(fetched.input.last_modified.is_some());
    assert_eq!(fetched.store_path, None);
    assert_eq!(
        fetched.accessor.read_file(Path::new("more.txt")).unwrap(),
        b"more\n"
    );
}

// ---------------------------------------------------------------------
// Submodules
// ---------------------------------------------------------------------

fn upstream_with_submodule(root: &Path) -> (Upstream, Revision) {
    // Allow path-based submodule clones for the fetcher's own git processes.
    std::env::set_var("GIT_ALLOW_PROTOCOL", "file");

    let child = root.join("child");
    std::fs::create_dir_all(&child).unwrap();
    git(&child, &["init", "-q", "-b", "master"]);
    std::fs::write(child.join("inner.txt"), "inner\n").unwrap();
    git(&child, &["add", "."]);
    git(&child, &["commit", "-q", "-m", "inner"]);

    let upstream = Upstream::create(root);
    git(
        &upstream.dir,
        &["submodule", "add", "-q", &child.display().to_string(), "sub"],
    );
    git(&upstream.dir, &["commit", "-q", "-m", "add submodule"]);
    let rev = head_rev(&upstream.dir);
    (upstream, rev)
}

#[test]
fn submodule_snapshot_contains_child_files_and_no_dot_git() {
    let tmp = tempfile::tempdir().unwrap();
    let (upstream, rev) = upstream_with_submodule(tmp.path());

    let fetcher = remote_fetcher(tmp.path(), |_| {});
    let mut req = input(&upstream.url());
    req.reference = Some("master".to_string());
    req.rev = Some(rev.clone());
    req.submodules = true;

    let fetched = fetcher.fetch(req).unwrap();
    let store_path = fetched.store_path.unwrap();
    assert_eq!(
        std::fs::read_to_string(store_path.as_path().join("sub/inner.txt")).unwrap(),
        "inner\n"
    );
    assert_eq!(
        std::fs::read_to_string(store_path.as_path().join("file.txt")).unwrap(),
        "one\n"
    );
    assert!(!store_path.as_path().join(".git").exists());
    assert!(!store_path.as_path().join("sub/.git").exists());

    // The submodule-free snapshot of the same rev lives in its own cache
    // partition and produces a different artifact.
    let mut plain = input(&upstream.url());
    plain.reference = Some("master".to_string());
    plain.rev = Some(rev);
    let plain_fetched = fetcher.fetch(plain).unwrap();
    assert_ne!(plain_fetched.store_path.unwrap(), store_path);
}

#[test]
fn submodule_snapshot_of_a_local_source_never_mutates_it() {
    let tmp = tempfile::tempdir().unwrap();
    let (upstream, rev) = upstream_with_submodule(tmp.path());
    git(
        &upstream.dir,
        &["submodule", "update", "--init", "--quiet"],
    );

    let before = tree_listing(&upstream.dir);

    let fetcher = local_fetcher(tmp.path(), |_| {});
    let mut req = input(&upstream.url());
    req.reference = Some("master".to_string());
    req.rev = Some(rev);
    req.submodules = true;

    let fetched = fetcher.fetch(req).unwrap();
    let store_path = fetched.store_path.unwrap();
    assert_eq!(
        std::fs::read_to_string(store_path.as_path().join("sub/inner.txt")).unwrap(),
        "inner\n"
    );

    assert_eq!(
        tree_listing(&upstream.dir),
        before,
        "local source tree was modified by the fetch"
    );
}

fn tree_listing(root: &Path) -> Vec<(PathBuf, u64)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let meta = std::fs::symlink_metadata(&path).unwrap();
            if meta.is_dir() {
                stack.push(path.clone());
                out.push((path, 0));
            } else {
                out.push((path, meta.len()));
            }
        }
    }
    out.sort();
    out
}

// ---------------------------------------------------------------------
// Cache-mode partitioning
// ---------------------------------------------------------------------

#[test]
fn shallow_and_full_requests_never_share_cache_records() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = Upstream::create(tmp.path());
    let rev = head_rev(&upstream.dir);

    let fetcher = remote_fetcher(tmp.path(), |_| {});

    let mut full = input(&upstream.url());
    full.reference = Some("master".to_string());
    full.rev = Some(rev.clone());
    fetcher.fetch(full).unwrap();

    let records = cache_root(tmp.path()).join("inputs-v1");
    let after_full = std::fs::read_dir(&records).unwrap().count();

    let mut shallow = input(&upstream.url());
    shallow.reference = Some("master".to_string());
    shallow.rev = Some(rev);
    shallow.shallow = true;
    fetcher.fetch(shallow).unwrap();

    // The shallow fetch added its own locked record instead of reusing the
    // full one.
    let after_shallow = std::fs::read_dir(&records).unwrap().count();
    assert!(after_shallow > after_full);
}
