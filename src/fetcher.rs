//! The dispatcher: turns a (possibly partial) Git input into an immutable
//! snapshot plus a fully locked descriptor.
//!
//! Control flow: probe the input; local trees without ref/rev are served
//! straight from the working tree (never cached), everything else goes
//! through the locked-input cache, the mirror and one of the two
//! materialization paths. This is the only place that writes to the
//! locked-input cache.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    accessor::{store_path_accessor, GitObjectAccessor, SnapshotAccessor, WorkTreeAccessor},
    checkout::{checkout_with_submodules, extract_archive},
    config::FetchConfig,
    error::FetchError,
    exec::{ExitKind, GitRunner, RunOptions},
    flock::FileLock,
    head::{read_head, resolve_default_ref, store_cached_head},
    input::{AttrValue, Attrs, GitInput, Revision},
    input_cache::{CacheHit, FileInputCache, LockedInputCache},
    mirror::Mirror,
    probe::{probe, RepoInfo},
    store::{IngestFilter, LocalStore, Store, StorePath},
};

/// The result of a fetch: a locked descriptor, a read-only view of the
/// snapshot, and (except for worktree inputs) the backing store artifact.
pub struct Fetched {
    pub input: GitInput,
    pub accessor: Box<dyn SnapshotAccessor>,
    pub store_path: Option<StorePath>,
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetched")
            .field("input", &self.input)
            .field("store_path", &self.store_path)
            .finish_non_exhaustive()
    }
}

pub struct GitFetcher {
    config: FetchConfig,
    store: Box<dyn Store>,
    cache: Box<dyn LockedInputCache>,
    git: GitRunner,
}

#[derive(Default)]
pub struct FetcherBuilder {
    cache_directory: Option<PathBuf>,
    store_directory: Option<PathBuf>,
    config: Option<FetchConfig>,
}

impl FetcherBuilder {
    /// Use a fully explicit configuration instead of the layered default.
    pub fn config(mut self, config: FetchConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Location of the mirror cache. Defaults to the configured (or
    /// platform) cache directory.
    pub fn cache_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_directory = Some(path.into());
        self
    }

    /// Location of the artifact store. Defaults to `<cache>/store`.
    pub fn store_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_directory = Some(path.into());
        self
    }

    pub fn try_build(self) -> anyhow::Result<GitFetcher> {
        let mut config = match self.config {
            Some(config) => config,
            None => FetchConfig::load()?,
        };
        if let Some(dir) = self.cache_directory {
            config.cache_dir = dir;
        }
        if let Some(dir) = self.store_directory {
            config.store_dir = dir;
        }
        let store = LocalStore::open(&config.store_dir)?;
        let cache = FileInputCache::open(&config.cache_dir, config.ref_ttl)?;
        Ok(GitFetcher::with_collaborators(
            config,
            Box::new(store),
            Box::new(cache),
        ))
    }
}

fn locked_key(cache_type: &str, name: &str, rev: &Revision) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("type".into(), AttrValue::String(cache_type.into()));
    attrs.insert("name".into(), AttrValue::String(name.into()));
    attrs.insert("rev".into(), AttrValue::String(rev.to_string()));
    attrs
}

fn unlocked_key(cache_type: &str, name: &str, url: &str, reference: &str) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("type".into(), AttrValue::String(cache_type.into()));
    attrs.insert("name".into(), AttrValue::String(name.into()));
    attrs.insert("url".into(), AttrValue::String(url.into()));
    attrs.insert("ref".into(), AttrValue::String(reference.into()));
    attrs
}

impl GitFetcher {
    pub fn builder() -> FetcherBuilder {
        FetcherBuilder::default()
    }

    /// Wire the fetcher to an externally-provided store and locked-input
    /// cache (the surrounding system's own implementations).
    pub fn with_collaborators(
        config: FetchConfig,
        store: Box<dyn Store>,
        cache: Box<dyn LockedInputCache>,
    ) -> GitFetcher {
        GitFetcher {
            config,
            store,
            cache,
            git: GitRunner::new(),
        }
    }

    pub fn fetch(&self, input: GitInput) -> Result<Fetched, FetchError> {
        let info = probe(&input, self.config.force_remote_file_urls, &self.git)?;
        if input.reference.is_none() && input.rev.is_none() && info.is_local {
            self.fetch_from_worktree(input, info)
        } else {
            self.fetch_from_commit(input, info)
        }
    }

    /// Plain `git clone` of the input into `dest`, for consumers that want a
    /// mutable checkout instead of a snapshot.
    pub fn clone_to(&self, input: &GitInput, dest: &Path) -> Result<(), FetchError> {
        if input.rev.is_some() {
            return Err(FetchError::ClonePinnedRev);
        }
        let info = probe(input, self.config.force_remote_file_urls, &self.git)?;
        let mut args: Vec<String> = vec!["clone".into(), info.url.clone()];
        if let Some(reference) = &input.reference {
            args.push("--branch".into());
            args.push(reference.clone());
        }
        args.push(dest.to_string_lossy().into_owned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git.run_ok(&arg_refs, RunOptions::default())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit path
    // ------------------------------------------------------------------

    fn fetch_from_commit(
        &self,
        mut input: GitInput,
        info: RepoInfo,
    ) -> Result<Fetched, FetchError> {
        let name = input.name().to_string();
        let orig_rev = input.rev.clone();

        if let Some(rev) = &input.rev {
            let key = locked_key(&info.mode.tag(), &name, rev);
            if let Some(hit) = self.cache.lookup(&key)? {
                return self.finish_from_store(input, hit);
            }
        }

        let original_ref = input.reference.clone();
        let reference = match &original_ref {
            Some(reference) => reference.clone(),
            None => self.default_ref(&info),
        };
        input.reference = Some(reference.clone());

        let repo_dir: PathBuf;
        let mut git_dir = info.git_dir.clone();

        if info.is_local {
            if input.rev.is_none() {
                input.rev = Some(self.resolve_rev(Path::new(&info.url), &git_dir, &reference)?);
            }
            repo_dir = PathBuf::from(&info.url);
        } else {
            let unlocked = unlocked_key(&info.mode.tag(), &name, &info.url, &reference);
            if let Some(hit) = self.cache.lookup(&unlocked)? {
                if let Some(cached_rev) = hit.info.get("rev").and_then(AttrValue::as_str) {
                    let cached_rev = Revision::parse(cached_rev)?;
                    if input.rev.as_ref().map_or(true, |rev| *rev == cached_rev) {
                        input.rev = Some(cached_rev.clone());
                        let locked = locked_key(&info.mode.tag(), &name, &cached_rev);
                        if let Some(hit) = self.cache.lookup(&locked)? {
                            return self.finish_from_store(input, hit);
                        }
                        // The artifact behind the unlocked record is gone
                        // (garbage-collected); materialize it again below.
                    }
                }
            }

            let mirror = Mirror::open(&self.config.cache_dir, &info.url);
            git_dir = ".".to_string();

            {
                if let Some(parent) = mirror.dir.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _lock =
                    FileLock::acquire(&mirror.lock_path(), self.config.lock_timeout)?;
                mirror.ensure(&self.git)?;

                if mirror.decide_fetch(
                    &self.git,
                    input.rev.as_ref(),
                    &reference,
                    info.mode,
                    self.config.ref_ttl,
                )? {
                    info!("fetching Git repository '{}'", info.url);
                    mirror.fetch(
                        &self.git,
                        &reference,
                        input.rev.as_ref(),
                        info.mode,
                        &self.config.num_jobs(),
                    )?;
                    if original_ref.is_none()
                        && !store_cached_head(&self.git, &mirror.dir, &reference)
                    {
                        warn!(
                            "could not update cached HEAD '{}' for '{}'",
                            reference, info.url
                        );
                    }
                }

                if input.rev.is_none() {
                    input.rev = Some(mirror.read_ref(&reference)?);
                }
                // Lock released here; the rest only reads immutable objects.
            }

            repo_dir = mirror.dir.clone();
        }

        if !info.mode.shallow && self.repo_is_shallow(&repo_dir, &git_dir)? {
            return Err(FetchError::ShallowMismatch {
                url: info.url.clone(),
            });
        }

        let rev = input.rev.clone().expect("rev was resolved above");

        debug!("using revision {} of repo '{}'", rev, info.url);

        // Now that the rev is known, check the locked table again.
        let locked = locked_key(&info.mode.tag(), &name, &rev);
        if let Some(hit) = self.cache.lookup(&locked)? {
            return self.finish_from_store(input, hit);
        }

        self.require_rev_present(&repo_dir, &git_dir, &rev, &reference, &info)?;

        let mut info_attrs = Attrs::new();
        info_attrs.insert("rev".into(), AttrValue::String(rev.to_string()));
        let last_modified = self.last_modified_cached(&repo_dir, &git_dir, &rev)?;
        info_attrs.insert("lastModified".into(), AttrValue::Int(last_modified));
        if !info.mode.shallow {
            let rev_count = self.rev_count_cached(&info, &repo_dir, &git_dir, &rev)?;
            info_attrs.insert("revCount".into(), AttrValue::Int(rev_count));
        }

        info!("copying Git tree '{}' to the store", input.to_url());
        let work_tree = tempfile::tempdir()?;
        let filter = if info.mode.submodules {
            checkout_with_submodules(
                &self.git,
                &info,
                &repo_dir,
                &rev,
                work_tree.path(),
                &self.config.num_jobs(),
            )?;
            IngestFilter::ExcludeDotGit
        } else {
            extract_archive(&self.git, &repo_dir, &git_dir, &rev, work_tree.path())?;
            IngestFilter::All
        };
        let store_path = self.store.add_to_store(&name, work_tree.path(), filter)?;

        // Refs resolved on behalf of the user may be reused; a rev the user
        // pinned explicitly is only recorded under the locked key.
        if orig_rev.is_none() {
            let unlocked = unlocked_key(&info.mode.tag(), &name, &info.url, &reference);
            self.cache.add(&unlocked, &info_attrs, &store_path, false)?;
        }
        self.cache.add(&locked, &info_attrs, &store_path, true)?;

        input.last_modified = Some(last_modified);
        input.rev_count = info_attrs.get("revCount").and_then(AttrValue::as_int);
        input.nar_hash = Some(self.store.nar_hash(&store_path)?);

        // The fresh view is synthesized straight from the repository
        // objects; submodule trees only exist as the ingested artifact.
        let accessor: Box<dyn SnapshotAccessor> = if info.mode.submodules {
            Box::new(store_path_accessor(&store_path))
        } else {
            Box::new(GitObjectAccessor::open(&repo_dir, rev)?)
        };

        Ok(Fetched {
            input,
            accessor,
            store_path: Some(store_path),
        })
    }

    fn finish_from_store(
        &self,
        mut input: GitInput,
        hit: CacheHit,
    ) -> Result<Fetched, FetchError> {
        if input.rev.is_none() {
            if let Some(rev) = hit.info.get("rev").and_then(AttrValue::as_str) {
                input.rev = Some(Revision::parse(rev)?);
            }
        }
        input.last_modified = hit.info.get("lastModified").and_then(AttrValue::as_int);
        input.rev_count = hit.info.get("revCount").and_then(AttrValue::as_int);
        input.nar_hash = Some(self.store.nar_hash(&hit.store_path)?);
        Ok(Fetched {
            input,
            accessor: Box::new(store_path_accessor(&hit.store_path)),
            store_path: Some(hit.store_path),
        })
    }

    // ------------------------------------------------------------------
    // Worktree path (local input, no ref, no rev)
    // ------------------------------------------------------------------

    fn fetch_from_worktree(
        &self,
        mut input: GitInput,
        info: RepoInfo,
    ) -> Result<Fetched, FetchError> {
        let repo_dir = PathBuf::from(&info.url);

        if !info.is_dirty {
            let reference = self.default_ref(&info);
            let rev = self.resolve_rev(&repo_dir, &info.git_dir, &reference)?;
            input.reference = Some(reference);
            input.rev_count = Some(self.rev_count_cached(&info, &repo_dir, &info.git_dir, &rev)?);
            input.last_modified =
                Some(self.last_modified_cached(&repo_dir, &info.git_dir, &rev)?);
            input.rev = Some(rev);
        } else {
            if !self.config.allow_dirty {
                return Err(FetchError::DirtyNotAllowed {
                    path: info.url.clone(),
                });
            }
            if self.config.warn_dirty {
                warn!("Git tree '{}' is dirty", info.url);
            }
            input.last_modified = Some(if info.has_head {
                self.git_timestamp(&repo_dir, &info.git_dir, "HEAD")?
            } else {
                0
            });
        }

        let files = self.list_files(&info)?;
        let accessor = WorkTreeAccessor::new(&repo_dir, Some(files));

        // Deliberately not recorded in the locked-input cache: the tree is
        // not addressed by a commit.
        Ok(Fetched {
            input,
            accessor: Box::new(accessor),
            store_path: None,
        })
    }

    /// The tracked file set of a working tree.
    fn list_files(&self, info: &RepoInfo) -> Result<BTreeSet<PathBuf>, FetchError> {
        let mut args: Vec<&str> = vec![
            "-C",
            &info.url,
            "--git-dir",
            &info.git_dir,
            "ls-files",
            "-z",
        ];
        if info.mode.submodules {
            args.push("--recurse-submodules");
        }
        let output = self.git.run_ok(&args, RunOptions::default())?;
        Ok(output
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    fn default_ref(&self, info: &RepoInfo) -> String {
        let head = if info.is_local {
            read_head(&self.git, &info.url)
        } else {
            let mirror = Mirror::open(&self.config.cache_dir, &info.url);
            resolve_default_ref(&self.git, &mirror.dir, &info.url, self.config.ref_ttl)
        };
        head.unwrap_or_else(|| {
            warn!(
                "could not read HEAD ref from repo at '{}', using 'master'",
                info.url
            );
            "master".to_string()
        })
    }

    fn resolve_rev(
        &self,
        repo_dir: &Path,
        git_dir: &str,
        reference: &str,
    ) -> Result<Revision, FetchError> {
        let dir = repo_dir.to_string_lossy();
        let output = self.git.run_ok(
            &["-C", dir.as_ref(), "--git-dir", git_dir, "rev-parse", reference],
            RunOptions::default(),
        )?;
        Ok(Revision::parse(output.trim())?)
    }

    fn repo_is_shallow(&self, repo_dir: &Path, git_dir: &str) -> Result<bool, FetchError> {
        let dir = repo_dir.to_string_lossy();
        let output = self.git.run_ok(
            &[
                "-C",
                dir.as_ref(),
                "--git-dir",
                git_dir,
                "rev-parse",
                "--is-shallow-repository",
            ],
            RunOptions::default(),
        )?;
        Ok(output == "true")
    }

    fn git_timestamp(
        &self,
        repo_dir: &Path,
        git_dir: &str,
        refspec: &str,
    ) -> Result<u64, FetchError> {
        let dir = repo_dir.to_string_lossy();
        let output = self.git.run_ok(
            &[
                "-C",
                dir.as_ref(),
                "--git-dir",
                git_dir,
                "log",
                "-1",
                "--format=%ct",
                "--no-show-signature",
                refspec,
            ],
            RunOptions::default(),
        )?;
        output
            .trim()
            .parse()
            .map_err(|_| FetchError::BadGitOutput {
                command: format!("log -1 --format=%ct {refspec}"),
                output,
            })
    }

    fn last_modified_cached(
        &self,
        repo_dir: &Path,
        git_dir: &str,
        rev: &Revision,
    ) -> Result<u64, FetchError> {
        let key = format!("git-{rev}-last-modified");
        if let Some(value) = self.cache.query_fact(&key)? {
            if let Ok(cached) = value.trim().parse() {
                return Ok(cached);
            }
        }
        let last_modified = self.git_timestamp(repo_dir, git_dir, rev.as_str())?;
        self.cache.upsert_fact(&key, &last_modified.to_string())?;
        Ok(last_modified)
    }

    fn rev_count_cached(
        &self,
        info: &RepoInfo,
        repo_dir: &Path,
        git_dir: &str,
        rev: &Revision,
    ) -> Result<u64, FetchError> {
        let key = format!("git-{rev}-revcount");
        if let Some(value) = self.cache.query_fact(&key)? {
            if let Ok(cached) = value.trim().parse() {
                return Ok(cached);
            }
        }
        debug!("getting Git revision count of '{}'", info.url);
        let dir = repo_dir.to_string_lossy();
        let output = self.git.run_ok(
            &[
                "-C",
                dir.as_ref(),
                "--git-dir",
                git_dir,
                "rev-list",
                "--count",
                rev.as_str(),
            ],
            RunOptions::default(),
        )?;
        let rev_count: u64 = output
            .trim()
            .parse()
            .map_err(|_| FetchError::BadGitOutput {
                command: format!("rev-list --count {rev}"),
                output,
            })?;
        self.cache.upsert_fact(&key, &rev_count.to_string())?;
        Ok(rev_count)
    }

    /// After a fetch, the pinned rev must actually exist. `git cat-file
    /// commit` on a missing object exits 128 complaining about a bad file;
    /// every other outcome is left to the materialization step.
    fn require_rev_present(
        &self,
        repo_dir: &Path,
        git_dir: &str,
        rev: &Revision,
        reference: &str,
        info: &RepoInfo,
    ) -> Result<(), FetchError> {
        let dir = repo_dir.to_string_lossy();
        let output = self.git.run(
            &[
                "-C",
                dir.as_ref(),
                "--git-dir",
                git_dir,
                "cat-file",
                "commit",
                rev.as_str(),
            ],
            RunOptions {
                merge_stderr: true,
                ..RunOptions::default()
            },
        )?;
        if output.exit == ExitKind::Exited(128) && output.stdout.contains("bad file") {
            return Err(FetchError::RevNotFound {
                rev: rev.to_string(),
                reference: reference.to_string(),
                url: info.url.clone(),
            });
        }
        Ok(())
    }
}
