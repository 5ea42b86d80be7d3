use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::bail;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

/// Testing hook: when set to `1`, `file://` URLs are driven through the
/// remote mirror path instead of being treated as local working trees.
pub const FORCE_REMOTE_ENV: &str = "_NIX_FORCE_HTTP";

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Root under which the versioned mirror namespace lives.
    pub cache_dir: PathBuf,
    /// Root of the content-addressed artifact store.
    pub store_dir: PathBuf,
    /// Freshness window for cached refs and the cached default branch.
    pub ref_ttl: Duration,
    /// How long to wait for another writer to release a mirror lock.
    pub lock_timeout: Duration,
    /// Worker count handed to `git fetch --jobs` and `git submodule update --jobs`.
    pub max_jobs: u32,
    pub allow_dirty: bool,
    pub warn_dirty: bool,
    /// Explicit probe override; populated from [`FORCE_REMOTE_ENV`] at load
    /// time so nothing deeper in the crate reads the environment.
    pub force_remote_file_urls: bool,
}

impl FetchConfig {
    pub fn load() -> anyhow::Result<Self> {
        let raw = RawConfig::load(config_dir(), None, None)?;

        let cache_dir = match raw.cache.dir {
            Some(dir) => dir,
            None => default_cache_dir()?,
        };
        let store_dir = raw
            .cache
            .store
            .unwrap_or_else(|| cache_dir.join("store"));

        let config = Self {
            store_dir,
            ref_ttl: Duration::from_secs(raw.fetch.ttl.unwrap_or(3600)),
            lock_timeout: Duration::from_secs(raw.lock.timeout.unwrap_or(300)),
            max_jobs: raw.fetch.jobs.unwrap_or_else(default_jobs),
            allow_dirty: raw.dirty.allow.unwrap_or(true),
            warn_dirty: raw.dirty.warn.unwrap_or(false),
            force_remote_file_urls: std::env::var(FORCE_REMOTE_ENV).as_deref() == Ok("1"),
            cache_dir,
        };
        trace!("loaded configuration: {:?}", config);

        Ok(config)
    }

    /// Self-contained configuration rooted at `cache_dir`, with defaults for
    /// everything else. The environment is not consulted.
    pub fn rooted_at(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            store_dir: cache_dir.join("store"),
            ref_ttl: Duration::from_secs(3600),
            lock_timeout: Duration::from_secs(300),
            max_jobs: default_jobs(),
            allow_dirty: true,
            warn_dirty: false,
            force_remote_file_urls: false,
            cache_dir,
        }
    }

    pub fn num_jobs(&self) -> String {
        self.max_jobs.max(1).to_string()
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    cache: CacheSection,
    #[serde(default)]
    fetch: FetchSection,
    #[serde(default)]
    dirty: DirtySection,
    #[serde(default)]
    lock: LockSection,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct CacheSection {
    dir: Option<PathBuf>,
    store: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct FetchSection {
    /// Seconds a fetched ref stays fresh.
    ttl: Option<u64>,
    jobs: Option<u32>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct DirtySection {
    allow: Option<bool>,
    warn: Option<bool>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct LockSection {
    /// Seconds to wait on a contended mirror lock.
    timeout: Option<u64>,
}

impl RawConfig {
    fn load(
        config_dir: Option<PathBuf>,
        config_override: Option<toml::Table>,
        env_override: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(mut path) = config_dir {
            path.push("config.toml");
            debug!("loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(false));
        }

        if let Some(config_override) = config_override {
            builder = builder.add_source(File::from_str(
                &config_override.to_string(),
                FileFormat::Toml,
            ));
        }

        builder
            .add_source(
                Environment::with_prefix("REVFETCH")
                    .separator("_")
                    .try_parsing(true)
                    .source(env_override),
            )
            .build()?
            .try_deserialize()
    }
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("REVFETCH_CONFIG_DIR") {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
        let mut path = PathBuf::from(path);
        path.push("revfetch");
        return Some(path);
    }
    if let Some(mut path) = home::home_dir() {
        path.push(".config");
        path.push("revfetch");
        return Some(path);
    }
    None
}

fn default_cache_dir() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CACHE_HOME") {
        let mut path = PathBuf::from(path);
        path.push("revfetch");
        return Ok(path);
    }
    if let Some(mut path) = home::home_dir() {
        path.push(".cache");
        path.push("revfetch");
        return Ok(path);
    }
    bail!("could not find home dir; please define the $HOME env variable")
}

fn default_jobs() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}
