//! Adapter to the outer locked-input cache.
//!
//! Two logical tables, both keyed by attribute sets: the *unlocked* table
//! maps `(type, name, url, ref)` to a resolved rev plus artifact, the
//! *locked* table maps `(type, name, rev)` to the artifact itself. A small
//! fact store carries per-rev scalars (`lastModified`, `revCount`) so they
//! are computed once per revision.

use std::{
    fs,
    path::{Path, PathBuf},
};

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use thiserror::Error;

use crate::{
    input::{serialize_attrs, AttrValue, Attrs},
    paths::{to_base32, url_hash},
    store::StorePath,
};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt cache record: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("failed to encode cache record: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub info: Attrs,
    pub store_path: StorePath,
}

#[cfg_attr(test, automock)]
pub trait LockedInputCache {
    /// Look up a record. A hit whose artifact has been garbage-collected is
    /// reported as a miss.
    fn lookup(&self, key: &Attrs) -> Result<Option<CacheHit>, CacheError>;

    /// Insert a record. `immutable` marks locked keys, whose value can never
    /// legitimately change.
    fn add(
        &self,
        key: &Attrs,
        info: &Attrs,
        store_path: &StorePath,
        immutable: bool,
    ) -> Result<(), CacheError>;

    fn query_fact(&self, key: &str) -> Result<Option<String>, CacheError>;

    fn upsert_fact(&self, key: &str, value: &str) -> Result<(), CacheError>;
}

/// TOML-file-backed implementation, one record per key under the cache root.
/// Immutable (locked) records never expire; mutable ones are only served
/// while younger than the configured TTL, so a re-resolved ref eventually
/// goes back to the network.
pub struct FileInputCache {
    records: PathBuf,
    facts: PathBuf,
    ttl: std::time::Duration,
}

// Scalar fields first: the TOML serializer requires values ahead of tables.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    store_path: PathBuf,
    immutable: bool,
    key: toml::Table,
    info: toml::Table,
}

fn attrs_to_table(attrs: &Attrs) -> toml::Table {
    let mut table = toml::Table::new();
    for (name, value) in attrs {
        let value = match value {
            AttrValue::String(s) => toml::Value::String(s.clone()),
            AttrValue::Bool(b) => toml::Value::Boolean(*b),
            AttrValue::Int(n) => toml::Value::Integer(*n as i64),
        };
        table.insert(name.clone(), value);
    }
    table
}

fn is_fresh(file: &Path, ttl: std::time::Duration) -> bool {
    match fs::metadata(file).and_then(|m| m.modified()) {
        Ok(modified) => match modified.elapsed() {
            Ok(age) => age <= ttl,
            Err(_) => true,
        },
        Err(_) => false,
    }
}

fn table_to_attrs(table: &toml::Table) -> Attrs {
    let mut attrs = Attrs::new();
    for (name, value) in table {
        let value = match value {
            toml::Value::String(s) => AttrValue::String(s.clone()),
            toml::Value::Boolean(b) => AttrValue::Bool(*b),
            toml::Value::Integer(n) => AttrValue::Int(*n as u64),
            other => AttrValue::String(other.to_string()),
        };
        attrs.insert(name.clone(), value);
    }
    attrs
}

impl FileInputCache {
    pub fn open(cache_root: &Path, ttl: std::time::Duration) -> Result<FileInputCache, CacheError> {
        let records = cache_root.join("inputs-v1");
        let facts = cache_root.join("facts-v1");
        fs::create_dir_all(&records)?;
        fs::create_dir_all(&facts)?;
        Ok(FileInputCache { records, facts, ttl })
    }

    fn record_file(&self, key: &Attrs) -> PathBuf {
        self.records
            .join(format!("{}.toml", url_hash(&serialize_attrs(key))))
    }

    fn fact_file(&self, key: &str) -> PathBuf {
        self.facts
            .join(to_base32(&sha2::Sha256::digest(key.as_bytes())))
    }
}

impl LockedInputCache for FileInputCache {
    fn lookup(&self, key: &Attrs) -> Result<Option<CacheHit>, CacheError> {
        let file = self.record_file(key);
        let contents = match fs::read_to_string(&file) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let record: Record = toml::from_str(&contents)?;
        if !record.immutable && !is_fresh(&file, self.ttl) {
            debug!("cache record {} expired", file.display());
            return Ok(None);
        }
        let store_path = StorePath::new(record.store_path);
        if !store_path.exists() {
            // The artifact was garbage-collected out from under the record.
            debug!("store path {} is gone; dropping cache record", store_path);
            let _ = fs::remove_file(&file);
            return Ok(None);
        }
        Ok(Some(CacheHit {
            info: table_to_attrs(&record.info),
            store_path,
        }))
    }

    fn add(
        &self,
        key: &Attrs,
        info: &Attrs,
        store_path: &StorePath,
        immutable: bool,
    ) -> Result<(), CacheError> {
        let record = Record {
            store_path: store_path.as_path().to_path_buf(),
            immutable,
            key: attrs_to_table(key),
            info: attrs_to_table(info),
        };
        fs::write(self.record_file(key), toml::to_string_pretty(&record)?)?;
        Ok(())
    }

    fn query_fact(&self, key: &str) -> Result<Option<String>, CacheError> {
        match fs::read_to_string(self.fact_file(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn upsert_fact(&self, key: &str, value: &str) -> Result<(), CacheError> {
        fs::write(self.fact_file(key), value)?;
        Ok(())
    }
}
