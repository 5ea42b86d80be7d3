//! Typed Git input descriptors and their generic attribute-map form.
//!
//! An input arrives either as a `git+…` URL or as an attribute bag shared
//! with the other fetchers of the surrounding system. Inside the crate it is
//! the strongly-typed [`GitInput`]; at the collaboration points (locked-input
//! cache keys, persisted records) it is serialized back to [`Attrs`].

use std::collections::BTreeMap;
use std::fmt::{Display, Write as _};

use regex_lite::Regex;
use thiserror::Error;
use url::Url;

const ACCEPTED_SCHEMES: &[&str] = &["git", "git+http", "git+https", "git+ssh", "git+file"];

const KNOWN_ATTRS: &[&str] = &[
    "type",
    "url",
    "ref",
    "rev",
    "shallow",
    "submodules",
    "allRefs",
    "lastModified",
    "revCount",
    "narHash",
    "name",
];

#[derive(Error, Debug)]
pub enum InputError {
    #[error("URL scheme '{0}' is not a Git scheme")]
    UnsupportedScheme(String),
    #[error("invalid URL: {0}")]
    BadUrl(#[from] url::ParseError),
    #[error("unsupported Git input attribute '{0}'")]
    UnsupportedAttribute(String),
    #[error("Git input attribute '{0}' has the wrong type")]
    AttributeType(String),
    #[error("missing Git input attribute '{0}'")]
    MissingAttribute(String),
    #[error("invalid Git branch/tag name '{0}'")]
    BadRef(String),
    #[error("hash '{0}' is not supported by Git; supported types are sha1 and sha256")]
    HashUnsupported(String),
    #[error("Git input '{0}' has a commit hash but no branch/tag name")]
    RevWithoutRef(String),
}

/// A commit hash: 40 hex characters (SHA-1) or 64 (SHA-256, accepted but not
/// exercised by Git today).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(String);

impl Revision {
    pub fn parse(s: &str) -> Result<Revision, InputError> {
        let is_hex = s.chars().all(|c| c.is_ascii_hexdigit());
        if is_hex && (s.len() == 40 || s.len() == 64) {
            Ok(Revision(s.to_ascii_lowercase()))
        } else {
            Err(InputError::HashUnsupported(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_sha256(&self) -> bool {
        self.0.len() == 64
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value in the generic attribute map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    String(String),
    Bool(bool),
    Int(u64),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            AttrValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(n) => write!(f, "{n}"),
        }
    }
}

pub type Attrs = BTreeMap<String, AttrValue>;

/// Deterministic one-line-per-attribute rendering, used to derive stable
/// cache keys. `BTreeMap` ordering makes it canonical.
pub fn serialize_attrs(attrs: &Attrs) -> String {
    let mut out = String::new();
    for (name, value) in attrs {
        let _ = writeln!(out, "{name}={value}");
    }
    out
}

/// Conservative Git ref-name validation. Deliberately stricter than git
/// itself: rejects anything that could be mistaken for an option or escape
/// the refs namespace.
pub fn is_valid_ref_name(name: &str) -> bool {
    let re = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._/\-]*$").unwrap();
    re.is_match(name)
        && !name.contains("..")
        && !name.contains("//")
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("@{")
}

fn validate_ref(name: &str) -> Result<(), InputError> {
    if is_valid_ref_name(name) {
        Ok(())
    } else {
        Err(InputError::BadRef(name.to_string()))
    }
}

/// A fully-parsed Git input. Immutable from the caller's point of view;
/// the dispatcher fills in `reference`, `rev`, `last_modified`, `rev_count`
/// and `nar_hash` on the copy it returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitInput {
    /// Normalized URL (any `git+` prefix stripped, lifted query params removed).
    pub url: String,
    pub reference: Option<String>,
    pub rev: Option<Revision>,
    pub shallow: bool,
    pub submodules: bool,
    pub all_refs: bool,
    pub name: Option<String>,
    pub last_modified: Option<u64>,
    pub rev_count: Option<u64>,
    pub nar_hash: Option<String>,
}

impl GitInput {
    pub fn new(url: impl Into<String>) -> GitInput {
        GitInput {
            url: url.into(),
            reference: None,
            rev: None,
            shallow: false,
            submodules: false,
            all_refs: false,
            name: None,
            last_modified: None,
            rev_count: None,
            nar_hash: None,
        }
    }

    /// Parse a `git`/`git+http(s)`/`git+ssh`/`git+file` URL, lifting the
    /// `rev`, `ref`, `shallow` and `submodules` query parameters into
    /// attributes and preserving everything else on the URL.
    pub fn from_url(url: &str) -> Result<GitInput, InputError> {
        let parsed = Url::parse(url)?;
        if !ACCEPTED_SCHEMES.contains(&parsed.scheme()) {
            return Err(InputError::UnsupportedScheme(parsed.scheme().to_string()));
        }

        let mut kept_query: Vec<(String, String)> = Vec::new();
        let mut input = GitInput::new(String::new());
        for (name, value) in parsed.query_pairs() {
            match name.as_ref() {
                "rev" => input.rev = Some(Revision::parse(&value)?),
                "ref" => {
                    validate_ref(&value)?;
                    input.reference = Some(value.into_owned());
                }
                "shallow" => input.shallow = value == "1",
                "submodules" => input.submodules = value == "1",
                other => kept_query.push((other.to_string(), value.into_owned())),
            }
        }

        let mut base = parsed.clone();
        base.set_query(None);
        let mut base = base.to_string();
        if let Some(stripped) = base.strip_prefix("git+") {
            base = stripped.to_string();
        }
        if !kept_query.is_empty() {
            let mut url = Url::parse(&base)?;
            url.query_pairs_mut().extend_pairs(kept_query);
            base = url.to_string();
        }
        input.url = base;
        Ok(input)
    }

    /// Build an input from the generic attribute map. Unknown keys are
    /// rejected so that typos never silently change the fetch.
    pub fn from_attrs(attrs: &Attrs) -> Result<GitInput, InputError> {
        match attrs.get("type").and_then(AttrValue::as_str) {
            Some("git") => {}
            _ => return Err(InputError::MissingAttribute("type".to_string())),
        }
        if let Some(unknown) = attrs.keys().find(|k| !KNOWN_ATTRS.contains(&k.as_str())) {
            return Err(InputError::UnsupportedAttribute(unknown.clone()));
        }

        let get_str = |key: &str| -> Result<Option<String>, InputError> {
            match attrs.get(key) {
                None => Ok(None),
                Some(AttrValue::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(InputError::AttributeType(key.to_string())),
            }
        };
        let get_bool = |key: &str| -> Result<bool, InputError> {
            match attrs.get(key) {
                None => Ok(false),
                Some(AttrValue::Bool(b)) => Ok(*b),
                Some(_) => Err(InputError::AttributeType(key.to_string())),
            }
        };
        let get_int = |key: &str| -> Result<Option<u64>, InputError> {
            match attrs.get(key) {
                None => Ok(None),
                Some(AttrValue::Int(n)) => Ok(Some(*n)),
                Some(_) => Err(InputError::AttributeType(key.to_string())),
            }
        };

        let url = get_str("url")?.ok_or_else(|| InputError::MissingAttribute("url".to_string()))?;
        // Validates the URL even though we keep the caller's string.
        Url::parse(&url)?;

        let reference = get_str("ref")?;
        if let Some(reference) = &reference {
            validate_ref(reference)?;
        }

        Ok(GitInput {
            url,
            reference,
            rev: get_str("rev")?.map(|r| Revision::parse(&r)).transpose()?,
            shallow: get_bool("shallow")?,
            submodules: get_bool("submodules")?,
            all_refs: get_bool("allRefs")?,
            name: get_str("name")?,
            last_modified: get_int("lastModified")?,
            rev_count: get_int("revCount")?,
            nar_hash: get_str("narHash")?,
        })
    }

    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert("type".into(), AttrValue::String("git".into()));
        attrs.insert("url".into(), AttrValue::String(self.url.clone()));
        if let Some(reference) = &self.reference {
            attrs.insert("ref".into(), AttrValue::String(reference.clone()));
        }
        if let Some(rev) = &self.rev {
            attrs.insert("rev".into(), AttrValue::String(rev.to_string()));
        }
        if self.shallow {
            attrs.insert("shallow".into(), AttrValue::Bool(true));
        }
        if self.submodules {
            attrs.insert("submodules".into(), AttrValue::Bool(true));
        }
        if self.all_refs {
            attrs.insert("allRefs".into(), AttrValue::Bool(true));
        }
        if let Some(name) = &self.name {
            attrs.insert("name".into(), AttrValue::String(name.clone()));
        }
        if let Some(last_modified) = self.last_modified {
            attrs.insert("lastModified".into(), AttrValue::Int(last_modified));
        }
        if let Some(rev_count) = self.rev_count {
            attrs.insert("revCount".into(), AttrValue::Int(rev_count));
        }
        if let Some(nar_hash) = &self.nar_hash {
            attrs.insert("narHash".into(), AttrValue::String(nar_hash.clone()));
        }
        attrs
    }

    /// Render back to URL form, restoring the `git+` prefix for non-`git`
    /// schemes and the lifted query parameters.
    pub fn to_url(&self) -> String {
        let mut url = self.url.clone();
        if !url.starts_with("git://") {
            url = format!("git+{url}");
        }
        let mut query: Vec<String> = Vec::new();
        if let Some(rev) = &self.rev {
            query.push(format!("rev={rev}"));
        }
        if let Some(reference) = &self.reference {
            query.push(format!("ref={reference}"));
        }
        if self.shallow {
            query.push("shallow=1".to_string());
        }
        if !query.is_empty() {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str(&query.join("&"));
        }
        url
    }

    /// Apply a ref/rev override pair, as done when re-locking. An input that
    /// ends up with a rev but no ref cannot be fetched incrementally and is
    /// rejected.
    pub fn apply_overrides(
        mut self,
        reference: Option<String>,
        rev: Option<Revision>,
    ) -> Result<GitInput, InputError> {
        if let Some(reference) = reference {
            validate_ref(&reference)?;
            self.reference = Some(reference);
        }
        if let Some(rev) = rev {
            self.rev = Some(rev);
        }
        if self.reference.is_none() && self.rev.is_some() {
            return Err(InputError::RevWithoutRef(self.to_url()));
        }
        Ok(self)
    }

    pub fn is_locked(&self) -> bool {
        self.rev.is_some()
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("source")
    }

    /// Stable identity of a locked input for deduplication across
    /// evaluator contexts.
    pub fn fingerprint(&self) -> Option<String> {
        self.rev
            .as_ref()
            .map(|rev| format!("{};{}", rev, if self.submodules { "1" } else { "0" }))
    }
}
