//! Crate-wide fetch error taxonomy.

use thiserror::Error;

use crate::{
    accessor::AccessorError, exec::ExecError, input::InputError, input_cache::CacheError,
    store::StoreError,
};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("'{path}' is not a Git repository")]
    NotARepo { path: String },

    #[error("Git tree '{path}' is dirty")]
    DirtyNotAllowed { path: String },

    #[error(
        "getting the HEAD of the Git tree '{path}' failed with exit code {code}:\n{message}"
    )]
    HeadProbeFailed {
        path: String,
        code: i32,
        message: String,
    },

    #[error(
        "'{url}' is a shallow Git repository, but shallow repositories are only allowed \
         when shallow = true is set on the input"
    )]
    ShallowMismatch { url: String },

    #[error(
        "cannot find Git revision '{rev}' in ref '{reference}' of repository '{url}'; \
         make sure the rev exists on the ref you specified, or set allRefs = true \
         to search every ref"
    )]
    RevNotFound {
        rev: String,
        reference: String,
        url: String,
    },

    #[error("could not update local clone of Git repository '{url}': {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: ExecError,
    },

    #[error("could not parse output of 'git {command}': '{output}'")]
    BadGitOutput { command: String, output: String },

    #[error("cloning a specific revision is not supported")]
    ClonePinnedRev,

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Accessor(#[from] AccessorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to lock mirror directory: {0}")]
    Lock(#[from] crate::flock::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
