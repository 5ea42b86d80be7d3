#[macro_use] extern crate log;

pub mod accessor;
pub mod checkout;
pub mod config;
pub mod error;
pub mod exec;
pub mod fetcher;
pub mod flock;
pub mod head;
pub mod input;
pub mod input_cache;
pub mod mirror;
pub mod paths;
pub mod probe;
pub mod store;

pub use config::FetchConfig;
pub use error::FetchError;
pub use fetcher::{Fetched, FetcherBuilder, GitFetcher};
pub use input::{GitInput, Revision};
