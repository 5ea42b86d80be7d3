use std::{error::Error, path::PathBuf};

use clap::{Parser, Subcommand};

use revfetch::{FetchConfig, GitFetcher, GitInput, Revision};

use tracing_subscriber::EnvFilter;

/// Content-addressed Git snapshot fetcher.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub cmd: Command,
    /// Location of the mirror cache directory [default: platform-specific]
    #[clap(short, long)]
    pub cache_directory: Option<PathBuf>,
    /// Location of the artifact store [default: <cache>/store]
    #[clap(short, long)]
    pub store_directory: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch a snapshot and print the locked input descriptor
    Fetch {
        /// Repository URL (git, git+http, git+https, git+ssh or git+file)
        url: String,
        /// Branch or tag to fetch
        #[clap(long = "ref")]
        reference: Option<String>,
        /// Commit hash to pin
        #[clap(long)]
        rev: Option<String>,
        /// Fetch only the requested commit, without history
        #[clap(long)]
        shallow: bool,
        /// Include submodules in the snapshot
        #[clap(long)]
        submodules: bool,
        /// Search every ref for the requested rev
        #[clap(long)]
        all_refs: bool,
    },
    /// Clone an input into a mutable checkout
    Clone {
        url: String,
        #[clap(long = "ref")]
        reference: Option<String>,
        directory: PathBuf,
    },
    /// Remove every cached mirror and locked-input record.
    /// The next fetch of any input will hit the network again.
    ClearCache,
}

fn main() {
    // The library logs through the `log` facade; the subscriber picks those
    // records up alongside native tracing events. RUST_LOG overrides the
    // info default.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run() {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = CliArgs::parse();

    let mut config = FetchConfig::load()?;
    if let Some(cache_directory) = cli_args.cache_directory {
        config.store_dir = cache_directory.join("store");
        config.cache_dir = cache_directory;
    }
    if let Some(store_directory) = cli_args.store_directory {
        config.store_dir = store_directory;
    }

    match cli_args.cmd {
        Command::Fetch {
            url,
            reference,
            rev,
            shallow,
            submodules,
            all_refs,
        } => {
            let rev = rev.as_deref().map(Revision::parse).transpose()?;
            let mut input = GitInput::from_url(&url)?;
            if reference.is_some() {
                input = input.apply_overrides(reference, None)?;
            }
            // A bare rev without a ref is a legitimate (if slower) input, so
            // it bypasses the override rule.
            if rev.is_some() {
                input.rev = rev;
            }
            input.shallow |= shallow;
            input.submodules |= submodules;
            input.all_refs |= all_refs;

            let fetcher = GitFetcher::builder().config(config).try_build()?;
            let fetched = fetcher.fetch(input)?;

            println!("url: {}", fetched.input.to_url());
            if let Some(rev) = &fetched.input.rev {
                println!("rev: {rev}");
            }
            if let Some(last_modified) = fetched.input.last_modified {
                println!("lastModified: {last_modified}");
            }
            if let Some(rev_count) = fetched.input.rev_count {
                println!("revCount: {rev_count}");
            }
            if let Some(nar_hash) = &fetched.input.nar_hash {
                println!("narHash: {nar_hash}");
            }
            if let Some(store_path) = &fetched.store_path {
                println!("storePath: {store_path}");
            }
            Ok(())
        }
        Command::Clone {
            url,
            reference,
            directory,
        } => {
            let mut input = GitInput::from_url(&url)?;
            if reference.is_some() {
                input = input.apply_overrides(reference, None)?;
            }
            let fetcher = GitFetcher::builder().config(config).try_build()?;
            fetcher.clone_to(&input, &directory)?;
            Ok(())
        }
        Command::ClearCache => {
            tracing::info!("clearing fetcher cache at {}", config.cache_dir.display());
            if config.cache_dir.exists() {
                std::fs::remove_dir_all(&config.cache_dir)?;
            }
            Ok(())
        }
    }
}
