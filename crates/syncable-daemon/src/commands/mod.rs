//! Subcommands of the `syncable` binary.
//!
//! Every command returns the text to print, so tests can drive them without
//! capturing stdout.

mod store;
mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use syncable_core::{FsBacking, NativeFs, StoreConfig, SyncablePath};

use crate::config::Config;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the store's root folder
    Init,
    /// Create a folder or bundle, e.g. `folder:notes/bundle:thread`
    Mkdir { path: String },
    /// Store the content of a local file, creating or replacing the item
    Put { path: String, source: PathBuf },
    /// Print a file's content
    Cat { path: String },
    /// List a folder or bundle
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Delete an item, leaving a tombstone until the next sweep
    Rm { path: String },
    /// Print an item's content hash
    Hash {
        #[arg(default_value = "")]
        path: String,
    },
    /// Permanently remove tombstones under a folder or bundle
    Sweep {
        #[arg(default_value = "")]
        path: String,
    },
    /// Pull from and push to another on-disk replica of the store
    Sync {
        /// Directory of the other replica
        #[arg(long)]
        remote_dir: PathBuf,
        /// Subtree to synchronize
        #[arg(default_value = "")]
        path: String,
    },
}

pub async fn run(config: &Config, command: Command) -> Result<String> {
    let backing = open_store(config.store_path.clone(), config)?;
    match command {
        Command::Init => store::init(&backing, config).await,
        Command::Mkdir { path } => store::mkdir(&backing, config, &parse_path(config, &path)?).await,
        Command::Put { path, source } => {
            let data = tokio::fs::read(&source)
                .await
                .with_context(|| format!("reading {}", source.display()))?;
            store::put(&backing, config, &parse_path(config, &path)?, data).await
        }
        Command::Cat { path } => store::cat(&backing, &parse_path(config, &path)?).await,
        Command::Ls { path } => store::ls(&backing, &parse_path(config, &path)?).await,
        Command::Rm { path } => store::rm(&backing, &parse_path(config, &path)?).await,
        Command::Hash { path } => store::hash(&backing, &parse_path(config, &path)?).await,
        Command::Sweep { path } => store::sweep(&backing, &parse_path(config, &path)?).await,
        Command::Sync { remote_dir, path } => {
            let remote = open_store(remote_dir, config)?;
            sync::sync(backing, remote, &parse_path(config, &path)?).await
        }
    }
}

fn open_store(dir: PathBuf, config: &Config) -> Result<FsBacking<NativeFs>> {
    FsBacking::new(NativeFs::new(dir), &config.root_id, &StoreConfig::default())
        .with_context(|| format!("opening store {}", config.root_id))
}

/// Parse a path relative to the store root. An empty path (or `/`) is the root.
pub fn parse_path(config: &Config, path: &str) -> Result<SyncablePath> {
    let relative = path.trim_matches('/');
    if relative.is_empty() {
        return Ok(SyncablePath::root(&config.root_id)?);
    }
    format!("{}/{}", config.root_id, relative)
        .parse()
        .with_context(|| format!("invalid path {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative_paths() {
        let config = Config::new("/tmp/s", "mail", "local").unwrap();
        assert!(parse_path(&config, "").unwrap().is_root());
        assert!(parse_path(&config, "/").unwrap().is_root());
        let path = parse_path(&config, "folder:inbox/file:m1").unwrap();
        assert_eq!(path.to_string(), "mail/folder:inbox/file:m1");
        assert!(parse_path(&config, "inbox").is_err());
    }
}
