use std::path::PathBuf;

use clap::Args;

/// Environment variable naming the store directory when `--store` is absent.
pub const STORE_PATH_ENV: &str = "SYNCABLE_STORE_PATH";

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Directory holding the store (defaults to $SYNCABLE_STORE_PATH)
    #[arg(short, long, global = true)]
    pub store: Option<String>,

    /// Storage root id of the store inside the directory
    #[arg(long, global = true, default_value = "default")]
    pub root_id: String,

    /// Creator identity recorded in the provenance of new items
    #[arg(long, global = true, default_value = "local")]
    pub creator: String,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,
}

/// Resolved configuration of one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the store (supports ~ for home directory)
    pub store_path: PathBuf,
    pub root_id: String,
    pub creator: String,
}

impl Config {
    /// Resolve `args`, falling back to `SYNCABLE_STORE_PATH` for the store directory.
    pub fn from_args(args: &StoreArgs) -> Result<Self, ConfigError> {
        let store = match &args.store {
            Some(store) => store.clone(),
            None => std::env::var(STORE_PATH_ENV).map_err(|_| ConfigError::MissingStorePath)?,
        };
        Self::new(&store, &args.root_id, &args.creator)
    }

    pub fn new(store: &str, root_id: &str, creator: &str) -> Result<Self, ConfigError> {
        if root_id.is_empty() {
            return Err(ConfigError::EmptyRootId);
        }
        Ok(Self {
            store_path: expand_tilde(store),
            root_id: root_id.to_string(),
            creator: creator.to_string(),
        })
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no store directory: pass --store or set SYNCABLE_STORE_PATH")]
    MissingStorePath,

    #[error("storage root id must not be empty")]
    EmptyRootId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_store_wins() {
        let args = StoreArgs {
            store: Some("/tmp/store".into()),
            root_id: "mail".into(),
            creator: "alice".into(),
            verbose: false,
        };
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/tmp/store"));
        assert_eq!(config.root_id, "mail");
        assert_eq!(config.creator, "alice");
    }

    #[test]
    fn test_tilde_expands_to_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/stores/a"), home.join("stores/a"));
        assert_eq!(expand_tilde("/abs/~/x"), PathBuf::from("/abs/~/x"));
    }

    #[test]
    fn test_empty_root_id_rejected() {
        assert!(matches!(
            Config::new("/tmp/store", "", "local"),
            Err(ConfigError::EmptyRootId)
        ));
    }
}
