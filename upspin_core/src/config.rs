//! Client configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entry::{Endpoint, Packing};
use crate::errors::{Error, Kind, Result};
use crate::path::{parse_user, UserName};

/// Per-user client configuration, loadable from a TOML file:
///
/// ```toml
/// user_name = "ann@example.com"
/// packing = "ee"
///
/// [dir_endpoint]
/// transport = "remote"
/// net_addr = "dir.example.com:443"
///
/// [store_endpoint]
/// transport = "remote"
/// net_addr = "store.example.com:443"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub user_name: UserName,
    /// Packing used for new files that are not Access or Group files.
    #[serde(default = "default_packing")]
    pub packing: Packing,
    /// Preferred directory server for the user's own tree.
    pub dir_endpoint: Endpoint,
    /// Store the client writes blocks to.
    pub store_endpoint: Endpoint,
    /// Directory holding `secret.upspinkey` (and optionally
    /// `symmsecret.upspinkey`).
    #[serde(default)]
    pub secrets_dir: Option<PathBuf>,
}

fn default_packing() -> Packing {
    Packing::Ee
}

impl Config {
    pub fn new(
        user_name: impl Into<UserName>,
        dir_endpoint: Endpoint,
        store_endpoint: Endpoint,
    ) -> Config {
        Config {
            user_name: user_name.into(),
            packing: default_packing(),
            dir_endpoint,
            store_endpoint,
            secrets_dir: None,
        }
    }

    /// Loads and validates a TOML config file.
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(Error::from)?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| Error::new(Kind::Invalid).op("config.from_file").with(e))?;
        parse_user(&config.user_name)?;
        Ok(config)
    }
}
