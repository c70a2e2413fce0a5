use std::path::{Path, PathBuf};

use moltlink_core::{ProtocolConfig, Result};

const CONFIG_FILE: &str = "moltlink.json";

pub struct NodeConfig {
    pub protocol: ProtocolConfig,
    /// File the protocol settings were read from, if any
    pub source: Option<PathBuf>,
}

impl NodeConfig {
    /// Load from `path`, else from the per-user config file when it exists,
    /// else defaults. `MOLTLINK_*` variables override whichever was loaded.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let source = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_path().filter(|p| p.exists()),
        };

        let mut protocol = match &source {
            Some(path) => ProtocolConfig::from_json_file(path)?,
            None => ProtocolConfig::default(),
        };
        protocol.apply_env_overrides()?;

        Ok(Self { protocol, source })
    }
}

fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "moltlink", "moltlinkd")
        .map(|d| d.config_dir().join(CONFIG_FILE))
}
