use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Settings read from the `.ini` file next to the plugin. The file is TOML despite its
/// extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Development")]
    pub development: Development,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Development {
    pub allow_live_updates: bool,
    pub insert_debug_markers: bool,
    /// Dump shaders here instead of replacing them. Empty means replace mode.
    pub shader_dump_bin_path: PathBuf,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text)?;
        if config.dump_path().is_some() {
            config.development.allow_live_updates = false;
        }
        Ok(config)
    }

    /// A missing file yields the defaults. A malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// `<dir>/<plugin>.ini` for a plugin at `<dir>/<plugin>.dll`.
    pub fn path_for_module(module: &Path) -> PathBuf {
        module.with_extension("ini")
    }

    pub fn dump_path(&self) -> Option<&Path> {
        let path = self.development.shader_dump_bin_path.as_path();
        (!path.as_os_str().is_empty()).then_some(path)
    }

    pub fn allow_live_updates(&self) -> bool {
        self.development.allow_live_updates
    }

    pub fn insert_debug_markers(&self) -> bool {
        self.development.insert_debug_markers
    }
}
