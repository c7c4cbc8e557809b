use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::paths::PATH_PADDING_LENGTH;
use crate::Error;

fn default_padding_length() -> usize {
    PATH_PADDING_LENGTH
}

/// Where the store lives, and how long its padded root is.
#[derive(clap::Args, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding the store and bramble state. Defaults to
    /// `$HOME/bramble`.
    #[arg(long, env = "BRAMBLE_PATH")]
    #[serde(default)]
    pub bramble_path: Option<PathBuf>,

    /// Length of the padded store root, including its trailing slash.
    /// Stores only produce matching output hashes if this is the same.
    #[arg(long, default_value_t = PATH_PADDING_LENGTH)]
    #[serde(default = "default_padding_length")]
    pub padding_length: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bramble_path: None,
            padding_length: PATH_PADDING_LENGTH,
        }
    }
}

impl StoreConfig {
    pub fn with_bramble_path(path: impl Into<PathBuf>) -> Self {
        Self {
            bramble_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Returns the cleaned, absolute bramble path.
    pub fn resolve_bramble_path(&self) -> Result<PathBuf, Error> {
        let path = match &self.bramble_path {
            Some(p) => p.clone(),
            None => dirs::home_dir()
                .ok_or(Error::NoBramblePath)?
                .join("bramble"),
        };
        let s = path.to_str().ok_or_else(|| Error::NonUtf8Path(path.clone()))?;
        let cleaned = PathBuf::from(path_clean::clean(s));
        if !cleaned.is_absolute() {
            return Err(Error::RelativeBramblePath(cleaned));
        }
        Ok(cleaned)
    }
}
