//! Store configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::DEFAULT_PAGE_SIZE;
use crate::{Error, Result};

/// Extension tagging every scratch file so the sweep can recognize it
pub const CACHE_FILE_EXT: &str = "cache";

/// Main store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection and its settings
    pub backend: BackendConfig,

    /// Local scratch-file settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Listing page size hint
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl StoreConfig {
    /// Configuration for a local-disk store rooted at `root`
    pub fn local(root: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::Local { root: root.into() },
            cache: CacheConfig {
                dir: cache_dir.into(),
                ..Default::default()
            },
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::local_io(path, e))?;
        let config: StoreConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::InvalidConfig {
                message: "page_size must be greater than zero".to_string(),
            });
        }

        if self.cache.dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                message: "cache.dir must not be empty".to_string(),
            });
        }

        match &self.backend {
            BackendConfig::S3 { bucket, .. } if bucket.is_empty() => Err(Error::InvalidConfig {
                message: "s3 bucket must not be empty".to_string(),
            }),
            BackendConfig::Local { root } if root.as_os_str().is_empty() => {
                Err(Error::InvalidConfig {
                    message: "local root must not be empty".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Storage backend type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local filesystem directory standing in for a remote store
    Local { root: PathBuf },

    /// Process-local in-memory store
    Memory,

    /// S3-compatible storage
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            root: PathBuf::from("./data"),
        }
    }
}

/// Scratch-file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the scratch files of open handles
    pub dir: PathBuf,

    /// Age after which a leftover scratch file is considered orphaned
    #[serde(with = "millis_serde")]
    pub max_age: Duration,

    /// Run the sweep once when the store is constructed
    pub sweep_on_start: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("cloudstore"),
            max_age: Duration::from_secs(24 * 60 * 60),
            sweep_on_start: false,
        }
    }
}

/// Durations are stored as milliseconds
mod millis_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
