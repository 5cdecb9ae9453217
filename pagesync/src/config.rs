use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
const MIN_PAGE_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSyncConfig {
    /// Size of a host page frame, a power of two.
    pub page_size: usize,
    /// Offset limit placed on every transfer descriptor.
    pub max_offset: u64,
    /// Pages per background writeback pass, 0 for no bound.
    pub writeback_batch: usize,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for PageSyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_offset: i64::MAX as u64,
            writeback_batch: 16,
            log_level: "info".to_string(),
        }
    }
}

impl PageSyncConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            bail!(
                "page_size must be a power of two of at least {MIN_PAGE_SIZE}, got {}",
                self.page_size
            );
        }
        if self.max_offset == 0 {
            bail!("max_offset must be positive");
        }
        Ok(())
    }
}
