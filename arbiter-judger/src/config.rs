use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct Config {
    #[validate]
    pub judger: Judger,

    #[validate]
    pub runguard: Runguard,
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct Judger {
    /// Worker thread count; 0 selects the CPU count.
    #[validate(range(max = 256))]
    pub workers: usize,

    #[validate(range(min = 1, max = 65536))]
    pub queue_capacity: usize,

    pub workspace_root: PathBuf,

    /// Root of the check/run/compare script tree.
    pub script_dir: PathBuf,

    /// Problem-asset cache populated by the caller.
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct Runguard {
    /// Path of the runguard binary, exported to scripts as $RUNGUARD.
    pub bin: PathBuf,

    pub netns: Option<String>,

    pub seccomp_policy: Option<PathBuf>,

    pub chroot_dir: Option<PathBuf>,

    pub user: Option<u32>,

    pub group: Option<u32>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let content = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn worker_count(&self) -> usize {
        match self.judger.workers {
            0 => num_cpus::get(),
            n => n,
        }
    }
}
