use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::BUFFER_POOL_SIZE;
use super::error::{FileError, FileResult};
use super::replacer::ReplacementAlgorithm;

/// Buffer pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of page-sized slots in the pool
    pub capacity: usize,
    /// Eviction policy
    pub algorithm: ReplacementAlgorithm,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: BUFFER_POOL_SIZE,
            algorithm: ReplacementAlgorithm::default(),
        }
    }
}

impl BufferConfig {
    pub fn new(capacity: usize, algorithm: ReplacementAlgorithm) -> Self {
        Self {
            capacity,
            algorithm,
        }
    }

    pub fn validate(&self) -> FileResult<()> {
        if self.capacity == 0 {
            return Err(FileError::InvalidConfig(
                "capacity must be at least one page".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> FileResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> FileResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
