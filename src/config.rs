//! Configuration for extent creation
//!
//! Centralized configuration with sensible defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmdkError};
use crate::format::header::{MAX_GRAIN_SIZE, MAX_GTES_PER_GT};

/// Main configuration for creating or rewriting an extent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtentConfig {
    // -------------------------------------------------------------------------
    // Layout Configuration
    // -------------------------------------------------------------------------
    /// Grain size in 512-byte sectors (stream-optimized: power of two >= 8)
    pub grain_size: u64,

    /// Number of entries per grain table
    pub num_gtes_per_gt: u32,

    /// Maintain a redundant grain directory and tables
    pub redundant: bool,

    /// Sectors reserved for the embedded descriptor (0 = no descriptor)
    pub descriptor_sectors: u64,

    // -------------------------------------------------------------------------
    // Compression Configuration (stream-optimized only)
    // -------------------------------------------------------------------------
    /// zlib level, 0..=9
    pub compression_level: u32,

    /// Worker threads compressing grains (0 = compress inline)
    pub compression_workers: usize,

    /// Bound on grains queued for compression
    pub queue_depth: usize,

    /// Emit a progress marker every N grains (None = never)
    pub progress_interval: Option<u64>,

    // -------------------------------------------------------------------------
    // Lifecycle Configuration
    // -------------------------------------------------------------------------
    /// Remove the file on abort instead of leaving the temporary signature
    pub remove_on_abort: bool,

    /// fsync the extent on close
    pub sync_on_close: bool,
}

impl Default for ExtentConfig {
    fn default() -> Self {
        Self {
            grain_size: 128, // 64 KiB grains
            num_gtes_per_gt: 512,
            redundant: true,
            descriptor_sectors: 20,
            compression_level: 6,
            compression_workers: 2,
            queue_depth: 16,
            progress_interval: None,
            remove_on_abort: true,
            sync_on_close: true,
        }
    }
}

impl ExtentConfig {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values shared by every extent kind
    pub fn validate(&self) -> Result<()> {
        if self.grain_size == 0 {
            return Err(VmdkError::Config("grain_size must be positive".into()));
        }
        if self.num_gtes_per_gt == 0 {
            return Err(VmdkError::Config(
                "num_gtes_per_gt must be positive".into(),
            ));
        }
        if self.grain_size > MAX_GRAIN_SIZE {
            return Err(VmdkError::Config(format!(
                "grain_size {} exceeds {} sectors",
                self.grain_size, MAX_GRAIN_SIZE
            )));
        }
        if self.num_gtes_per_gt > MAX_GTES_PER_GT {
            return Err(VmdkError::Config(format!(
                "num_gtes_per_gt {} exceeds {}",
                self.num_gtes_per_gt, MAX_GTES_PER_GT
            )));
        }
        if self.compression_level > 9 {
            return Err(VmdkError::Config(format!(
                "compression_level {} out of range 0..=9",
                self.compression_level
            )));
        }
        if self.queue_depth == 0 {
            return Err(VmdkError::Config("queue_depth must be positive".into()));
        }
        if self.progress_interval == Some(0) {
            return Err(VmdkError::Config(
                "progress_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Stricter check for stream-optimized extents
    pub fn validate_stream_optimized(&self) -> Result<()> {
        self.validate()?;
        if self.grain_size < 8 || !self.grain_size.is_power_of_two() {
            return Err(VmdkError::Config(format!(
                "stream-optimized grain_size must be a power of two >= 8, got {}",
                self.grain_size
            )));
        }
        Ok(())
    }
}

/// Builder for ExtentConfig
#[derive(Default)]
pub struct ConfigBuilder {
    config: ExtentConfig,
}

impl ConfigBuilder {
    /// Set the grain size (in sectors)
    pub fn grain_size(mut self, sectors: u64) -> Self {
        self.config.grain_size = sectors;
        self
    }

    /// Set the number of grain table entries per table
    pub fn num_gtes_per_gt(mut self, count: u32) -> Self {
        self.config.num_gtes_per_gt = count;
        self
    }

    /// Enable or disable the redundant directory/tables
    pub fn redundant(mut self, enabled: bool) -> Self {
        self.config.redundant = enabled;
        self
    }

    /// Set the sectors reserved for the embedded descriptor
    pub fn descriptor_sectors(mut self, sectors: u64) -> Self {
        self.config.descriptor_sectors = sectors;
        self
    }

    /// Set the zlib compression level
    pub fn compression_level(mut self, level: u32) -> Self {
        self.config.compression_level = level;
        self
    }

    /// Set the number of compression worker threads
    pub fn compression_workers(mut self, workers: usize) -> Self {
        self.config.compression_workers = workers;
        self
    }

    /// Set the compression queue bound
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.queue_depth = depth;
        self
    }

    /// Emit progress markers every `grains` grains
    pub fn progress_interval(mut self, grains: Option<u64>) -> Self {
        self.config.progress_interval = grains;
        self
    }

    /// Remove the file on abort
    pub fn remove_on_abort(mut self, remove: bool) -> Self {
        self.config.remove_on_abort = remove;
        self
    }

    /// fsync on close
    pub fn sync_on_close(mut self, sync: bool) -> Self {
        self.config.sync_on_close = sync;
        self
    }

    pub fn build(self) -> ExtentConfig {
        self.config
    }
}
