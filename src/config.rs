use std::fs;
use std::path::Path;

use anyhow::Result;
use log::warn;
use serde::Deserialize;

use crate::error::CacheError;
use crate::kv_store::DType;

fn default_parallel() -> usize {
    1
}

fn default_kv_cache_type() -> String {
    "f16".to_string()
}

fn default_batch_size() -> usize {
    512
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Total cached positions, split evenly across `parallel` slots.
    pub kv_size: usize,
    /// Number of slots (concurrent sequences).
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Best-fit slot selection with forking instead of plain longest match.
    #[serde(default)]
    pub multi_user_cache: bool,
    #[serde(default = "default_kv_cache_type")]
    pub kv_cache_type: String,
    /// Maximum inputs processed per forward pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Leading positions a context shift never discards.
    #[serde(default)]
    pub num_keep: usize,
}

impl Config {
    pub fn new(kv_size: usize, parallel: usize) -> Self {
        Self {
            kv_size,
            parallel,
            multi_user_cache: false,
            kv_cache_type: default_kv_cache_type(),
            batch_size: default_batch_size(),
            num_keep: 0,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Per-slot context window.
    pub fn num_ctx(&self) -> usize {
        self.kv_size / self.parallel.max(1)
    }

    pub fn dtype(&self) -> Result<DType, CacheError> {
        parse_kv_cache_type(&self.kv_cache_type)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.parallel == 0 {
            return Err(CacheError::InvalidConfig(
                "parallel must be at least 1".to_string(),
            ));
        }
        if self.num_ctx() < 1 {
            return Err(CacheError::InvalidConfig(format!(
                "must have at least one kv cache entry per parallel sequence (kv: {} parallel: {})",
                self.kv_size, self.parallel
            )));
        }
        if self.batch_size == 0 {
            return Err(CacheError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.num_keep >= self.num_ctx() {
            return Err(CacheError::KeepExceedsContext {
                keep: self.num_keep,
                num_ctx: self.num_ctx(),
            });
        }
        self.dtype()?;
        Ok(())
    }
}

/// Map a cache type name to a [`DType`]. Unknown names fall back to f16.
pub fn parse_kv_cache_type(name: &str) -> Result<DType, CacheError> {
    match name {
        "" | "f16" => Ok(DType::F16),
        "f32" => Ok(DType::F32),
        "bf16" => Ok(DType::BF16),
        "q8_0" | "q4_0" => Err(CacheError::InvalidConfig(format!(
            "kv cache quantization not yet implemented: {name}"
        ))),
        other => {
            warn!("Unknown kv cache type {other:?}, using f16");
            Ok(DType::F16)
        }
    }
}
