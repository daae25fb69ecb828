//! Engine configuration.
//!
//! Everything has a default suitable for a phone-class device; a JSON file
//! can override any subset of fields.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::crypto::{ARGON2_MAX_LANES, DEFAULT_MAX_MEMORY_KIB, DEFAULT_MAX_PARALLELISM};

/// Upper bounds applied while validating memory-hard parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Highest accepted lane count.
    pub max_parallelism: u32,
    /// Largest accepted working memory in KiB.
    pub max_memory_kib: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            max_memory_kib: DEFAULT_MAX_MEMORY_KIB,
        }
    }
}

impl Limits {
    /// Lane ceiling actually enforced; never above what Argon2 supports.
    pub fn parallelism_ceiling(&self) -> u32 {
        self.max_parallelism.clamp(1, ARGON2_MAX_LANES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub limits: Limits,
    /// Memory-hard derivations allowed in flight at once (minimum 1).
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            max_concurrent: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid engine configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("in {}", path.display()))
    }

    pub(crate) fn permits(&self) -> usize {
        self.max_concurrent.max(1)
    }
}
