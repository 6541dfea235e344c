//! JIT configuration, loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which tiers the scheduler may pick on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationMode {
    /// Everything compiles at the baseline tier.
    Baseline,
    /// Everything compiles at the optimizing tier.
    Optimized,
    /// Baseline first; hot methods are promoted through `reoptimize`.
    #[default]
    Mixed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration of the compilation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    pub mode: CompilationMode,
    /// Invocation count at which the profiler should ask for the optimizing
    /// tier. `0` turns threshold promotion off.
    pub recompilation_threshold: u32,
    pub compiler_threads: usize,
    /// Bytes reserved for the code cache.
    pub code_cache_size: usize,
    /// Log every installed target method at trace level.
    pub trace_jit: bool,
    pub peephole: bool,
    /// Fold null checks into faulting memory accesses.
    pub implicit_null_checks: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            mode: CompilationMode::Mixed,
            recompilation_threshold: 5000,
            compiler_threads: 1,
            code_cache_size: 16 * 1024 * 1024,
            trace_jit: false,
            peephole: true,
            implicit_null_checks: true,
        }
    }
}

impl JitConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: JitConfig = toml::from_str(content)?;
        Ok(config.normalized())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Whether an invocation count has reached the promotion threshold.
    pub fn should_promote(&self, invocations: u32) -> bool {
        self.mode == CompilationMode::Mixed
            && self.recompilation_threshold != 0
            && invocations >= self.recompilation_threshold
    }

    fn normalized(mut self) -> Self {
        self.compiler_threads = self.compiler_threads.max(1);
        self
    }
}
