//! Error types shared by the backend and the scheduler.

use thiserror::Error;

use crate::adaptive::Tier;
use crate::jit::memory::MemoryError;

/// Why compiling one method failed.
///
/// The variants follow how the scheduler reacts to them: internal errors fail
/// the request, unsupported constructs are retried at a higher tier and
/// resource errors are retried once after eviction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A compiler bug: unbound label, malformed operand, broken table invariant.
    #[error("internal compiler error: {0}")]
    Internal(String),

    /// The requested tier cannot compile some construct in the method.
    #[error("{tier} tier cannot compile {what}")]
    Unsupported { tier: Tier, what: String },

    /// The code cache has no chunk large enough for the artifact.
    #[error("code cache full: requested {requested} bytes, {available} bytes free")]
    CodeCacheFull { requested: usize, available: usize },

    #[error("executable memory: {0}")]
    Memory(#[from] MemoryError),

    /// The method is marked never-compile.
    #[error("compilation disabled for {0}")]
    CompilationDisabled(String),
}

impl CompileError {
    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }

    pub fn unsupported(tier: Tier, what: impl Into<String>) -> Self {
        CompileError::Unsupported {
            tier,
            what: what.into(),
        }
    }

    /// Out of code space or mappable memory.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            CompileError::CodeCacheFull { .. } | CompileError::Memory(_)
        )
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, CompileError::Unsupported { .. })
    }
}

/// Failure to rewrite a call site or an entry point in installed code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("offset {0:#x} is not a patchable direct call site")]
    NotACallSite(u32),

    #[error("target {target:#x} is out of rel32 range from {site:#x}")]
    OutOfRange { site: usize, target: usize },

    #[error("patch site {0:#x} is not aligned for an atomic store")]
    Misaligned(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let full = CompileError::CodeCacheFull {
            requested: 64,
            available: 0,
        };
        assert!(full.is_resource());
        assert!(!full.is_unsupported());

        let unsupported = CompileError::unsupported(Tier::Baseline, "native call");
        assert!(unsupported.is_unsupported());
        assert_eq!(
            unsupported.to_string(),
            "baseline tier cannot compile native call"
        );

        assert!(CompileError::from(MemoryError::AllocationFailed).is_resource());
        assert!(!CompileError::internal("unbound label").is_resource());
    }
}
