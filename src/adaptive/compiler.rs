//! The compilers the scheduler dispatches to, one per tier.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::Tier;
use super::method::Method;
use crate::config::JitConfig;
use crate::error::CompileError;
use crate::jit::HostAssembler;
use crate::jit::code_cache::CodeCache;
use crate::jit::codegen::{CodeGenerator, CodegenOptions};
use crate::jit::runtime_calls::RuntimeCallTable;
use crate::jit::target_method::{TargetMethod, TargetMethodBuilder};

pub trait Compiler: Send + Sync {
    fn tier(&self) -> Tier;

    /// Compile `method` into an installable artifact. Must not block.
    fn compile(&self, method: &Method) -> Result<TargetMethod, CompileError>;
}

/// Lowers a method's LIR for the host and lays it out in the code cache.
pub struct LirCompiler {
    tier: Tier,
    options: CodegenOptions,
    runtime: Arc<RuntimeCallTable>,
    builder: TargetMethodBuilder,
    trace: bool,
}

impl LirCompiler {
    pub fn new(tier: Tier, cache: Arc<CodeCache>, runtime: Arc<RuntimeCallTable>, config: &JitConfig) -> Self {
        LirCompiler {
            tier,
            options: CodegenOptions::for_tier(tier, config),
            runtime,
            builder: TargetMethodBuilder::new(cache),
            trace: config.trace_jit,
        }
    }

    pub fn code_cache(&self) -> &Arc<CodeCache> {
        self.builder.cache()
    }
}

impl Compiler for LirCompiler {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn compile(&self, method: &Method) -> Result<TargetMethod, CompileError> {
        let start = Instant::now();
        let lir = method.lower(self.tier)?;
        if self.trace {
            trace!("LIR for {method} at {} tier:\n{lir}", self.tier);
        }

        let assembled = CodeGenerator::<HostAssembler>::new(&self.runtime, self.options).generate(&lir)?;
        let target = self.builder.build(method.id(), assembled)?;

        debug!(
            method = %method,
            tier = %self.tier,
            code_size = target.code_size(),
            stops = target.stop_count(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "compiled"
        );
        if self.trace {
            trace!("{}", target.describe());
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::MethodFlags;
    use crate::jit::lir::MethodId;
    use crate::jit::target_method::EntryKind;
    use crate::samples;

    fn compiler(tier: Tier) -> LirCompiler {
        let runtime = Arc::new(RuntimeCallTable::host());
        let cache = CodeCache::new(64 * 1024, &runtime).unwrap();
        LirCompiler::new(tier, cache, runtime, &JitConfig::default())
    }

    #[test]
    fn test_compiles_sample_at_each_tier() {
        let method = Method::new(MethodId(0), "add", MethodFlags::empty(), |tier: Tier| {
            Ok::<_, CompileError>(samples::add(tier))
        });
        for tier in [Tier::Baseline, Tier::Optimized] {
            let compiler = compiler(tier);
            let target = compiler.compile(&method).unwrap();
            assert_eq!(target.tier(), tier);
            assert_eq!(target.method(), MethodId(0));
            assert!(compiler.code_cache().contains(target.entry_address(EntryKind::Optimized)));
        }
    }

    #[test]
    fn test_lowering_errors_propagate() {
        let method = Method::new(MethodId(1), "broken", MethodFlags::empty(), |tier: Tier| {
            Err::<crate::jit::lir::MethodLir, _>(CompileError::unsupported(tier, "monitors"))
        });
        assert!(compiler(Tier::Baseline).compile(&method).unwrap_err().is_unsupported());
    }
}
