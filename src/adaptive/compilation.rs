//! One compilation request and the handle its requesters wait on.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::method::Method;
use super::{CompilationDirective, Tier};
use crate::error::CompileError;
use crate::jit::target_method::TargetMethod;

pub type CompilationResult = Result<Arc<TargetMethod>, CompileError>;

/// A compile of one method for one directive. Every requester of the same
/// pair shares this object and sees the same result.
pub struct Compilation {
    method: Arc<Method>,
    directive: CompilationDirective,
    tier: Tier,
    result: Mutex<Option<CompilationResult>>,
    done: Condvar,
}

impl Compilation {
    pub(crate) fn new(method: Arc<Method>, directive: CompilationDirective, tier: Tier) -> Arc<Self> {
        Arc::new(Compilation {
            method,
            directive,
            tier,
            result: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    pub(crate) fn finished(
        method: Arc<Method>,
        directive: CompilationDirective,
        target: Arc<TargetMethod>,
    ) -> Arc<Self> {
        let tier = target.tier();
        Arc::new(Compilation {
            method,
            directive,
            tier,
            result: Mutex::new(Some(Ok(target))),
            done: Condvar::new(),
        })
    }

    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    pub fn directive(&self) -> CompilationDirective {
        self.directive
    }

    /// Tier the request was started at. A retry may produce a higher one.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    fn lock_result(&self) -> MutexGuard<'_, Option<CompilationResult>> {
        self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_done(&self) -> bool {
        self.lock_result().is_some()
    }

    pub fn try_result(&self) -> Option<CompilationResult> {
        self.lock_result().clone()
    }

    /// Block until the compilation has finished.
    pub fn wait(&self) -> CompilationResult {
        let mut result = self.lock_result();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            result = self.done.wait(result).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn complete(&self, outcome: CompilationResult) {
        let mut result = self.lock_result();
        debug_assert!(result.is_none(), "compilation completed twice");
        *result = Some(outcome);
        self.done.notify_all();
    }
}

impl fmt::Debug for Compilation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compilation")
            .field("method", &self.method.name())
            .field("directive", &self.directive)
            .field("tier", &self.tier)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Returned by asynchronous requests.
#[derive(Debug, Clone)]
pub struct CompilationHandle {
    compilation: Arc<Compilation>,
}

impl CompilationHandle {
    pub(crate) fn new(compilation: Arc<Compilation>) -> Self {
        CompilationHandle { compilation }
    }

    pub fn method(&self) -> &Arc<Method> {
        self.compilation.method()
    }

    pub fn tier(&self) -> Tier {
        self.compilation.tier()
    }

    pub fn is_done(&self) -> bool {
        self.compilation.is_done()
    }

    pub fn try_result(&self) -> Option<CompilationResult> {
        self.compilation.try_result()
    }

    pub fn wait(&self) -> CompilationResult {
        self.compilation.wait()
    }

    /// Whether two handles refer to the same compilation.
    pub fn same_compilation(&self, other: &CompilationHandle) -> bool {
        Arc::ptr_eq(&self.compilation, &other.compilation)
    }
}
