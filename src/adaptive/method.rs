//! Methods as seen by the scheduler, with their compilation state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

use super::compilation::Compilation;
use super::{CompilationDirective, Tier};
use crate::error::CompileError;
use crate::jit::lir::{MethodId, MethodLir};
use crate::jit::target_method::{EntryKind, TargetMethod};

bitflags! {
    /// Properties reported by the resolution service.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodFlags: u8 {
        const NATIVE = 1 << 0;
        /// Uses constructs only the optimizing tier handles.
        const MUST_OPTIMIZE = 1 << 1;
        const NEVER_COMPILE = 1 << 2;
        const NEVER_INLINE = 1 << 3;
        /// Generated by the runtime, e.g. a reflective invocation stub.
        const SYNTHETIC = 1 << 4;
    }
}

/// Produces register-allocated LIR for a method at a given tier.
pub trait LirSource: Send + Sync {
    fn lower(&self, tier: Tier) -> Result<MethodLir, CompileError>;
}

impl<F> LirSource for F
where
    F: Fn(Tier) -> Result<MethodLir, CompileError> + Send + Sync,
{
    fn lower(&self, tier: Tier) -> Result<MethodLir, CompileError> {
        self(tier)
    }
}

#[derive(Default)]
pub(crate) struct MethodState {
    pub(crate) current: Option<Arc<TargetMethod>>,
    pub(crate) results: HashMap<CompilationDirective, Arc<TargetMethod>>,
    pub(crate) in_flight: HashMap<CompilationDirective, Arc<Compilation>>,
    pub(crate) history: Vec<Tier>,
    /// Superseded artifacts. Old frames and forwarded entries still run
    /// their code, so it must not go back to the code cache.
    pub(crate) retired: Vec<Arc<TargetMethod>>,
}

pub struct Method {
    id: MethodId,
    name: String,
    flags: MethodFlags,
    source: Box<dyn LirSource>,
    state: Mutex<MethodState>,
    /// Dispatch slot: optimized entry of the installed code, 0 when none.
    entry: AtomicUsize,
}

impl Method {
    pub fn new(
        id: MethodId,
        name: impl Into<String>,
        flags: MethodFlags,
        source: impl LirSource + 'static,
    ) -> Arc<Self> {
        Arc::new(Method {
            id,
            name: name.into(),
            flags,
            source: Box::new(source),
            state: Mutex::new(MethodState::default()),
            entry: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn lower(&self, tier: Tier) -> Result<MethodLir, CompileError> {
        self.source.lower(tier)
    }

    /// Entry address callers should jump to, once something is installed.
    pub fn entry_address(&self) -> Option<usize> {
        match self.entry.load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }

    pub fn current(&self) -> Option<Arc<TargetMethod>> {
        self.lock_state().current.clone()
    }

    pub fn current_tier(&self) -> Option<Tier> {
        self.lock_state().current.as_ref().map(|tm| tm.tier())
    }

    /// Tiers of every artifact installed so far, oldest first.
    pub fn tier_history(&self) -> Vec<Tier> {
        self.lock_state().history.clone()
    }

    pub fn result_for(&self, directive: CompilationDirective) -> Option<Arc<TargetMethod>> {
        self.lock_state().results.get(&directive).cloned()
    }

    /// Superseded artifacts kept mapped since their replacement.
    pub fn retired_count(&self) -> usize {
        self.lock_state().retired.len()
    }

    /// Let superseded code go back to the code cache once no other handle
    /// holds it. Only call this when no thread can still be executing it
    /// or entering it through a stale entry address, e.g. at a global
    /// safepoint. Returns how many artifacts were let go.
    pub fn release_retired(&self) -> usize {
        let retired = std::mem::take(&mut self.lock_state().retired);
        retired.len()
    }

    pub fn is_compiling(&self) -> bool {
        !self.lock_state().in_flight.is_empty()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, MethodState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `target` the installed artifact. The dispatch slot is written
    /// before the caller forwards the previous artifact.
    pub(crate) fn install(
        &self,
        state: &mut MethodState,
        target: Arc<TargetMethod>,
    ) -> Option<Arc<TargetMethod>> {
        self.entry
            .store(target.entry_address(EntryKind::Optimized), Ordering::Release);
        state.history.push(target.tier());
        state.current.replace(target)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
