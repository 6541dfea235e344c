//! The adaptive compilation scheduler.
//!
//! Synchronous requests compile on the caller's thread; asynchronous ones
//! go through a FIFO queue drained by a pool of worker threads. Each
//! method's state has its own lock, separate from the queue lock, so
//! unrelated methods never wait on each other.
//!
//! Publication order for a finished compile, all under the method lock:
//! cache the result for its directive, store the new entry into the
//! method's dispatch slot, forward the previous artifact's entries and
//! retire it. Requesters are woken only after that. Direct calls are linked
//! through the callee resolver before any of this, so the new code is never
//! visible with a resolvable call still on the trampoline.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::compilation::{Compilation, CompilationHandle, CompilationResult};
use super::compiler::{Compiler, LirCompiler};
use super::method::{Method, MethodFlags};
use super::{CompilationDirective, Tier};
use crate::config::{CompilationMode, JitConfig};
use crate::error::CompileError;
use crate::jit::code_cache::CodeCache;
use crate::jit::lir::MethodId;
use crate::jit::runtime_calls::RuntimeCallTable;
use crate::jit::target_method::TargetMethod;

/// Notified around every compilation the scheduler performs.
pub trait CompilationObserver: Send + Sync {
    fn before_compilation(&self, _method: &Method, _directive: CompilationDirective, _tier: Tier) {}

    fn after_compilation(
        &self,
        _method: &Method,
        _directive: CompilationDirective,
        _result: &CompilationResult,
    ) {
    }
}

/// Called with the failure when a compile runs out of code space or
/// memory, before the single retry.
pub type EvictionHook = Arc<dyn Fn(&CompileError) + Send + Sync>;

/// Entry address to link a direct call to `MethodId` against, if the
/// callee has code.
pub type CalleeResolver = Arc<dyn Fn(MethodId) -> Option<usize> + Send + Sync>;

#[derive(Debug, Default)]
pub struct SchedulerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    installs: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub installs: u64,
    /// Results not installed because a higher tier already was.
    pub discarded: u64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            installs: self.installs.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

struct QueueState {
    pending: VecDeque<Arc<Compilation>>,
    shutdown: bool,
}

struct Shared {
    config: JitConfig,
    baseline: Box<dyn Compiler>,
    optimized: Box<dyn Compiler>,
    queue: Mutex<QueueState>,
    not_empty: Condvar,
    observers: RwLock<Vec<Arc<dyn CompilationObserver>>>,
    stats: SchedulerStats,
    eviction_hook: Option<EvictionHook>,
    callee_resolver: Option<CalleeResolver>,
    hierarchy_lock: Option<Arc<RwLock<()>>>,
}

/// How a request was satisfied.
enum Request {
    Cached(Arc<TargetMethod>),
    Joined(Arc<Compilation>),
    Started(Arc<Compilation>),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl Shared {
    fn compiler(&self, tier: Tier) -> &dyn Compiler {
        match tier {
            Tier::Baseline => self.baseline.as_ref(),
            Tier::Optimized => self.optimized.as_ref(),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> Vec<Arc<dyn CompilationObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn select_tier(
        &self,
        method: &Method,
        directive: CompilationDirective,
        installed: Option<&Arc<TargetMethod>>,
    ) -> Result<Tier, CompileError> {
        let flags = method.flags();
        if flags.contains(MethodFlags::NEVER_COMPILE) {
            return Err(CompileError::CompilationDisabled(method.name().to_string()));
        }
        if flags.contains(MethodFlags::MUST_OPTIMIZE) {
            return Ok(Tier::Optimized);
        }
        if let Some(tier) = directive.forced_tier() {
            return Ok(tier);
        }
        Ok(match (installed, self.config.mode) {
            (_, CompilationMode::Baseline) => Tier::Baseline,
            // Recompiling something already installed means it is hot.
            (Some(_), _) => Tier::Optimized,
            (None, _) if flags.contains(MethodFlags::SYNTHETIC) && !flags.contains(MethodFlags::NATIVE) => {
                Tier::Baseline
            }
            (None, CompilationMode::Optimized) => Tier::Optimized,
            (None, CompilationMode::Mixed) => Tier::Baseline,
        })
    }

    /// Join, reuse or start the compilation for `(method, directive)`.
    fn request(&self, method: &Arc<Method>, directive: CompilationDirective) -> Result<Request, CompileError> {
        let mut state = method.lock_state();
        if let Some(compilation) = state.in_flight.get(&directive) {
            return Ok(Request::Joined(Arc::clone(compilation)));
        }
        if let Some(target) = state.results.get(&directive) {
            return Ok(Request::Cached(Arc::clone(target)));
        }
        let tier = self.select_tier(method, directive, state.current.as_ref())?;
        let compilation = Compilation::new(Arc::clone(method), directive, tier);
        state.in_flight.insert(directive, Arc::clone(&compilation));
        SchedulerStats::bump(&self.stats.submitted);
        Ok(Request::Started(compilation))
    }

    fn enqueue(&self, compilation: Arc<Compilation>) {
        debug!(
            method = %compilation.method(),
            tier = %compilation.tier(),
            "queued compilation"
        );
        self.lock_queue().pending.push_back(compilation);
        self.not_empty.notify_one();
    }

    /// Next queued compilation; `None` once shut down and drained.
    fn next_pending(&self) -> Option<Arc<Compilation>> {
        let mut queue = self.lock_queue();
        loop {
            if let Some(compilation) = queue.pending.pop_front() {
                return Some(compilation);
            }
            if queue.shutdown {
                return None;
            }
            queue = self.not_empty.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn compile_once(&self, method: &Method, tier: Tier) -> Result<TargetMethod, CompileError> {
        let _hierarchy = self
            .hierarchy_lock
            .as_ref()
            .map(|lock| lock.read().unwrap_or_else(PoisonError::into_inner));
        let compiler = self.compiler(tier);
        panic::catch_unwind(AssertUnwindSafe(|| compiler.compile(method))).unwrap_or_else(|payload| {
            Err(CompileError::internal(format!(
                "compiler panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    /// Compile at `tier`, retrying once at the optimizing tier for
    /// constructs the baseline cannot handle, and once after eviction for
    /// resource errors.
    fn compile_with_retries(&self, method: &Method, mut tier: Tier) -> Result<TargetMethod, CompileError> {
        let mut evicted = false;
        loop {
            match self.compile_once(method, tier) {
                Err(err) if err.is_unsupported() && tier == Tier::Baseline => {
                    warn!(method = %method, "{err}; retrying at the optimized tier");
                    SchedulerStats::bump(&self.stats.retries);
                    tier = Tier::Optimized;
                }
                Err(err) if err.is_resource() && !evicted => {
                    warn!(method = %method, "{err}; evicting and retrying");
                    SchedulerStats::bump(&self.stats.retries);
                    evicted = true;
                    if let Some(hook) = &self.eviction_hook {
                        hook(&err);
                    }
                }
                result => return result,
            }
        }
    }

    fn perform(&self, compilation: &Arc<Compilation>) {
        let method = compilation.method();
        let directive = compilation.directive();
        let observers = self.observers();
        for observer in &observers {
            observer.before_compilation(method, directive, compilation.tier());
        }

        let compiled = self.compile_with_retries(method, compilation.tier());
        if let (Ok(target), Some(resolve)) = (&compiled, &self.callee_resolver) {
            match target.link_direct_calls(resolve.as_ref()) {
                Ok(0) => {}
                Ok(linked) => debug!(method = %method, linked, "linked direct calls"),
                // Unlinked sites still reach the resolution trampoline.
                Err(err) => warn!(method = %method, "could not link direct calls: {err}"),
            }
        }
        let result = self.publish(compilation, compiled);

        SchedulerStats::bump(&self.stats.completed);
        if let Err(err) = &result {
            SchedulerStats::bump(&self.stats.failed);
            error!(method = %method, directive = %directive, "compilation failed: {err}");
        }
        compilation.complete(result.clone());
        for observer in &observers {
            observer.after_compilation(method, directive, &result);
        }
    }

    fn publish(
        &self,
        compilation: &Arc<Compilation>,
        compiled: Result<TargetMethod, CompileError>,
    ) -> CompilationResult {
        let method = compilation.method();
        let directive = compilation.directive();
        let mut state = method.lock_state();
        if state
            .in_flight
            .get(&directive)
            .is_some_and(|c| Arc::ptr_eq(c, compilation))
        {
            state.in_flight.remove(&directive);
        }

        let target = Arc::new(compiled?);
        state.results.insert(directive, Arc::clone(&target));

        let installed = state.current.as_ref().map(|current| current.tier());
        if installed.is_some_and(|tier| tier > target.tier()) {
            debug!(
                method = %method,
                tier = %target.tier(),
                "not installing; a higher tier is already installed"
            );
            SchedulerStats::bump(&self.stats.discarded);
            return Ok(target);
        }

        let previous = method.install(&mut state, Arc::clone(&target));
        SchedulerStats::bump(&self.stats.installs);
        info!(
            method = %method,
            tier = %target.tier(),
            id = target.id(),
            "installed at {:#x}",
            target.code_start()
        );
        if let Some(previous) = previous {
            if let Err(err) = previous.forward_to(&target) {
                // Old callers keep running the previous code; only the speedup is lost.
                warn!(method = %method, "could not forward #{}: {err}", previous.id());
            }
            state.retired.push(previous);
        }
        Ok(target)
    }
}

/// Configures an [`AdaptiveScheduler`].
pub struct SchedulerBuilder {
    config: JitConfig,
    runtime: Option<Arc<RuntimeCallTable>>,
    compilers: Option<(Box<dyn Compiler>, Box<dyn Compiler>)>,
    eviction_hook: Option<EvictionHook>,
    callee_resolver: Option<CalleeResolver>,
    hierarchy_lock: Option<Arc<RwLock<()>>>,
}

impl SchedulerBuilder {
    /// Runtime routines used by the default compilers.
    pub fn runtime(mut self, runtime: Arc<RuntimeCallTable>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Replace the default LIR compilers.
    pub fn compilers(mut self, baseline: Box<dyn Compiler>, optimized: Box<dyn Compiler>) -> Self {
        self.compilers = Some((baseline, optimized));
        self
    }

    pub fn eviction_hook(mut self, hook: impl Fn(&CompileError) + Send + Sync + 'static) -> Self {
        self.eviction_hook = Some(Arc::new(hook));
        self
    }

    /// Consulted for every direct call of a freshly compiled method before
    /// it is installed.
    pub fn callee_resolver(mut self, resolve: impl Fn(MethodId) -> Option<usize> + Send + Sync + 'static) -> Self {
        self.callee_resolver = Some(Arc::new(resolve));
        self
    }

    /// Read-held for the whole of every compile.
    pub fn hierarchy_lock(mut self, lock: Arc<RwLock<()>>) -> Self {
        self.hierarchy_lock = Some(lock);
        self
    }

    pub fn build(self) -> Result<AdaptiveScheduler, CompileError> {
        let (baseline, optimized) = match self.compilers {
            Some(compilers) => compilers,
            None => {
                let runtime = self.runtime.unwrap_or_else(|| Arc::new(RuntimeCallTable::host()));
                let cache = CodeCache::new(self.config.code_cache_size, &runtime)?;
                let baseline: Box<dyn Compiler> = Box::new(LirCompiler::new(
                    Tier::Baseline,
                    Arc::clone(&cache),
                    Arc::clone(&runtime),
                    &self.config,
                ));
                let optimized: Box<dyn Compiler> =
                    Box::new(LirCompiler::new(Tier::Optimized, cache, runtime, &self.config));
                (baseline, optimized)
            }
        };

        let threads = self.config.compiler_threads.max(1);
        let shared = Arc::new(Shared {
            config: self.config,
            baseline,
            optimized,
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            observers: RwLock::new(Vec::new()),
            stats: SchedulerStats::default(),
            eviction_hook: self.eviction_hook,
            callee_resolver: self.callee_resolver,
            hierarchy_lock: self.hierarchy_lock,
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("lirjit-compile-{index}"))
                .spawn(move || {
                    while let Some(compilation) = shared.next_pending() {
                        shared.perform(&compilation);
                    }
                })
                .map_err(|err| CompileError::internal(format!("cannot start compiler thread: {err}")))?;
            workers.push(worker);
        }
        debug!(threads, mode = ?shared.config.mode, "scheduler started");

        Ok(AdaptiveScheduler { shared, workers })
    }
}

pub struct AdaptiveScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl AdaptiveScheduler {
    pub fn builder(config: JitConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            runtime: None,
            compilers: None,
            eviction_hook: None,
            callee_resolver: None,
            hierarchy_lock: None,
        }
    }

    /// A scheduler with the host LIR compilers and its own code cache.
    pub fn new(config: JitConfig) -> Result<Self, CompileError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &JitConfig {
        &self.shared.config
    }

    /// Invocation count at which [`Self::notify_invocations`] reoptimizes.
    pub fn recompilation_threshold(&self) -> u32 {
        self.shared.config.recompilation_threshold
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Whether any submitted compilation has not finished yet.
    pub fn is_compiling(&self) -> bool {
        let stats = self.stats();
        stats.submitted > stats.completed
    }

    pub fn add_observer(&self, observer: Arc<dyn CompilationObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn CompilationObserver>) {
        let target = Arc::as_ptr(observer) as *const ();
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|o| Arc::as_ptr(o) as *const () != target);
    }

    /// Tier a fresh request with `directive` would compile at.
    pub fn select_tier(&self, method: &Method, directive: CompilationDirective) -> Result<Tier, CompileError> {
        let installed = method.current();
        self.shared.select_tier(method, directive, installed.as_ref())
    }

    /// Compile on this thread, or wait for the compile already running for
    /// the same directive. A cached result is returned as is.
    pub fn compile_synchronously(
        &self,
        method: &Arc<Method>,
        directive: CompilationDirective,
    ) -> CompilationResult {
        match self.shared.request(method, directive)? {
            Request::Cached(target) => Ok(target),
            Request::Joined(compilation) => compilation.wait(),
            Request::Started(compilation) => {
                self.shared.perform(&compilation);
                compilation.wait()
            }
        }
    }

    /// Queue a compile for the workers and return immediately.
    pub fn compile_asynchronously(
        &self,
        method: &Arc<Method>,
        directive: CompilationDirective,
    ) -> Result<CompilationHandle, CompileError> {
        let compilation = match self.shared.request(method, directive)? {
            Request::Cached(target) => Compilation::finished(Arc::clone(method), directive, target),
            Request::Joined(compilation) => compilation,
            Request::Started(compilation) => {
                self.shared.enqueue(Arc::clone(&compilation));
                compilation
            }
        };
        Ok(CompilationHandle::new(compilation))
    }

    /// Report that `method` has been invoked `invocations` times. Once the
    /// configured threshold is reached in mixed mode, it is queued for
    /// reoptimization.
    pub fn notify_invocations(&self, method: &Arc<Method>, invocations: u32) -> Option<CompilationHandle> {
        if !self.shared.config.should_promote(invocations) {
            return None;
        }
        self.reoptimize(method, CompilationDirective::Default, false)
    }

    /// Raise `method` to the optimizing tier.
    ///
    /// Nothing happens when it is already optimized, or when a compile for
    /// it is in flight; a synchronous request then waits for that compile.
    /// Returns the new compilation, if one was started.
    pub fn reoptimize(
        &self,
        method: &Arc<Method>,
        directive: CompilationDirective,
        synchronous: bool,
    ) -> Option<CompilationHandle> {
        let compilation = {
            let mut state = method.lock_state();
            if let Some(running) = state.in_flight.values().next().cloned() {
                drop(state);
                if synchronous {
                    let _ = running.wait();
                }
                return None;
            }
            if state
                .current
                .as_ref()
                .is_some_and(|current| current.tier() >= Tier::Optimized)
            {
                return None;
            }
            if method.flags().contains(MethodFlags::NEVER_COMPILE) {
                debug!(method = %method, "not reoptimizing a never-compile method");
                return None;
            }
            let compilation = Compilation::new(Arc::clone(method), directive, Tier::Optimized);
            state.in_flight.insert(directive, Arc::clone(&compilation));
            SchedulerStats::bump(&self.shared.stats.submitted);
            compilation
        };

        info!(method = %method, synchronous, "reoptimizing");
        if synchronous {
            self.shared.perform(&compilation);
        } else {
            self.shared.enqueue(Arc::clone(&compilation));
        }
        Some(CompilationHandle::new(compilation))
    }
}

impl Drop for AdaptiveScheduler {
    fn drop(&mut self) {
        self.shared.lock_queue().shutdown = true;
        self.shared.not_empty.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::lir::{Block, LirList, LirOp, MethodId, MethodLir};
    use crate::jit::operand::{Kind, Operand};
    use crate::jit::target_method::{CallSiteState, EntryKind};
    use crate::jit::x86_64::regs;
    use crate::samples;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Wraps a real compiler, counting calls and optionally injecting a
    /// failure or a delay.
    struct Instrumented {
        inner: LirCompiler,
        calls: Arc<AtomicUsize>,
        threads: Arc<Mutex<Vec<String>>>,
        fail_first: Mutex<Option<CompileError>>,
        fail_always: Option<CompileError>,
        delay: Duration,
    }

    impl Compiler for Instrumented {
        fn tier(&self) -> Tier {
            self.inner.tier()
        }

        fn compile(&self, method: &Method) -> Result<TargetMethod, CompileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.threads
                .lock()
                .unwrap()
                .push(thread::current().name().unwrap_or("").to_string());
            thread::sleep(self.delay);
            if let Some(err) = self.fail_first.lock().unwrap().take() {
                return Err(err);
            }
            if let Some(err) = &self.fail_always {
                return Err(err.clone());
            }
            self.inner.compile(method)
        }
    }

    struct Harness {
        scheduler: AdaptiveScheduler,
        baseline_calls: Arc<AtomicUsize>,
        optimized_calls: Arc<AtomicUsize>,
        threads: Arc<Mutex<Vec<String>>>,
    }

    #[derive(Default)]
    struct Faults {
        baseline_first: Option<CompileError>,
        optimized_always: Option<CompileError>,
        delay: Duration,
    }

    fn harness_with(config: JitConfig, faults: Faults, builder: impl FnOnce(SchedulerBuilder) -> SchedulerBuilder) -> Harness {
        let runtime = Arc::new(RuntimeCallTable::host());
        let cache = CodeCache::new(256 * 1024, &runtime).unwrap();
        let baseline_calls = Arc::new(AtomicUsize::new(0));
        let optimized_calls = Arc::new(AtomicUsize::new(0));
        let threads = Arc::new(Mutex::new(Vec::new()));

        let baseline = Instrumented {
            inner: LirCompiler::new(Tier::Baseline, Arc::clone(&cache), Arc::clone(&runtime), &config),
            calls: Arc::clone(&baseline_calls),
            threads: Arc::clone(&threads),
            fail_first: Mutex::new(faults.baseline_first),
            fail_always: None,
            delay: faults.delay,
        };
        let optimized = Instrumented {
            inner: LirCompiler::new(Tier::Optimized, cache, runtime, &config),
            calls: Arc::clone(&optimized_calls),
            threads: Arc::clone(&threads),
            fail_first: Mutex::new(None),
            fail_always: faults.optimized_always,
            delay: faults.delay,
        };
        let scheduler = builder(AdaptiveScheduler::builder(config).compilers(Box::new(baseline), Box::new(optimized)))
            .build()
            .unwrap();
        Harness {
            scheduler,
            baseline_calls,
            optimized_calls,
            threads,
        }
    }

    fn harness() -> Harness {
        harness_with(JitConfig::default(), Faults::default(), |b| b)
    }

    fn add_method(flags: MethodFlags) -> Arc<Method> {
        Method::new(MethodId(0), "add", flags, |tier: Tier| Ok::<_, CompileError>(samples::add(tier)))
    }

    fn native_call_method() -> Arc<Method> {
        Method::new(MethodId(1), "native", MethodFlags::NATIVE, |_tier: Tier| {
            let mut lir = LirList::new();
            lir.append(LirOp::StdEntry);
            lir.append(LirOp::NativeCall {
                function: 0x1000,
                result: Operand::register(regs::RAX, Kind::Int),
            });
            lir.append(LirOp::Return {
                value: Operand::register(regs::RAX, Kind::Int),
            });
            Ok::<_, CompileError>(MethodLir {
                name: "native".to_string(),
                blocks: vec![Block::new(0).with_lir(lir)],
                frame: crate::jit::lir::FrameLayout::new(0),
            })
        })
    }

    #[test]
    fn test_synchronous_result_is_cached_per_directive() {
        let h = harness();
        let method = add_method(MethodFlags::empty());

        let first = h.scheduler.compile_synchronously(&method, CompilationDirective::Default).unwrap();
        let second = h.scheduler.compile_synchronously(&method, CompilationDirective::Default).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.tier(), Tier::Baseline);
        assert_eq!(h.baseline_calls.load(Ordering::SeqCst), 1);
        assert_eq!(method.entry_address(), Some(first.entry_address(EntryKind::Optimized)));
        assert!(!method.is_compiling());
        assert!(!h.scheduler.is_compiling());
    }

    #[test]
    fn test_concurrent_requests_share_one_compilation() {
        let h = harness_with(
            JitConfig::default(),
            Faults {
                delay: Duration::from_millis(50),
                ..Faults::default()
            },
            |b| b,
        );
        let scheduler = Arc::new(h.scheduler);
        let method = add_method(MethodFlags::empty());

        let requesters: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                let method = Arc::clone(&method);
                thread::spawn(move || {
                    scheduler
                        .compile_synchronously(&method, CompilationDirective::Baseline)
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<Arc<TargetMethod>> = requesters.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(h.baseline_calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(scheduler.stats().submitted, 1);
    }

    #[test]
    fn test_asynchronous_compile_runs_on_worker() {
        let h = harness();
        let method = add_method(MethodFlags::empty());

        let handle = h
            .scheduler
            .compile_asynchronously(&method, CompilationDirective::Optimize)
            .unwrap();
        let target = handle.wait().unwrap();
        assert_eq!(target.tier(), Tier::Optimized);
        assert_eq!(h.threads.lock().unwrap().as_slice(), &["lirjit-compile-0".to_string()]);

        let again = h
            .scheduler
            .compile_asynchronously(&method, CompilationDirective::Optimize)
            .unwrap();
        assert!(again.is_done());
        assert!(Arc::ptr_eq(&again.wait().unwrap(), &target));
        assert_eq!(h.optimized_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reoptimize_is_noop_when_already_optimized() {
        let h = harness();
        let method = add_method(MethodFlags::empty());
        h.scheduler
            .compile_synchronously(&method, CompilationDirective::Optimize)
            .unwrap();

        assert!(h.scheduler.reoptimize(&method, CompilationDirective::Default, true).is_none());
        assert!(h.scheduler.reoptimize(&method, CompilationDirective::Default, false).is_none());
        assert_eq!(h.optimized_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.stats().submitted, 1);
    }

    #[test]
    fn test_reoptimize_promotes_and_forwards() {
        let h = harness();
        let method = add_method(MethodFlags::empty());
        let baseline = h
            .scheduler
            .compile_synchronously(&method, CompilationDirective::Default)
            .unwrap();

        let handle = h
            .scheduler
            .reoptimize(&method, CompilationDirective::Default, true)
            .unwrap();
        let optimized = handle.wait().unwrap();

        assert_eq!(optimized.tier(), Tier::Optimized);
        assert_ne!(optimized.id(), baseline.id());
        assert_eq!(method.current_tier(), Some(Tier::Optimized));
        assert_eq!(method.tier_history(), vec![Tier::Baseline, Tier::Optimized]);
        assert_eq!(method.entry_address(), Some(optimized.entry_address(EntryKind::Optimized)));
        assert_eq!(baseline.forwarded_to(), Some(optimized.id()));
        // The directive's cached result now points at the newer code.
        assert!(Arc::ptr_eq(
            &method.result_for(CompilationDirective::Default).unwrap(),
            &optimized
        ));
    }

    #[test]
    fn test_reoptimize_waits_for_running_compile() {
        let lock = Arc::new(RwLock::new(()));
        let h = harness_with(JitConfig::default(), Faults::default(), {
            let lock = Arc::clone(&lock);
            move |b| b.hierarchy_lock(lock)
        });
        let scheduler = Arc::new(h.scheduler);
        let method = add_method(MethodFlags::empty());

        // Keep the baseline compile parked on the hierarchy lock.
        let writer = lock.write().unwrap();
        let handle = scheduler
            .compile_asynchronously(&method, CompilationDirective::Baseline)
            .unwrap();
        assert!(scheduler.reoptimize(&method, CompilationDirective::Default, false).is_none());

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            let method = Arc::clone(&method);
            thread::spawn(move || scheduler.reoptimize(&method, CompilationDirective::Default, true))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(writer);
        assert!(waiter.join().unwrap().is_none());
        assert!(handle.is_done());
        assert_eq!(h.optimized_calls.load(Ordering::SeqCst), 0);
        assert_eq!(method.current_tier(), Some(Tier::Baseline));
    }

    #[test]
    fn test_lower_tier_result_is_not_installed_over_higher() {
        let h = harness();
        let method = add_method(MethodFlags::empty());
        let optimized = h
            .scheduler
            .compile_synchronously(&method, CompilationDirective::Optimize)
            .unwrap();
        let baseline = h
            .scheduler
            .compile_synchronously(&method, CompilationDirective::Baseline)
            .unwrap();

        assert_eq!(baseline.tier(), Tier::Baseline);
        assert!(Arc::ptr_eq(&method.current().unwrap(), &optimized));
        assert_eq!(optimized.forwarded_to(), None);
        let stats = h.scheduler.stats();
        assert_eq!(stats.installs, 1);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn test_tier_selection() {
        let h = harness();
        let scheduler = &h.scheduler;
        let plain = add_method(MethodFlags::empty());
        assert_eq!(scheduler.select_tier(&plain, CompilationDirective::Default), Ok(Tier::Baseline));
        assert_eq!(scheduler.select_tier(&plain, CompilationDirective::Optimize), Ok(Tier::Optimized));

        let must = add_method(MethodFlags::MUST_OPTIMIZE);
        assert_eq!(scheduler.select_tier(&must, CompilationDirective::Baseline), Ok(Tier::Optimized));

        let never = add_method(MethodFlags::NEVER_COMPILE);
        assert!(matches!(
            scheduler.compile_synchronously(&never, CompilationDirective::Default),
            Err(CompileError::CompilationDisabled(_))
        ));
        assert!(scheduler.reoptimize(&never, CompilationDirective::Default, true).is_none());

        let conflicting = add_method(MethodFlags::MUST_OPTIMIZE | MethodFlags::NEVER_COMPILE);
        assert!(matches!(
            scheduler.select_tier(&conflicting, CompilationDirective::Optimize),
            Err(CompileError::CompilationDisabled(_))
        ));

        let optimized_mode = harness_with(
            JitConfig {
                mode: CompilationMode::Optimized,
                ..JitConfig::default()
            },
            Faults::default(),
            |b| b,
        );
        assert_eq!(
            optimized_mode.scheduler.select_tier(&plain, CompilationDirective::Default),
            Ok(Tier::Optimized)
        );
        let stub = add_method(MethodFlags::SYNTHETIC);
        assert_eq!(
            optimized_mode.scheduler.select_tier(&stub, CompilationDirective::Default),
            Ok(Tier::Baseline)
        );
    }

    #[test]
    fn test_superseded_code_is_retired_until_released() {
        let h = harness();
        let method = add_method(MethodFlags::empty());
        let baseline = h
            .scheduler
            .compile_synchronously(&method, CompilationDirective::Default)
            .unwrap();
        h.scheduler
            .reoptimize(&method, CompilationDirective::Default, true)
            .unwrap()
            .wait()
            .unwrap();

        let superseded = Arc::downgrade(&baseline);
        drop(baseline);
        assert_eq!(method.retired_count(), 1);
        assert!(superseded.upgrade().is_some());

        assert_eq!(method.release_retired(), 1);
        assert_eq!(method.retired_count(), 0);
        assert!(superseded.upgrade().is_none());
    }

    #[test]
    fn test_callee_resolver_links_calls_before_install() {
        let callee = add_method(MethodFlags::empty());
        let h = harness_with(JitConfig::default(), Faults::default(), {
            let callee = Arc::clone(&callee);
            move |b| b.callee_resolver(move |id| if id == callee.id() { callee.entry_address() } else { None })
        });
        let caller = Method::new(MethodId(1), "call_add", MethodFlags::empty(), |tier: Tier| {
            Ok::<_, CompileError>(samples::call_add(tier))
        });

        h.scheduler
            .compile_synchronously(&callee, CompilationDirective::Optimize)
            .unwrap();
        let code = h
            .scheduler
            .compile_synchronously(&caller, CompilationDirective::Optimize)
            .unwrap();

        let sites = code.call_site_offsets();
        assert_eq!(sites.len(), 1);
        assert_eq!(code.call_site_callee(sites[0]), Some(callee.id()));
        assert_eq!(code.call_site_state(sites[0]), Some(CallSiteState::Patched));
        assert_eq!(code.call_site_target(sites[0]), callee.entry_address());
    }

    #[test]
    fn test_calls_to_uncompiled_callees_stay_on_the_trampoline() {
        let h = harness_with(JitConfig::default(), Faults::default(), |b| b.callee_resolver(|_| None));
        let caller = Method::new(MethodId(1), "call_add", MethodFlags::empty(), |tier: Tier| {
            Ok::<_, CompileError>(samples::call_add(tier))
        });
        let code = h
            .scheduler
            .compile_synchronously(&caller, CompilationDirective::Optimize)
            .unwrap();
        let sites = code.call_site_offsets();
        assert_eq!(code.call_site_state(sites[0]), Some(CallSiteState::Unpatched));
    }

    #[test]
    fn test_invocation_threshold_triggers_reoptimization() {
        let h = harness_with(
            JitConfig {
                recompilation_threshold: 3,
                ..JitConfig::default()
            },
            Faults::default(),
            |b| b,
        );
        let method = add_method(MethodFlags::empty());
        h.scheduler
            .compile_synchronously(&method, CompilationDirective::Default)
            .unwrap();

        assert!(h.scheduler.notify_invocations(&method, 2).is_none());
        let handle = h.scheduler.notify_invocations(&method, 3).unwrap();
        assert_eq!(handle.wait().unwrap().tier(), Tier::Optimized);
        assert_eq!(method.current_tier(), Some(Tier::Optimized));
        assert!(h.scheduler.notify_invocations(&method, 4).is_none());
        assert_eq!(h.optimized_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invocation_threshold_ignored_outside_mixed_mode() {
        let h = harness_with(
            JitConfig {
                mode: CompilationMode::Baseline,
                recompilation_threshold: 1,
                ..JitConfig::default()
            },
            Faults::default(),
            |b| b,
        );
        let method = add_method(MethodFlags::empty());
        assert!(h.scheduler.notify_invocations(&method, 100).is_none());
        assert!(!method.is_compiling());
    }

    #[test]
    fn test_unsupported_at_baseline_retries_optimized() {
        let h = harness();
        let method = native_call_method();
        let target = h
            .scheduler
            .compile_synchronously(&method, CompilationDirective::Baseline)
            .unwrap();
        assert_eq!(target.tier(), Tier::Optimized);
        assert_eq!(h.baseline_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.optimized_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.stats().retries, 1);
    }

    #[test]
    fn test_resource_errors_evict_and_retry_once() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evictions);
        let full = CompileError::CodeCacheFull {
            requested: 64,
            available: 0,
        };
        let h = harness_with(
            JitConfig::default(),
            Faults {
                baseline_first: Some(full.clone()),
                optimized_always: Some(full),
                ..Faults::default()
            },
            move |b| {
                b.eviction_hook(move |_err| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            },
        );
        let method = add_method(MethodFlags::empty());

        h.scheduler
            .compile_synchronously(&method, CompilationDirective::Baseline)
            .unwrap();
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(h.baseline_calls.load(Ordering::SeqCst), 2);

        let err = h
            .scheduler
            .compile_synchronously(&method, CompilationDirective::Optimize)
            .unwrap_err();
        assert!(err.is_resource());
        assert_eq!(evictions.load(Ordering::SeqCst), 2);
        assert_eq!(h.optimized_calls.load(Ordering::SeqCst), 2);
        // The method keeps running its baseline code.
        assert_eq!(method.current_tier(), Some(Tier::Baseline));
        assert_eq!(h.scheduler.stats().failed, 1);
    }

    #[test]
    fn test_panicking_compile_fails_only_its_request() {
        let h = harness();
        let broken = Method::new(MethodId(9), "broken", MethodFlags::empty(), |_tier: Tier| -> Result<MethodLir, CompileError> {
            panic!("front end bug")
        });
        let handle = h
            .scheduler
            .compile_asynchronously(&broken, CompilationDirective::Default)
            .unwrap();
        assert!(matches!(
            handle.wait(),
            Err(CompileError::Internal(message)) if message.contains("front end bug")
        ));

        let method = add_method(MethodFlags::empty());
        let next = h
            .scheduler
            .compile_asynchronously(&method, CompilationDirective::Default)
            .unwrap();
        assert!(next.wait().is_ok());
        // A failed request is not cached; asking again compiles again.
        assert!(broken.result_for(CompilationDirective::Default).is_none());
    }

    #[test]
    fn test_hierarchy_lock_is_read_held_during_compile() {
        let lock = Arc::new(RwLock::new(()));
        let h = harness_with(JitConfig::default(), Faults::default(), {
            let lock = Arc::clone(&lock);
            move |b| b.hierarchy_lock(lock)
        });
        let method = add_method(MethodFlags::empty());

        let writer = lock.write().unwrap();
        let handle = h
            .scheduler
            .compile_asynchronously(&method, CompilationDirective::Default)
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_done());
        drop(writer);
        assert!(handle.wait().is_ok());
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CompilationObserver for Recorder {
        fn before_compilation(&self, method: &Method, directive: CompilationDirective, tier: Tier) {
            self.events
                .lock()
                .unwrap()
                .push(format!("before {} {directive} {tier}", method.name()));
        }

        fn after_compilation(&self, method: &Method, _directive: CompilationDirective, result: &CompilationResult) {
            self.events
                .lock()
                .unwrap()
                .push(format!("after {} ok={}", method.name(), result.is_ok()));
        }
    }

    #[test]
    fn test_observers_see_each_compilation() {
        let h = harness();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn CompilationObserver> = recorder.clone();
        h.scheduler.add_observer(Arc::clone(&observer));

        let method = add_method(MethodFlags::empty());
        h.scheduler
            .compile_synchronously(&method, CompilationDirective::Default)
            .unwrap();
        h.scheduler.remove_observer(&observer);
        h.scheduler
            .compile_synchronously(&method, CompilationDirective::Optimize)
            .unwrap();

        assert_eq!(
            recorder.events.lock().unwrap().as_slice(),
            &["before add default baseline".to_string(), "after add ok=true".to_string()]
        );
    }
}
