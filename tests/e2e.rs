//! Compiles methods, installs them and runs the generated code.

#![cfg(all(target_arch = "x86_64", unix))]

use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use lirjit::jit::lir::{ArithOp, Block, FrameLayout, LirList, LirOp, MethodId, MethodLir};
use lirjit::jit::operand::{Address, Kind, Operand, Scale};
use lirjit::jit::runtime_calls::{RuntimeCall, RuntimeCallTable};
use lirjit::jit::x86_64::regs;
use lirjit::samples;
use lirjit::{
    AdaptiveScheduler, CompilationDirective, CompileError, EntryKind, JitConfig, Method, MethodFlags,
    TargetMethod, Tier,
};

type IntFn = extern "C" fn(i32, i32) -> i32;
type LongFn = extern "C" fn(i64, i64) -> i64;

fn scheduler() -> AdaptiveScheduler {
    AdaptiveScheduler::new(JitConfig {
        code_cache_size: 1 << 20,
        ..JitConfig::default()
    })
    .unwrap()
}

fn int_fn(entry: usize) -> IntFn {
    unsafe { std::mem::transmute::<usize, IntFn>(entry) }
}

fn long_fn(entry: usize) -> LongFn {
    unsafe { std::mem::transmute::<usize, LongFn>(entry) }
}

fn sample_method(name: &str, id: u32) -> Arc<Method> {
    samples::find(name).unwrap().method(MethodId(id))
}

#[test]
fn test_add_baseline_then_reoptimize() {
    let scheduler = scheduler();
    let method = sample_method("add", 0);

    let baseline = scheduler
        .compile_synchronously(&method, CompilationDirective::Default)
        .unwrap();
    assert_eq!(baseline.tier(), Tier::Baseline);
    assert_eq!(int_fn(method.entry_address().unwrap())(2, 3), 5);

    let optimized = scheduler
        .reoptimize(&method, CompilationDirective::Default, true)
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(optimized.tier(), Tier::Optimized);
    assert_ne!(optimized.id(), baseline.id());
    assert_ne!(optimized.code_start(), baseline.code_start());

    let entry = method.entry_address().unwrap();
    assert_eq!(entry, optimized.entry_address(EntryKind::Optimized));
    assert_eq!(int_fn(entry)(40, 2), 42);

    // The superseded artifact is still mapped and callable.
    assert_eq!(int_fn(baseline.entry_address(EntryKind::Optimized))(-1, 1), 0);
    assert_eq!(int_fn(baseline.entry_address(EntryKind::Baseline))(7, 8), 15);
}

/// Adds at the baseline tier and subtracts when optimized, so a call shows
/// which artifact actually ran.
fn tier_revealing_method() -> Arc<Method> {
    Method::new(MethodId(5), "reveal", MethodFlags::empty(), |tier: Tier| {
        let op = match tier {
            Tier::Baseline => ArithOp::Add,
            Tier::Optimized => ArithOp::Sub,
        };
        let mut lir = LirList::new();
        lir.append(LirOp::StdEntry)
            .append(LirOp::Arith {
                op,
                left: Operand::register(regs::RDI, Kind::Int),
                right: Operand::register(regs::RSI, Kind::Int),
                result: Operand::register(regs::RAX, Kind::Int),
            })
            .append(LirOp::Return {
                value: Operand::register(regs::RAX, Kind::Int),
            });
        Ok::<_, CompileError>(MethodLir {
            name: "reveal".to_string(),
            blocks: vec![Block::new(0).with_lir(lir)],
            frame: FrameLayout::new(0),
        })
    })
}

#[test]
fn test_forwarded_entries_run_newer_code() {
    let scheduler = scheduler();
    let method = tier_revealing_method();

    let old = scheduler
        .compile_synchronously(&method, CompilationDirective::Baseline)
        .unwrap();
    let old_entry = old.entry_address(EntryKind::Optimized);
    let old_interop = old.entry_address(EntryKind::Baseline);
    assert_eq!(int_fn(old_entry)(10, 3), 13);

    let new = scheduler
        .reoptimize(&method, CompilationDirective::Default, true)
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(old.forwarded_to(), Some(new.id()));

    assert_eq!(int_fn(old_entry)(10, 3), 7);
    assert_eq!(int_fn(old_interop)(10, 3), 7);
    assert_eq!(int_fn(new.entry_address(EntryKind::Optimized))(10, 3), 7);
}

#[test]
fn test_direct_call_linking_and_forwarding() {
    let scheduler = scheduler();
    let callee = tier_revealing_method();
    let caller = sample_method("call_add", 1);

    let callee_baseline = scheduler
        .compile_synchronously(&callee, CompilationDirective::Baseline)
        .unwrap();
    let caller_code = scheduler
        .compile_synchronously(&caller, CompilationDirective::Optimize)
        .unwrap();

    let sites = caller_code.call_site_offsets();
    assert_eq!(sites.len(), 1);
    caller_code
        .patch_call_site(sites[0], callee_baseline.entry_address(EntryKind::Optimized))
        .unwrap();
    let call = int_fn(caller.entry_address().unwrap());
    assert_eq!(call(20, 5), 25);

    // Promoting the callee redirects the already linked call without
    // touching the caller.
    scheduler
        .reoptimize(&callee, CompilationDirective::Default, true)
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(call(20, 5), 15);
}

fn compile_at(scheduler: &AdaptiveScheduler, name: &str, tier: Tier) -> (Arc<Method>, Arc<TargetMethod>) {
    let method = sample_method(name, 0);
    let directive = match tier {
        Tier::Baseline => CompilationDirective::Baseline,
        Tier::Optimized => CompilationDirective::Optimize,
    };
    let target = scheduler.compile_synchronously(&method, directive).unwrap();
    assert_eq!(target.tier(), tier);
    (method, target)
}

#[test]
fn test_min_divided_by_minus_one_on_both_paths() {
    let scheduler = scheduler();
    for tier in [Tier::Baseline, Tier::Optimized] {
        let (_idiv_method, idiv) = compile_at(&scheduler, "idiv", tier);
        let (_irem_method, irem) = compile_at(&scheduler, "irem", tier);
        let (_ldiv_method, ldiv) = compile_at(&scheduler, "ldiv", tier);
        let (_lrem_method, lrem) = compile_at(&scheduler, "lrem", tier);

        let idiv = int_fn(idiv.entry_address(EntryKind::Optimized));
        let irem = int_fn(irem.entry_address(EntryKind::Optimized));
        let ldiv = long_fn(ldiv.entry_address(EntryKind::Optimized));
        let lrem = long_fn(lrem.entry_address(EntryKind::Optimized));

        assert_eq!(idiv(i32::MIN, -1), i32::MIN, "{tier} int divide");
        assert_eq!(irem(i32::MIN, -1), 0, "{tier} int remainder");
        assert_eq!(ldiv(i64::MIN, -1), i64::MIN, "{tier} long divide");
        assert_eq!(lrem(i64::MIN, -1), 0, "{tier} long remainder");

        assert_eq!(idiv(-7, 2), -3);
        assert_eq!(irem(-7, 2), -1);
        assert_eq!(ldiv(1 << 40, -4), -(1 << 38));
        assert_eq!(lrem(7, -2), 1);
    }
}

#[test]
fn test_long_samples_keep_full_width() {
    let scheduler = scheduler();
    let (_method, ldiv) = compile_at(&scheduler, "ldiv", Tier::Optimized);
    assert_eq!(samples::find("ldiv").map(|s| s.kind), Some(Kind::Long));
    assert_eq!(long_fn(ldiv.entry_address(EntryKind::Optimized))(i64::MAX, 1), i64::MAX);
}

#[test]
fn test_retired_code_is_not_reused() {
    let scheduler = scheduler();
    let method = tier_revealing_method();

    let old = scheduler
        .compile_synchronously(&method, CompilationDirective::Default)
        .unwrap();
    assert_eq!(old.tier(), Tier::Baseline);
    let old_entry = old.entry_address(EntryKind::Optimized);
    drop(old);
    scheduler
        .reoptimize(&method, CompilationDirective::Default, true)
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(method.retired_count(), 1);

    // No handle to the baseline artifact is left outside the method, and
    // fresh code is allocated after it was superseded.
    let (_idiv_method, idiv) = compile_at(&scheduler, "idiv", Tier::Optimized);
    assert_eq!(idiv.offset_of(old_entry), None);
    assert_eq!(int_fn(old_entry)(10, 3), 7);
    assert_eq!(int_fn(idiv.entry_address(EntryKind::Optimized))(10, 3), 3);
}

#[test]
fn test_resolver_links_callee_compiled_first() {
    let callee = sample_method("add", 0);
    let scheduler = AdaptiveScheduler::builder(JitConfig {
        code_cache_size: 1 << 20,
        ..JitConfig::default()
    })
    .callee_resolver({
        let callee = Arc::clone(&callee);
        move |id| if id == callee.id() { callee.entry_address() } else { None }
    })
    .build()
    .unwrap();
    let caller = sample_method("call_add", 5);

    scheduler
        .compile_synchronously(&callee, CompilationDirective::Baseline)
        .unwrap();
    scheduler
        .compile_synchronously(&caller, CompilationDirective::Optimize)
        .unwrap();
    let call = int_fn(caller.entry_address().unwrap());
    assert_eq!(call(20, 5), 25);

    // Still right once the callee it was linked to is superseded.
    scheduler
        .reoptimize(&callee, CompilationDirective::Default, true)
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(call(-20, 5), -15);
}

/// Array layout the generated code expects: hub word, 32-bit length, then
/// elements from offset 16.
#[repr(C, align(8))]
struct IntArray {
    hub: u64,
    length: i32,
    padding: i32,
    elements: [i32; 4],
}

impl IntArray {
    fn new(elements: [i32; 4]) -> Self {
        IntArray {
            hub: 0x1000,
            length: elements.len() as i32,
            padding: 0,
            elements,
        }
    }
}

type ElementAtFn = extern "C" fn(*const IntArray, i64) -> i32;

/// `int element_at(int[] array, int index) { return array[index]; }`
fn element_at_method(runtime: RuntimeCallTable) -> (AdaptiveScheduler, Arc<Method>) {
    let scheduler = AdaptiveScheduler::builder(JitConfig {
        code_cache_size: 1 << 20,
        ..JitConfig::default()
    })
    .runtime(Arc::new(runtime))
    .build()
    .unwrap();
    let method = Method::new(MethodId(6), "element_at", MethodFlags::empty(), |_tier: Tier| {
        let array = Operand::register(regs::RDI, Kind::Object);
        let index = Operand::register(regs::RSI, Kind::Int);
        let mut lir = LirList::new();
        lir.append(LirOp::StdEntry)
            .append(LirOp::NullCheck { object: array })
            .append(LirOp::BoundsCheck { array, index })
            .append(LirOp::Move {
                src: Operand::address(Address::indexed(regs::RDI, regs::RSI, Scale::Times4, 16, Kind::Int)),
                dst: Operand::register(regs::RAX, Kind::Int),
            })
            .append(LirOp::Return {
                value: Operand::register(regs::RAX, Kind::Int),
            });
        Ok::<_, CompileError>(MethodLir {
            name: "element_at".to_string(),
            blocks: vec![Block::new(0).with_lir(lir)],
            frame: FrameLayout::new(0),
        })
    });
    (scheduler, method)
}

fn compile_element_at(scheduler: &AdaptiveScheduler, method: &Arc<Method>) -> ElementAtFn {
    scheduler
        .compile_synchronously(method, CompilationDirective::Optimize)
        .unwrap();
    unsafe { std::mem::transmute::<usize, ElementAtFn>(method.entry_address().unwrap()) }
}

#[test]
fn test_in_bounds_elements_load() {
    let (scheduler, method) = element_at_method(RuntimeCallTable::host());
    let element_at = compile_element_at(&scheduler, &method);
    let array = IntArray::new([10, 20, 30, 40]);
    assert_eq!(array.hub, 0x1000);
    assert_eq!(array.padding, 0);
    for (index, expected) in [(0, 10), (1, 20), (3, 40)] {
        assert_eq!(element_at(&array, index), expected);
    }
}

const OUT_OF_BOUNDS_INDEX: &str = "LIRJIT_E2E_OUT_OF_BOUNDS_INDEX";
const OUT_OF_BOUNDS_EXIT: i32 = 42;

extern "C" fn report_out_of_bounds(index: i32) {
    let _ = writeln!(std::io::stderr(), "index out of bounds: {index}");
    std::process::exit(OUT_OF_BOUNDS_EXIT);
}

/// Runs in a child process: the throw routine never returns.
#[test]
fn test_out_of_bounds_index_throws() {
    if let Ok(index) = std::env::var(OUT_OF_BOUNDS_INDEX) {
        let runtime = RuntimeCallTable::host()
            .with_entry(RuntimeCall::ThrowIndexOutOfBounds, report_out_of_bounds as usize as u64);
        let (scheduler, method) = element_at_method(runtime);
        let element_at = compile_element_at(&scheduler, &method);
        let array = IntArray::new([1, 2, 3, 4]);
        let value = element_at(&array, index.parse().unwrap());
        panic!("index {index} loaded {value}");
    }

    for index in [4i64, 1000, -1] {
        let output = Command::new(std::env::current_exe().unwrap())
            .args(["--exact", "test_out_of_bounds_index_throws", "--nocapture"])
            .env(OUT_OF_BOUNDS_INDEX, index.to_string())
            .output()
            .unwrap();
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(output.status.code(), Some(OUT_OF_BOUNDS_EXIT), "index {index}:\n{stderr}");
        assert!(stderr.contains(&format!("index out of bounds: {index}")), "{stderr}");
    }
}
