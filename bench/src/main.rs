use std::sync::Arc;
use std::time::Instant;

use lirjit::adaptive::{Compiler, LirCompiler};
use lirjit::jit::code_cache::CodeCache;
use lirjit::jit::lir::MethodId;
use lirjit::jit::runtime_calls::RuntimeCallTable;
use lirjit::samples;
use lirjit::{JitConfig, Tier};
use serde::Serialize;

const ITERATIONS: u32 = 2_000;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    tier: Tier,
    code_size: usize,
    iterations: u32,
    mean_compile_micros: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

fn time_compiles(compiler: &LirCompiler, name: &str, id: MethodId) -> Option<BenchmarkResult> {
    let sample = samples::find(name)?;
    let method = sample.method(id);

    let mut code_size = 0;
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        // Each artifact is dropped right away, which returns its region to the cache.
        match compiler.compile(&method) {
            Ok(target) => code_size = target.code_size(),
            Err(e) => {
                eprintln!("{name} ({}) failed: {e}", compiler.tier());
                return None;
            }
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    Some(BenchmarkResult {
        name: name.to_string(),
        tier: compiler.tier(),
        code_size,
        iterations: ITERATIONS,
        mean_compile_micros: elapsed * 1e6 / f64::from(ITERATIONS),
    })
}

fn main() {
    let config = JitConfig::default();
    let runtime = Arc::new(RuntimeCallTable::host());
    let cache = match CodeCache::new(config.code_cache_size, &runtime) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("cannot reserve the code cache: {e}");
            std::process::exit(1);
        }
    };

    let compilers = [Tier::Baseline, Tier::Optimized]
        .map(|tier| LirCompiler::new(tier, Arc::clone(&cache), Arc::clone(&runtime), &config));

    let mut results = Vec::new();
    for (index, sample) in samples::SAMPLES.iter().enumerate() {
        for compiler in &compilers {
            results.extend(time_compiles(compiler, sample.name, MethodId(index as u32)));
        }
    }

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("cannot serialize results: {e}"),
    }
}
