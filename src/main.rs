use std::path::PathBuf;
use std::process::ExitCode;
#[cfg(all(target_arch = "x86_64", unix))]
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use lirjit::jit::lir::MethodId;
use lirjit::samples::{self, Sample};
#[cfg(all(target_arch = "x86_64", unix))]
use lirjit::{EntryKind, Method};
use lirjit::{AdaptiveScheduler, CompilationDirective, JitConfig, Tier};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum TierArg {
    Baseline,
    #[default]
    Optimized,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Baseline => Tier::Baseline,
            TierArg::Optimized => Tier::Optimized,
        }
    }
}

#[derive(Parser)]
#[command(name = "lirjit")]
#[command(about = "A JIT compilation backend for LIR", long_about = None)]
struct Cli {
    /// JIT configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Trace compilation and dump every installed target method
    #[arg(long, global = true)]
    trace_jit: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in sample methods
    Samples,
    /// Compile a sample and print the resulting target method
    Compile {
        /// Sample name (see `lirjit samples`)
        sample: String,

        /// Compiler tier
        #[arg(long, value_enum, default_value = "optimized")]
        tier: TierArg,

        /// Print a JSON summary instead of the text dump
        #[arg(long)]
        json: bool,

        /// Print the LIR before compiling
        #[arg(long)]
        dump_lir: bool,
    },
    /// Compile a sample at baseline, run it, reoptimize and run it again
    Run {
        /// Sample name (see `lirjit samples`)
        sample: String,

        /// The two arguments
        #[arg(num_args = 2, allow_hyphen_values = true)]
        args: Vec<i64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(trace_jit: bool) {
    let filter = if trace_jit {
        EnvFilter::new("lirjit=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lirjit=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>, trace_jit: bool) -> Result<JitConfig> {
    let mut config = match path {
        Some(path) => JitConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => JitConfig::default(),
    };
    config.trace_jit |= trace_jit;
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref(), cli.trace_jit)?;
    init_tracing(config.trace_jit);

    match cli.command {
        Commands::Samples => {
            for sample in samples::SAMPLES {
                println!("{:<10} {}", sample.name, sample.description);
            }
            Ok(())
        }
        Commands::Compile {
            sample,
            tier,
            json,
            dump_lir,
        } => compile_sample(config, &sample, tier.into(), json, dump_lir),
        Commands::Run { sample, args } => run_sample(config, &sample, args[0], args[1]),
    }
}

fn find_sample(name: &str) -> Result<(MethodId, &'static Sample)> {
    let index = samples::SAMPLES
        .iter()
        .position(|sample| sample.name == name)
        .with_context(|| format!("unknown sample `{name}`; see `lirjit samples`"))?;
    Ok((MethodId(index as u32), &samples::SAMPLES[index]))
}

fn directive_for(tier: Tier) -> CompilationDirective {
    match tier {
        Tier::Baseline => CompilationDirective::Baseline,
        Tier::Optimized => CompilationDirective::Optimize,
    }
}

fn compile_sample(config: JitConfig, name: &str, tier: Tier, json: bool, dump_lir: bool) -> Result<()> {
    let (id, sample) = find_sample(name)?;
    if dump_lir {
        print!("{}", (sample.build)(tier));
    }

    let scheduler = AdaptiveScheduler::new(config)?;
    let method = sample.method(id);
    let target = scheduler.compile_synchronously(&method, directive_for(tier))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&target.summary())?);
    } else {
        print!("{}", target.describe());
    }
    Ok(())
}

/// Every sample as a method, indexed by its id, with a scheduler that
/// links direct calls against whatever the callee has installed.
#[cfg(all(target_arch = "x86_64", unix))]
fn sample_scheduler(config: JitConfig) -> Result<(AdaptiveScheduler, Arc<Vec<Arc<Method>>>)> {
    let methods: Arc<Vec<Arc<Method>>> = Arc::new(
        samples::SAMPLES
            .iter()
            .enumerate()
            .map(|(index, sample)| sample.method(MethodId(index as u32)))
            .collect(),
    );
    let resolver_methods = Arc::clone(&methods);
    let scheduler = AdaptiveScheduler::builder(config)
        .callee_resolver(move |id: MethodId| {
            resolver_methods
                .get(id.0 as usize)
                .and_then(|method| method.entry_address())
        })
        .build()?;
    Ok((scheduler, methods))
}

#[cfg(all(target_arch = "x86_64", unix))]
fn invoke(entry: usize, sample: &Sample, a: i64, b: i64) -> i64 {
    use lirjit::jit::operand::Kind;
    // The samples are compiled for the C calling convention with two
    // arguments of the sample's kind.
    unsafe {
        match sample.kind {
            Kind::Long => {
                let f = std::mem::transmute::<usize, extern "C" fn(i64, i64) -> i64>(entry);
                f(a, b)
            }
            _ => {
                let f = std::mem::transmute::<usize, extern "C" fn(i32, i32) -> i32>(entry);
                f(a as i32, b as i32) as i64
            }
        }
    }
}

#[cfg(all(target_arch = "x86_64", unix))]
fn run_sample(config: JitConfig, name: &str, a: i64, b: i64) -> Result<()> {
    let (id, sample) = find_sample(name)?;
    if b == 0 && (name.ends_with("div") || name.ends_with("rem")) {
        bail!("division by zero needs an exception dispatcher, which the CLI does not install");
    }

    let (scheduler, methods) = sample_scheduler(config)?;
    // Callees first, so the caller's calls are linked when it is installed.
    if let Some(callee) = sample.callee {
        let (callee_id, _) = find_sample(callee)?;
        let callee_method = methods
            .get(callee_id.0 as usize)
            .with_context(|| format!("no method for callee `{callee}`"))?;
        scheduler.compile_synchronously(callee_method, CompilationDirective::Optimize)?;
    }
    let method = methods
        .get(id.0 as usize)
        .with_context(|| format!("no method for `{name}`"))?;

    let baseline = scheduler.compile_synchronously(method, CompilationDirective::Baseline)?;
    let entry = method.entry_address().context("nothing installed after compiling")?;
    println!(
        "baseline  #{:<3} {:#x}: {}",
        baseline.id(),
        entry,
        invoke(entry, sample, a, b)
    );

    let optimized = scheduler
        .reoptimize(method, CompilationDirective::Default, true)
        .context("method was not reoptimized")?
        .wait()?;
    let entry = method.entry_address().context("nothing installed after reoptimizing")?;
    println!(
        "optimized #{:<3} {:#x}: {}",
        optimized.id(),
        entry,
        invoke(entry, sample, a, b)
    );

    // Calls through the superseded entry are forwarded to the new code.
    let old_entry = baseline.entry_address(EntryKind::Optimized);
    println!(
        "forwarded #{:<3} {:#x}: {}",
        baseline.id(),
        old_entry,
        invoke(old_entry, sample, a, b)
    );
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
fn run_sample(_config: JitConfig, _name: &str, _a: i64, _b: i64) -> Result<()> {
    bail!("running compiled code needs an x86-64 unix host")
}
