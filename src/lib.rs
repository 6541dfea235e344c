//! lirjit - a JIT compilation backend
//!
//! This library lowers register-allocated LIR to x86-64 machine code, packages
//! it with the metadata a managed runtime needs (stop table, reference maps,
//! exception and trap tables) and schedules tiered (re)compilation.

pub mod adaptive;
pub mod config;
pub mod error;
pub mod jit;
pub mod samples;

// Re-export commonly used types
pub use adaptive::{AdaptiveScheduler, CompilationDirective, CompilationHandle, Method, MethodFlags, Tier};
pub use config::{CompilationMode, ConfigError, JitConfig};
pub use error::{CompileError, PatchError};
pub use jit::target_method::{EntryKind, TargetMethod};
