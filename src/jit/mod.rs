//! Code generation backend.
//!
//! This module turns register-allocated LIR into installed machine code:
//! - Operand model and LIR instruction set
//! - x86-64 machine assembler behind the [`masm::MachineAssembler`] trait
//! - LIR-to-machine-code generator with stop, trap and exception tables
//! - Code cache, target methods and in-place code patching
//!
//! The runtime side (thread locals, runtime entry points, class hierarchy)
//! is reached only through [`runtime_calls::RuntimeCallTable`] and
//! [`target_method::TypeHierarchy`].

pub mod code_cache;
pub mod codebuf;
pub mod codegen;
pub mod lir;
pub mod masm;
pub mod memory;
pub mod operand;
pub mod patch;
pub mod refmap;
pub mod runtime_calls;
pub mod target_method;
pub mod x86_64;

/// Assembler for the machine this process runs on.
pub type HostAssembler = x86_64::X86_64Assembler;
