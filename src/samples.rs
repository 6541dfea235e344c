//! Built-in sample methods, already lowered to LIR.
//!
//! Used by the CLI, the benchmarks and the integration tests. All samples
//! take two arguments of the same kind in the first two integer argument
//! registers and return in `rax`.

use std::sync::Arc;

use crate::adaptive::{Method, MethodFlags, Tier};
use crate::error::CompileError;
use crate::jit::lir::{ArithOp, Block, DebugInfo, FrameLayout, LirList, LirOp, MethodId, MethodLir};
use crate::jit::operand::{Kind, Operand};
use crate::jit::x86_64::regs;

pub struct Sample {
    pub name: &'static str,
    pub description: &'static str,
    /// Kind of both arguments and of the result.
    pub kind: Kind,
    /// Sample whose code this one calls directly.
    pub callee: Option<&'static str>,
    pub build: fn(Tier) -> MethodLir,
}

impl Sample {
    /// A schedulable method whose LIR comes from this sample.
    pub fn method(&self, id: MethodId) -> Arc<Method> {
        let build = self.build;
        Method::new(id, self.name, MethodFlags::empty(), move |tier: Tier| {
            Ok::<_, CompileError>(build(tier))
        })
    }
}

pub const SAMPLES: &[Sample] = &[
    Sample {
        name: "add",
        description: "int add(int a, int b) { return a + b; }",
        kind: Kind::Int,
        callee: None,
        build: add,
    },
    Sample {
        name: "idiv",
        description: "int div(int a, int b) { return a / b; }",
        kind: Kind::Int,
        callee: None,
        build: int_divide,
    },
    Sample {
        name: "irem",
        description: "int rem(int a, int b) { return a % b; }",
        kind: Kind::Int,
        callee: None,
        build: int_remainder,
    },
    Sample {
        name: "ldiv",
        description: "long div(long a, long b) { return a / b; }",
        kind: Kind::Long,
        callee: None,
        build: long_divide,
    },
    Sample {
        name: "lrem",
        description: "long rem(long a, long b) { return a % b; }",
        kind: Kind::Long,
        callee: None,
        build: long_remainder,
    },
    Sample {
        name: "call_add",
        description: "int f(int a, int b) { return add(a, b); }",
        kind: Kind::Int,
        callee: Some("add"),
        build: call_add,
    },
];

pub fn find(name: &str) -> Option<&'static Sample> {
    SAMPLES.iter().find(|sample| sample.name == name)
}

fn reg(register: crate::jit::operand::Register, kind: Kind) -> Operand {
    Operand::register(register, kind)
}

fn single_block(name: &str, body: Vec<LirOp>, kind: Kind) -> MethodLir {
    let mut lir = LirList::new();
    lir.append(LirOp::StdEntry);
    for op in body {
        lir.append(op);
    }
    lir.append(LirOp::Return {
        value: reg(regs::RAX, kind),
    });
    MethodLir {
        name: name.to_string(),
        blocks: vec![Block::new(0).with_lir(lir)],
        frame: FrameLayout::new(0),
    }
}

fn binary(name: &str, op: ArithOp, kind: Kind) -> MethodLir {
    single_block(
        name,
        vec![LirOp::Arith {
            op,
            left: reg(regs::RDI, kind),
            right: reg(regs::RSI, kind),
            result: reg(regs::RAX, kind),
        }],
        kind,
    )
}

/// `int add(int a, int b) { return a + b; }`. Same LIR at every tier.
pub fn add(_tier: Tier) -> MethodLir {
    binary("add", ArithOp::Add, Kind::Int)
}

pub fn int_divide(_tier: Tier) -> MethodLir {
    binary("idiv", ArithOp::Div, Kind::Int)
}

pub fn int_remainder(_tier: Tier) -> MethodLir {
    binary("irem", ArithOp::Rem, Kind::Int)
}

pub fn long_divide(_tier: Tier) -> MethodLir {
    binary("ldiv", ArithOp::Div, Kind::Long)
}

pub fn long_remainder(_tier: Tier) -> MethodLir {
    binary("lrem", ArithOp::Rem, Kind::Long)
}

/// Calls `add` (method 0) with its own arguments. The call site starts out
/// at the resolution trampoline and has to be linked before running.
pub fn call_add(_tier: Tier) -> MethodLir {
    let mut lir = LirList::new();
    lir.append(LirOp::StdEntry);
    lir.append_with_info(
        LirOp::DirectCall {
            callee: MethodId(0),
            result: reg(regs::RAX, Kind::Int),
        },
        DebugInfo::new(0, Vec::new()),
    );
    lir.append(LirOp::Return {
        value: reg(regs::RAX, Kind::Int),
    });
    MethodLir {
        name: "call_add".to_string(),
        blocks: vec![Block::new(0).with_lir(lir)],
        frame: FrameLayout::new(0),
    }
}
