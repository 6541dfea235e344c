//! Low-level IR: instructions, per-block lists and the block graph handed to
//! the code generator.
//!
//! Operands are already in their final locations when LIR reaches this crate;
//! a `Variable` surviving to emission is a bug in the allocator.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use super::operand::{Kind, ObjectRef, Operand, Register};
use super::runtime_calls::RuntimeCall;
use crate::error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Identity of a method known to the resolution service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Identity of a class, used as an exception catch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        /// Target of a loop back edge; aligned before emission.
        const BACKWARD_BRANCH_TARGET = 1 << 0;
        /// Entered by the exception dispatcher.
        const EXCEPTION_ENTRY = 1 << 1;
    }
}

/// Branch condition. Signed forms for integers, unsigned forms for words and
/// for the flags produced by floating-point compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
}

impl Condition {
    pub fn negate(self) -> Self {
        match self {
            Condition::Always => Condition::Always,
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Less => Condition::GreaterEqual,
            Condition::LessEqual => Condition::Greater,
            Condition::Greater => Condition::LessEqual,
            Condition::GreaterEqual => Condition::Less,
            Condition::Below => Condition::AboveEqual,
            Condition::BelowEqual => Condition::Above,
            Condition::Above => Condition::BelowEqual,
            Condition::AboveEqual => Condition::Below,
        }
    }

    /// The unsigned condition testing the same relation, for float compares.
    pub fn to_unsigned(self) -> Self {
        match self {
            Condition::Less => Condition::Below,
            Condition::LessEqual => Condition::BelowEqual,
            Condition::Greater => Condition::Above,
            Condition::GreaterEqual => Condition::AboveEqual,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl ArithOp {
    pub fn is_commutative(self) -> bool {
        matches!(self, ArithOp::Add | ArithOp::Mul)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Sar,
    Shr,
}

/// One exception edge leaving a program point.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionEdge {
    pub handler: BlockId,
    /// `None` catches everything.
    pub catch_type: Option<ClassId>,
    /// Code run before entering the handler block; must end in a branch.
    pub adapter: Option<LirList>,
}

impl ExceptionEdge {
    pub fn new(handler: BlockId, catch_type: Option<ClassId>) -> Self {
        ExceptionEdge {
            handler,
            catch_type,
            adapter: None,
        }
    }
}

/// Live state at a program point that may safepoint or throw.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DebugInfo {
    pub bci: u32,
    pub live_values: Vec<Operand>,
    pub exception_edges: Vec<ExceptionEdge>,
}

impl DebugInfo {
    pub fn new(bci: u32, live_values: Vec<Operand>) -> Arc<Self> {
        Arc::new(DebugInfo {
            bci,
            live_values,
            exception_edges: Vec::new(),
        })
    }

    pub fn with_handlers(bci: u32, live_values: Vec<Operand>, edges: Vec<ExceptionEdge>) -> Arc<Self> {
        Arc::new(DebugInfo {
            bci,
            live_values,
            exception_edges: edges,
        })
    }

    pub fn has_handlers(&self) -> bool {
        !self.exception_edges.is_empty()
    }

    /// Frame slots holding live references.
    pub fn reference_slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.live_values.iter().filter_map(|v| match v {
            Operand::StackSlot {
                index,
                kind: Kind::Object,
            } => Some(*index),
            _ => None,
        })
    }

    /// Registers holding live references.
    pub fn reference_registers(&self) -> impl Iterator<Item = Register> + '_ {
        self.live_values.iter().filter_map(|v| match v {
            Operand::Register {
                reg,
                kind: Kind::Object,
            } => Some(*reg),
            _ => None,
        })
    }
}

/// The closed set of LIR operations.
#[derive(Debug, Clone, PartialEq)]
pub enum LirOp {
    /// Build the frame and save the callee-save area.
    StdEntry,
    Move { src: Operand, dst: Operand },
    Lea { address: Operand, result: Operand },
    Arith { op: ArithOp, left: Operand, right: Operand, result: Operand },
    Logic { op: LogicOp, left: Operand, right: Operand, result: Operand },
    Shift { op: ShiftOp, value: Operand, count: Operand, result: Operand },
    Negate { value: Operand, result: Operand },
    Compare { left: Operand, right: Operand },
    Branch { cond: Condition, target: BlockId },
    Return { value: Operand },
    DirectCall { callee: MethodId, result: Operand },
    /// Call through a register or a dispatch-table slot.
    IndirectCall { callee: MethodId, target: Operand, result: Operand },
    /// Call unmanaged code at a fixed address.
    NativeCall { function: u64, result: Operand },
    RuntimeCall { call: RuntimeCall, result: Operand },
    NullCheck { object: Operand },
    Safepoint,
    Throw { exception: Operand },
    NewInstance { hub: ObjectRef, size: u32, result: Operand },
    /// Allocate an array of `length` elements of kind `element`.
    NewArray { hub: ObjectRef, element: Kind, length: Operand, result: Operand },
    /// Throw unless `0 <= index < array.length`. The array must not be null,
    /// or be null-checked by an immediately preceding `NullCheck`.
    BoundsCheck { array: Operand, index: Operand },
    CheckCast { object: Operand, hub: ObjectRef },
    Membar,
}

impl LirOp {
    pub fn name(&self) -> &'static str {
        match self {
            LirOp::StdEntry => "std_entry",
            LirOp::Move { .. } => "move",
            LirOp::Lea { .. } => "lea",
            LirOp::Arith { op, .. } => match op {
                ArithOp::Add => "add",
                ArithOp::Sub => "sub",
                ArithOp::Mul => "mul",
                ArithOp::Div => "div",
                ArithOp::Rem => "rem",
            },
            LirOp::Logic { op, .. } => match op {
                LogicOp::And => "and",
                LogicOp::Or => "or",
                LogicOp::Xor => "xor",
            },
            LirOp::Shift { op, .. } => match op {
                ShiftOp::Shl => "shl",
                ShiftOp::Sar => "sar",
                ShiftOp::Shr => "shr",
            },
            LirOp::Negate { .. } => "neg",
            LirOp::Compare { .. } => "cmp",
            LirOp::Branch { .. } => "branch",
            LirOp::Return { .. } => "return",
            LirOp::DirectCall { .. } => "direct_call",
            LirOp::IndirectCall { .. } => "indirect_call",
            LirOp::NativeCall { .. } => "native_call",
            LirOp::RuntimeCall { .. } => "runtime_call",
            LirOp::NullCheck { .. } => "null_check",
            LirOp::Safepoint => "safepoint",
            LirOp::Throw { .. } => "throw",
            LirOp::NewInstance { .. } => "new_instance",
            LirOp::NewArray { .. } => "new_array",
            LirOp::BoundsCheck { .. } => "bounds_check",
            LirOp::CheckCast { .. } => "checkcast",
            LirOp::Membar => "membar",
        }
    }

    /// Input operands, in operand order.
    pub fn inputs(&self) -> Vec<Operand> {
        match self {
            LirOp::Move { src, .. } => vec![*src],
            LirOp::Lea { address, .. } => vec![*address],
            LirOp::Arith { left, right, .. } | LirOp::Logic { left, right, .. } => vec![*left, *right],
            LirOp::Shift { value, count, .. } => vec![*value, *count],
            LirOp::Negate { value, .. } => vec![*value],
            LirOp::Compare { left, right } => vec![*left, *right],
            LirOp::Return { value } => vec![*value],
            LirOp::IndirectCall { target, .. } => vec![*target],
            LirOp::NullCheck { object } | LirOp::CheckCast { object, .. } => vec![*object],
            LirOp::Throw { exception } => vec![*exception],
            LirOp::NewArray { length, .. } => vec![*length],
            LirOp::BoundsCheck { array, index } => vec![*array, *index],
            LirOp::StdEntry
            | LirOp::Branch { .. }
            | LirOp::DirectCall { .. }
            | LirOp::NativeCall { .. }
            | LirOp::RuntimeCall { .. }
            | LirOp::Safepoint
            | LirOp::NewInstance { .. }
            | LirOp::Membar => Vec::new(),
        }
    }

    /// Result operand, `Illegal` if the operation defines none.
    pub fn result(&self) -> Operand {
        match self {
            LirOp::Move { dst, .. } => *dst,
            LirOp::Lea { result, .. }
            | LirOp::Arith { result, .. }
            | LirOp::Logic { result, .. }
            | LirOp::Shift { result, .. }
            | LirOp::Negate { result, .. }
            | LirOp::DirectCall { result, .. }
            | LirOp::IndirectCall { result, .. }
            | LirOp::NativeCall { result, .. }
            | LirOp::RuntimeCall { result, .. }
            | LirOp::NewInstance { result, .. }
            | LirOp::NewArray { result, .. } => *result,
            _ => Operand::ILLEGAL,
        }
    }

    pub fn is_unconditional_branch(&self) -> bool {
        matches!(
            self,
            LirOp::Branch {
                cond: Condition::Always,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LirInstruction {
    pub op: LirOp,
    pub info: Option<Arc<DebugInfo>>,
}

impl fmt::Display for LirInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op.name())?;
        match &self.op {
            LirOp::Branch { cond, target } => write!(f, " {cond:?} {target}")?,
            LirOp::DirectCall { callee, .. } | LirOp::IndirectCall { callee, .. } => {
                write!(f, " {callee}")?
            }
            LirOp::NativeCall { function, .. } => write!(f, " {function:#x}")?,
            LirOp::RuntimeCall { call, .. } => write!(f, " {call:?}")?,
            LirOp::NewInstance { hub, size, .. } => write!(f, " hub@{:#x} size={size}", hub.0)?,
            LirOp::NewArray { hub, element, .. } => write!(f, " hub@{:#x} {element:?}[]", hub.0)?,
            LirOp::CheckCast { hub, .. } => write!(f, " hub@{:#x}", hub.0)?,
            _ => {}
        }
        for (i, input) in self.op.inputs().iter().enumerate() {
            write!(f, "{}{input}", if i == 0 { " " } else { ", " })?;
        }
        let result = self.op.result();
        if !result.is_illegal() {
            write!(f, " -> {result}")?;
        }
        if let Some(info) = &self.info {
            write!(f, " [bci={}]", info.bci)?;
        }
        Ok(())
    }
}

/// Ordered instructions of one block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LirList {
    instructions: Vec<LirInstruction>,
}

impl LirList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, op: LirOp) -> &mut Self {
        self.instructions.push(LirInstruction { op, info: None });
        self
    }

    pub fn append_with_info(&mut self, op: LirOp, info: Arc<DebugInfo>) -> &mut Self {
        self.instructions.push(LirInstruction {
            op,
            info: Some(info),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> &[LirInstruction] {
        &self.instructions
    }

    pub fn last(&self) -> Option<&LirInstruction> {
        self.instructions.last()
    }

    /// Check the block-shape invariants the code generator depends on.
    pub fn verify(&self, block: &Block) -> Result<(), CompileError> {
        let Some(last) = self.instructions.last() else {
            return Err(CompileError::internal(format!("{} has no instructions", block.id)));
        };

        for (i, insn) in self.instructions.iter().enumerate() {
            match &insn.op {
                LirOp::Branch { target, .. } if !block.successors.contains(target) => {
                    return Err(CompileError::internal(format!(
                        "{} branches to {target}, which is not a successor",
                        block.id
                    )));
                }
                LirOp::Throw { .. } if i + 1 != self.instructions.len() => {
                    return Err(CompileError::internal(format!(
                        "{}: throw at index {i} is not the last instruction",
                        block.id
                    )));
                }
                _ => {}
            }
        }

        let terminated = if block.successors.is_empty() {
            matches!(last.op, LirOp::Return { .. } | LirOp::Throw { .. })
        } else {
            last.op.is_unconditional_branch()
        };
        if !terminated {
            return Err(CompileError::internal(format!(
                "{} ends with {} instead of a terminator",
                block.id,
                last.op.name()
            )));
        }
        Ok(())
    }

    /// Run the look-back peephole over this list; returns how many instructions were removed.
    ///
    /// `next_block` is the block emitted right after this one.
    pub fn peephole(&mut self, next_block: Option<BlockId>) -> usize {
        let before = self.instructions.len();
        let mut out: Vec<LirInstruction> = Vec::with_capacity(before);

        for insn in self.instructions.drain(..) {
            if let LirOp::Move { src, dst } = &insn.op {
                if src == dst && insn.info.is_none() {
                    continue;
                }
                if let Some(LirInstruction {
                    op: LirOp::Move { src: prev_src, dst: prev_dst },
                    ..
                }) = out.last()
                    && prev_src == dst
                    && prev_dst == src
                    && src.is_register()
                    && dst.is_register()
                    && insn.info.is_none()
                {
                    continue;
                }
            }
            out.push(insn);
        }

        if let (Some(next), Some(last)) = (next_block, out.last())
            && let LirOp::Branch {
                cond: Condition::Always,
                target,
            } = last.op
            && target == next
        {
            out.pop();
        }

        self.instructions = out;
        before - self.instructions.len()
    }
}

impl fmt::Display for LirList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, insn) in self.instructions.iter().enumerate() {
            writeln!(f, "  {i:3}: {insn}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub flags: BlockFlags,
    pub lir: LirList,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
}

impl Block {
    pub fn new(id: u32) -> Self {
        Block {
            id: BlockId(id),
            flags: BlockFlags::empty(),
            lir: LirList::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: BlockFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_successors(mut self, successors: &[u32]) -> Self {
        self.successors = successors.iter().map(|s| BlockId(*s)).collect();
        self
    }

    pub fn with_lir(mut self, lir: LirList) -> Self {
        self.lir = lir;
        self
    }

    pub fn is_exception_entry(&self) -> bool {
        self.flags.contains(BlockFlags::EXCEPTION_ENTRY)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if !self.flags.is_empty() {
            write!(f, " {:?}", self.flags)?;
        }
        if !self.successors.is_empty() {
            let succs: Vec<String> = self.successors.iter().map(|s| s.to_string()).collect();
            write!(f, " -> {}", succs.join(", "))?;
        }
        writeln!(f)?;
        write!(f, "{}", self.lir)
    }
}

/// Frame shape chosen by the register allocator.
///
/// Stack slot `i` lives at `sp + 8 * i`; the callee-save area follows the
/// spill slots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameLayout {
    pub stack_slots: u32,
    pub callee_saved: Vec<Register>,
}

impl FrameLayout {
    pub fn new(stack_slots: u32) -> Self {
        FrameLayout {
            stack_slots,
            callee_saved: Vec::new(),
        }
    }

    /// Bytes reserved below the saved frame pointer, kept 16-byte aligned.
    pub fn frame_size(&self) -> u32 {
        let words = self.stack_slots + self.callee_saved.len() as u32;
        (words * 8 + 15) & !15
    }

    pub fn frame_words(&self) -> u32 {
        self.frame_size() / 8
    }

    pub fn stack_slot_offset(&self, index: u32) -> i32 {
        (index * 8) as i32
    }

    pub fn callee_save_offset(&self, position: usize) -> i32 {
        ((self.stack_slots as usize + position) * 8) as i32
    }
}

/// A method ready for emission: blocks in emission order plus the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodLir {
    pub name: String,
    pub blocks: Vec<Block>,
    pub frame: FrameLayout,
}

impl fmt::Display for MethodLir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "method {} (frame {} bytes)", self.name, self.frame.frame_size())?;
        for block in &self.blocks {
            write!(f, "{block}")?;
        }
        Ok(())
    }
}
