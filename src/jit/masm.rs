//! The instruction-emission capability set the code generator relies on.
//!
//! One implementation exists per target architecture; the code generator is
//! generic over it so dispatch is resolved at compile time.

use super::codebuf::Label;
use super::lir::{ArithOp, Condition, FrameLayout, LogicOp, ShiftOp};
use super::operand::{Address, Constant, Kind, Register, Scale};
use crate::error::CompileError;

/// Layout of the per-thread block addressed through the thread register.
pub mod thread_locals {
    /// Holds the thread-locals pointer itself; the runtime swaps it to a
    /// protected page to trigger safepoints.
    pub const SAFEPOINT_LATCH: i32 = 0;
    /// Return address of the last call out of managed code.
    pub const LAST_MANAGED_IP: i32 = 8;
    /// Stack pointer at the last call out of managed code.
    pub const LAST_MANAGED_SP: i32 = 16;
    pub const TLAB_TOP: i32 = 24;
    pub const TLAB_END: i32 = 32;
}

/// Offset of the hub (class pointer) word in every object.
pub const HUB_OFFSET: i32 = 0;
/// Offset of the 32-bit length in every array.
pub const ARRAY_LENGTH_OFFSET: i32 = 8;
/// Array elements start here.
pub const ARRAY_HEADER_SIZE: i32 = 16;

/// Architecture-neutral `[base + index * scale + displacement]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: Register,
    pub index: Option<Register>,
    pub scale: Scale,
    pub displacement: i32,
}

impl MemRef {
    pub fn base(base: Register, displacement: i32) -> Self {
        MemRef {
            base,
            index: None,
            scale: Scale::Times1,
            displacement,
        }
    }
}

impl From<&Address> for MemRef {
    fn from(address: &Address) -> Self {
        MemRef {
            base: address.base,
            index: address.index,
            scale: address.scale,
            displacement: address.displacement,
        }
    }
}

/// Offsets of the two entry points at the start of every method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOffsets {
    /// Entry used by callers following the baseline convention.
    pub baseline: u32,
    pub optimized: u32,
}

/// Start and return address of an emitted call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub call_offset: u32,
    pub return_offset: u32,
}

/// A position-relative literal load waiting for the pool layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPatch {
    /// Offset of the 32-bit displacement field.
    pub disp_offset: u32,
    /// The displacement is relative to this offset.
    pub instruction_end: u32,
    pub constant: Constant,
}

/// Output of a finished assembler.
#[derive(Debug, Clone, Default)]
pub struct AssembledCode {
    pub code: Vec<u8>,
    pub data_patches: Vec<DataPatch>,
}

pub trait MachineAssembler: Default {
    // ==================== Registers ====================

    fn stack_pointer(&self) -> Register;
    /// Free for use inside a single LIR instruction's expansion.
    fn scratch_register(&self) -> Register;
    /// Floating-point counterpart of `scratch_register`.
    fn float_scratch_register(&self) -> Register;
    fn thread_register(&self) -> Register;
    fn return_register(&self, kind: Kind) -> Register;
    fn argument_register(&self, index: usize, kind: Kind) -> Option<Register>;
    /// `(dividend and quotient, remainder)` of the hardware divide.
    fn division_registers(&self) -> (Register, Register);
    fn shift_count_register(&self) -> Register;

    // ==================== Positions ====================

    fn position(&self) -> u32;
    fn new_label(&mut self) -> Label;
    fn bind(&mut self, label: Label);
    fn align(&mut self, alignment: u32);

    // ==================== Frame ====================

    /// Must be emitted at offset 0.
    fn emit_entry_points(&mut self) -> EntryOffsets;
    fn build_frame(&mut self, frame_size: u32);
    fn save_callee_saves(&mut self, frame: &FrameLayout);
    fn restore_callee_saves(&mut self, frame: &FrameLayout);
    fn leave_and_return(&mut self);

    // ==================== Moves ====================

    fn move_register(&mut self, kind: Kind, dst: Register, src: Register);
    /// Returns the offset of the (possibly faulting) load.
    fn load(&mut self, kind: Kind, dst: Register, src: &MemRef) -> u32;
    fn store(&mut self, kind: Kind, dst: &MemRef, src: Register) -> u32;
    /// General-purpose destinations only.
    fn load_immediate(&mut self, kind: Kind, dst: Register, value: i64);
    fn store_immediate(&mut self, kind: Kind, dst: &MemRef, value: i32) -> u32;
    /// Load a constant from the literal pool.
    fn load_literal(&mut self, kind: Kind, dst: Register, constant: Constant);
    fn load_effective_address(&mut self, dst: Register, src: &MemRef);

    // ==================== Arithmetic ====================

    /// `dst = dst op src`. Integer division goes through `corrected_divide`.
    fn arith(&mut self, op: ArithOp, kind: Kind, dst: Register, src: Register);
    fn arith_immediate(&mut self, op: ArithOp, kind: Kind, dst: Register, imm: i32);
    fn logic(&mut self, op: LogicOp, kind: Kind, dst: Register, src: Register);
    fn logic_immediate(&mut self, op: LogicOp, kind: Kind, dst: Register, imm: i32);
    /// Shift by the count in `shift_count_register`.
    fn shift(&mut self, op: ShiftOp, kind: Kind, dst: Register);
    fn shift_immediate(&mut self, op: ShiftOp, kind: Kind, dst: Register, amount: u8);
    fn negate(&mut self, kind: Kind, dst: Register);
    /// Signed divide of the dividend register by `divisor` where
    /// `MIN / -1` yields `MIN` with remainder 0. Returns the offset of the
    /// divide instruction, which traps on a zero divisor.
    fn corrected_divide(&mut self, kind: Kind, divisor: Register) -> u32;

    // ==================== Compare and branch ====================

    fn compare(&mut self, kind: Kind, left: Register, right: Register);
    fn compare_immediate(&mut self, kind: Kind, left: Register, imm: i32);
    fn compare_literal(&mut self, kind: Kind, left: Register, constant: Constant);
    fn compare_memory(&mut self, kind: Kind, left: Register, right: &MemRef);
    fn jump(&mut self, target: Label);
    fn branch(&mut self, cond: Condition, target: Label);

    // ==================== Calls ====================

    /// A call whose 32-bit displacement can be rewritten with one aligned store.
    fn patchable_direct_call(&mut self) -> CallSite;
    fn absolute_call(&mut self, address: u64) -> CallSite;
    fn indirect_call(&mut self, target: Register) -> CallSite;
    fn indirect_call_memory(&mut self, slot: &MemRef) -> CallSite;
    /// Record the last-managed-frame anchor, call, clear the anchor.
    fn native_call(&mut self, address: u64) -> CallSite;

    // ==================== Runtime checks ====================

    /// Touch `[object]` so a null object faults; returns the faulting offset.
    fn null_check(&mut self, object: Register) -> u32;
    fn safepoint_poll(&mut self) -> u32;
    fn membar(&mut self);
    /// Trap if reached.
    fn halt(&mut self);

    /// Code-cache trampoline for call sites that are not linked yet.
    fn emit_trampoline(&mut self, target: u64);

    /// Resolve labels and hand out the bytes.
    fn finish(self) -> Result<AssembledCode, CompileError>;
}
