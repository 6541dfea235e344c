//! LIR to machine code.
//!
//! [`CodeGenerator`] walks the blocks of a [`MethodLir`] once, in order,
//! lowering each instruction through a [`MachineAssembler`]. Alongside the
//! bytes it records everything the target method builder needs: call and
//! safepoint stops with their reference maps, implicit-exception trap sites,
//! protected ranges for exception dispatch and literal patches.
//!
//! Cold paths (allocation and type-check slow paths, throw stubs for explicit
//! and range checks) are queued as local stubs and emitted after all main-line code so
//! the hot path stays linear.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::codebuf::Label;
use super::lir::{
    ArithOp, BlockFlags, BlockId, ClassId, Condition, DebugInfo, FrameLayout, LirInstruction,
    LirList, LirOp, LogicOp, MethodId, MethodLir, ShiftOp,
};
use super::masm::{
    ARRAY_HEADER_SIZE, ARRAY_LENGTH_OFFSET, CallSite, DataPatch, EntryOffsets, HUB_OFFSET, MachineAssembler,
    MemRef, thread_locals,
};
use super::operand::{Constant, Kind, ObjectRef, Operand, Register, Scale};
use super::refmap::StopReferences;
use super::runtime_calls::{RuntimeCall, RuntimeCallTable};
use crate::adaptive::Tier;
use crate::config::JitConfig;
use crate::error::CompileError;

/// Accesses below this displacement from a null base land in the unmapped
/// first page, so the access itself can serve as the null check.
pub const IMPLICIT_NULL_CHECK_LIMIT: i32 = 4096;

/// Knobs that differ between tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodegenOptions {
    pub tier: Tier,
    pub peephole: bool,
    /// Emit corrected `idiv` inline instead of calling the runtime.
    pub inline_division: bool,
    pub implicit_null_checks: bool,
    pub allow_native_calls: bool,
}

impl CodegenOptions {
    pub fn for_tier(tier: Tier, config: &JitConfig) -> Self {
        let optimized = tier == Tier::Optimized;
        CodegenOptions {
            tier,
            peephole: optimized && config.peephole,
            inline_division: optimized,
            implicit_null_checks: config.implicit_null_checks,
            allow_native_calls: optimized,
        }
    }
}

/// What a call stop calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Method(MethodId),
    Runtime(RuntimeCall),
    Native(u64),
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Method(id) => write!(f, "{id}"),
            Callee::Runtime(call) => write!(f, "runtime:{call}"),
            Callee::Native(address) => write!(f, "native@{address:#x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub site: CallSite,
    pub callee: Callee,
    pub refs: StopReferences,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointRecord {
    /// Start of the polling or faulting instruction.
    pub offset: u32,
    pub refs: StopReferences,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    NullPointer,
    DivideByZero,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapKind::NullPointer => f.write_str("null_pointer"),
            TrapKind::DivideByZero => f.write_str("divide_by_zero"),
        }
    }
}

/// An instruction that faults on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapSite {
    pub offset: u32,
    pub kind: TrapKind,
}

/// One row of the exception table: `[start, end)` is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandlerEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    /// `None` catches everything.
    pub catch_type: Option<ClassId>,
}

impl ExceptionHandlerEntry {
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Machine code plus metadata, before it has a home in the code cache.
#[derive(Debug, Clone)]
pub struct AssembledMethod {
    pub name: String,
    pub tier: Tier,
    pub code: Vec<u8>,
    pub data_patches: Vec<DataPatch>,
    pub entries: EntryOffsets,
    pub frame_size: u32,
    pub frame_words: u32,
    pub direct_calls: Vec<CallRecord>,
    pub indirect_calls: Vec<CallRecord>,
    pub safepoints: Vec<SafepointRecord>,
    pub traps: Vec<TrapSite>,
    pub exception_handlers: Vec<ExceptionHandlerEntry>,
}

impl AssembledMethod {
    pub fn stop_count(&self) -> usize {
        self.direct_calls.len() + self.indirect_calls.len() + self.safepoints.len()
    }
}

/// Cold code queued during the main pass.
enum LocalStub {
    AllocationSlowPath {
        entry: Label,
        continuation: Label,
        hub: ObjectRef,
        result: Register,
        info: Option<Arc<DebugInfo>>,
    },
    ArrayAllocationSlowPath {
        entry: Label,
        continuation: Label,
        hub: ObjectRef,
        length: Register,
        result: Register,
        info: Option<Arc<DebugInfo>>,
    },
    TypeCheckSlowPath {
        entry: Label,
        continuation: Label,
        object: Register,
        hub: ObjectRef,
        info: Option<Arc<DebugInfo>>,
    },
    RangeCheck {
        entry: Label,
        index: Register,
        info: Option<Arc<DebugInfo>>,
    },
    Throw {
        entry: Label,
        call: RuntimeCall,
        info: Option<Arc<DebugInfo>>,
    },
}

/// A protected range waiting for its handlers to be resolved.
struct ExceptionRange {
    start: u32,
    end: u32,
    info: Arc<DebugInfo>,
}

#[derive(Clone, Copy)]
enum CallKind {
    Direct,
    Indirect,
}

/// Floating values travel through general registers as raw bits.
fn raw_bits_kind(kind: Kind) -> Kind {
    match kind {
        Kind::Float => Kind::Int,
        Kind::Double => Kind::Long,
        other => other,
    }
}

fn is_pooled(constant: &Constant) -> bool {
    matches!(constant, Constant::Object(object) if !object.is_null())
}

/// Whether a null check on `object` can ride on the memory access in `next`.
fn folds_null_check(object: &Operand, next: &LirOp) -> bool {
    let Some(base) = object.register_or_none() else {
        return false;
    };
    let address = match next {
        // The length load faults first.
        LirOp::BoundsCheck { array, .. } => return array.register_or_none() == Some(base),
        LirOp::Move {
            src: Operand::Address(address),
            dst,
        } if !dst.is_address() => address,
        LirOp::Move {
            src,
            dst: Operand::Address(address),
        } if !src.is_address() => address,
        _ => return false,
    };
    address.base == base
        && address.index.is_none()
        && (0..IMPLICIT_NULL_CHECK_LIMIT).contains(&address.displacement)
}

pub struct CodeGenerator<'r, A: MachineAssembler> {
    asm: A,
    runtime: &'r RuntimeCallTable,
    options: CodegenOptions,
    frame: FrameLayout,
    block_labels: HashMap<BlockId, Label>,
    exception_entries: HashMap<BlockId, u32>,
    stubs: Vec<LocalStub>,
    direct_calls: Vec<CallRecord>,
    indirect_calls: Vec<CallRecord>,
    safepoints: Vec<SafepointRecord>,
    traps: Vec<TrapSite>,
    exception_ranges: Vec<ExceptionRange>,
    /// The last compare was floating, so branches test the unsigned flags.
    float_compare: bool,
    /// Debug info of a null check riding on the next memory access.
    folded_null_check: Option<Option<Arc<DebugInfo>>>,
}

impl<'r, A: MachineAssembler> CodeGenerator<'r, A> {
    pub fn new(runtime: &'r RuntimeCallTable, options: CodegenOptions) -> Self {
        CodeGenerator {
            asm: A::default(),
            runtime,
            options,
            frame: FrameLayout::default(),
            block_labels: HashMap::new(),
            exception_entries: HashMap::new(),
            stubs: Vec::new(),
            direct_calls: Vec::new(),
            indirect_calls: Vec::new(),
            safepoints: Vec::new(),
            traps: Vec::new(),
            exception_ranges: Vec::new(),
            float_compare: false,
            folded_null_check: None,
        }
    }

    /// Lower every block of `method`, then stubs and exception adapters.
    pub fn generate(mut self, method: &MethodLir) -> Result<AssembledMethod, CompileError> {
        debug!(
            method = %method.name,
            tier = %self.options.tier,
            blocks = method.blocks.len(),
            "generating code"
        );
        self.frame = method.frame.clone();
        let entries = self.asm.emit_entry_points();

        for block in &method.blocks {
            let label = self.asm.new_label();
            if self.block_labels.insert(block.id, label).is_some() {
                return Err(CompileError::internal(format!(
                    "{}: block {} appears twice",
                    method.name, block.id
                )));
            }
        }

        for (i, block) in method.blocks.iter().enumerate() {
            block.lir.verify(block)?;

            let mut lir = block.lir.clone();
            if self.options.peephole {
                let removed = lir.peephole(method.blocks.get(i + 1).map(|next| next.id));
                if removed > 0 {
                    trace!(block = %block.id, removed, "peephole");
                }
            }

            if block.flags.contains(BlockFlags::BACKWARD_BRANCH_TARGET) {
                self.asm.align(16);
            }
            let label = self.block_label(block.id)?;
            self.asm.bind(label);
            if block.is_exception_entry() {
                self.exception_entries.insert(block.id, self.asm.position());
            }
            self.emit_lir(lir.instructions())?;
        }

        self.emit_local_stubs()?;
        let exception_handlers = self.emit_exception_handlers()?;

        let frame_size = self.frame.frame_size();
        let frame_words = self.frame.frame_words();
        let out = self.asm.finish()?;
        debug!(
            method = %method.name,
            bytes = out.code.len(),
            stops = self.direct_calls.len() + self.indirect_calls.len() + self.safepoints.len(),
            "code generated"
        );

        Ok(AssembledMethod {
            name: method.name.clone(),
            tier: self.options.tier,
            code: out.code,
            data_patches: out.data_patches,
            entries,
            frame_size,
            frame_words,
            direct_calls: self.direct_calls,
            indirect_calls: self.indirect_calls,
            safepoints: self.safepoints,
            traps: self.traps,
            exception_handlers,
        })
    }

    fn emit_lir(&mut self, instructions: &[LirInstruction]) -> Result<(), CompileError> {
        let mut i = 0;
        while i < instructions.len() {
            let insn = &instructions[i];
            if let LirOp::NullCheck { object } = &insn.op
                && self.options.implicit_null_checks
                && let Some(next) = instructions.get(i + 1)
                && folds_null_check(object, &next.op)
            {
                trace!("null check on {object} folded into {}", next.op.name());
                self.folded_null_check = Some(insn.info.clone());
                self.emit_instruction(next)?;
                if self.folded_null_check.take().is_some() {
                    return Err(CompileError::internal(format!(
                        "null check on {object} was not consumed by {}",
                        next.op.name()
                    )));
                }
                i += 2;
                continue;
            }
            self.emit_instruction(insn)?;
            i += 1;
        }
        Ok(())
    }

    fn emit_instruction(&mut self, insn: &LirInstruction) -> Result<(), CompileError> {
        let info = insn.info.as_ref();
        match &insn.op {
            LirOp::StdEntry => {
                self.asm.build_frame(self.frame.frame_size());
                self.asm.save_callee_saves(&self.frame);
            }
            LirOp::Move { src, dst } => self.emit_move(src, dst)?,
            LirOp::Lea { address, result } => {
                let Operand::Address(address) = address else {
                    return Err(CompileError::internal(format!("lea of non-address {address}")));
                };
                let dst = self.result_register(result, "lea")?;
                self.asm.load_effective_address(dst, &MemRef::from(address));
            }
            LirOp::Arith {
                op,
                left,
                right,
                result,
            } => self.emit_arith(*op, left, right, result, info)?,
            LirOp::Logic {
                op,
                left,
                right,
                result,
            } => self.emit_logic(*op, left, right, result)?,
            LirOp::Shift {
                op,
                value,
                count,
                result,
            } => self.emit_shift(*op, value, count, result)?,
            LirOp::Negate { value, result } => {
                let dst = self.result_register(result, "neg")?;
                self.move_to_register(value, dst)?;
                self.asm.negate(result.kind(), dst);
            }
            LirOp::Compare { left, right } => self.emit_compare(left, right)?,
            LirOp::Branch { cond, target } => {
                let label = self.block_label(*target)?;
                let cond = if self.float_compare {
                    cond.to_unsigned()
                } else {
                    *cond
                };
                self.asm.branch(cond, label);
            }
            LirOp::Return { value } => {
                if !value.is_illegal() {
                    let ret = self.asm.return_register(value.kind());
                    self.move_to_register(value, ret)?;
                }
                self.asm.restore_callee_saves(&self.frame);
                self.asm.leave_and_return();
            }
            LirOp::DirectCall { callee, result } => {
                let site = self.asm.patchable_direct_call();
                self.record_call(CallKind::Direct, site, Callee::Method(*callee), info);
                self.move_call_result(result)?;
            }
            LirOp::IndirectCall {
                callee,
                target,
                result,
            } => {
                let site = match target {
                    Operand::Register { reg, .. } => self.asm.indirect_call(*reg),
                    Operand::Address(slot) => self.asm.indirect_call_memory(&MemRef::from(slot)),
                    Operand::StackSlot { index, .. } => {
                        let slot = self.stack_slot(*index)?;
                        self.asm.indirect_call_memory(&slot)
                    }
                    other => {
                        return Err(CompileError::internal(format!("indirect call through {other}")));
                    }
                };
                self.record_call(CallKind::Indirect, site, Callee::Method(*callee), info);
                self.move_call_result(result)?;
            }
            LirOp::NativeCall { function, result } => {
                if !self.options.allow_native_calls {
                    return Err(CompileError::unsupported(self.options.tier, "native calls"));
                }
                let site = self.asm.native_call(*function);
                self.record_call(CallKind::Direct, site, Callee::Native(*function), info);
                self.move_call_result(result)?;
            }
            LirOp::RuntimeCall { call, result } => {
                self.call_runtime(*call, info);
                self.move_call_result(result)?;
            }
            LirOp::NullCheck { object } => self.emit_null_check(object, info)?,
            LirOp::Safepoint => {
                let offset = self.asm.safepoint_poll();
                self.record_safepoint(offset, info);
            }
            LirOp::Throw { exception } => {
                let arg = self.argument_register(0, Kind::Object)?;
                self.move_to_register(exception, arg)?;
                self.call_runtime(RuntimeCall::UnwindException, info);
            }
            LirOp::NewInstance { hub, size, result } => {
                self.emit_new_instance(*hub, *size, result, info)?
            }
            LirOp::NewArray {
                hub,
                element,
                length,
                result,
            } => self.emit_new_array(*hub, *element, length, result, info)?,
            LirOp::BoundsCheck { array, index } => self.emit_bounds_check(array, index, info)?,
            LirOp::CheckCast { object, hub } => self.emit_check_cast(object, *hub, info)?,
            LirOp::Membar => self.asm.membar(),
        }
        Ok(())
    }

    // ==================== Moves ====================

    fn emit_move(&mut self, src: &Operand, dst: &Operand) -> Result<(), CompileError> {
        for operand in [src, dst] {
            match operand {
                Operand::Variable { .. } => {
                    return Err(CompileError::internal(format!(
                        "unallocated variable {operand} reached the code generator"
                    )));
                }
                Operand::Illegal => {
                    return Err(CompileError::internal(format!("move {src} -> {dst} has an illegal operand")));
                }
                Operand::RegisterPair { .. } => {
                    return Err(CompileError::internal(format!(
                        "register pair {operand} on a 64-bit target"
                    )));
                }
                _ => {}
            }
        }

        let kind = dst.kind();
        let bits = raw_bits_kind(kind);
        let scratch = self.asm.scratch_register();
        match (src, dst) {
            (_, Operand::Constant(constant)) => {
                return Err(CompileError::internal(format!("move into constant {constant}")));
            }
            (Operand::Address(_), Operand::Address(_)) => {
                return Err(CompileError::internal(format!("memory-to-memory move {src} -> {dst}")));
            }
            (Operand::Register { reg: from, .. }, Operand::Register { reg: to, .. }) => {
                if from != to {
                    self.asm.move_register(kind, *to, *from);
                }
            }
            (Operand::Register { reg, .. }, Operand::StackSlot { index, .. }) => {
                let slot = self.stack_slot(*index)?;
                self.asm.store(kind, &slot, *reg);
            }
            (Operand::Register { reg, .. }, Operand::Address(address)) => {
                let offset = self.asm.store(kind, &MemRef::from(address), *reg);
                self.note_memory_access(offset);
            }
            (Operand::StackSlot { index, .. }, Operand::Register { reg, .. }) => {
                let slot = self.stack_slot(*index)?;
                self.asm.load(kind, *reg, &slot);
            }
            (Operand::StackSlot { index: from, .. }, Operand::StackSlot { index: to, .. }) => {
                if from != to {
                    let from = self.stack_slot(*from)?;
                    let to = self.stack_slot(*to)?;
                    self.asm.load(bits, scratch, &from);
                    self.asm.store(bits, &to, scratch);
                }
            }
            (Operand::StackSlot { index, .. }, Operand::Address(address)) => {
                let slot = self.stack_slot(*index)?;
                self.asm.load(bits, scratch, &slot);
                let offset = self.asm.store(bits, &MemRef::from(address), scratch);
                self.note_memory_access(offset);
            }
            (Operand::Address(address), Operand::Register { reg, .. }) => {
                let offset = self.asm.load(kind, *reg, &MemRef::from(address));
                self.note_memory_access(offset);
            }
            (Operand::Address(address), Operand::StackSlot { index, .. }) => {
                let slot = self.stack_slot(*index)?;
                let offset = self.asm.load(bits, scratch, &MemRef::from(address));
                self.note_memory_access(offset);
                self.asm.store(bits, &slot, scratch);
            }
            (Operand::Constant(constant), Operand::Register { reg, .. }) => {
                self.load_constant(*constant, *reg);
            }
            (Operand::Constant(constant), Operand::StackSlot { index, .. }) => {
                let slot = self.stack_slot(*index)?;
                self.store_constant(*constant, &slot);
            }
            (Operand::Constant(constant), Operand::Address(address)) => {
                let offset = self.store_constant(*constant, &MemRef::from(address));
                self.note_memory_access(offset);
            }
            _ => {
                return Err(CompileError::internal(format!("no lowering for move {src} -> {dst}")));
            }
        }
        Ok(())
    }

    fn load_constant(&mut self, constant: Constant, dst: Register) {
        if is_pooled(&constant) {
            self.asm.load_literal(Kind::Object, dst, constant);
        } else if dst.is_xmm() {
            self.asm.load_literal(constant.kind(), dst, constant);
        } else {
            self.asm
                .load_immediate(raw_bits_kind(constant.kind()), dst, constant.bits() as i64);
        }
    }

    /// Returns the offset of the store.
    fn store_constant(&mut self, constant: Constant, dst: &MemRef) -> u32 {
        let kind = raw_bits_kind(constant.kind());
        if !is_pooled(&constant)
            && let Some(imm) = constant.as_imm32()
        {
            return self.asm.store_immediate(kind, dst, imm);
        }
        let scratch = self.asm.scratch_register();
        self.load_constant(constant, scratch);
        self.asm.store(kind, dst, scratch)
    }

    fn note_memory_access(&mut self, offset: u32) {
        if let Some(info) = self.folded_null_check.take() {
            self.record_trap(offset, TrapKind::NullPointer, info.as_ref());
        }
    }

    fn move_to_register(&mut self, value: &Operand, dst: Register) -> Result<(), CompileError> {
        self.emit_move(value, &Operand::register(dst, value.kind()))
    }

    /// `value` itself if it is in a register, else a scratch register holding it.
    fn materialize(&mut self, value: &Operand) -> Result<Register, CompileError> {
        if let Some(reg) = value.register_or_none() {
            return Ok(reg);
        }
        let scratch = self.scratch_for(value.kind());
        self.move_to_register(value, scratch)?;
        Ok(scratch)
    }

    fn move_call_result(&mut self, result: &Operand) -> Result<(), CompileError> {
        if result.is_illegal() {
            return Ok(());
        }
        let ret = self.asm.return_register(result.kind());
        self.emit_move(&Operand::register(ret, result.kind()), result)
    }

    // ==================== Arithmetic ====================

    fn emit_arith(
        &mut self,
        op: ArithOp,
        left: &Operand,
        right: &Operand,
        result: &Operand,
        info: Option<&Arc<DebugInfo>>,
    ) -> Result<(), CompileError> {
        let kind = result.kind();
        let dst = self.result_register(result, "arithmetic")?;

        if matches!(op, ArithOp::Div | ArithOp::Rem) && !kind.is_floating() {
            return self.emit_divide(op, left, right, dst, kind, info);
        }
        if op == ArithOp::Rem {
            return Err(CompileError::unsupported(
                self.options.tier,
                "floating-point remainder",
            ));
        }

        // Two-address form: dst = left first, unless that would clobber right.
        if right.register_or_none() == Some(dst) && left.register_or_none() != Some(dst) {
            if op.is_commutative() {
                let src = self.materialize(left)?;
                self.asm.arith(op, kind, dst, src);
            } else {
                let scratch = self.scratch_for(kind);
                self.asm.move_register(kind, scratch, dst);
                self.move_to_register(left, dst)?;
                self.asm.arith(op, kind, dst, scratch);
            }
            return Ok(());
        }

        self.move_to_register(left, dst)?;
        match right {
            Operand::Constant(constant) if !kind.is_floating() && constant.as_imm32().is_some() => {
                let imm = constant.as_imm32().unwrap_or_default();
                self.asm.arith_immediate(op, kind, dst, imm);
            }
            _ => {
                let src = self.materialize(right)?;
                self.asm.arith(op, kind, dst, src);
            }
        }
        Ok(())
    }

    fn emit_divide(
        &mut self,
        op: ArithOp,
        left: &Operand,
        right: &Operand,
        dst: Register,
        kind: Kind,
        info: Option<&Arc<DebugInfo>>,
    ) -> Result<(), CompileError> {
        let (quotient, remainder) = self.asm.division_registers();

        let produced = if self.options.inline_division {
            let divisor = match right.register_or_none() {
                Some(reg) if reg == quotient || reg == remainder => {
                    return Err(CompileError::internal(format!(
                        "divisor in {reg} overlaps the division registers"
                    )));
                }
                Some(reg) => reg,
                None => {
                    let scratch = self.asm.scratch_register();
                    self.move_to_register(right, scratch)?;
                    scratch
                }
            };
            self.move_to_register(left, quotient)?;
            let idiv = self.asm.corrected_divide(kind, divisor);
            self.record_trap(idiv, TrapKind::DivideByZero, info);
            if op == ArithOp::Div { quotient } else { remainder }
        } else {
            let dividend_arg = self.argument_register(0, kind)?;
            let divisor_arg = self.argument_register(1, kind)?;
            let scratch = self.asm.scratch_register();
            self.move_to_register(left, scratch)?;
            self.move_to_register(right, divisor_arg)?;
            self.asm.move_register(kind, dividend_arg, scratch);

            let throw = self.throw_stub(RuntimeCall::ThrowArithmetic, info);
            self.asm.compare_immediate(kind, divisor_arg, 0);
            self.asm.branch(Condition::Equal, throw);

            let call = match (op, kind.is_wide()) {
                (ArithOp::Div, false) => RuntimeCall::IntDivide,
                (ArithOp::Div, true) => RuntimeCall::LongDivide,
                (_, false) => RuntimeCall::IntRemainder,
                (_, true) => RuntimeCall::LongRemainder,
            };
            self.call_runtime(call, info);
            self.asm.return_register(kind)
        };

        if produced != dst {
            self.asm.move_register(kind, dst, produced);
        }
        Ok(())
    }

    fn emit_logic(
        &mut self,
        op: LogicOp,
        left: &Operand,
        right: &Operand,
        result: &Operand,
    ) -> Result<(), CompileError> {
        let kind = result.kind();
        if kind.is_floating() {
            return Err(CompileError::internal(format!("{op:?} on floating operand {result}")));
        }
        let dst = self.result_register(result, "logic")?;

        // Every logic op commutes.
        let (first, second) = if right.register_or_none() == Some(dst) {
            (right, left)
        } else {
            (left, right)
        };
        self.move_to_register(first, dst)?;
        match second {
            Operand::Constant(constant) if constant.as_imm32().is_some() => {
                let imm = constant.as_imm32().unwrap_or_default();
                self.asm.logic_immediate(op, kind, dst, imm);
            }
            _ => {
                let src = self.materialize(second)?;
                self.asm.logic(op, kind, dst, src);
            }
        }
        Ok(())
    }

    /// Variable counts go through the shift count register, which is clobbered.
    fn emit_shift(
        &mut self,
        op: ShiftOp,
        value: &Operand,
        count: &Operand,
        result: &Operand,
    ) -> Result<(), CompileError> {
        let kind = result.kind();
        if kind.is_floating() {
            return Err(CompileError::internal(format!("{op:?} on floating operand {result}")));
        }
        let dst = self.result_register(result, "shift")?;

        if let Operand::Constant(constant) = count {
            let mask = if kind.is_wide() { 63 } else { 31 };
            let amount = (constant.bits() & mask) as u8;
            self.move_to_register(value, dst)?;
            self.asm.shift_immediate(op, kind, dst, amount);
            return Ok(());
        }

        let rcx = self.asm.shift_count_register();
        if dst == rcx {
            return Err(CompileError::internal(format!(
                "shift result cannot live in the count register {rcx}"
            )));
        }
        if count.register_or_none() == Some(dst) {
            if value.register_or_none() == Some(rcx) {
                return Err(CompileError::internal(format!(
                    "shift of {value} by {count} needs a register swap"
                )));
            }
            self.move_to_register(count, rcx)?;
            self.move_to_register(value, dst)?;
        } else {
            self.move_to_register(value, dst)?;
            self.move_to_register(count, rcx)?;
        }
        self.asm.shift(op, kind, dst);
        Ok(())
    }

    fn emit_compare(&mut self, left: &Operand, right: &Operand) -> Result<(), CompileError> {
        let kind = left.kind();
        let lhs = self.materialize(left)?;
        match right {
            Operand::Register { reg, .. } => self.asm.compare(kind, lhs, *reg),
            Operand::Constant(constant) => match constant.as_imm32() {
                Some(imm) if !kind.is_floating() && !is_pooled(constant) => {
                    self.asm.compare_immediate(kind, lhs, imm)
                }
                _ => self.asm.compare_literal(kind, lhs, *constant),
            },
            Operand::StackSlot { index, .. } => {
                let memory = self.stack_slot(*index)?;
                self.compare_memory_operand(kind, lhs, &memory)?;
            }
            Operand::Address(address) => {
                self.compare_memory_operand(kind, lhs, &MemRef::from(address))?;
            }
            other => {
                return Err(CompileError::internal(format!("compare with {other}")));
            }
        }
        self.float_compare = kind.is_floating();
        Ok(())
    }

    fn compare_memory_operand(&mut self, kind: Kind, lhs: Register, memory: &MemRef) -> Result<(), CompileError> {
        if !kind.is_floating() {
            self.asm.compare_memory(kind, lhs, memory);
            return Ok(());
        }
        let scratch = self.asm.float_scratch_register();
        if lhs == scratch {
            return Err(CompileError::internal("floating compare with no operand in a register"));
        }
        self.asm.load(kind, scratch, memory);
        self.asm.compare(kind, lhs, scratch);
        Ok(())
    }

    // ==================== Runtime checks and allocation ====================

    fn emit_null_check(
        &mut self,
        object: &Operand,
        info: Option<&Arc<DebugInfo>>,
    ) -> Result<(), CompileError> {
        let Some(reg) = object.register_or_none() else {
            return Err(CompileError::internal(format!("null check of {object} outside a register")));
        };
        if self.options.implicit_null_checks {
            let offset = self.asm.null_check(reg);
            self.record_trap(offset, TrapKind::NullPointer, info);
        } else {
            let throw = self.throw_stub(RuntimeCall::ThrowNullPointer, info);
            self.asm.compare_immediate(Kind::Object, reg, 0);
            self.asm.branch(Condition::Equal, throw);
        }
        Ok(())
    }

    /// Bump-pointer allocation in the thread-local buffer, with a runtime
    /// call on overflow.
    fn emit_new_instance(
        &mut self,
        hub: ObjectRef,
        size: u32,
        result: &Operand,
        info: Option<&Arc<DebugInfo>>,
    ) -> Result<(), CompileError> {
        let dst = self.result_register(result, "new instance")?;
        let thread = self.asm.thread_register();
        let scratch = self.asm.scratch_register();
        if dst == thread || dst == scratch {
            return Err(CompileError::internal(format!("allocation result in reserved register {dst}")));
        }
        if hub.is_null() {
            return Err(CompileError::internal("allocation with a null hub"));
        }
        let size = i32::try_from(size)
            .map_err(|_| CompileError::internal(format!("instance size {size} too large")))?;

        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let top = MemRef::base(thread, thread_locals::TLAB_TOP);
        let end = MemRef::base(thread, thread_locals::TLAB_END);

        self.asm.load(Kind::Word, dst, &top);
        self.asm.load_effective_address(scratch, &MemRef::base(dst, size));
        self.asm.compare_memory(Kind::Word, scratch, &end);
        self.asm.branch(Condition::Above, slow);
        self.asm.store(Kind::Word, &top, scratch);
        self.asm.load_literal(Kind::Object, scratch, Constant::Object(hub));
        self.asm.store(Kind::Object, &MemRef::base(dst, HUB_OFFSET), scratch);
        self.asm.bind(done);

        self.stubs.push(LocalStub::AllocationSlowPath {
            entry: slow,
            continuation: done,
            hub,
            result: dst,
            info: info.cloned(),
        });
        Ok(())
    }

    /// Like [`Self::emit_new_instance`], sized `header + length * element`
    /// rounded up to a word. Negative lengths take the slow path, where the
    /// runtime throws.
    fn emit_new_array(
        &mut self,
        hub: ObjectRef,
        element: Kind,
        length: &Operand,
        result: &Operand,
        info: Option<&Arc<DebugInfo>>,
    ) -> Result<(), CompileError> {
        let dst = self.result_register(result, "new array")?;
        let thread = self.asm.thread_register();
        let scratch = self.asm.scratch_register();
        let Some(length) = length.register_or_none() else {
            return Err(CompileError::internal(format!("array length {length} outside a register")));
        };
        if dst == thread || dst == scratch {
            return Err(CompileError::internal(format!("allocation result in reserved register {dst}")));
        }
        if length == thread || length == scratch || length == dst {
            return Err(CompileError::internal(format!("array length in clobbered register {length}")));
        }
        if hub.is_null() {
            return Err(CompileError::internal("allocation with a null hub"));
        }
        let scale = match element.size_in_bytes() {
            1 => Scale::Times1,
            2 => Scale::Times2,
            4 => Scale::Times4,
            8 => Scale::Times8,
            size => {
                return Err(CompileError::internal(format!("no arrays of {element:?} ({size} bytes)")));
            }
        };

        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let top = MemRef::base(thread, thread_locals::TLAB_TOP);
        let end = MemRef::base(thread, thread_locals::TLAB_END);

        self.asm.compare_immediate(Kind::Int, length, 0);
        self.asm.branch(Condition::Less, slow);
        // A 32-bit move zero-extends the now non-negative length.
        self.asm.move_register(Kind::Int, scratch, length);
        self.asm.load(Kind::Word, dst, &top);
        let object_end = MemRef {
            base: dst,
            index: Some(scratch),
            scale,
            displacement: ARRAY_HEADER_SIZE + 7,
        };
        self.asm.load_effective_address(scratch, &object_end);
        self.asm.logic_immediate(LogicOp::And, Kind::Word, scratch, -8);
        self.asm.compare_memory(Kind::Word, scratch, &end);
        self.asm.branch(Condition::Above, slow);
        self.asm.store(Kind::Word, &top, scratch);
        self.asm.load_literal(Kind::Object, scratch, Constant::Object(hub));
        self.asm.store(Kind::Object, &MemRef::base(dst, HUB_OFFSET), scratch);
        self.asm.store(Kind::Int, &MemRef::base(dst, ARRAY_LENGTH_OFFSET), length);
        self.asm.bind(done);

        self.stubs.push(LocalStub::ArrayAllocationSlowPath {
            entry: slow,
            continuation: done,
            hub,
            length,
            result: dst,
            info: info.cloned(),
        });
        Ok(())
    }

    /// One unsigned compare against the length word: a negative index looks
    /// larger than any length.
    fn emit_bounds_check(
        &mut self,
        array: &Operand,
        index: &Operand,
        info: Option<&Arc<DebugInfo>>,
    ) -> Result<(), CompileError> {
        let Some(array) = array.register_or_none() else {
            return Err(CompileError::internal(format!("bounds check of {array} outside a register")));
        };
        let index = match index {
            Operand::Register { reg, .. } => *reg,
            Operand::Constant(constant) => {
                let value = constant
                    .as_imm32()
                    .ok_or_else(|| CompileError::internal(format!("array index {constant} is not an int")))?;
                let scratch = self.asm.scratch_register();
                self.asm.load_immediate(Kind::Int, scratch, i64::from(value));
                scratch
            }
            other => {
                return Err(CompileError::internal(format!("array index {other} outside a register")));
            }
        };

        let entry = self.asm.new_label();
        let offset = self.asm.position();
        self.asm
            .compare_memory(Kind::Int, index, &MemRef::base(array, ARRAY_LENGTH_OFFSET));
        self.note_memory_access(offset);
        self.asm.branch(Condition::AboveEqual, entry);

        self.stubs.push(LocalStub::RangeCheck {
            entry,
            index,
            info: info.cloned(),
        });
        Ok(())
    }

    /// Exact-hub fast path; anything else asks the runtime.
    fn emit_check_cast(
        &mut self,
        object: &Operand,
        hub: ObjectRef,
        info: Option<&Arc<DebugInfo>>,
    ) -> Result<(), CompileError> {
        let Some(reg) = object.register_or_none() else {
            return Err(CompileError::internal(format!("checkcast of {object} outside a register")));
        };
        let scratch = self.asm.scratch_register();
        let slow = self.asm.new_label();
        let done = self.asm.new_label();

        self.asm.compare_immediate(Kind::Object, reg, 0);
        self.asm.branch(Condition::Equal, done);
        self.asm.load(Kind::Word, scratch, &MemRef::base(reg, HUB_OFFSET));
        self.asm.compare_literal(Kind::Object, scratch, Constant::Object(hub));
        self.asm.branch(Condition::NotEqual, slow);
        self.asm.bind(done);

        self.stubs.push(LocalStub::TypeCheckSlowPath {
            entry: slow,
            continuation: done,
            object: reg,
            hub,
            info: info.cloned(),
        });
        Ok(())
    }

    fn throw_stub(&mut self, call: RuntimeCall, info: Option<&Arc<DebugInfo>>) -> Label {
        let entry = self.asm.new_label();
        self.stubs.push(LocalStub::Throw {
            entry,
            call,
            info: info.cloned(),
        });
        entry
    }

    /// Stubs may queue stubs of their own, so this runs until none are left.
    fn emit_local_stubs(&mut self) -> Result<(), CompileError> {
        loop {
            let stubs = std::mem::take(&mut self.stubs);
            if stubs.is_empty() {
                return Ok(());
            }
            trace!(count = stubs.len(), "emitting local stubs");
            for stub in stubs {
                self.emit_local_stub(stub)?;
            }
        }
    }

    fn emit_local_stub(&mut self, stub: LocalStub) -> Result<(), CompileError> {
        match stub {
            LocalStub::AllocationSlowPath {
                entry,
                continuation,
                hub,
                result,
                info,
            } => {
                self.asm.bind(entry);
                let arg = self.argument_register(0, Kind::Object)?;
                self.asm.load_literal(Kind::Object, arg, Constant::Object(hub));
                self.call_runtime(RuntimeCall::NewInstance, info.as_ref());
                let ret = self.asm.return_register(Kind::Object);
                if ret != result {
                    self.asm.move_register(Kind::Object, result, ret);
                }
                self.asm.jump(continuation);
            }
            LocalStub::TypeCheckSlowPath {
                entry,
                continuation,
                object,
                hub,
                info,
            } => {
                self.asm.bind(entry);
                let object_arg = self.argument_register(0, Kind::Object)?;
                let hub_arg = self.argument_register(1, Kind::Object)?;
                if object != object_arg {
                    self.asm.move_register(Kind::Object, object_arg, object);
                }
                self.asm.load_literal(Kind::Object, hub_arg, Constant::Object(hub));
                self.call_runtime(RuntimeCall::CheckCast, info.as_ref());
                let verdict = self.asm.return_register(Kind::Int);
                let throw = self.throw_stub(RuntimeCall::ThrowClassCast, info.as_ref());
                self.asm.compare_immediate(Kind::Int, verdict, 0);
                self.asm.branch(Condition::Equal, throw);
                self.asm.jump(continuation);
            }
            LocalStub::ArrayAllocationSlowPath {
                entry,
                continuation,
                hub,
                length,
                result,
                info,
            } => {
                self.asm.bind(entry);
                let hub_arg = self.argument_register(0, Kind::Object)?;
                let length_arg = self.argument_register(1, Kind::Int)?;
                // Length first: it may sit in the hub argument register.
                if length != length_arg {
                    self.asm.move_register(Kind::Int, length_arg, length);
                }
                self.asm.load_literal(Kind::Object, hub_arg, Constant::Object(hub));
                self.call_runtime(RuntimeCall::NewArray, info.as_ref());
                let ret = self.asm.return_register(Kind::Object);
                if ret != result {
                    self.asm.move_register(Kind::Object, result, ret);
                }
                self.asm.jump(continuation);
            }
            LocalStub::RangeCheck { entry, index, info } => {
                self.asm.bind(entry);
                let arg = self.argument_register(0, Kind::Int)?;
                if index != arg {
                    self.asm.move_register(Kind::Int, arg, index);
                }
                self.call_runtime(RuntimeCall::ThrowIndexOutOfBounds, info.as_ref());
            }
            LocalStub::Throw { entry, call, info } => {
                self.asm.bind(entry);
                self.call_runtime(call, info.as_ref());
            }
        }
        Ok(())
    }

    // ==================== Exception handlers ====================

    /// Resolve every protected range against its handler chain, emitting
    /// adapters once per edge.
    fn emit_exception_handlers(&mut self) -> Result<Vec<ExceptionHandlerEntry>, CompileError> {
        let ranges = std::mem::take(&mut self.exception_ranges);
        let mut adapters: HashMap<(usize, usize), u32> = HashMap::new();
        let mut entries = Vec::new();

        for range in &ranges {
            for (i, edge) in range.info.exception_edges.iter().enumerate() {
                let handler = match &edge.adapter {
                    Some(adapter) => {
                        let key = (Arc::as_ptr(&range.info) as usize, i);
                        match adapters.get(&key) {
                            Some(offset) => *offset,
                            None => {
                                let offset = self.emit_adapter(edge.handler, adapter)?;
                                adapters.insert(key, offset);
                                offset
                            }
                        }
                    }
                    None => *self.exception_entries.get(&edge.handler).ok_or_else(|| {
                        CompileError::internal(format!(
                            "handler {} is not marked as an exception entry",
                            edge.handler
                        ))
                    })?,
                };
                entries.push(ExceptionHandlerEntry {
                    start: range.start,
                    end: range.end,
                    handler,
                    catch_type: edge.catch_type,
                });
            }
        }

        if !self.exception_ranges.is_empty() {
            return Err(CompileError::internal("exception adapter contains a protected instruction"));
        }
        // Adapters may have queued stubs of their own.
        self.emit_local_stubs()?;
        Ok(entries)
    }

    fn emit_adapter(&mut self, handler: BlockId, adapter: &LirList) -> Result<u32, CompileError> {
        let ends_in_handler = matches!(
            adapter.last().map(|insn| &insn.op),
            Some(LirOp::Branch { cond: Condition::Always, target }) if *target == handler
        );
        if !ends_in_handler {
            return Err(CompileError::internal(format!(
                "exception adapter for {handler} does not end with a jump to it"
            )));
        }
        let offset = self.asm.position();
        self.emit_lir(adapter.instructions())?;
        Ok(offset)
    }

    // ==================== Recording ====================

    fn record_call(
        &mut self,
        kind: CallKind,
        site: CallSite,
        callee: Callee,
        info: Option<&Arc<DebugInfo>>,
    ) {
        let record = CallRecord {
            site,
            callee,
            refs: StopReferences::from_debug_info(info.map(Arc::as_ref)),
        };
        match kind {
            CallKind::Direct => self.direct_calls.push(record),
            CallKind::Indirect => self.indirect_calls.push(record),
        }
        if let Some(info) = info
            && info.has_handlers()
        {
            self.exception_ranges.push(ExceptionRange {
                start: site.call_offset,
                end: site.return_offset,
                info: Arc::clone(info),
            });
        }
    }

    fn record_safepoint(&mut self, offset: u32, info: Option<&Arc<DebugInfo>>) {
        self.safepoints.push(SafepointRecord {
            offset,
            refs: StopReferences::from_debug_info(info.map(Arc::as_ref)),
        });
    }

    /// A trap is also a safepoint: the collector may run while the
    /// exception is raised.
    fn record_trap(&mut self, offset: u32, kind: TrapKind, info: Option<&Arc<DebugInfo>>) {
        self.traps.push(TrapSite { offset, kind });
        self.record_safepoint(offset, info);
        if let Some(info) = info
            && info.has_handlers()
        {
            // The faulting pc is exactly `offset`.
            self.exception_ranges.push(ExceptionRange {
                start: offset,
                end: offset + 1,
                info: Arc::clone(info),
            });
        }
    }

    /// Calls that never return are followed by a halt.
    fn call_runtime(&mut self, call: RuntimeCall, info: Option<&Arc<DebugInfo>>) -> CallSite {
        let site = self.asm.absolute_call(self.runtime.address(call));
        self.record_call(CallKind::Direct, site, Callee::Runtime(call), info);
        if !call.returns() {
            self.asm.halt();
        }
        site
    }

    // ==================== Helpers ====================

    fn block_label(&self, id: BlockId) -> Result<Label, CompileError> {
        self.block_labels
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::internal(format!("branch to unknown block {id}")))
    }

    fn stack_slot(&self, index: u32) -> Result<MemRef, CompileError> {
        if index >= self.frame.stack_slots {
            return Err(CompileError::internal(format!(
                "stack slot {index} outside a frame of {} slots",
                self.frame.stack_slots
            )));
        }
        Ok(MemRef::base(
            self.asm.stack_pointer(),
            self.frame.stack_slot_offset(index),
        ))
    }

    fn result_register(&self, result: &Operand, what: &str) -> Result<Register, CompileError> {
        result
            .register_or_none()
            .ok_or_else(|| CompileError::internal(format!("{what} result {result} is not a register")))
    }

    fn argument_register(&self, index: usize, kind: Kind) -> Result<Register, CompileError> {
        self.asm
            .argument_register(index, kind)
            .ok_or_else(|| CompileError::internal(format!("no argument register {index}")))
    }

    fn scratch_for(&self, kind: Kind) -> Register {
        if kind.is_floating() {
            self.asm.float_scratch_register()
        } else {
            self.asm.scratch_register()
        }
    }
}
