//! x86-64 instruction encoding for JIT compilation.
//!
//! Encodes the instruction forms the code generator needs and implements
//! [`MachineAssembler`] on top of them. Register roles follow the System V
//! AMD64 ABI; `r15` is reserved as the thread register and `r11` as scratch.

use super::codebuf::{CodeBuffer, Label, ReferenceSize};
use super::lir::{ArithOp, Condition, FrameLayout, LogicOp, ShiftOp};
use super::masm::{
    AssembledCode, CallSite, DataPatch, EntryOffsets, MachineAssembler, MemRef, thread_locals,
};
use super::operand::{Constant, Kind, Register, RegisterClass};
use crate::error::CompileError;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    pub fn register(self) -> Register {
        Register::cpu(self as u8)
    }
}

/// LIR-visible register constants.
pub mod regs {
    use crate::jit::operand::Register;

    pub const RAX: Register = Register::cpu(0);
    pub const RCX: Register = Register::cpu(1);
    pub const RDX: Register = Register::cpu(2);
    pub const RBX: Register = Register::cpu(3);
    pub const RSP: Register = Register::cpu(4);
    pub const RBP: Register = Register::cpu(5);
    pub const RSI: Register = Register::cpu(6);
    pub const RDI: Register = Register::cpu(7);
    pub const R8: Register = Register::cpu(8);
    pub const R9: Register = Register::cpu(9);
    pub const R10: Register = Register::cpu(10);
    pub const R11: Register = Register::cpu(11);
    pub const R12: Register = Register::cpu(12);
    pub const R13: Register = Register::cpu(13);
    pub const R14: Register = Register::cpu(14);
    pub const R15: Register = Register::cpu(15);

    pub const XMM0: Register = Register::xmm(0);
    pub const XMM1: Register = Register::xmm(1);
    pub const XMM15: Register = Register::xmm(15);

    /// Scratch register, never handed out by the allocator.
    pub const SCRATCH: Register = R11;
    pub const FLOAT_SCRATCH: Register = XMM15;
    /// Points at the current thread's locals block.
    pub const THREAD: Register = R15;

    pub const INT_ARGS: [Register; 6] = [RDI, RSI, RDX, RCX, R8, R9];
}

/// x86-64 condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    fn from_condition(cond: Condition) -> Option<Cond> {
        Some(match cond {
            Condition::Always => return None,
            Condition::Equal => Cond::E,
            Condition::NotEqual => Cond::Ne,
            Condition::Less => Cond::L,
            Condition::LessEqual => Cond::Le,
            Condition::Greater => Cond::G,
            Condition::GreaterEqual => Cond::Ge,
            Condition::Below => Cond::B,
            Condition::BelowEqual => Cond::Be,
            Condition::Above => Cond::A,
            Condition::AboveEqual => Cond::Ae,
        })
    }
}

/// Length in bytes of the patchable jump written over an entry point.
pub const ENTRY_PATCH_SIZE: usize = 5;

/// Opcode of `jmp rel32`.
pub const JMP_REL32: u8 = 0xE9;

/// Opcode of `call rel32`.
pub const CALL_REL32: u8 = 0xE8;

/// x86-64 assembler emitting into an owned code buffer.
#[derive(Debug, Default)]
pub struct X86_64Assembler {
    buf: CodeBuffer,
    data_patches: Vec<DataPatch>,
}

impl X86_64Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(&self) -> &[u8] {
        self.buf.code()
    }

    pub fn data_patches(&self) -> &[DataPatch] {
        &self.data_patches
    }

    // ==================== Encoding helpers ====================

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        (mode << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    /// Emit a REX prefix if any bit is needed.
    fn rex(&mut self, w: bool, reg: u8, index: u8, base: u8) {
        let rex = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((base >> 3) & 1);
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    /// ModRM/SIB/displacement for a memory operand.
    fn emit_mem(&mut self, reg: u8, mem: &MemRef) {
        let base = mem.base.number & 7;
        let disp = mem.displacement;
        let mode = if disp == 0 && base != 5 {
            0b00
        } else if i8::try_from(disp).is_ok() {
            0b01
        } else {
            0b10
        };

        match mem.index {
            Some(index) => {
                debug_assert!(index.number != 4, "rsp cannot be an index register");
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf
                    .emit_u8((mem.scale.log2() << 6) | ((index.number & 7) << 3) | base);
            }
            None if base == 4 => {
                // rsp/r12 as base need a SIB byte
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(0x24);
            }
            None => self.buf.emit_u8(Self::modrm(mode, reg, base)),
        }

        match mode {
            0b01 => self.buf.emit_u8(disp as i8 as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// `[prefix] [REX] opcode ModRM(11, reg, rm)`
    fn emit_rr(&mut self, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, rm: u8) {
        if let Some(prefix) = prefix {
            self.buf.emit_u8(prefix);
        }
        self.rex(w, reg, 0, rm);
        self.buf.emit_bytes(opcode);
        self.buf.emit_u8(Self::modrm(0b11, reg, rm));
    }

    /// `[prefix] [REX] opcode ModRM(mem)`
    fn emit_rm(&mut self, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, mem: &MemRef) {
        if let Some(prefix) = prefix {
            self.buf.emit_u8(prefix);
        }
        let index = mem.index.map_or(0, |r| r.number);
        self.rex(w, reg, index, mem.base.number);
        self.buf.emit_bytes(opcode);
        self.emit_mem(reg, mem);
    }

    /// `[prefix] [REX] opcode ModRM(00, reg, rip) disp32`; returns the
    /// offset of the displacement.
    fn emit_rip(&mut self, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8) -> u32 {
        if let Some(prefix) = prefix {
            self.buf.emit_u8(prefix);
        }
        self.rex(w, reg, 0, 0);
        self.buf.emit_bytes(opcode);
        self.buf.emit_u8(Self::modrm(0b00, reg, 0b101));
        let disp_offset = self.buf.offset() as u32;
        self.buf.emit_u32(0);
        disp_offset
    }

    /// Record a literal reference whose displacement field was just emitted.
    fn record_literal(&mut self, disp_offset: u32, constant: Constant) {
        self.data_patches.push(DataPatch {
            disp_offset,
            instruction_end: self.buf.offset() as u32,
            constant,
        });
    }

    /// Group-1 ALU op with an immediate (`/digit`), picking the imm8 form when it fits.
    fn group1_imm(&mut self, w: bool, digit: u8, rm: u8, imm: i32) {
        self.rex(w, 0, 0, rm);
        if let Ok(imm8) = i8::try_from(imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, digit, rm));
            self.buf.emit_u8(imm8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, digit, rm));
            self.buf.emit_u32(imm as u32);
        }
    }

    fn sse_prefix(kind: Kind) -> u8 {
        if kind == Kind::Float { 0xF3 } else { 0xF2 }
    }

    // ==================== Data Movement ====================

    /// MOV r, r (64-bit when `w`)
    pub fn mov_rr(&mut self, w: bool, dst: Reg, src: Reg) {
        self.emit_rr(None, w, &[0x89], src as u8, dst as u8);
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex(true, 0, 0, dst as u8);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r32, imm32 (zero-extends)
    pub fn mov_ri32(&mut self, dst: Reg, imm: u32) {
        self.rex(false, 0, 0, dst as u8);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u32(imm);
    }

    /// MOV r/m64, imm32 (sign-extended)
    pub fn mov_ri_sx(&mut self, dst: Reg, imm: i32) {
        self.rex(true, 0, 0, dst as u8);
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        self.rex(false, 0, 0, reg as u8);
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        self.rex(false, 0, 0, reg as u8);
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Arithmetic ====================

    /// CDQ (sign-extend EAX into EDX)
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    /// CQO (sign-extend RAX into RDX)
    pub fn cqo(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x99);
    }

    /// IDIV r/m (signed divide of edx:eax or rdx:rax)
    pub fn idiv(&mut self, w: bool, src: Reg) {
        self.emit_rr(None, w, &[0xF7], 7, src as u8);
    }

    // ==================== Control Flow ====================

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// LEAVE (mov rsp, rbp; pop rbp)
    pub fn leave(&mut self) {
        self.buf.emit_u8(0xC9);
    }

    /// NOP
    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    /// Five-byte NOP (0F 1F 44 00 00)
    pub fn nop5(&mut self) {
        self.buf.emit_bytes(&[0x0F, 0x1F, 0x44, 0x00, 0x00]);
    }

    /// JMP rel32 to a label
    pub fn jmp_label(&mut self, target: Label) {
        self.buf.emit_u8(JMP_REL32);
        self.buf.emit_label_ref(target, ReferenceSize::Rel32);
    }

    /// Jcc rel32 to a label
    pub fn jcc_label(&mut self, cond: Cond, target: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_label_ref(target, ReferenceSize::Rel32);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        self.emit_rr(None, false, &[0xFF], 2, reg as u8);
    }

    /// JMP r64
    pub fn jmp_r(&mut self, reg: Reg) {
        self.emit_rr(None, false, &[0xFF], 4, reg as u8);
    }

    fn reg(register: Register) -> Reg {
        debug_assert!(register.is_cpu(), "{register} is not a general-purpose register");
        match register.number {
            0 => Reg::Rax,
            1 => Reg::Rcx,
            2 => Reg::Rdx,
            3 => Reg::Rbx,
            4 => Reg::Rsp,
            5 => Reg::Rbp,
            6 => Reg::Rsi,
            7 => Reg::Rdi,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            _ => Reg::R15,
        }
    }
}

impl MachineAssembler for X86_64Assembler {
    fn stack_pointer(&self) -> Register {
        regs::RSP
    }

    fn scratch_register(&self) -> Register {
        regs::SCRATCH
    }

    fn float_scratch_register(&self) -> Register {
        regs::FLOAT_SCRATCH
    }

    fn thread_register(&self) -> Register {
        regs::THREAD
    }

    fn return_register(&self, kind: Kind) -> Register {
        if kind.is_floating() { regs::XMM0 } else { regs::RAX }
    }

    fn argument_register(&self, index: usize, kind: Kind) -> Option<Register> {
        if kind.is_floating() {
            (index < 8).then(|| Register::xmm(index as u8))
        } else {
            regs::INT_ARGS.get(index).copied()
        }
    }

    fn division_registers(&self) -> (Register, Register) {
        (regs::RAX, regs::RDX)
    }

    fn shift_count_register(&self) -> Register {
        regs::RCX
    }

    fn position(&self) -> u32 {
        self.buf.offset() as u32
    }

    fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    fn bind(&mut self, label: Label) {
        self.buf.bind(label);
    }

    fn align(&mut self, alignment: u32) {
        self.buf.align_with(alignment as usize, 0x90);
    }

    // ==================== Frame ====================

    fn emit_entry_points(&mut self) -> EntryOffsets {
        debug_assert_eq!(self.buf.offset(), 0, "entry points must start the method");
        // Baseline entry: jmp to the optimized entry, padded to 8 bytes so the
        // optimized entry's first instruction sits in its own aligned word.
        self.buf.emit_u8(JMP_REL32);
        self.buf.emit_u32(3);
        self.buf.emit_bytes(&[0x90, 0x90, 0x90]);
        let optimized = self.position();
        // Placeholder replaced by a jmp when the method is forwarded.
        self.nop5();
        EntryOffsets {
            baseline: 0,
            optimized,
        }
    }

    fn build_frame(&mut self, frame_size: u32) {
        self.push(Reg::Rbp);
        self.mov_rr(true, Reg::Rbp, Reg::Rsp);
        if frame_size > 0 {
            // SUB rsp, imm
            self.group1_imm(true, 5, Reg::Rsp as u8, frame_size as i32);
        }
    }

    fn save_callee_saves(&mut self, frame: &FrameLayout) {
        for (position, reg) in frame.callee_saved.iter().enumerate() {
            let slot = MemRef::base(regs::RSP, frame.callee_save_offset(position));
            let kind = if reg.is_xmm() { Kind::Double } else { Kind::Long };
            self.store(kind, &slot, *reg);
        }
    }

    fn restore_callee_saves(&mut self, frame: &FrameLayout) {
        for (position, reg) in frame.callee_saved.iter().enumerate() {
            let slot = MemRef::base(regs::RSP, frame.callee_save_offset(position));
            let kind = if reg.is_xmm() { Kind::Double } else { Kind::Long };
            self.load(kind, *reg, &slot);
        }
    }

    fn leave_and_return(&mut self) {
        self.leave();
        self.ret();
    }

    // ==================== Moves ====================

    fn move_register(&mut self, kind: Kind, dst: Register, src: Register) {
        let w = kind.is_wide();
        match (dst.class, src.class) {
            (RegisterClass::Cpu, RegisterClass::Cpu) => {
                self.emit_rr(None, w, &[0x89], src.number, dst.number)
            }
            // MOVAPS xmm, xmm
            (RegisterClass::Xmm, RegisterClass::Xmm) => {
                self.emit_rr(None, false, &[0x0F, 0x28], dst.number, src.number)
            }
            // MOVD/MOVQ xmm, r
            (RegisterClass::Xmm, RegisterClass::Cpu) => {
                self.emit_rr(Some(0x66), w, &[0x0F, 0x6E], dst.number, src.number)
            }
            // MOVD/MOVQ r, xmm
            (RegisterClass::Cpu, RegisterClass::Xmm) => {
                self.emit_rr(Some(0x66), w, &[0x0F, 0x7E], src.number, dst.number)
            }
        }
    }

    fn load(&mut self, kind: Kind, dst: Register, src: &MemRef) -> u32 {
        let start = self.position();
        if dst.is_xmm() {
            // MOVSS/MOVSD xmm, m
            self.emit_rm(Some(Self::sse_prefix(kind)), false, &[0x0F, 0x10], dst.number, src);
        } else {
            self.emit_rm(None, kind.is_wide(), &[0x8B], dst.number, src);
        }
        start
    }

    fn store(&mut self, kind: Kind, dst: &MemRef, src: Register) -> u32 {
        let start = self.position();
        if src.is_xmm() {
            // MOVSS/MOVSD m, xmm
            self.emit_rm(Some(Self::sse_prefix(kind)), false, &[0x0F, 0x11], src.number, dst);
        } else {
            self.emit_rm(None, kind.is_wide(), &[0x89], src.number, dst);
        }
        start
    }

    fn load_immediate(&mut self, kind: Kind, dst: Register, value: i64) {
        let dst = Self::reg(dst);
        if !kind.is_wide() {
            self.mov_ri32(dst, value as u32);
        } else if let Ok(imm) = u32::try_from(value) {
            self.mov_ri32(dst, imm);
        } else if let Ok(imm) = i32::try_from(value) {
            self.mov_ri_sx(dst, imm);
        } else {
            self.mov_ri64(dst, value);
        }
    }

    fn store_immediate(&mut self, kind: Kind, dst: &MemRef, value: i32) -> u32 {
        let start = self.position();
        // MOV r/m, imm32
        self.emit_rm(None, kind.is_wide(), &[0xC7], 0, dst);
        self.buf.emit_u32(value as u32);
        start
    }

    fn load_literal(&mut self, kind: Kind, dst: Register, constant: Constant) {
        let disp_offset = if dst.is_xmm() {
            self.emit_rip(Some(Self::sse_prefix(kind)), false, &[0x0F, 0x10], dst.number)
        } else {
            self.emit_rip(None, kind.is_wide(), &[0x8B], dst.number)
        };
        self.record_literal(disp_offset, constant);
    }

    fn load_effective_address(&mut self, dst: Register, src: &MemRef) {
        self.emit_rm(None, true, &[0x8D], dst.number, src);
    }

    // ==================== Arithmetic ====================

    fn arith(&mut self, op: ArithOp, kind: Kind, dst: Register, src: Register) {
        if kind.is_floating() {
            let opcode = match op {
                ArithOp::Add => 0x58,
                ArithOp::Sub => 0x5C,
                ArithOp::Mul => 0x59,
                ArithOp::Div => 0x5E,
                ArithOp::Rem => unreachable!("floating remainder has no instruction"),
            };
            self.emit_rr(Some(Self::sse_prefix(kind)), false, &[0x0F, opcode], dst.number, src.number);
            return;
        }
        let w = kind.is_wide();
        match op {
            ArithOp::Add => self.emit_rr(None, w, &[0x01], src.number, dst.number),
            ArithOp::Sub => self.emit_rr(None, w, &[0x29], src.number, dst.number),
            // IMUL r, r/m
            ArithOp::Mul => self.emit_rr(None, w, &[0x0F, 0xAF], dst.number, src.number),
            ArithOp::Div | ArithOp::Rem => {
                unreachable!("integer division is emitted by corrected_divide")
            }
        }
    }

    fn arith_immediate(&mut self, op: ArithOp, kind: Kind, dst: Register, imm: i32) {
        let w = kind.is_wide();
        match op {
            ArithOp::Add => self.group1_imm(w, 0, dst.number, imm),
            ArithOp::Sub => self.group1_imm(w, 5, dst.number, imm),
            ArithOp::Mul => {
                // IMUL r, r/m, imm
                self.rex(w, dst.number, 0, dst.number);
                if let Ok(imm8) = i8::try_from(imm) {
                    self.buf.emit_u8(0x6B);
                    self.buf.emit_u8(Self::modrm(0b11, dst.number, dst.number));
                    self.buf.emit_u8(imm8 as u8);
                } else {
                    self.buf.emit_u8(0x69);
                    self.buf.emit_u8(Self::modrm(0b11, dst.number, dst.number));
                    self.buf.emit_u32(imm as u32);
                }
            }
            ArithOp::Div | ArithOp::Rem => {
                unreachable!("division by an immediate is lowered through a register")
            }
        }
    }

    fn logic(&mut self, op: LogicOp, kind: Kind, dst: Register, src: Register) {
        let opcode = match op {
            LogicOp::And => 0x21,
            LogicOp::Or => 0x09,
            LogicOp::Xor => 0x31,
        };
        self.emit_rr(None, kind.is_wide(), &[opcode], src.number, dst.number);
    }

    fn logic_immediate(&mut self, op: LogicOp, kind: Kind, dst: Register, imm: i32) {
        let digit = match op {
            LogicOp::And => 4,
            LogicOp::Or => 1,
            LogicOp::Xor => 6,
        };
        self.group1_imm(kind.is_wide(), digit, dst.number, imm);
    }

    fn shift(&mut self, op: ShiftOp, kind: Kind, dst: Register) {
        // D3 /digit: shift r/m by CL
        self.emit_rr(None, kind.is_wide(), &[0xD3], shift_digit(op), dst.number);
    }

    fn shift_immediate(&mut self, op: ShiftOp, kind: Kind, dst: Register, amount: u8) {
        // C1 /digit ib
        self.emit_rr(None, kind.is_wide(), &[0xC1], shift_digit(op), dst.number);
        self.buf.emit_u8(amount);
    }

    fn negate(&mut self, kind: Kind, dst: Register) {
        if kind.is_floating() {
            // XORPS/XORPD with a sign-bit mask from the literal pool.
            let (prefix, mask) = if kind == Kind::Float {
                (None, Constant::Float(-0.0))
            } else {
                (Some(0x66), Constant::Double(-0.0))
            };
            let disp_offset = self.emit_rip(prefix, false, &[0x0F, 0x57], dst.number);
            self.record_literal(disp_offset, mask);
        } else {
            // NEG r/m
            self.emit_rr(None, kind.is_wide(), &[0xF7], 3, dst.number);
        }
    }

    fn corrected_divide(&mut self, kind: Kind, divisor: Register) -> u32 {
        debug_assert!(
            divisor != regs::RAX && divisor != regs::RDX,
            "divisor must not be rax or rdx"
        );
        let w = kind.is_wide();
        let normal = self.new_label();
        let done = self.new_label();

        if w {
            // CMP rax, [rip + MIN]
            let disp_offset = self.emit_rip(None, true, &[0x3B], Reg::Rax as u8);
            self.record_literal(disp_offset, Constant::Long(i64::MIN));
        } else {
            // CMP eax, imm32
            self.rex(false, 0, 0, 0);
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, 7, Reg::Rax as u8));
            self.buf.emit_u32(i32::MIN as u32);
        }
        self.jcc_label(Cond::Ne, normal);
        // XOR edx, edx: remainder of MIN / -1
        self.emit_rr(None, false, &[0x31], Reg::Rdx as u8, Reg::Rdx as u8);
        self.group1_imm(w, 7, divisor.number, -1);
        self.jcc_label(Cond::E, done);

        self.bind(normal);
        if w {
            self.cqo();
        } else {
            self.cdq();
        }
        let idiv_offset = self.position();
        self.idiv(w, Self::reg(divisor));
        self.bind(done);
        idiv_offset
    }

    // ==================== Compare and branch ====================

    fn compare(&mut self, kind: Kind, left: Register, right: Register) {
        match kind {
            // UCOMISS
            Kind::Float => self.emit_rr(None, false, &[0x0F, 0x2E], left.number, right.number),
            // UCOMISD
            Kind::Double => self.emit_rr(Some(0x66), false, &[0x0F, 0x2E], left.number, right.number),
            _ => self.emit_rr(None, kind.is_wide(), &[0x39], right.number, left.number),
        }
    }

    fn compare_immediate(&mut self, kind: Kind, left: Register, imm: i32) {
        self.group1_imm(kind.is_wide(), 7, left.number, imm);
    }

    fn compare_literal(&mut self, kind: Kind, left: Register, constant: Constant) {
        let disp_offset = match kind {
            Kind::Float => self.emit_rip(None, false, &[0x0F, 0x2E], left.number),
            Kind::Double => self.emit_rip(Some(0x66), false, &[0x0F, 0x2E], left.number),
            _ => self.emit_rip(None, kind.is_wide(), &[0x3B], left.number),
        };
        self.record_literal(disp_offset, constant);
    }

    fn compare_memory(&mut self, kind: Kind, left: Register, right: &MemRef) {
        // CMP r, r/m
        self.emit_rm(None, kind.is_wide(), &[0x3B], left.number, right);
    }

    fn jump(&mut self, target: Label) {
        self.jmp_label(target);
    }

    fn branch(&mut self, cond: Condition, target: Label) {
        match Cond::from_condition(cond) {
            Some(cc) => self.jcc_label(cc, target),
            None => self.jmp_label(target),
        }
    }

    // ==================== Calls ====================

    fn patchable_direct_call(&mut self) -> CallSite {
        // Keep the rel32 field 4-byte aligned so it never straddles a cache
        // line and can be rewritten with a single store.
        while (self.buf.offset() + 1) % 4 != 0 {
            self.nop();
        }
        let call_offset = self.position();
        self.buf.emit_u8(CALL_REL32);
        self.buf.emit_u32(0);
        CallSite {
            call_offset,
            return_offset: self.position(),
        }
    }

    fn absolute_call(&mut self, address: u64) -> CallSite {
        self.mov_ri64(Reg::R11, address as i64);
        let call_offset = self.position();
        self.call_r(Reg::R11);
        CallSite {
            call_offset,
            return_offset: self.position(),
        }
    }

    fn indirect_call(&mut self, target: Register) -> CallSite {
        let call_offset = self.position();
        self.call_r(Self::reg(target));
        CallSite {
            call_offset,
            return_offset: self.position(),
        }
    }

    fn indirect_call_memory(&mut self, slot: &MemRef) -> CallSite {
        let call_offset = self.position();
        // CALL r/m64
        self.emit_rm(None, false, &[0xFF], 2, slot);
        CallSite {
            call_offset,
            return_offset: self.position(),
        }
    }

    fn native_call(&mut self, address: u64) -> CallSite {
        let resume = self.new_label();
        // LEA r11, [rip + resume]
        self.rex(true, Reg::R11 as u8, 0, 0);
        self.buf.emit_u8(0x8D);
        self.buf.emit_u8(Self::modrm(0b00, Reg::R11 as u8, 0b101));
        self.buf.emit_label_ref(resume, ReferenceSize::Rel32);

        let thread = regs::THREAD;
        self.store(Kind::Word, &MemRef::base(thread, thread_locals::LAST_MANAGED_IP), regs::R11);
        self.store(Kind::Word, &MemRef::base(thread, thread_locals::LAST_MANAGED_SP), regs::RSP);
        let site = self.absolute_call(address);
        self.bind(resume);
        self.store_immediate(Kind::Word, &MemRef::base(thread, thread_locals::LAST_MANAGED_IP), 0);
        site
    }

    // ==================== Runtime checks ====================

    fn null_check(&mut self, object: Register) -> u32 {
        let offset = self.position();
        // TEST [object], eax
        self.emit_rm(None, false, &[0x85], Reg::Rax as u8, &MemRef::base(object, 0));
        offset
    }

    fn safepoint_poll(&mut self) -> u32 {
        let offset = self.position();
        // MOV r15, [r15 + latch]
        let latch = MemRef::base(regs::THREAD, thread_locals::SAFEPOINT_LATCH);
        self.emit_rm(None, true, &[0x8B], regs::THREAD.number, &latch);
        offset
    }

    fn membar(&mut self) {
        // MFENCE
        self.buf.emit_bytes(&[0x0F, 0xAE, 0xF0]);
    }

    fn halt(&mut self) {
        // UD2
        self.buf.emit_bytes(&[0x0F, 0x0B]);
    }

    fn emit_trampoline(&mut self, target: u64) {
        self.mov_ri64(Reg::Rax, target as i64);
        self.jmp_r(Reg::Rax);
    }

    fn finish(mut self) -> Result<AssembledCode, CompileError> {
        let unbound = self.buf.unbound_references();
        if !unbound.is_empty() {
            let names: Vec<String> = unbound.iter().map(|l| format!("L{}", l.index())).collect();
            return Err(CompileError::internal(format!(
                "unbound labels at end of method: {}",
                names.join(", ")
            )));
        }
        self.buf
            .patch_forward_refs()
            .map_err(CompileError::internal)?;
        Ok(AssembledCode {
            code: self.buf.into_code(),
            data_patches: self.data_patches,
        })
    }
}

fn shift_digit(op: ShiftOp) -> u8 {
    match op {
        ShiftOp::Shl => 4,
        ShiftOp::Shr => 5,
        ShiftOp::Sar => 7,
    }
}
