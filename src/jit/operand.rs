//! Typed LIR operands.
//!
//! Every operand is an immutable value carrying a [`Kind`]. Classification
//! predicates are mutually exclusive; the [`Operand::Illegal`] sentinel fails
//! all of them. The typed accessors panic on a variant mismatch, which always
//! indicates a bug in whoever built the LIR.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Value kind of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Int,
    Long,
    Float,
    Double,
    Object,
    Word,
    Void,
    /// Kind of the illegal operand.
    Illegal,
}

impl Kind {
    /// Size of a value of this kind in bytes.
    pub fn size_in_bytes(self) -> u32 {
        match self {
            Kind::Int | Kind::Float => 4,
            Kind::Long | Kind::Double | Kind::Object | Kind::Word => 8,
            Kind::Void | Kind::Illegal => 0,
        }
    }

    pub fn is_floating(self) -> bool {
        matches!(self, Kind::Float | Kind::Double)
    }

    /// Whether values of this kind are held in 64-bit registers.
    pub fn is_wide(self) -> bool {
        matches!(self, Kind::Long | Kind::Double | Kind::Object | Kind::Word)
    }

    pub fn type_char(self) -> char {
        match self {
            Kind::Int => 'i',
            Kind::Long => 'l',
            Kind::Float => 'f',
            Kind::Double => 'd',
            Kind::Object => 'a',
            Kind::Word => 'w',
            Kind::Void => 'v',
            Kind::Illegal => '-',
        }
    }
}

/// Register file a register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterClass {
    Cpu,
    Xmm,
}

/// A physical register. Numbers follow the hardware encoding (0..16 per class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    pub number: u8,
    pub class: RegisterClass,
}

impl Register {
    pub const fn cpu(number: u8) -> Self {
        assert!(number < 16);
        Register {
            number,
            class: RegisterClass::Cpu,
        }
    }

    pub const fn xmm(number: u8) -> Self {
        assert!(number < 16);
        Register {
            number,
            class: RegisterClass::Xmm,
        }
    }

    pub fn is_cpu(self) -> bool {
        self.class == RegisterClass::Cpu
    }

    pub fn is_xmm(self) -> bool {
        self.class == RegisterClass::Xmm
    }

    /// Index into a register reference map. CPU registers come first.
    pub fn reference_map_index(self) -> usize {
        match self.class {
            RegisterClass::Cpu => self.number as usize,
            RegisterClass::Xmm => 16 + self.number as usize,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const CPU: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        match self.class {
            RegisterClass::Cpu => f.write_str(CPU[self.number as usize]),
            RegisterClass::Xmm => write!(f, "xmm{}", self.number),
        }
    }
}

/// Handle to a heap object owned by the external collector.
///
/// Object constants are never embedded in code; they go through the
/// reference literal pool of the target method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(pub u64);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A typed constant value.
#[derive(Debug, Clone, Copy)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Word(u64),
    Object(ObjectRef),
}

impl Constant {
    pub fn kind(&self) -> Kind {
        match self {
            Constant::Int(_) => Kind::Int,
            Constant::Long(_) => Kind::Long,
            Constant::Float(_) => Kind::Float,
            Constant::Double(_) => Kind::Double,
            Constant::Word(_) => Kind::Word,
            Constant::Object(_) => Kind::Object,
        }
    }

    /// Raw bit pattern, zero-extended to 64 bits.
    pub fn bits(&self) -> u64 {
        match *self {
            Constant::Int(v) => v as u32 as u64,
            Constant::Long(v) => v as u64,
            Constant::Float(v) => v.to_bits() as u64,
            Constant::Double(v) => v.to_bits(),
            Constant::Word(v) => v,
            Constant::Object(r) => r.0,
        }
    }

    /// The value as a sign-extended 32-bit immediate, if it fits one.
    pub fn as_imm32(&self) -> Option<i32> {
        match *self {
            Constant::Int(v) => Some(v),
            Constant::Long(v) => i32::try_from(v).ok(),
            Constant::Word(v) => i32::try_from(v as i64).ok(),
            Constant::Object(r) if r.is_null() => Some(0),
            _ => None,
        }
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.bits() == other.bits()
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.bits().hash(state);
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{v}i"),
            Constant::Long(v) => write!(f, "{v}L"),
            Constant::Float(v) => write!(f, "{v}f"),
            Constant::Double(v) => write!(f, "{v}d"),
            Constant::Word(v) => write!(f, "{v:#x}w"),
            Constant::Object(r) if r.is_null() => f.write_str("null"),
            Constant::Object(r) => write!(f, "obj@{:#x}", r.0),
        }
    }
}

/// Index scaling factor of an address operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scale {
    #[default]
    Times1,
    Times2,
    Times4,
    Times8,
}

impl Scale {
    pub fn log2(self) -> u8 {
        match self {
            Scale::Times1 => 0,
            Scale::Times2 => 1,
            Scale::Times4 => 2,
            Scale::Times8 => 3,
        }
    }

    pub fn bytes(self) -> u32 {
        1 << self.log2()
    }
}

/// `[base + index * scale + displacement]` of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub base: Register,
    pub index: Option<Register>,
    pub scale: Scale,
    pub displacement: i32,
    pub kind: Kind,
}

impl Address {
    pub fn new(base: Register, displacement: i32, kind: Kind) -> Self {
        Address {
            base,
            index: None,
            scale: Scale::Times1,
            displacement,
            kind,
        }
    }

    pub fn indexed(base: Register, index: Register, scale: Scale, displacement: i32, kind: Kind) -> Self {
        Address {
            base,
            index: Some(index),
            scale,
            displacement,
            kind,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.base)?;
        if let Some(index) = self.index {
            write!(f, "+{}*{}", index, self.scale.bytes())?;
        }
        if self.displacement != 0 {
            write!(f, "{:+}", self.displacement)?;
        }
        write!(f, "|{}]", self.kind.type_char())
    }
}

/// A LIR operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Illegal,
    Register { reg: Register, kind: Kind },
    RegisterPair { low: Register, high: Register, kind: Kind },
    StackSlot { index: u32, kind: Kind },
    Variable { id: u32, kind: Kind },
    Constant(Constant),
    Address(Address),
}

impl Operand {
    pub const ILLEGAL: Operand = Operand::Illegal;

    pub fn register(reg: Register, kind: Kind) -> Self {
        Operand::Register { reg, kind }
    }

    pub fn register_pair(low: Register, high: Register, kind: Kind) -> Self {
        Operand::RegisterPair { low, high, kind }
    }

    pub fn stack_slot(index: u32, kind: Kind) -> Self {
        Operand::StackSlot { index, kind }
    }

    pub fn variable(id: u32, kind: Kind) -> Self {
        Operand::Variable { id, kind }
    }

    pub fn constant(value: Constant) -> Self {
        Operand::Constant(value)
    }

    pub fn int(value: i32) -> Self {
        Operand::Constant(Constant::Int(value))
    }

    pub fn long(value: i64) -> Self {
        Operand::Constant(Constant::Long(value))
    }

    pub fn address(address: Address) -> Self {
        Operand::Address(address)
    }

    pub fn kind(&self) -> Kind {
        match self {
            Operand::Illegal => Kind::Illegal,
            Operand::Register { kind, .. }
            | Operand::RegisterPair { kind, .. }
            | Operand::StackSlot { kind, .. }
            | Operand::Variable { kind, .. } => *kind,
            Operand::Constant(c) => c.kind(),
            Operand::Address(a) => a.kind,
        }
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self, Operand::Illegal)
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Operand::Register { .. } | Operand::RegisterPair { .. })
    }

    pub fn is_single_register(&self) -> bool {
        matches!(self, Operand::Register { .. })
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, Operand::StackSlot { .. })
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Operand::Variable { .. })
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Operand::Constant(_))
    }

    pub fn is_address(&self) -> bool {
        matches!(self, Operand::Address(_))
    }

    /// Register or stack slot: a location the allocator assigned.
    pub fn is_location(&self) -> bool {
        self.is_register() || self.is_stack()
    }

    pub fn as_register(&self) -> Register {
        match self {
            Operand::Register { reg, .. } => *reg,
            other => panic!("{other} is not a single register"),
        }
    }

    pub fn register_pair_parts(&self) -> (Register, Register) {
        match self {
            Operand::RegisterPair { low, high, .. } => (*low, *high),
            other => panic!("{other} is not a register pair"),
        }
    }

    pub fn stack_index(&self) -> u32 {
        match self {
            Operand::StackSlot { index, .. } => *index,
            other => panic!("{other} does not have a stack index"),
        }
    }

    pub fn variable_number(&self) -> u32 {
        match self {
            Operand::Variable { id, .. } => *id,
            other => panic!("{other} is not a variable"),
        }
    }

    pub fn as_constant(&self) -> Constant {
        match self {
            Operand::Constant(c) => *c,
            other => panic!("{other} is not a constant"),
        }
    }

    pub fn as_address(&self) -> Address {
        match self {
            Operand::Address(a) => *a,
            other => panic!("{other} is not an address"),
        }
    }

    /// The register if this is a single register, else `None`.
    pub fn register_or_none(&self) -> Option<Register> {
        match self {
            Operand::Register { reg, .. } => Some(*reg),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Illegal => f.write_str("-"),
            Operand::Register { reg, kind } => write!(f, "{reg}|{}", kind.type_char()),
            Operand::RegisterPair { low, high, kind } => {
                write!(f, "{low}:{high}|{}", kind.type_char())
            }
            Operand::StackSlot { index, kind } => write!(f, "stack:{index}|{}", kind.type_char()),
            Operand::Variable { id, kind } => write!(f, "v{id}|{}", kind.type_char()),
            Operand::Constant(c) => write!(f, "{c}"),
            Operand::Address(a) => write!(f, "{a}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicates(op: &Operand) -> [bool; 5] {
        [
            op.is_register(),
            op.is_stack(),
            op.is_constant(),
            op.is_address(),
            op.is_variable(),
        ]
    }

    fn sample_operands() -> Vec<Operand> {
        let rbx = Register::cpu(3);
        vec![
            Operand::register(Register::cpu(0), Kind::Int),
            Operand::register_pair(Register::cpu(0), Register::cpu(2), Kind::Long),
            Operand::stack_slot(4, Kind::Object),
            Operand::variable(17, Kind::Double),
            Operand::int(-5),
            Operand::constant(Constant::Object(ObjectRef(0x1000))),
            Operand::address(Address::indexed(rbx, Register::cpu(1), Scale::Times8, 16, Kind::Long)),
        ]
    }

    #[test]
    fn test_exactly_one_predicate_holds() {
        for op in sample_operands() {
            let count = predicates(&op).iter().filter(|p| **p).count();
            assert_eq!(count, 1, "{op} matched {count} predicates");
            assert!(!op.is_illegal());
        }
    }

    #[test]
    fn test_illegal_fails_every_predicate() {
        let op = Operand::ILLEGAL;
        assert!(op.is_illegal());
        assert_eq!(predicates(&op), [false; 5]);
        assert_eq!(op.kind(), Kind::Illegal);
    }

    #[test]
    fn test_accessors_return_payload() {
        let rax = Register::cpu(0);
        assert_eq!(Operand::register(rax, Kind::Int).as_register(), rax);
        assert_eq!(Operand::stack_slot(4, Kind::Int).stack_index(), 4);
        assert_eq!(Operand::variable(9, Kind::Long).variable_number(), 9);
        assert_eq!(Operand::long(1 << 40).as_constant(), Constant::Long(1 << 40));

        let pair = Operand::register_pair(rax, Register::cpu(2), Kind::Long);
        assert_eq!(pair.register_pair_parts(), (rax, Register::cpu(2)));

        let addr = Address::new(Register::cpu(7), -8, Kind::Word);
        assert_eq!(Operand::address(addr).as_address(), addr);
    }

    #[test]
    #[should_panic(expected = "does not have a stack index")]
    fn test_stack_index_on_register_panics() {
        Operand::register(Register::cpu(0), Kind::Int).stack_index();
    }

    #[test]
    #[should_panic(expected = "is not a single register")]
    fn test_register_on_illegal_panics() {
        Operand::ILLEGAL.as_register();
    }

    #[test]
    #[should_panic(expected = "is not a variable")]
    fn test_variable_number_on_constant_panics() {
        Operand::int(1).variable_number();
    }

    #[test]
    fn test_structural_equality() {
        let rax = Register::cpu(0);
        assert_eq!(Operand::register(rax, Kind::Int), Operand::register(rax, Kind::Int));
        assert_ne!(Operand::register(rax, Kind::Int), Operand::register(rax, Kind::Long));
        assert_ne!(Operand::int(1), Operand::long(1));
        assert_eq!(
            Operand::constant(Constant::Double(f64::NAN)),
            Operand::constant(Constant::Double(f64::NAN))
        );
        assert_ne!(
            Operand::constant(Constant::Double(0.0)),
            Operand::constant(Constant::Double(-0.0))
        );
    }

    #[test]
    fn test_imm32_fitting() {
        assert_eq!(Constant::Long(-1).as_imm32(), Some(-1));
        assert_eq!(Constant::Long(i64::MIN).as_imm32(), None);
        assert_eq!(Constant::Object(ObjectRef::NULL).as_imm32(), Some(0));
        assert_eq!(Constant::Object(ObjectRef(8)).as_imm32(), None);
        assert_eq!(Constant::Double(1.0).as_imm32(), None);
    }

    #[test]
    fn test_display() {
        let addr = Address::indexed(Register::cpu(3), Register::cpu(1), Scale::Times8, 16, Kind::Long);
        assert_eq!(Operand::address(addr).to_string(), "[rbx+rcx*8+16|l]");
        assert_eq!(Operand::register(Register::xmm(1), Kind::Double).to_string(), "xmm1|d");
        assert_eq!(Operand::stack_slot(2, Kind::Object).to_string(), "stack:2|a");
    }
}
