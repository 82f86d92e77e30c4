//! Decoded guest instruction model.
//!
//! The trace selector and its optimizer hand the backend a sequence of
//! already-decoded instructions; nothing here parses or verifies raw
//! bytecode. Each record carries the opcode, up to three virtual register
//! numbers, an immediate, a branch target, and the optimizer's elision
//! flags.

use std::fmt;

// =============================================================================
// Virtual registers
// =============================================================================

/// A guest virtual register number.
///
/// Each virtual register has a home slot in the guest frame; the allocator
/// decides when a copy lives in a physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u16);

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// =============================================================================
// Optimizer flags
// =============================================================================

/// Per-instruction check-elision flags set by the trace optimizer.
///
/// A set bit is a proof obligation discharged upstream; the lowering engine
/// skips the corresponding guard.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct OptFlags(u16);

impl OptFlags {
    pub const NONE: OptFlags = OptFlags(0);
    /// Null check on the object/array operand already covered.
    pub const NULL_CHECK_ELIDED: OptFlags = OptFlags(1 << 0);
    /// Array index already proven in bounds.
    pub const BOUNDS_CHECK_ELIDED: OptFlags = OptFlags(1 << 1);
    /// Suspend poll on this back edge already covered.
    pub const SUSPEND_CHECK_ELIDED: OptFlags = OptFlags(1 << 2);
    /// Divisor already proven nonzero.
    pub const RANGE_CHECK_ELIDED: OptFlags = OptFlags(1 << 3);

    #[inline(always)]
    pub const fn contains(self, other: OptFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline(always)]
    pub const fn union(self, other: OptFlags) -> OptFlags {
        OptFlags(self.0 | other.0)
    }

    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for OptFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = Vec::new();
        if self.contains(OptFlags::NULL_CHECK_ELIDED) {
            names.push("null-elided");
        }
        if self.contains(OptFlags::BOUNDS_CHECK_ELIDED) {
            names.push("bounds-elided");
        }
        if self.contains(OptFlags::SUSPEND_CHECK_ELIDED) {
            names.push("suspend-elided");
        }
        if self.contains(OptFlags::RANGE_CHECK_ELIDED) {
            names.push("range-elided");
        }
        write!(f, "OptFlags[{}]", names.join(", "))
    }
}

// =============================================================================
// Opcodes
// =============================================================================

/// Comparison kind for two-way conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// Element width for array accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemWidth {
    /// Bytes and booleans.
    B1,
    /// Chars (zero-extended) and shorts (sign-extended).
    B2 { signed: bool },
    /// Ints, floats, object references.
    B4,
    /// Longs and doubles.
    B8,
}

impl ElemWidth {
    /// log2 of the element size, for scaled addressing.
    #[inline]
    pub const fn shift(self) -> u8 {
        match self {
            ElemWidth::B1 => 0,
            ElemWidth::B2 { .. } => 1,
            ElemWidth::B4 => 2,
            ElemWidth::B8 => 3,
        }
    }
}

/// Binary integer operation selector shared by reg-reg and reg-literal forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

/// Opcode of a decoded guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    // Data movement
    Move,
    /// 32-bit constant into a vreg.
    Const,
    /// 64-bit constant into a vreg pair.
    ConstWide,
    /// String reference through the resolution cache (index in `imm`).
    ConstString,
    /// Class reference through the resolution cache (index in `imm`).
    ConstClass,

    // Arithmetic, two register sources.
    Binary(BinOp),
    /// Binary with a literal second source (literal in `imm`).
    BinaryLit(BinOp),
    Neg,
    Not,
    /// Three-way compare of two wide values, -1/0/1 into dst.
    Cmp,

    // Arrays
    ArrayLength,
    AGet(ElemWidth),
    APut(ElemWidth),
    /// Class index in `imm`, length in `src1`.
    NewArray,
    /// Payload worklist entry; payload offset in `imm`.
    FillArrayData,

    // Object fields. Instance fields carry a resolved byte offset in `imm`;
    // static fields carry a resolution-cache index.
    IGet(ElemWidth),
    IPut(ElemWidth),
    SGet,
    SPut,
    NewInstance,
    CheckCast,
    InstanceOf,
    MonitorEnter,
    MonitorExit,

    // Calls. Method index in `imm`.
    Invoke,
    Return,
    ReturnVoid,
    Throw,

    // Control
    Goto,
    /// Compare two vregs, branch to `target`.
    If(CmpKind),
    /// Compare a vreg against zero, branch to `target`.
    IfZ(CmpKind),
    /// Table offset in `imm`.
    PackedSwitch,
    SparseSwitch,
}

impl Opcode {
    /// Mnemonic for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Move => "move",
            Opcode::Const => "const",
            Opcode::ConstWide => "const-wide",
            Opcode::ConstString => "const-string",
            Opcode::ConstClass => "const-class",
            Opcode::Binary(op) | Opcode::BinaryLit(op) => match op {
                BinOp::Add => "add",
                BinOp::Sub => "sub",
                BinOp::Mul => "mul",
                BinOp::Div => "div",
                BinOp::Rem => "rem",
                BinOp::And => "and",
                BinOp::Or => "or",
                BinOp::Xor => "xor",
                BinOp::Shl => "shl",
                BinOp::Shr => "shr",
                BinOp::Ushr => "ushr",
            },
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Cmp => "cmp",
            Opcode::ArrayLength => "array-length",
            Opcode::AGet(_) => "aget",
            Opcode::APut(_) => "aput",
            Opcode::NewArray => "new-array",
            Opcode::FillArrayData => "fill-array-data",
            Opcode::IGet(_) => "iget",
            Opcode::IPut(_) => "iput",
            Opcode::SGet => "sget",
            Opcode::SPut => "sput",
            Opcode::NewInstance => "new-instance",
            Opcode::CheckCast => "check-cast",
            Opcode::InstanceOf => "instance-of",
            Opcode::MonitorEnter => "monitor-enter",
            Opcode::MonitorExit => "monitor-exit",
            Opcode::Invoke => "invoke",
            Opcode::Return => "return",
            Opcode::ReturnVoid => "return-void",
            Opcode::Throw => "throw",
            Opcode::Goto => "goto",
            Opcode::If(_) => "if",
            Opcode::IfZ(_) => "if-z",
            Opcode::PackedSwitch => "packed-switch",
            Opcode::SparseSwitch => "sparse-switch",
        }
    }
}

// =============================================================================
// Decoded instructions
// =============================================================================

/// One decoded guest instruction as handed to the lowering engine.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInsn {
    pub opcode: Opcode,
    /// Destination vreg. For stores and branches this is the first source.
    pub dst: VReg,
    pub src1: VReg,
    pub src2: VReg,
    /// Literal, resolution-cache index, field offset, or table offset,
    /// depending on the opcode.
    pub imm: i64,
    /// Guest pc of the branch target, when the opcode branches.
    pub target: u32,
    /// Guest pc of this instruction.
    pub pc: u32,
    pub flags: OptFlags,
}

impl DecodedInsn {
    /// A non-branching instruction with all fields zeroed except the given.
    pub fn new(opcode: Opcode, pc: u32) -> Self {
        DecodedInsn {
            opcode,
            dst: VReg(0),
            src1: VReg(0),
            src2: VReg(0),
            imm: 0,
            target: 0,
            pc,
            flags: OptFlags::NONE,
        }
    }

    pub fn with_regs(mut self, dst: VReg, src1: VReg, src2: VReg) -> Self {
        self.dst = dst;
        self.src1 = src1;
        self.src2 = src2;
        self
    }

    pub fn with_imm(mut self, imm: i64) -> Self {
        self.imm = imm;
        self
    }

    pub fn with_target(mut self, target: u32) -> Self {
        self.target = target;
        self
    }

    pub fn with_flags(mut self, flags: OptFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Case table attached to a switch instruction; the instruction's `imm`
/// indexes into [`Trace::switches`].
#[derive(Debug, Clone)]
pub struct SwitchTable {
    /// First case key for packed tables; ignored for sparse ones.
    pub first_key: i32,
    /// Case keys for sparse tables, parallel to `targets`.
    pub keys: Vec<i32>,
    /// Guest pc per case.
    pub targets: Vec<u32>,
    /// Guest pc when no case matches.
    pub default_target: u32,
}

/// A trace: straight-line run of decoded instructions with possible internal
/// branches whose targets fall inside or outside the run.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub insns: Vec<DecodedInsn>,
    /// Guest pc of the trace head; back edges to it stay inside the trace.
    pub entry_pc: u32,
    /// Number of guest virtual registers in the frame.
    pub num_vregs: u16,
    /// Switch case tables, indexed by a switch instruction's `imm`.
    pub switches: Vec<SwitchTable>,
    /// Fill-array payloads, indexed by a fill instruction's `imm`.
    pub payloads: Vec<Vec<u8>>,
    /// Guest pc execution continues at when the last instruction is not a
    /// branch or return.
    pub fallthrough: Option<u32>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_ops() {
        let f = OptFlags::NULL_CHECK_ELIDED.union(OptFlags::BOUNDS_CHECK_ELIDED);
        assert!(f.contains(OptFlags::NULL_CHECK_ELIDED));
        assert!(f.contains(OptFlags::BOUNDS_CHECK_ELIDED));
        assert!(!f.contains(OptFlags::SUSPEND_CHECK_ELIDED));
        assert!(OptFlags::NONE.is_empty());
    }

    #[test]
    fn elem_width_shift() {
        assert_eq!(ElemWidth::B1.shift(), 0);
        assert_eq!(ElemWidth::B2 { signed: true }.shift(), 1);
        assert_eq!(ElemWidth::B4.shift(), 2);
        assert_eq!(ElemWidth::B8.shift(), 3);
    }

    #[test]
    fn builder() {
        let insn = DecodedInsn::new(Opcode::Binary(BinOp::Add), 0x10)
            .with_regs(VReg(0), VReg(1), VReg(2))
            .with_flags(OptFlags::NULL_CHECK_ELIDED);
        assert_eq!(insn.dst, VReg(0));
        assert_eq!(insn.pc, 0x10);
        assert_eq!(insn.opcode.name(), "add");
    }
}
