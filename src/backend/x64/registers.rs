//! x64 register definitions and the conventions the trace backend relies on.
//!
//! This module provides:
//! - General-purpose register (GPR) definitions with hardware encoding
//! - Register sets as bitfields for O(1) membership testing
//! - The host calling convention used when marshaling runtime-helper calls
//!
//! The backend reserves two GPRs globally: `GUEST_FRAME` holds the base of
//! the guest frame (all virtual-register slots are addressed off it) and
//! `SCRATCH` is always available to multi-step emission sequences without
//! going through the allocator.

use std::fmt;

// =============================================================================
// General-Purpose Registers (GPR)
// =============================================================================

/// x64 general-purpose register with hardware encoding.
///
/// - Bits 0-2 go in ModR/M or the opcode
/// - Bit 3 goes in a REX prefix bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
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

/// Register holding the guest frame base for the whole trace.
pub const GUEST_FRAME: Gpr = Gpr::Rbp;

/// Scratch register, never handed out by the allocator.
pub const SCRATCH: Gpr = Gpr::R11;

impl Gpr {
    /// Get the hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Get bits 0-2 for ModR/M encoding.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Get bit 3 for the REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// RSP and R12 encode as 0b100, which collides with the SIB escape.
    #[inline(always)]
    pub const fn needs_sib_as_base(self) -> bool {
        self.low_bits() == 4
    }

    /// RBP and R13 encode as 0b101, which means [disp32] in mod=00.
    #[inline(always)]
    pub const fn needs_displacement(self) -> bool {
        self.low_bits() == 5
    }

    /// Convert from an encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Gpr> {
        match enc {
            0 => Some(Gpr::Rax),
            1 => Some(Gpr::Rcx),
            2 => Some(Gpr::Rdx),
            3 => Some(Gpr::Rbx),
            4 => Some(Gpr::Rsp),
            5 => Some(Gpr::Rbp),
            6 => Some(Gpr::Rsi),
            7 => Some(Gpr::Rdi),
            8 => Some(Gpr::R8),
            9 => Some(Gpr::R9),
            10 => Some(Gpr::R10),
            11 => Some(Gpr::R11),
            12 => Some(Gpr::R12),
            13 => Some(Gpr::R13),
            14 => Some(Gpr::R14),
            15 => Some(Gpr::R15),
            _ => None,
        }
    }

    /// 64-bit register name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Register Sets
// =============================================================================

/// A set of GPRs as a 16-bit bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GprSet(u16);

impl GprSet {
    pub const EMPTY: GprSet = GprSet(0);
    pub const ALL: GprSet = GprSet(0xFFFF);

    #[inline(always)]
    pub const fn singleton(reg: Gpr) -> Self {
        GprSet(1 << reg.encoding())
    }

    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        GprSet(bits)
    }

    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline(always)]
    pub const fn contains(self, reg: Gpr) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    #[inline(always)]
    pub const fn insert(self, reg: Gpr) -> Self {
        GprSet(self.0 | (1 << reg.encoding()))
    }

    #[inline(always)]
    pub const fn remove(self, reg: Gpr) -> Self {
        GprSet(self.0 & !(1 << reg.encoding()))
    }

    #[inline(always)]
    pub const fn union(self, other: GprSet) -> Self {
        GprSet(self.0 | other.0)
    }

    #[inline(always)]
    pub const fn intersection(self, other: GprSet) -> Self {
        GprSet(self.0 & other.0)
    }

    #[inline(always)]
    pub const fn difference(self, other: GprSet) -> Self {
        GprSet(self.0 & !other.0)
    }

    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// First register (lowest encoding) in the set, if any.
    #[inline]
    pub const fn first(self) -> Option<Gpr> {
        if self.0 == 0 {
            None
        } else {
            Gpr::from_encoding(self.0.trailing_zeros() as u8)
        }
    }

    /// Iterate over registers in encoding order.
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        (0..16).filter_map(move |i| {
            if (self.0 & (1 << i)) != 0 {
                Gpr::from_encoding(i)
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for GprSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GprSet{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", reg)?;
            first = false;
        }
        write!(f, "}}")
    }
}

// =============================================================================
// Calling Convention (helper call marshaling)
// =============================================================================

/// Host calling convention for runtime-helper calls.
///
/// Every helper the backend calls out to has a fixed, narrow C signature,
/// so only integer argument registers and the clobber sets matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    WindowsX64,
    SystemV,
}

impl CallingConvention {
    /// Calling convention of the current host.
    #[cfg(target_os = "windows")]
    pub const fn host() -> Self {
        CallingConvention::WindowsX64
    }

    #[cfg(not(target_os = "windows"))]
    pub const fn host() -> Self {
        CallingConvention::SystemV
    }

    /// Integer argument registers, in order.
    pub const fn int_arg_regs(self) -> &'static [Gpr] {
        match self {
            CallingConvention::WindowsX64 => &[Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9],
            CallingConvention::SystemV => {
                &[Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9]
            }
        }
    }

    /// Integer return register.
    pub const fn int_return_reg(self) -> Gpr {
        Gpr::Rax
    }

    /// Volatile (caller-saved) GPRs. Guest values living in these must be
    /// flushed to their frame slots before any helper call.
    pub const fn volatile_gprs(self) -> GprSet {
        match self {
            // RAX, RCX, RDX, R8-R11
            CallingConvention::WindowsX64 => GprSet::from_bits(0x0F07),
            // RAX, RCX, RDX, RSI, RDI, R8-R11
            CallingConvention::SystemV => GprSet::from_bits(0x0FC7),
        }
    }

    /// Non-volatile (callee-saved) GPRs.
    pub const fn callee_saved_gprs(self) -> GprSet {
        match self {
            CallingConvention::WindowsX64 => GprSet::from_bits(0xF0F8),
            CallingConvention::SystemV => GprSet::from_bits(0xF028),
        }
    }

    /// Shadow space the caller must reserve (Windows only).
    pub const fn shadow_space(self) -> usize {
        match self {
            CallingConvention::WindowsX64 => 32,
            CallingConvention::SystemV => 0,
        }
    }
}

/// Registers the allocator may bind guest values to.
///
/// Excludes RSP, the guest frame register, and the scratch register.
/// The pool is ordered so volatile registers are preferred: values in them
/// are cheap to give up at call boundaries.
pub const ALLOCATABLE: [Gpr; 13] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::Rbx,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

/// Bitset form of [`ALLOCATABLE`].
pub const fn allocatable_set() -> GprSet {
    let mut set = GprSet::EMPTY;
    let mut i = 0;
    while i < ALLOCATABLE.len() {
        set = set.insert(ALLOCATABLE[i]);
        i += 1;
    }
    set
}

// =============================================================================
// Memory Operands
// =============================================================================

/// Scale factor for SIB addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    X1 = 0,
    X2 = 1,
    X4 = 2,
    X8 = 3,
}

impl Scale {
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    pub const fn value(self) -> u8 {
        1 << (self as u8)
    }

    pub const fn from_value(val: u8) -> Option<Scale> {
        match val {
            1 => Some(Scale::X1),
            2 => Some(Scale::X2),
            4 => Some(Scale::X4),
            8 => Some(Scale::X8),
            _ => None,
        }
    }
}

/// An x64 memory operand: base + index*scale + disp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<Gpr>,
    /// Index register; cannot be RSP.
    pub index: Option<Gpr>,
    pub scale: Scale,
    pub disp: i32,
}

impl MemOperand {
    /// [base]
    #[inline]
    pub const fn base(reg: Gpr) -> Self {
        MemOperand {
            base: Some(reg),
            index: None,
            scale: Scale::X1,
            disp: 0,
        }
    }

    /// [base + disp]
    #[inline]
    pub const fn base_disp(reg: Gpr, disp: i32) -> Self {
        MemOperand {
            base: Some(reg),
            index: None,
            scale: Scale::X1,
            disp,
        }
    }

    /// [base + index*scale]
    #[inline]
    pub const fn base_index(base: Gpr, index: Gpr, scale: Scale) -> Self {
        MemOperand {
            base: Some(base),
            index: Some(index),
            scale,
            disp: 0,
        }
    }

    /// [base + index*scale + disp]
    #[inline]
    pub const fn base_index_disp(base: Gpr, index: Gpr, scale: Scale, disp: i32) -> Self {
        MemOperand {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
        }
    }

    #[inline]
    pub const fn disp_fits_i8(&self) -> bool {
        self.disp >= -128 && self.disp <= 127
    }
}

// =============================================================================
// Tests
// =============================================================================
