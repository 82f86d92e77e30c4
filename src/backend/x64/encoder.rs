//! x64 instruction encoder.
//!
//! Low-level encoding for the instruction subset the lowering engine emits:
//! REX prefix generation, ModR/M and SIB bytes, 8/32-bit displacements and
//! the relative branch forms the label manager patches.
//!
//! Encoding layout:
//! ```text
//! [Prefixes] [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```
//!
//! Every function returns a fixed-size [`EncodedInst`]; nothing here touches
//! the code stream. Branch encodings place their relative immediate in the
//! trailing bytes so the caller can register a fixup for them.

use super::registers::{Gpr, MemOperand, Scale};

// =============================================================================
// REX Prefix
// =============================================================================

/// REX prefix byte, format 0100WRXB.
#[derive(Debug, Clone, Copy)]
pub struct Rex {
    pub w: bool, // 64-bit operand
    pub r: bool, // Extends reg in ModR/M
    pub x: bool, // Extends index in SIB
    pub b: bool, // Extends r/m in ModR/M or base in SIB
}

impl Rex {
    /// REX for register-register operations.
    #[inline]
    pub const fn rr(w: bool, reg: Gpr, rm: Gpr) -> Self {
        Rex {
            w,
            r: reg.high_bit(),
            x: false,
            b: rm.high_bit(),
        }
    }

    /// REX for register-memory operations.
    #[inline]
    pub const fn rm(w: bool, reg: Gpr, mem: &MemOperand) -> Self {
        Rex {
            w,
            r: reg.high_bit(),
            x: match mem.index {
                Some(idx) => idx.high_bit(),
                None => false,
            },
            b: match mem.base {
                Some(base) => base.high_bit(),
                None => false,
            },
        }
    }

    /// REX with only the B extension for single-register forms.
    #[inline]
    pub const fn b_only(w: bool, rm: Gpr) -> Self {
        Rex {
            w,
            r: false,
            x: false,
            b: rm.high_bit(),
        }
    }

    /// Whether any bit is set (prefix required).
    #[inline]
    pub const fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b
    }

    /// Encode the prefix byte.
    #[inline]
    pub const fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3)
            | ((self.r as u8) << 2)
            | ((self.x as u8) << 1)
            | (self.b as u8)
    }
}

// =============================================================================
// ModR/M and SIB
// =============================================================================

/// Mod field values for ModR/M.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mod {
    Indirect = 0b00,
    IndirectDisp8 = 0b01,
    IndirectDisp32 = 0b10,
    Direct = 0b11,
}

/// Encode a ModR/M byte.
#[inline]
pub const fn modrm(mod_: Mod, reg: u8, rm: u8) -> u8 {
    ((mod_ as u8) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// Encode a SIB byte.
#[inline]
pub const fn sib(scale: Scale, index: u8, base: u8) -> u8 {
    ((scale as u8) << 6) | ((index & 0x7) << 3) | (base & 0x7)
}

// =============================================================================
// Instruction Encoding Buffer
// =============================================================================

/// Maximum encoded instruction length on x64.
pub const MAX_INST_LEN: usize = 15;

/// Fixed-size encoding buffer for one instruction.
#[derive(Debug, Clone, Copy)]
pub struct EncodedInst {
    bytes: [u8; MAX_INST_LEN],
    len: u8,
}

impl EncodedInst {
    #[inline]
    pub const fn new() -> Self {
        EncodedInst {
            bytes: [0; MAX_INST_LEN],
            len: 0,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn push(&mut self, byte: u8) {
        debug_assert!((self.len as usize) < MAX_INST_LEN);
        self.bytes[self.len as usize] = byte;
        self.len += 1;
    }

    #[inline]
    fn push_u16(&mut self, val: u16) {
        for b in val.to_le_bytes() {
            self.push(b);
        }
    }

    #[inline]
    fn push_u32(&mut self, val: u32) {
        for b in val.to_le_bytes() {
            self.push(b);
        }
    }

    #[inline]
    fn push_u64(&mut self, val: u64) {
        for b in val.to_le_bytes() {
            self.push(b);
        }
    }
}

impl Default for EncodedInst {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Generic forms
// =============================================================================

/// OP r/m64, r64 (or r/m32, r32 when `w` is false).
#[inline]
pub fn encode_rr(opcode: u8, dst: Gpr, src: Gpr, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::rr(w, src, dst);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, src.low_bits(), dst.low_bits()));
    enc
}

/// Two-byte-opcode (0F xx) register-register form, reg field = dst.
#[inline]
pub fn encode_rr_0f(opcode: u8, dst: Gpr, src: Gpr, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::rr(w, dst, src);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(0x0F);
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, dst.low_bits(), src.low_bits()));
    enc
}

/// OP r/m64, imm8 (opcode /digit form, sign-extended immediate).
#[inline]
pub fn encode_ri8(opcode: u8, digit: u8, dst: Gpr, imm: i8, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::b_only(w, dst);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
    enc.push(imm as u8);
    enc
}

/// OP r/m64, imm32 (opcode /digit form, sign-extended immediate).
#[inline]
pub fn encode_ri32(opcode: u8, digit: u8, dst: Gpr, imm: i32, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::b_only(w, dst);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
    enc.push_u32(imm as u32);
    enc
}

/// Single-register /digit form with no immediate (NEG, NOT, IDIV, ...).
#[inline]
fn encode_unary(opcode: u8, digit: u8, dst: Gpr, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::b_only(w, dst);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(opcode);
    enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
    enc
}

/// OP r64, [mem].
#[inline]
pub fn encode_rm(opcode: u8, reg: Gpr, mem: &MemOperand, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::rm(w, reg, mem);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(opcode);
    encode_modrm_sib_disp(&mut enc, reg.low_bits(), mem);
    enc
}

/// Two-byte-opcode (0F xx) register-memory form.
#[inline]
pub fn encode_rm_0f(opcode: u8, reg: Gpr, mem: &MemOperand, w: bool) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::rm(w, reg, mem);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(0x0F);
    enc.push(opcode);
    encode_modrm_sib_disp(&mut enc, reg.low_bits(), mem);
    enc
}

/// ModR/M, optional SIB, and displacement for a memory operand.
fn encode_modrm_sib_disp(enc: &mut EncodedInst, reg: u8, mem: &MemOperand) {
    match (mem.base, mem.index) {
        // [RIP + disp32]
        (None, None) => {
            enc.push(modrm(Mod::Indirect, reg, 0b101));
            enc.push_u32(mem.disp as u32);
        }

        // [base] or [base + disp]
        (Some(base), None) => {
            let forced_disp = base.needs_displacement() && mem.disp == 0;

            let mod_field = if mem.disp == 0 && !forced_disp {
                Mod::Indirect
            } else if mem.disp_fits_i8() {
                Mod::IndirectDisp8
            } else {
                Mod::IndirectDisp32
            };

            if base.needs_sib_as_base() {
                enc.push(modrm(mod_field, reg, 0b100));
                // SIB with no index: index=RSP(100)
                enc.push(sib(Scale::X1, 0b100, base.low_bits()));
            } else {
                enc.push(modrm(mod_field, reg, base.low_bits()));
            }

            match mod_field {
                Mod::IndirectDisp8 => enc.push(mem.disp as i8 as u8),
                Mod::IndirectDisp32 => enc.push_u32(mem.disp as u32),
                _ if forced_disp => enc.push(0), // RBP/R13 need at least disp8=0
                _ => {}
            }
        }

        // [base + index*scale (+ disp)]
        (Some(base), Some(index)) => {
            debug_assert!(
                index.low_bits() != 0b100 || index.high_bit(),
                "RSP cannot be used as index register"
            );

            let mod_field = if mem.disp == 0 && !base.needs_displacement() {
                Mod::Indirect
            } else if mem.disp_fits_i8() {
                Mod::IndirectDisp8
            } else {
                Mod::IndirectDisp32
            };

            enc.push(modrm(mod_field, reg, 0b100));
            enc.push(sib(mem.scale, index.low_bits(), base.low_bits()));

            match mod_field {
                Mod::IndirectDisp8 => enc.push(mem.disp as i8 as u8),
                Mod::IndirectDisp32 => enc.push_u32(mem.disp as u32),
                Mod::Indirect if base.needs_displacement() => enc.push(0),
                _ => {}
            }
        }

        // [index*scale + disp32], no base
        (None, Some(index)) => {
            enc.push(modrm(Mod::Indirect, reg, 0b100));
            // SIB base=RBP(101) with mod=00 means [disp32]
            enc.push(sib(mem.scale, index.low_bits(), 0b101));
            enc.push_u32(mem.disp as u32);
        }
    }
}

// =============================================================================
// Data movement
// =============================================================================

/// MOV r64, r64
#[inline]
pub fn encode_mov_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x89, dst, src, true)
}

/// MOV r32, r32 (zero-extends)
#[inline]
pub fn encode_mov_rr32(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x89, dst, src, false)
}

/// MOV r64, [mem]
#[inline]
pub fn encode_mov_rm(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm(0x8B, dst, mem, true)
}

/// MOV [mem], r64
#[inline]
pub fn encode_mov_mr(mem: &MemOperand, src: Gpr) -> EncodedInst {
    encode_rm(0x89, src, mem, true)
}

/// MOV r32, [mem] (zero-extends)
#[inline]
pub fn encode_mov_rm32(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm(0x8B, dst, mem, false)
}

/// MOV [mem], r32
#[inline]
pub fn encode_mov_mr32(mem: &MemOperand, src: Gpr) -> EncodedInst {
    encode_rm(0x89, src, mem, false)
}

/// MOV [mem], r16
#[inline]
pub fn encode_mov_mr16(mem: &MemOperand, src: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x66);
    let rex = Rex::rm(false, src, mem);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(0x89);
    encode_modrm_sib_disp(&mut enc, src.low_bits(), mem);
    enc
}

/// MOV [mem], r8 (low byte; REX forced for RSP/RBP/RSI/RDI sources)
#[inline]
pub fn encode_mov_mr8(mem: &MemOperand, src: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::rm(false, src, mem);
    // A REX prefix is forced for RSP/RBP/RSI/RDI so the byte form selects
    // SPL/BPL/SIL/DIL rather than AH/CH/DH/BH.
    if rex.is_needed() || matches!(src, Gpr::Rsp | Gpr::Rbp | Gpr::Rsi | Gpr::Rdi) {
        enc.push(rex.encode());
    }
    enc.push(0x88);
    encode_modrm_sib_disp(&mut enc, src.low_bits(), mem);
    enc
}

/// MOVZX r32, byte [mem]
#[inline]
pub fn encode_movzx_rm8(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm_0f(0xB6, dst, mem, false)
}

/// MOVZX r32, word [mem]
#[inline]
pub fn encode_movzx_rm16(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm_0f(0xB7, dst, mem, false)
}

/// MOVSX r32, byte [mem]
#[inline]
pub fn encode_movsx_rm8(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm_0f(0xBE, dst, mem, false)
}

/// MOVSX r32, word [mem]
#[inline]
pub fn encode_movsx_rm16(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm_0f(0xBF, dst, mem, false)
}

/// MOVSXD r64, r/m32 (sign-extend dword)
#[inline]
pub fn encode_movsxd(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x63, src, dst, true)
}

/// MOVSXD r64, dword [mem]
#[inline]
pub fn encode_movsxd_rm(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm(0x63, dst, mem, true)
}

/// MOVZX r64, r/m8 (zero-extend a SETcc result)
#[inline]
pub fn encode_movzx_rb(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr_0f(0xB6, dst, src, true)
}

/// MOV r64, imm64 (REX.W + B8+rd)
#[inline]
pub fn encode_mov_ri64(dst: Gpr, imm: i64) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(Rex::b_only(true, dst).encode());
    enc.push(0xB8 + dst.low_bits());
    enc.push_u64(imm as u64);
    enc
}

/// MOV r32, imm32 (B8+rd, zero-extends)
#[inline]
pub fn encode_mov_ri32(dst: Gpr, imm: u32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    if dst.high_bit() {
        enc.push(Rex::b_only(false, dst).encode());
    }
    enc.push(0xB8 + dst.low_bits());
    enc.push_u32(imm);
    enc
}

/// LEA r64, [mem]
#[inline]
pub fn encode_lea(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm(0x8D, dst, mem, true)
}

/// LEA r64, [rip + disp32] with a zero displacement in the trailing four
/// bytes, for the label manager to patch.
#[inline]
pub fn encode_lea_rip(dst: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex {
        w: true,
        r: dst.high_bit(),
        x: false,
        b: false,
    };
    enc.push(rex.encode());
    enc.push(0x8D);
    enc.push(modrm(Mod::Indirect, dst.low_bits(), 0b101));
    enc.push_u32(0);
    enc
}

// =============================================================================
// Arithmetic and bitwise
// =============================================================================

/// ADD r64, r64
#[inline]
pub fn encode_add_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x01, dst, src, true)
}

/// ADD r64, imm32 (narrows to the imm8 form when possible)
#[inline]
pub fn encode_add_ri(dst: Gpr, imm: i32) -> EncodedInst {
    if (-128..=127).contains(&imm) {
        encode_ri8(0x83, 0, dst, imm as i8, true)
    } else {
        encode_ri32(0x81, 0, dst, imm, true)
    }
}

/// SUB r64, r64
#[inline]
pub fn encode_sub_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x29, dst, src, true)
}

/// SUB r64, imm32
#[inline]
pub fn encode_sub_ri(dst: Gpr, imm: i32) -> EncodedInst {
    if (-128..=127).contains(&imm) {
        encode_ri8(0x83, 5, dst, imm as i8, true)
    } else {
        encode_ri32(0x81, 5, dst, imm, true)
    }
}

/// IMUL r64, r64
#[inline]
pub fn encode_imul_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr_0f(0xAF, dst, src, true)
}

/// IMUL r64, r64, imm32
#[inline]
pub fn encode_imul_rri(dst: Gpr, src: Gpr, imm: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(Rex::rr(true, dst, src).encode());
    if (-128..=127).contains(&imm) {
        enc.push(0x6B);
        enc.push(modrm(Mod::Direct, dst.low_bits(), src.low_bits()));
        enc.push(imm as u8);
    } else {
        enc.push(0x69);
        enc.push(modrm(Mod::Direct, dst.low_bits(), src.low_bits()));
        enc.push_u32(imm as u32);
    }
    enc
}

/// IDIV r64 (divide RDX:RAX)
#[inline]
pub fn encode_idiv(src: Gpr) -> EncodedInst {
    encode_unary(0xF7, 7, src, true)
}

/// CQO (sign-extend RAX into RDX:RAX)
#[inline]
pub fn encode_cqo() -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x48);
    enc.push(0x99);
    enc
}

/// NEG r64
#[inline]
pub fn encode_neg(dst: Gpr) -> EncodedInst {
    encode_unary(0xF7, 3, dst, true)
}

/// NOT r64
#[inline]
pub fn encode_not(dst: Gpr) -> EncodedInst {
    encode_unary(0xF7, 2, dst, true)
}

/// AND r64, r64
#[inline]
pub fn encode_and_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x21, dst, src, true)
}

/// AND r64, imm32
#[inline]
pub fn encode_and_ri(dst: Gpr, imm: i32) -> EncodedInst {
    if (-128..=127).contains(&imm) {
        encode_ri8(0x83, 4, dst, imm as i8, true)
    } else {
        encode_ri32(0x81, 4, dst, imm, true)
    }
}

/// OR r64, r64
#[inline]
pub fn encode_or_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x09, dst, src, true)
}

/// OR r64, imm32
#[inline]
pub fn encode_or_ri(dst: Gpr, imm: i32) -> EncodedInst {
    if (-128..=127).contains(&imm) {
        encode_ri8(0x83, 1, dst, imm as i8, true)
    } else {
        encode_ri32(0x81, 1, dst, imm, true)
    }
}

/// XOR r64, r64
#[inline]
pub fn encode_xor_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x31, dst, src, true)
}

/// XOR r64, imm32
#[inline]
pub fn encode_xor_ri(dst: Gpr, imm: i32) -> EncodedInst {
    if (-128..=127).contains(&imm) {
        encode_ri8(0x83, 6, dst, imm as i8, true)
    } else {
        encode_ri32(0x81, 6, dst, imm, true)
    }
}

/// Shift group: SHL=4, SHR=5, SAR=7.
#[inline]
fn encode_shift_ri(digit: u8, dst: Gpr, imm: u8) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(Rex::b_only(true, dst).encode());
    if imm == 1 {
        enc.push(0xD1);
        enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
    } else {
        enc.push(0xC1);
        enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
        enc.push(imm);
    }
    enc
}

#[inline]
fn encode_shift_cl(digit: u8, dst: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(Rex::b_only(true, dst).encode());
    enc.push(0xD3);
    enc.push(modrm(Mod::Direct, digit, dst.low_bits()));
    enc
}

/// SHL r64, imm8
#[inline]
pub fn encode_shl_ri(dst: Gpr, imm: u8) -> EncodedInst {
    encode_shift_ri(4, dst, imm)
}

/// SHL r64, cl
#[inline]
pub fn encode_shl_cl(dst: Gpr) -> EncodedInst {
    encode_shift_cl(4, dst)
}

/// SHR r64, imm8
#[inline]
pub fn encode_shr_ri(dst: Gpr, imm: u8) -> EncodedInst {
    encode_shift_ri(5, dst, imm)
}

/// SHR r64, cl
#[inline]
pub fn encode_shr_cl(dst: Gpr) -> EncodedInst {
    encode_shift_cl(5, dst)
}

/// SAR r64, imm8
#[inline]
pub fn encode_sar_ri(dst: Gpr, imm: u8) -> EncodedInst {
    encode_shift_ri(7, dst, imm)
}

/// SAR r64, cl
#[inline]
pub fn encode_sar_cl(dst: Gpr) -> EncodedInst {
    encode_shift_cl(7, dst)
}

// =============================================================================
// Comparison
// =============================================================================

/// CMP r64, r64
#[inline]
pub fn encode_cmp_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x39, dst, src, true)
}

/// CMP r64, imm32
#[inline]
pub fn encode_cmp_ri(dst: Gpr, imm: i32) -> EncodedInst {
    if (-128..=127).contains(&imm) {
        encode_ri8(0x83, 7, dst, imm as i8, true)
    } else {
        encode_ri32(0x81, 7, dst, imm, true)
    }
}

/// CMP r64, [mem]
#[inline]
pub fn encode_cmp_rm(dst: Gpr, mem: &MemOperand) -> EncodedInst {
    encode_rm(0x3B, dst, mem, true)
}

/// CMP dword [mem], imm8 (sign-extended); used by the safepoint poll.
#[inline]
pub fn encode_cmp_mi8(mem: &MemOperand, imm: i8) -> EncodedInst {
    let mut enc = EncodedInst::new();
    let rex = Rex::rm(false, Gpr::Rax, mem);
    if rex.is_needed() {
        enc.push(rex.encode());
    }
    enc.push(0x83);
    encode_modrm_sib_disp(&mut enc, 7, mem);
    enc.push(imm as u8);
    enc
}

/// TEST r64, r64
#[inline]
pub fn encode_test_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_rr(0x85, dst, src, true)
}

// =============================================================================
// Control flow
// =============================================================================

/// Condition codes for Jcc/SETcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x0,
    NoOverflow = 0x1,
    Below = 0x2,
    AboveEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NoSign = 0x9,
    Parity = 0xA,
    NoParity = 0xB,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

impl Condition {
    /// The inverted condition.
    #[inline]
    pub const fn invert(self) -> Condition {
        match self {
            Condition::Overflow => Condition::NoOverflow,
            Condition::NoOverflow => Condition::Overflow,
            Condition::Below => Condition::AboveEqual,
            Condition::AboveEqual => Condition::Below,
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::BelowEqual => Condition::Above,
            Condition::Above => Condition::BelowEqual,
            Condition::Sign => Condition::NoSign,
            Condition::NoSign => Condition::Sign,
            Condition::Parity => Condition::NoParity,
            Condition::NoParity => Condition::Parity,
            Condition::Less => Condition::GreaterEqual,
            Condition::GreaterEqual => Condition::Less,
            Condition::LessEqual => Condition::Greater,
            Condition::Greater => Condition::LessEqual,
        }
    }
}

/// JMP rel8
#[inline]
pub fn encode_jmp_rel8(offset: i8) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0xEB);
    enc.push(offset as u8);
    enc
}

/// JMP rel32
#[inline]
pub fn encode_jmp_rel32(offset: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0xE9);
    enc.push_u32(offset as u32);
    enc
}

/// JMP r64 (indirect)
#[inline]
pub fn encode_jmp_r(target: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    if target.high_bit() {
        enc.push(Rex::b_only(false, target).encode());
    }
    enc.push(0xFF);
    enc.push(modrm(Mod::Direct, 4, target.low_bits()));
    enc
}

/// Jcc rel8
#[inline]
pub fn encode_jcc_rel8(cond: Condition, offset: i8) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x70 + cond as u8);
    enc.push(offset as u8);
    enc
}

/// Jcc rel32
#[inline]
pub fn encode_jcc_rel32(cond: Condition, offset: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x0F);
    enc.push(0x80 + cond as u8);
    enc.push_u32(offset as u32);
    enc
}

/// SETcc r/m8
#[inline]
pub fn encode_setcc(cond: Condition, dst: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    if dst.high_bit() || matches!(dst, Gpr::Rsp | Gpr::Rbp | Gpr::Rsi | Gpr::Rdi) {
        enc.push(Rex::b_only(false, dst).encode());
    }
    enc.push(0x0F);
    enc.push(0x90 + cond as u8);
    enc.push(modrm(Mod::Direct, 0, dst.low_bits()));
    enc
}

/// CALL rel32
#[inline]
pub fn encode_call_rel32(offset: i32) -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0xE8);
    enc.push_u32(offset as u32);
    enc
}

/// CALL r64 (indirect)
#[inline]
pub fn encode_call_r(target: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    if target.high_bit() {
        enc.push(Rex::b_only(false, target).encode());
    }
    enc.push(0xFF);
    enc.push(modrm(Mod::Direct, 2, target.low_bits()));
    enc
}

/// PUSH r64
#[inline]
pub fn encode_push(src: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    if src.high_bit() {
        enc.push(Rex::b_only(false, src).encode());
    }
    enc.push(0x50 + src.low_bits());
    enc
}

/// POP r64
#[inline]
pub fn encode_pop(dst: Gpr) -> EncodedInst {
    let mut enc = EncodedInst::new();
    if dst.high_bit() {
        enc.push(Rex::b_only(false, dst).encode());
    }
    enc.push(0x58 + dst.low_bits());
    enc
}

/// RET
#[inline]
pub fn encode_ret() -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0xC3);
    enc
}

/// NOP
#[inline]
pub fn encode_nop() -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x90);
    enc
}

/// UD2 (trap for unreachable paths)
#[inline]
pub fn encode_ud2() -> EncodedInst {
    let mut enc = EncodedInst::new();
    enc.push(0x0F);
    enc.push(0x0B);
    enc
}

// =============================================================================
// Branch immediate geometry
// =============================================================================

/// Byte length of a rel8 conditional branch.
pub const JCC_REL8_LEN: usize = 2;
/// Byte length of a rel32 conditional branch.
pub const JCC_REL32_LEN: usize = 6;
/// Byte length of a rel8 unconditional jump.
pub const JMP_REL8_LEN: usize = 2;
/// Byte length of a rel32 unconditional jump.
pub const JMP_REL32_LEN: usize = 5;
/// Byte length of a rel32 call.
pub const CALL_REL32_LEN: usize = 5;

// =============================================================================
// Tests
// =============================================================================
