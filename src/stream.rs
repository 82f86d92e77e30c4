//! Append-only code stream.
//!
//! The foundation of the backend: a growable byte buffer plus write cursor.
//! Everything else - encoder output, switch tables, chaining-cell stubs -
//! lands here. Patching already-written bytes goes through a typed
//! [`PatchableImm`] handle naming an immediate field that was reserved when
//! the instruction was emitted; raw offsets are never patched directly, so a
//! patch can only ever touch immediate-operand bytes of a fully formed
//! instruction.

use crate::backend::x64::EncodedInst;
use crate::error::CompileError;

/// Width of a reserved immediate field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImmWidth {
    B8 = 1,
    B16 = 2,
    B32 = 4,
}

impl ImmWidth {
    /// Width in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Width in bits, for diagnostics.
    #[inline]
    pub const fn bits(self) -> u8 {
        (self as u8) * 8
    }

    /// Whether a signed displacement fits this width.
    #[inline]
    pub const fn fits(self, disp: i64) -> bool {
        match self {
            ImmWidth::B8 => disp >= i8::MIN as i64 && disp <= i8::MAX as i64,
            ImmWidth::B16 => disp >= i16::MIN as i64 && disp <= i16::MAX as i64,
            ImmWidth::B32 => disp >= i32::MIN as i64 && disp <= i32::MAX as i64,
        }
    }
}

/// Handle to an immediate field inside an already-emitted instruction.
///
/// `offset` is the position of the field's first byte; `end` is the address
/// the displacement is relative to (the byte after the instruction). The
/// handle is the only way to rewrite emitted bytes, which keeps every patch
/// inside an immediate field by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchableImm {
    offset: usize,
    width: ImmWidth,
    end: usize,
}

impl PatchableImm {
    /// Offset of the immediate's first byte in the stream.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn width(&self) -> ImmWidth {
        self.width
    }

    /// Stream offset the relative displacement is computed from.
    #[inline]
    pub fn anchor(&self) -> usize {
        self.end
    }
}

/// Append-only byte buffer with a write cursor.
pub struct CodeStream {
    code: Vec<u8>,
    limit: usize,
}

impl CodeStream {
    /// Per-trace code size limit. A trace that outgrows this is aborted
    /// rather than silently truncated.
    pub const DEFAULT_LIMIT: usize = 1 << 20;

    pub fn new() -> Self {
        CodeStream {
            code: Vec::with_capacity(1024),
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        CodeStream {
            code: Vec::with_capacity(1024),
            limit,
        }
    }

    /// Current write cursor.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.code
    }

    /// Consume the stream, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    #[inline]
    fn check_limit(&self, extra: usize) -> Result<(), CompileError> {
        if self.code.len() + extra > self.limit {
            Err(CompileError::CodeBufferLimit(self.limit))
        } else {
            Ok(())
        }
    }

    /// Append one byte.
    #[inline]
    pub fn emit_u8(&mut self, byte: u8) -> Result<(), CompileError> {
        self.check_limit(1)?;
        self.code.push(byte);
        Ok(())
    }

    /// Append raw bytes.
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), CompileError> {
        self.check_limit(bytes.len())?;
        self.code.extend_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) -> Result<(), CompileError> {
        self.emit_bytes(&val.to_le_bytes())
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) -> Result<(), CompileError> {
        self.emit_bytes(&val.to_le_bytes())
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) -> Result<(), CompileError> {
        self.emit_bytes(&val.to_le_bytes())
    }

    /// Append a fully encoded instruction.
    #[inline]
    pub fn emit_inst(&mut self, inst: &EncodedInst) -> Result<(), CompileError> {
        self.emit_bytes(inst.as_slice())
    }

    /// Append an instruction whose trailing `width` bytes are a relative
    /// immediate to be patched later. Returns the handle for that field.
    pub fn emit_inst_patchable(
        &mut self,
        inst: &EncodedInst,
        width: ImmWidth,
    ) -> Result<PatchableImm, CompileError> {
        debug_assert!(inst.len() > width.bytes());
        self.emit_bytes(inst.as_slice())?;
        let end = self.code.len();
        Ok(PatchableImm {
            offset: end - width.bytes(),
            width,
            end,
        })
    }

    /// Patch a previously reserved immediate with the displacement from its
    /// anchor to `target`. Fails if the displacement does not fit the width
    /// reserved at emission time.
    pub fn patch_imm(&mut self, imm: PatchableImm, target: usize) -> Result<(), CompileError> {
        debug_assert!(imm.offset + imm.width.bytes() <= self.code.len());
        let disp = target as i64 - imm.end as i64;
        if !imm.width.fits(disp) {
            return Err(CompileError::ImmediateOverflow {
                offset: imm.offset,
                width: imm.width.bits(),
                disp,
            });
        }
        match imm.width {
            ImmWidth::B8 => self.code[imm.offset] = disp as i8 as u8,
            ImmWidth::B16 => {
                self.code[imm.offset..imm.offset + 2]
                    .copy_from_slice(&(disp as i16).to_le_bytes());
            }
            ImmWidth::B32 => {
                self.code[imm.offset..imm.offset + 4]
                    .copy_from_slice(&(disp as i32).to_le_bytes());
            }
        }
        Ok(())
    }

    /// Patch an absolute 32-bit value (switch-table entries store native
    /// offsets, not branch displacements).
    pub fn patch_abs32(&mut self, imm: PatchableImm, value: u32) -> Result<(), CompileError> {
        debug_assert!(imm.offset + imm.width.bytes() <= self.code.len());
        match imm.width {
            ImmWidth::B32 => {
                self.code[imm.offset..imm.offset + 4].copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
            _ => Err(CompileError::ImmediateOverflow {
                offset: imm.offset,
                width: imm.width.bits(),
                disp: value as i64,
            }),
        }
    }

    /// Reserve `width` bytes of zeroed data (table slots, chain-cell
    /// payloads) and return a handle to them.
    pub fn reserve_data(&mut self, width: ImmWidth) -> Result<PatchableImm, CompileError> {
        self.check_limit(width.bytes())?;
        let offset = self.code.len();
        self.code.resize(offset + width.bytes(), 0);
        Ok(PatchableImm {
            offset,
            width,
            end: offset + width.bytes(),
        })
    }

    /// Align the cursor with single-byte NOPs (0x90). Data tables appended
    /// after the body start aligned.
    pub fn align(&mut self, align: usize) -> Result<(), CompileError> {
        debug_assert!(align.is_power_of_two());
        while self.code.len() % align != 0 {
            self.emit_u8(0x90)?;
        }
        Ok(())
    }
}

impl Default for CodeStream {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
