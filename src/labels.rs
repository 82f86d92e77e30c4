//! Labels, relocations and worklists.
//!
//! One per-compilation manager owns every pending fixup, split into four
//! classes:
//!
//! - shared helper labels: enum-keyed entry points (throw tails, the
//!   safepoint call, exception dispatch) that many sites branch to and that
//!   are bound exactly once, late in the compilation
//! - local labels: short-lived ids scoped to a single guest instruction's
//!   emission (guard skip-overs, slow-path reconvergence)
//! - guest-pc worklist: branches to guest addresses that may not be emitted
//!   yet; binding a guest pc drains its pending entries
//! - data-section worklist: switch tables and raw payloads appended after
//!   the body, plus chaining cells that deliberately stay unresolved for an
//!   external patcher
//!
//! All worklists are vector-backed. A forward reference reserves its
//! immediate width up front; a resolved displacement that does not fit that
//! width is a fatal [`CompileError::ImmediateOverflow`]. Backward branches
//! pick rel8 exactly when the displacement fits after accounting for the
//! branch's own length.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::backend::x64::encoder::{self, Condition};
use crate::error::CompileError;
use crate::stream::{CodeStream, ImmWidth, PatchableImm};

// =============================================================================
// Helper labels
// =============================================================================

/// Shared per-trace entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HelperLabel {
    ThrowNull = 0,
    ThrowBounds = 1,
    ThrowDivZero = 2,
    ThrowNegativeSize = 3,
    ThrowCast = 4,
    ThrowNoMethod = 5,
    ThrowVerify = 6,
    SafepointCall = 7,
    ExceptionDispatch = 8,
    /// The trace's shared return path; `return` sites jump here.
    Epilogue = 9,
}

impl HelperLabel {
    pub const COUNT: usize = 10;

    pub const ALL: [HelperLabel; Self::COUNT] = [
        HelperLabel::ThrowNull,
        HelperLabel::ThrowBounds,
        HelperLabel::ThrowDivZero,
        HelperLabel::ThrowNegativeSize,
        HelperLabel::ThrowCast,
        HelperLabel::ThrowNoMethod,
        HelperLabel::ThrowVerify,
        HelperLabel::SafepointCall,
        HelperLabel::ExceptionDispatch,
        HelperLabel::Epilogue,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            HelperLabel::ThrowNull => "throw-null",
            HelperLabel::ThrowBounds => "throw-bounds",
            HelperLabel::ThrowDivZero => "throw-div-zero",
            HelperLabel::ThrowNegativeSize => "throw-negative-size",
            HelperLabel::ThrowCast => "throw-cast",
            HelperLabel::ThrowNoMethod => "throw-no-method",
            HelperLabel::ThrowVerify => "throw-verify",
            HelperLabel::SafepointCall => "safepoint-call",
            HelperLabel::ExceptionDispatch => "exception-dispatch",
            HelperLabel::Epilogue => "epilogue",
        }
    }
}

// =============================================================================
// Local labels
// =============================================================================

/// A short-term label id, valid for one guest instruction's emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalLabel(u32);

// =============================================================================
// Chaining cells
// =============================================================================

/// Why a chaining cell exists; the external patcher treats the kinds
/// differently when relinking traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// Fallthrough exit to unchained code.
    Normal,
    /// Return site of an invoke.
    Invoke,
    /// Loop back edge that may later chain to another trace.
    BackEdge,
}

/// A chaining cell: a complete jump whose 4-byte immediate the runtime
/// rewrites after publication. Reported unresolved by design.
#[derive(Debug, Clone, Copy)]
pub struct ChainCell {
    pub kind: ChainKind,
    /// Guest pc the cell stands for.
    pub guest_target: u32,
    /// Handle to the jump's immediate bytes.
    pub imm: PatchableImm,
}

// =============================================================================
// Data-section worklist
// =============================================================================

/// Deferred data emitted after the trace body.
pub enum DataPayload {
    /// Switch table: one 4-byte slot per case, holding the case target's
    /// code offset relative to the table base.
    SwitchTable(Vec<u32>),
    /// Raw payload (fill-array data), copied verbatim.
    Bytes(Vec<u8>),
}

struct DataEntry {
    payload: DataPayload,
    /// RIP-relative displacement of the LEA that materializes the payload
    /// address; patched to the table base when the data section is emitted.
    lea_imm: PatchableImm,
}

/// A pending reference to an unbound guest pc.
enum GuestFixup {
    /// Relative branch immediate.
    Branch(PatchableImm),
    /// Switch-table slot holding `code_offset - table_base`.
    TableEntry { slot: PatchableImm, table_base: usize },
}

// =============================================================================
// Manager
// =============================================================================

/// All label and fixup state for one compilation.
pub struct Labels {
    helper_offsets: [Option<usize>; HelperLabel::COUNT],
    helper_pending: Vec<(HelperLabel, PatchableImm)>,
    local_offsets: Vec<Option<usize>>,
    local_pending: Vec<(u32, PatchableImm)>,
    guest_bound: FxHashMap<u32, usize>,
    guest_pending: FxHashMap<u32, SmallVec<[GuestFixup; 2]>>,
    data: Vec<DataEntry>,
    chain_cells: Vec<ChainCell>,
}

impl Labels {
    pub fn new() -> Self {
        Labels {
            helper_offsets: [None; HelperLabel::COUNT],
            helper_pending: Vec::new(),
            local_offsets: Vec::new(),
            local_pending: Vec::new(),
            guest_bound: FxHashMap::default(),
            guest_pending: FxHashMap::default(),
            data: Vec::new(),
            chain_cells: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Shared helper labels
    // -------------------------------------------------------------------------

    /// Conditional branch to a shared helper entry point. Always rel32: the
    /// helper tails sit at the end of the trace, past any rel8 range worth
    /// betting on.
    pub fn jcc_helper(
        &mut self,
        stream: &mut CodeStream,
        cond: Condition,
        label: HelperLabel,
    ) -> Result<(), CompileError> {
        let imm =
            stream.emit_inst_patchable(&encoder::encode_jcc_rel32(cond, 0), ImmWidth::B32)?;
        self.resolve_helper(stream, label, imm)
    }

    /// Unconditional jump to a shared helper entry point.
    pub fn jmp_helper(
        &mut self,
        stream: &mut CodeStream,
        label: HelperLabel,
    ) -> Result<(), CompileError> {
        let imm = stream.emit_inst_patchable(&encoder::encode_jmp_rel32(0), ImmWidth::B32)?;
        self.resolve_helper(stream, label, imm)
    }

    /// Call a shared helper entry point (the safepoint tail returns to its
    /// caller, so sites reach it with `call` rather than `jmp`).
    pub fn call_helper_label(
        &mut self,
        stream: &mut CodeStream,
        label: HelperLabel,
    ) -> Result<(), CompileError> {
        let imm = stream.emit_inst_patchable(&encoder::encode_call_rel32(0), ImmWidth::B32)?;
        self.resolve_helper(stream, label, imm)
    }

    fn resolve_helper(
        &mut self,
        stream: &mut CodeStream,
        label: HelperLabel,
        imm: PatchableImm,
    ) -> Result<(), CompileError> {
        match self.helper_offsets[label.index()] {
            Some(offset) => stream.patch_imm(imm, offset),
            None => {
                self.helper_pending.push((label, imm));
                Ok(())
            }
        }
    }

    /// Bind a helper label at the current cursor, draining its worklist.
    /// Binding twice is a compilation defect.
    pub fn bind_helper(
        &mut self,
        stream: &mut CodeStream,
        label: HelperLabel,
    ) -> Result<usize, CompileError> {
        if self.helper_offsets[label.index()].is_some() {
            return Err(CompileError::DuplicateHelperBind(label.name()));
        }
        let offset = stream.cursor();
        self.helper_offsets[label.index()] = Some(offset);
        let mut i = 0;
        while i < self.helper_pending.len() {
            if self.helper_pending[i].0 == label {
                let (_, imm) = self.helper_pending.swap_remove(i);
                stream.patch_imm(imm, offset)?;
            } else {
                i += 1;
            }
        }
        Ok(offset)
    }

    /// Whether any site branched to this helper. The driver only emits tails
    /// for helpers that are actually reached.
    pub fn helper_used(&self, label: HelperLabel) -> bool {
        self.helper_offsets[label.index()].is_some()
            || self.helper_pending.iter().any(|(l, _)| *l == label)
    }

    // -------------------------------------------------------------------------
    // Local labels
    // -------------------------------------------------------------------------

    /// Allocate a fresh local label.
    pub fn new_local(&mut self) -> LocalLabel {
        let id = self.local_offsets.len() as u32;
        self.local_offsets.push(None);
        LocalLabel(id)
    }

    /// Conditional branch to a local label. Forward references reserve the
    /// requested width; backward branches ignore it and pick rel8 exactly
    /// when the displacement fits.
    pub fn jcc_local(
        &mut self,
        stream: &mut CodeStream,
        cond: Condition,
        label: LocalLabel,
        width: ImmWidth,
    ) -> Result<(), CompileError> {
        match self.local_offsets[label.0 as usize] {
            Some(target) => Self::emit_backward_jcc(stream, cond, target),
            None => {
                let imm = match width {
                    ImmWidth::B8 => stream
                        .emit_inst_patchable(&encoder::encode_jcc_rel8(cond, 0), ImmWidth::B8)?,
                    _ => stream.emit_inst_patchable(
                        &encoder::encode_jcc_rel32(cond, 0),
                        ImmWidth::B32,
                    )?,
                };
                self.local_pending.push((label.0, imm));
                Ok(())
            }
        }
    }

    /// Unconditional jump to a local label.
    pub fn jmp_local(
        &mut self,
        stream: &mut CodeStream,
        label: LocalLabel,
        width: ImmWidth,
    ) -> Result<(), CompileError> {
        match self.local_offsets[label.0 as usize] {
            Some(target) => Self::emit_backward_jmp(stream, target),
            None => {
                let imm = match width {
                    ImmWidth::B8 => stream
                        .emit_inst_patchable(&encoder::encode_jmp_rel8(0), ImmWidth::B8)?,
                    _ => stream
                        .emit_inst_patchable(&encoder::encode_jmp_rel32(0), ImmWidth::B32)?,
                };
                self.local_pending.push((label.0, imm));
                Ok(())
            }
        }
    }

    /// Bind a local label at the current cursor, draining its worklist.
    pub fn bind_local(
        &mut self,
        stream: &mut CodeStream,
        label: LocalLabel,
    ) -> Result<usize, CompileError> {
        let offset = stream.cursor();
        self.local_offsets[label.0 as usize] = Some(offset);
        let mut i = 0;
        while i < self.local_pending.len() {
            if self.local_pending[i].0 == label.0 {
                let (_, imm) = self.local_pending.swap_remove(i);
                stream.patch_imm(imm, offset)?;
            } else {
                i += 1;
            }
        }
        Ok(offset)
    }

    // -------------------------------------------------------------------------
    // Guest-pc worklist
    // -------------------------------------------------------------------------

    /// Offset a guest pc was bound at, if it has been.
    pub fn guest_offset(&self, pc: u32) -> Option<usize> {
        self.guest_bound.get(&pc).copied()
    }

    /// Conditional branch to a guest pc.
    pub fn jcc_guest(
        &mut self,
        stream: &mut CodeStream,
        cond: Condition,
        pc: u32,
    ) -> Result<(), CompileError> {
        match self.guest_bound.get(&pc).copied() {
            Some(target) => Self::emit_backward_jcc(stream, cond, target),
            None => {
                let imm = stream
                    .emit_inst_patchable(&encoder::encode_jcc_rel32(cond, 0), ImmWidth::B32)?;
                self.guest_pending
                    .entry(pc)
                    .or_default()
                    .push(GuestFixup::Branch(imm));
                Ok(())
            }
        }
    }

    /// Unconditional jump to a guest pc.
    pub fn jmp_guest(&mut self, stream: &mut CodeStream, pc: u32) -> Result<(), CompileError> {
        match self.guest_bound.get(&pc).copied() {
            Some(target) => Self::emit_backward_jmp(stream, target),
            None => {
                let imm =
                    stream.emit_inst_patchable(&encoder::encode_jmp_rel32(0), ImmWidth::B32)?;
                self.guest_pending
                    .entry(pc)
                    .or_default()
                    .push(GuestFixup::Branch(imm));
                Ok(())
            }
        }
    }

    /// Bind a guest pc at the current cursor, draining its worklist.
    pub fn bind_guest(&mut self, stream: &mut CodeStream, pc: u32) -> Result<usize, CompileError> {
        let offset = stream.cursor();
        self.guest_bound.insert(pc, offset);
        if let Some(pending) = self.guest_pending.remove(&pc) {
            for fixup in pending {
                match fixup {
                    GuestFixup::Branch(imm) => stream.patch_imm(imm, offset)?,
                    GuestFixup::TableEntry { slot, table_base } => {
                        let rel = offset as i64 - table_base as i64;
                        stream.patch_abs32(slot, rel as i32 as u32)?;
                    }
                }
            }
        }
        Ok(offset)
    }

    /// Guest pcs that still have pending references. The driver gives each
    /// one an exit stub before closing the compilation.
    pub fn pending_guest_pcs(&self) -> Vec<u32> {
        let mut pcs: Vec<u32> = self.guest_pending.keys().copied().collect();
        pcs.sort_unstable();
        pcs
    }

    // -------------------------------------------------------------------------
    // Data section and chaining cells
    // -------------------------------------------------------------------------

    /// Defer a payload to the data section. `lea_imm` is the RIP-relative
    /// displacement of the instruction that takes the payload's address.
    pub fn defer_data(&mut self, payload: DataPayload, lea_imm: PatchableImm) {
        self.data.push(DataEntry { payload, lea_imm });
    }

    /// Emit the deferred data section at the current cursor and patch every
    /// address-taking instruction. Returns the section's start offset.
    pub fn emit_data(&mut self, stream: &mut CodeStream) -> Result<usize, CompileError> {
        stream.align(4)?;
        let section_start = stream.cursor();
        let entries = std::mem::take(&mut self.data);
        for entry in entries {
            stream.align(4)?;
            let base = stream.cursor();
            stream.patch_imm(entry.lea_imm, base)?;
            match entry.payload {
                DataPayload::SwitchTable(targets) => {
                    for pc in targets {
                        let slot = stream.reserve_data(ImmWidth::B32)?;
                        match self.guest_bound.get(&pc).copied() {
                            Some(offset) => {
                                let rel = offset as i64 - base as i64;
                                stream.patch_abs32(slot, rel as i32 as u32)?;
                            }
                            None => {
                                self.guest_pending
                                    .entry(pc)
                                    .or_default()
                                    .push(GuestFixup::TableEntry { slot, table_base: base });
                            }
                        }
                    }
                }
                DataPayload::Bytes(bytes) => stream.emit_bytes(&bytes)?,
            }
        }
        Ok(section_start)
    }

    /// Emit a chaining cell: a jump whose immediate is left zero for the
    /// runtime to rewrite. Returns the cell's start offset.
    pub fn emit_chain_cell(
        &mut self,
        stream: &mut CodeStream,
        kind: ChainKind,
        guest_target: u32,
    ) -> Result<usize, CompileError> {
        let offset = stream.cursor();
        let imm = stream.emit_inst_patchable(&encoder::encode_jmp_rel32(0), ImmWidth::B32)?;
        self.chain_cells.push(ChainCell {
            kind,
            guest_target,
            imm,
        });
        Ok(offset)
    }

    /// The chaining cells, in emission order.
    pub fn chain_cells(&self) -> &[ChainCell] {
        &self.chain_cells
    }

    pub fn take_chain_cells(&mut self) -> Vec<ChainCell> {
        std::mem::take(&mut self.chain_cells)
    }

    // -------------------------------------------------------------------------
    // Closure
    // -------------------------------------------------------------------------

    /// Verify every resolvable worklist drained. Chaining cells are exempt;
    /// they are unresolved by design.
    pub fn finish(&self) -> Result<(), CompileError> {
        let count = self.helper_pending.len()
            + self.local_pending.len()
            + self.guest_pending.values().map(|v| v.len()).sum::<usize>()
            + self.data.len();
        if count == 0 {
            return Ok(());
        }
        let first = if let Some((label, _)) = self.helper_pending.first() {
            format!("helper {}", label.name())
        } else if let Some((id, _)) = self.local_pending.first() {
            format!("local label {id}")
        } else if let Some(pc) = self.guest_pending.keys().min() {
            format!("guest pc {pc:#x}")
        } else {
            "data section".to_string()
        };
        Err(CompileError::UnresolvedWorklist { count, first })
    }

    // -------------------------------------------------------------------------
    // Backward branch emission
    // -------------------------------------------------------------------------

    /// Backward Jcc with automatic width: rel8 exactly when the displacement
    /// fits after subtracting the short form's own length.
    fn emit_backward_jcc(
        stream: &mut CodeStream,
        cond: Condition,
        target: usize,
    ) -> Result<(), CompileError> {
        let short_disp = target as i64 - (stream.cursor() + encoder::JCC_REL8_LEN) as i64;
        if ImmWidth::B8.fits(short_disp) {
            stream.emit_inst(&encoder::encode_jcc_rel8(cond, short_disp as i8))
        } else {
            let disp = target as i64 - (stream.cursor() + encoder::JCC_REL32_LEN) as i64;
            if !ImmWidth::B32.fits(disp) {
                return Err(CompileError::ImmediateOverflow {
                    offset: stream.cursor(),
                    width: 32,
                    disp,
                });
            }
            stream.emit_inst(&encoder::encode_jcc_rel32(cond, disp as i32))
        }
    }

    /// Backward JMP with automatic width.
    fn emit_backward_jmp(stream: &mut CodeStream, target: usize) -> Result<(), CompileError> {
        let short_disp = target as i64 - (stream.cursor() + encoder::JMP_REL8_LEN) as i64;
        if ImmWidth::B8.fits(short_disp) {
            stream.emit_inst(&encoder::encode_jmp_rel8(short_disp as i8))
        } else {
            let disp = target as i64 - (stream.cursor() + encoder::JMP_REL32_LEN) as i64;
            if !ImmWidth::B32.fits(disp) {
                return Err(CompileError::ImmediateOverflow {
                    offset: stream.cursor(),
                    width: 32,
                    disp,
                });
            }
            stream.emit_inst(&encoder::encode_jmp_rel32(disp as i32))
        }
    }

    /// Bound guest pcs and their code offsets, sorted by pc. This becomes
    /// the published trace's pc map.
    pub fn guest_pc_map(&self) -> Vec<(u32, usize)> {
        let mut map: Vec<(u32, usize)> = self
            .guest_bound
            .iter()
            .map(|(&pc, &off)| (pc, off))
            .collect();
        map.sort_unstable_by_key(|&(pc, _)| pc);
        map
    }
}

impl Default for Labels {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
