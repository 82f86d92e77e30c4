//! Guest frame layout.
//!
//! The frame base register points at a per-invocation record owned by the
//! runtime; the backend addresses everything in it with fixed displacements.
//! Compiled code and the interpreter share this layout, so a trace can exit
//! to the interpreter at any guest instruction boundary once dirty values are
//! flushed and the guest pc slot is current.

use crate::backend::x64::{MemOperand, GUEST_FRAME};
use crate::bytecode::VReg;

/// Byte offset of the guest pc slot.
pub const GUEST_PC_OFFSET: i32 = 0;
/// Byte offset of the saved guest frame pointer.
pub const GUEST_FP_OFFSET: i32 = 8;
/// Byte offset of the current-method slot.
pub const METHOD_OFFSET: i32 = 16;
/// Byte offset of the suspend-count dword polled at safepoints.
pub const SUSPEND_COUNT_OFFSET: i32 = 24;
/// Byte offset of the first virtual-register slot.
pub const VREG_BASE_OFFSET: i32 = 32;
/// Every slot is 8 bytes; wide guest values occupy a naturally-paired slot.
pub const SLOT_SIZE: i32 = 8;

/// Addressing for one trace's guest frame.
///
/// Spill slots live after the virtual-register area and belong to the
/// compiled code alone; the interpreter never reads them.
#[derive(Debug, Clone, Copy)]
pub struct FrameLayout {
    num_vregs: u16,
}

impl FrameLayout {
    pub const fn new(num_vregs: u16) -> Self {
        FrameLayout { num_vregs }
    }

    #[inline]
    pub const fn num_vregs(&self) -> u16 {
        self.num_vregs
    }

    /// Home slot of a virtual register.
    #[inline]
    pub fn vreg_slot(&self, vreg: VReg) -> MemOperand {
        debug_assert!(vreg.0 < self.num_vregs);
        MemOperand::base_disp(
            GUEST_FRAME,
            VREG_BASE_OFFSET + vreg.0 as i32 * SLOT_SIZE,
        )
    }

    /// Spill slot `index`, past the virtual-register area.
    #[inline]
    pub fn spill_slot(&self, index: u16) -> MemOperand {
        MemOperand::base_disp(
            GUEST_FRAME,
            VREG_BASE_OFFSET + (self.num_vregs as i32 + index as i32) * SLOT_SIZE,
        )
    }

    #[inline]
    pub fn guest_pc_slot(&self) -> MemOperand {
        MemOperand::base_disp(GUEST_FRAME, GUEST_PC_OFFSET)
    }

    #[inline]
    pub fn method_slot(&self) -> MemOperand {
        MemOperand::base_disp(GUEST_FRAME, METHOD_OFFSET)
    }

    #[inline]
    pub fn suspend_count_slot(&self) -> MemOperand {
        MemOperand::base_disp(GUEST_FRAME, SUSPEND_COUNT_OFFSET)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_offsets() {
        let frame = FrameLayout::new(8);
        assert_eq!(frame.vreg_slot(VReg(0)).disp, 32);
        assert_eq!(frame.vreg_slot(VReg(3)).disp, 56);
        assert_eq!(frame.spill_slot(0).disp, 32 + 8 * 8);
        assert_eq!(frame.spill_slot(2).disp, 32 + 10 * 8);
        assert_eq!(frame.suspend_count_slot().disp, SUSPEND_COUNT_OFFSET);
    }
}
