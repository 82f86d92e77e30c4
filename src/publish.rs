//! Publication of compiled traces into executable memory.
//!
//! W^X discipline throughout: code is copied into a read-write mapping,
//! flipped to read-execute, and only flipped back for the duration of a
//! chain-cell patch. A full fence follows every flip to execute so other
//! cores never run stale bytes.

use std::io;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use log::debug;

use crate::compiler::CompiledTrace;
use crate::error::CompileError;
use crate::labels::ChainCell;
use crate::stream::ImmWidth;

/// Signature of a published trace. The guest frame pointer goes in the first
/// argument register; the guest return value, if any, comes back in RAX.
pub type TraceEntry = unsafe extern "C" fn(frame: *mut u8) -> u64;

// =============================================================================
// Published trace
// =============================================================================

/// A trace mapped executable, plus the side tables the runtime patches and
/// queries. Dropping it unmaps the code.
pub struct PublishedTrace {
    base: *mut u8,
    len: usize,
    data_offset: usize,
    chain_cells: Vec<ChainCell>,
    guest_pc_map: Vec<(u32, usize)>,
    spill_slots: u16,
}

// The mapping is exclusively owned and only mutated through `&mut self`.
unsafe impl Send for PublishedTrace {}
unsafe impl Sync for PublishedTrace {}

impl CompiledTrace {
    /// Copy the code into fresh executable memory.
    pub fn publish(self) -> Result<PublishedTrace, CompileError> {
        let len = self.code.len().max(1);
        let base = os::map_rw(len)?;
        // SAFETY: the mapping is at least `code.len()` bytes and nothing else
        // references it yet.
        unsafe { ptr::copy_nonoverlapping(self.code.as_ptr(), base, self.code.len()) };
        if let Err(err) = os::protect(base, len, true) {
            os::unmap(base, len);
            return Err(err.into());
        }
        fence(Ordering::SeqCst);
        debug!("published {} bytes at {:p}", self.code.len(), base);
        Ok(PublishedTrace {
            base,
            len,
            data_offset: self.data_offset,
            chain_cells: self.chain_cells,
            guest_pc_map: self.guest_pc_map,
            spill_slots: self.spill_slots,
        })
    }
}

impl PublishedTrace {
    /// Callable entry point at the start of the mapping.
    pub fn entry(&self) -> TraceEntry {
        // SAFETY: the mapping is executable and offset 0 is the prologue.
        unsafe { std::mem::transmute::<*const u8, TraceEntry>(self.base as *const u8) }
    }

    pub fn code_ptr(&self) -> *const u8 {
        self.base
    }

    pub fn code_len(&self) -> usize {
        self.len
    }

    /// Offset of the data section within the mapping.
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Spill slots the trace uses past the vreg area of the guest frame; the
    /// runtime sizes frames accordingly before entering.
    pub fn spill_slots(&self) -> u16 {
        self.spill_slots
    }

    /// Exit jumps awaiting chain targets, in emission order.
    pub fn chain_cells(&self) -> &[ChainCell] {
        &self.chain_cells
    }

    /// Code offset a guest pc was bound at.
    pub fn offset_of_pc(&self, pc: u32) -> Option<usize> {
        self.guest_pc_map
            .binary_search_by_key(&pc, |&(p, _)| p)
            .ok()
            .map(|i| self.guest_pc_map[i].1)
    }

    /// Executable address of a bound guest pc, for chaining another trace
    /// into this one.
    pub fn address_of_pc(&self, pc: u32) -> Option<*const u8> {
        // SAFETY: bound offsets lie inside the mapping.
        self.offset_of_pc(pc)
            .map(|off| unsafe { self.base.add(off) } as *const u8)
    }

    /// Rewrite one chain cell's jump to land on `target`. The mapping is
    /// briefly writable; the trace must not be executing concurrently.
    pub fn patch_chain_target(
        &mut self,
        index: usize,
        target: *const u8,
    ) -> Result<(), CompileError> {
        let cell = *self
            .chain_cells
            .get(index)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let anchor = self.base as i64 + cell.imm.anchor() as i64;
        let disp = target as i64 - anchor;
        if !ImmWidth::B32.fits(disp) {
            return Err(CompileError::ImmediateOverflow {
                offset: cell.imm.offset(),
                width: 32,
                disp,
            });
        }
        os::protect(self.base, self.len, false)?;
        let bytes = (disp as i32).to_le_bytes();
        // SAFETY: the stream validated offset + 4 against the code length
        // when the cell was emitted.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(cell.imm.offset()), 4) };
        os::protect(self.base, self.len, true)?;
        fence(Ordering::SeqCst);
        debug!(
            "chained cell {} (guest {:#x}) to {:p}",
            index, cell.guest_target, target
        );
        Ok(())
    }
}

impl Drop for PublishedTrace {
    fn drop(&mut self) {
        os::unmap(self.base, self.len);
    }
}

// =============================================================================
// OS bindings
// =============================================================================

#[cfg(unix)]
mod os {
    use std::io;
    use std::ptr;

    pub fn map_rw(len: usize) -> io::Result<*mut u8> {
        // SAFETY: anonymous private mapping; aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    pub fn protect(ptr: *mut u8, len: usize, exec: bool) -> io::Result<()> {
        let prot = if exec {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        // SAFETY: `ptr` is the page-aligned base of a live `len`-byte mapping.
        if unsafe { libc::mprotect(ptr as *mut libc::c_void, len, prot) } != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        // SAFETY: mapping came from map_rw with this base and length.
        unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
    }
}

#[cfg(windows)]
mod os {
    use std::io;
    use std::ptr;

    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };

    pub fn map_rw(len: usize) -> io::Result<*mut u8> {
        // SAFETY: fresh reservation; aliases nothing.
        let ptr =
            unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    pub fn protect(ptr: *mut u8, len: usize, exec: bool) -> io::Result<()> {
        let prot = if exec { PAGE_EXECUTE_READ } else { PAGE_READWRITE };
        let mut old = 0u32;
        // SAFETY: `ptr` is the base of a live `len`-byte allocation.
        if unsafe { VirtualProtect(ptr.cast(), len, prot, &mut old) } == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn unmap(ptr: *mut u8, _len: usize) {
        // SAFETY: allocation came from VirtualAlloc.
        unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) };
    }
}

// =============================================================================
// Tests
// =============================================================================
