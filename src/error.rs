//! Compiler-internal error type.
//!
//! These are defects of the compilation unit itself, never guest-visible
//! faults: a guest null dereference or bad index is lowered into generated
//! code, not reported here. Every variant aborts the current trace without
//! publishing anything.

use thiserror::Error;

/// Fatal errors of a single trace compilation.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A resolved branch displacement does not fit the immediate width that
    /// was reserved at the forward reference.
    #[error("branch displacement {disp} does not fit reserved {width}-bit immediate at offset {offset:#x}")]
    ImmediateOverflow {
        offset: usize,
        width: u8,
        disp: i64,
    },

    /// Pending fixups survived to the end of compilation; some branch target
    /// was never bound.
    #[error("{count} unresolved fixup(s) at end of compilation (first target: {first})")]
    UnresolvedWorklist { count: usize, first: String },

    /// A shared helper label was bound twice.
    #[error("helper label {0} bound twice")]
    DuplicateHelperBind(&'static str),

    /// The register binding tables of two converging paths disagree.
    #[error("binding tables diverge at merge point {id}: {detail}")]
    StateMergeMismatch { id: u32, detail: String },

    /// `go_to_state`/`transfer_to_state` named a snapshot that was never
    /// captured.
    #[error("no snapshot recorded for merge point {0}")]
    UnknownSnapshot(u32),

    /// Every allocatable register is pinned or mid-use; the lowering
    /// sequence asked for more registers than exist.
    #[error("register pool exhausted ({0} registers pinned or in use)")]
    RegisterPressure(usize),

    /// The trace contains a construct this backend does not lower; the
    /// caller falls back to the interpreter.
    #[error("unsupported opcode {0} at guest pc {1:#x}")]
    UnsupportedOpcode(&'static str, u32),

    /// The code stream outgrew the per-trace limit.
    #[error("code stream exceeded limit of {0} bytes")]
    CodeBufferLimit(usize),

    /// Publishing to executable memory failed.
    #[error("failed to publish code: {0}")]
    Publish(#[from] std::io::Error),
}
