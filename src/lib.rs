//! Trace-JIT x64 backend for the Kite register VM.
//!
//! Compiles straight-line runs of decoded bytecode into native code:
//! - LIR sink with optional list scheduling
//! - LRU register allocation with constant tracking and state snapshots
//! - Worklist-driven labels, chaining cells and data sections
//! - W^X publication with runtime chain patching
#![deny(unsafe_op_in_unsafe_fn)]
pub mod backend;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod frame;
pub mod helpers;
pub mod labels;
pub mod lir;
pub mod lower;
pub mod publish;
pub mod regalloc;
pub mod sched;
pub mod stream;

pub use bytecode::{BinOp, CmpKind, DecodedInsn, ElemWidth, Opcode, OptFlags, SwitchTable, Trace, VReg};
pub use compiler::{CompiledTrace, CompilerConfig, TraceCompiler};
pub use error::CompileError;
pub use helpers::{HelperTable, RuntimeHelper};
pub use labels::{ChainCell, ChainKind};
pub use publish::{PublishedTrace, TraceEntry};
