//! x86-64 backend: register definitions and instruction encoding.

pub mod encoder;
pub mod registers;

pub use encoder::{Condition, EncodedInst};
pub use registers::{CallingConvention, Gpr, GprSet, MemOperand, Scale, GUEST_FRAME, SCRATCH};
