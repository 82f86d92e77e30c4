//! Native code generation backends.
//!
//! Only x86-64 is implemented; the rest of the crate is architecture-neutral
//! up to the `Lir` layer.

pub mod x64;
