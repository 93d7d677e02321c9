//! MinZ code generation library.
//!
//! This crate is the core of the MinZ compiler: the mid-level IR, the optimizer, the
//! calling-convention selector, the register allocator, and the target backends, chief among
//! them the Z80 generator with its self-modifying calling convention. The front-end (or the
//! `minz-reader` crate, for the textual form) produces a `mir::Module`; a `Context` drives the
//! pipeline and hands back assembly text for the assembler.

#![warn(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use cranelift_entity as entity;

pub use crate::context::Context;
pub use crate::entity::packed_option;
pub use crate::result::{CodegenError, CodegenResult, InvariantCode};
pub use crate::verifier::{verify_function, verify_module};
pub use crate::write::{write_function, write_module};

pub mod asm;
pub mod callconv;
pub mod callgraph;
pub mod diagnostic;
pub mod isa;
pub mod mir;
pub mod opt;
pub mod regalloc;
pub mod settings;
pub mod verifier;
pub mod write;

mod context;
mod result;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
