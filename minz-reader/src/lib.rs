//! Parser for the textual MinZ MIR format.
//!
//! The front-end contract allows MIR to arrive either in memory or as text; this crate covers
//! the textual half. `parse_module` turns the stable form printed by
//! `minz_codegen::write_module` back into a `mir::Module`, with line-numbered errors, so the
//! CLI and the test suite can drive the code generator without the out-of-scope front-end.

#![warn(missing_docs, trivial_numeric_casts, unused_extern_crates)]

#[macro_use]
mod error;
mod lexer;
mod parser;

pub use crate::error::{Location, ParseError, ParseResult};
pub use crate::lexer::{tokenize, Token};
pub use crate::parser::parse_module;
