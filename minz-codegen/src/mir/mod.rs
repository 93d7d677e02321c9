//! Representation of MinZ MIR.
//!
//! The MIR is the typed, mostly-SSA instruction form that the optimizer and the backends
//! consume. It is produced by the front-end (or parsed from the textual form by `minz-reader`),
//! optimized in place, annotated with calling conventions, and finally lowered by a target
//! backend.

pub mod builder;
pub mod entities;
pub mod function;
pub mod instructions;
pub mod module;
pub mod types;

pub use self::builder::FunctionBuilder;
pub use self::entities::{AnyEntity, DataId, FuncId, Inst, Label, Local, TypeId, Value};
pub use self::function::{
    AbiParam, FuncName, Function, LabelData, LocalData, ParamLoc, Recursion, Signature, ValueData,
};
pub use self::instructions::{CondCode, InstructionData, Opcode, ValueList};
pub use self::module::{DataDecl, DataPayload, Module};
pub use self::types::{BitField, BitFieldLayout, Field, Type, TypeData, TypeStore};
