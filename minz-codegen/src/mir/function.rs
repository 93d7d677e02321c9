//! Intermediate representation of a function.
//!
//! The `Function` struct defined in this module owns all of its instructions, values, labels and
//! local slots. Cross-function references are by symbol name, never by pointer; the annotations
//! computed by the analyses (recursion class, leafness, calling convention) live directly on the
//! function.

use crate::callconv::CallConv;
use crate::entity::{PrimaryMap, SecondaryMap};
use crate::mir::entities::{Inst, Label, Local, Value};
use crate::mir::instructions::InstructionData;
use crate::mir::types::Type;
use crate::packed_option::PackedOption;
use crate::write::write_function;
use core::fmt;
use std::collections::BTreeMap;

/// A function name: the owning module's name plus the simple name.
///
/// The qualified form `module.name` is what appears on labels in the emitted assembly and in
/// cross-module call targets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct FuncName {
    /// Owning module.
    pub module: String,
    /// Simple name within the module.
    pub name: String,
}

impl FuncName {
    /// Create a name from module and simple parts.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// The fully qualified `module.name` form.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

impl fmt::Display for FuncName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Requested placement of a single parameter, from an `@abi` placement annotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamLoc {
    /// Let the allocator decide.
    Auto,
    /// Pin to a named physical register of the target.
    Reg(String),
    /// Force to the stack frame.
    Stack,
}

impl Default for ParamLoc {
    fn default() -> Self {
        ParamLoc::Auto
    }
}

/// A function parameter: name, type, and optional forced placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbiParam {
    /// Parameter name. Parameter reads in the body go through this name.
    pub name: String,
    /// Parameter type.
    pub ty: Type,
    /// Forced placement, if any.
    pub loc: ParamLoc,
}

impl AbiParam {
    /// A parameter with automatic placement.
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            loc: ParamLoc::Auto,
        }
    }
}

/// A function signature: ordered parameters and optional return type.
///
/// The calling convention starts out unassigned and is frozen by the selection pass; after that
/// point it must not change.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Signature {
    /// Ordered parameters.
    pub params: Vec<AbiParam>,
    /// Return type, if the function returns a value.
    pub ret: Option<Type>,
    /// Selected calling convention. `None` until the selection pass runs.
    pub conv: Option<CallConv>,
}

impl Signature {
    /// Create a signature with no parameters and no return value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the named parameter.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }
}

/// How a function participates in call-graph cycles.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Recursion {
    /// Not recursive.
    None,
    /// Calls itself directly.
    Direct,
    /// In a two-node cycle.
    Mutual,
    /// In a cycle of three or more nodes.
    Indirect,
}

impl Default for Recursion {
    fn default() -> Self {
        Recursion::None
    }
}

/// A named local slot.
///
/// The slot index is assigned at the point of declaration, so every local has a distinct slot
/// before the allocator ever runs; the allocator turns slots into unique addresses.
#[derive(Clone, Debug)]
pub struct LocalData {
    /// Local name, used by `LoadVar`/`StoreVar`.
    pub name: String,
    /// Local type.
    pub ty: Type,
    /// Declaration-order slot index, unique within the function.
    pub slot: u32,
}

/// A label and its source-level name.
#[derive(Clone, Debug)]
pub struct LabelData {
    /// The name, unique within the function.
    pub name: String,
}

/// Definition and type of a value.
#[derive(Clone, Debug, Default)]
pub struct ValueData {
    /// The value's type.
    pub ty: Option<Type>,
    /// The single defining instruction.
    pub def: PackedOption<Inst>,
}

/// A function.
///
/// Instructions are stored in a `PrimaryMap` arena with a separate linear `layout`; passes that
/// rewrite the body replace entries in the arena and splice the layout. Results and definitions
/// are tracked so that every value has exactly one defining instruction.
#[derive(Clone, Debug)]
pub struct Function {
    /// Name of this function.
    pub name: FuncName,

    /// Signature of this function.
    pub signature: Signature,

    /// Named local slots.
    pub locals: PrimaryMap<Local, LocalData>,

    /// Instruction payloads.
    pub insts: PrimaryMap<Inst, InstructionData>,

    /// Result value of each instruction, when it defines one.
    pub results: SecondaryMap<Inst, PackedOption<Value>>,

    /// Type and defining instruction of every value.
    pub values: PrimaryMap<Value, ValueData>,

    /// Linear instruction order, segmented into basic blocks by `Label` instructions.
    pub layout: Vec<Inst>,

    /// Labels declared in this function.
    pub labels: PrimaryMap<Label, LabelData>,

    /// Recursion class computed by call-graph analysis.
    pub recursion: Recursion,

    /// True when the function performs no calls.
    pub is_leaf: bool,

    /// Resident in ROM; self-modifying conventions are forbidden.
    pub in_rom: bool,

    /// Interrupt handler; shadow registers are usable without save/restore.
    pub interrupt: bool,

    /// Never inline this function.
    pub no_inline: bool,

    /// Externally defined; no body to lower.
    pub is_extern: bool,

    /// Prologue and epilogue suppressed (`@abi("naked")`).
    pub naked: bool,

    /// Calling convention forced by an `@abi` annotation.
    pub forced_conv: Option<CallConv>,

    /// Parameter name to anchor symbol, set when the convention is TSMC.
    pub smc_anchors: BTreeMap<String, String>,
}

impl Function {
    /// Create a function with the given name and signature.
    pub fn with_name_signature(name: FuncName, signature: Signature) -> Self {
        Self {
            name,
            signature,
            locals: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            results: SecondaryMap::new(),
            values: PrimaryMap::new(),
            layout: Vec::new(),
            labels: PrimaryMap::new(),
            recursion: Recursion::None,
            is_leaf: true,
            in_rom: false,
            interrupt: false,
            no_inline: false,
            is_extern: false,
            naked: false,
            forced_conv: None,
            smc_anchors: BTreeMap::new(),
        }
    }

    /// The fully qualified `module.name` form of this function's name.
    pub fn qualified_name(&self) -> String {
        self.name.qualified()
    }

    /// Is this function recursive in any way?
    pub fn is_recursive(&self) -> bool {
        self.recursion != Recursion::None
    }

    /// The selected calling convention.
    ///
    /// Panics if the selection pass has not run; backends must not be reachable before it.
    pub fn conv(&self) -> CallConv {
        self.signature
            .conv
            .expect("calling convention selected before lowering")
    }

    /// Create a new value of type `ty` defined by `inst`.
    pub fn make_result(&mut self, inst: Inst, ty: Type) -> Value {
        let value = self.values.push(ValueData {
            ty: Some(ty),
            def: inst.into(),
        });
        self.results[inst] = value.into();
        value
    }

    /// The result value of `inst`, if it defines one.
    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.results[inst].expand()
    }

    /// The type of `value`.
    pub fn value_type(&self, value: Value) -> Type {
        self.values[value].ty.expect("value has a type")
    }

    /// The instruction defining `value`.
    pub fn value_def(&self, value: Value) -> Option<Inst> {
        self.values[value].def.expand()
    }

    /// Find a declared local by name.
    pub fn find_local(&self, name: &str) -> Option<Local> {
        self.locals
            .iter()
            .find(|(_, data)| data.name == name)
            .map(|(local, _)| local)
    }

    /// Find a label by name.
    pub fn find_label(&self, name: &str) -> Option<Label> {
        self.labels
            .iter()
            .find(|(_, data)| data.name == name)
            .map(|(label, _)| label)
    }

    /// The layout position of `label`, if it has been placed.
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.layout.iter().position(|&inst| {
            matches!(self.insts[inst], InstructionData::LabelMark { label: l } if l == label)
        })
    }

    /// Does `callee` name this function?
    ///
    /// Both the simple and the module-qualified spelling must be recognized: the front-end may
    /// emit simple names inside a module, and missing either form leaves recursion undetected.
    pub fn is_called_as(&self, callee: &str) -> bool {
        let qualified = self.qualified_name();
        callee == qualified || qualified == format!("{}.{}", self.name.module, callee)
    }

    /// Iterate over the layout as `(position, inst)` pairs.
    pub fn layout_iter(&self) -> impl Iterator<Item = (usize, Inst)> + '_ {
        self.layout.iter().copied().enumerate()
    }

    /// Recompute the leaf flag from the body.
    pub fn update_leaf_flag(&mut self) {
        self.is_leaf = !self
            .layout
            .iter()
            .any(|&inst| self.insts[inst].opcode().is_call());
    }
}

impl fmt::Display for Function {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write_function(fmt, self)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write_function(fmt, self)
    }
}
