//! Construction of MIR functions.
//!
//! `FunctionBuilder` is the only public way to assemble a function body, and every insertion
//! goes through the invariant checks of the data model: opcode arity is fixed by the payload
//! variants, named storage accesses must carry a symbol, and branch targets must be labels of
//! this function, placed exactly once by the time `finish` runs.
//!
//! A failed insertion returns `CodegenError::Invariant` and leaves the function unchanged.

use crate::callconv::CallConv;
use crate::mir::entities::{Inst, Label, Local, TypeId, Value};
use crate::mir::function::{FuncName, Function, LabelData, LocalData, Recursion, Signature};
use crate::mir::instructions::{CondCode, InstructionData, Opcode, ValueList};
use crate::mir::types::Type;
use crate::result::{CodegenError, CodegenResult, InvariantCode};

/// Builds one function.
pub struct FunctionBuilder {
    func: Function,
}

impl FunctionBuilder {
    /// Start a function with the given name and signature.
    pub fn new(name: FuncName, signature: Signature) -> Self {
        Self {
            func: Function::with_name_signature(name, signature),
        }
    }

    fn context(&self) -> String {
        self.func.qualified_name()
    }

    fn check_symbol(&self, symbol: &str) -> CodegenResult<()> {
        if symbol.is_empty() {
            return Err(CodegenError::invariant(
                InvariantCode::EmptySymbol,
                self.context(),
            ));
        }
        Ok(())
    }

    fn check_same_type(&self, a: Value, b: Value) -> CodegenResult<()> {
        if self.func.value_type(a) != self.func.value_type(b) {
            return Err(CodegenError::invariant(
                InvariantCode::TypeMismatch,
                self.context(),
            ));
        }
        Ok(())
    }

    fn push(&mut self, data: InstructionData) -> Inst {
        let inst = self.func.insts.push(data);
        self.func.layout.push(inst);
        inst
    }

    fn push_with_result(&mut self, data: InstructionData, ty: Type) -> Value {
        let inst = self.push(data);
        self.func.make_result(inst, ty)
    }

    /// Declare a named local. The slot index is assigned here, at declaration, so distinct
    /// locals can never end up sharing an address later.
    pub fn declare_local(&mut self, name: impl Into<String>, ty: Type) -> CodegenResult<Local> {
        let name = name.into();
        self.check_symbol(&name)?;
        let slot = self.func.locals.len() as u32;
        Ok(self.func.locals.push(LocalData { name, ty, slot }))
    }

    /// Create a label. It must be placed exactly once before `finish`.
    pub fn create_label(&mut self, name: impl Into<String>) -> Label {
        self.func.labels.push(LabelData { name: name.into() })
    }

    /// Place `label` at the current end of the layout.
    pub fn place_label(&mut self, label: Label) -> CodegenResult<()> {
        if self.func.label_position(label).is_some() {
            return Err(CodegenError::invariant(
                InvariantCode::DuplicateLabel,
                format!("{}: {}", self.context(), self.func.labels[label].name),
            ));
        }
        self.push(InstructionData::LabelMark { label });
        Ok(())
    }

    /// Materialize an integer constant.
    pub fn load_const(&mut self, imm: i64, ty: Type) -> Value {
        self.push_with_result(InstructionData::UnaryImm { imm, ty }, ty)
    }

    /// Materialize the address of a module-level symbol.
    pub fn load_addr(&mut self, symbol: impl Into<String>) -> CodegenResult<Value> {
        let symbol = symbol.into();
        self.check_symbol(&symbol)?;
        Ok(self.push_with_result(InstructionData::SymbolAddr { symbol }, Type::Ptr))
    }

    /// One of `Move`, `Not`, `Neg`, `Inc`, `Dec`, `Test`.
    pub fn unary(&mut self, opcode: Opcode, arg: Value) -> CodegenResult<Value> {
        debug_assert!(opcode.is_unary(), "{} is not unary", opcode);
        let ty = match opcode {
            Opcode::Test => Type::Bool,
            _ => self.func.value_type(arg),
        };
        Ok(self.push_with_result(InstructionData::Unary { opcode, arg }, ty))
    }

    /// A two-operand ALU operation. Both operands must have the instruction's type.
    pub fn binary(&mut self, opcode: Opcode, lhs: Value, rhs: Value) -> CodegenResult<Value> {
        debug_assert!(opcode.is_binary_alu(), "{} is not a binary ALU op", opcode);
        self.check_same_type(lhs, rhs)?;
        let ty = self.func.value_type(lhs);
        Ok(self.push_with_result(
            InstructionData::Binary {
                opcode,
                args: [lhs, rhs],
            },
            ty,
        ))
    }

    /// Integer comparison producing a `bool`.
    pub fn cmp(&mut self, cond: CondCode, lhs: Value, rhs: Value) -> CodegenResult<Value> {
        self.check_same_type(lhs, rhs)?;
        Ok(self.push_with_result(
            InstructionData::IntCompare {
                cond,
                args: [lhs, rhs],
            },
            Type::Bool,
        ))
    }

    /// Load from named storage.
    pub fn load_var(&mut self, symbol: impl Into<String>, ty: Type) -> CodegenResult<Value> {
        let symbol = symbol.into();
        self.check_symbol(&symbol)?;
        Ok(self.push_with_result(InstructionData::LoadVar { symbol, ty }, ty))
    }

    /// Store to named storage.
    pub fn store_var(&mut self, symbol: impl Into<String>, arg: Value) -> CodegenResult<Inst> {
        let symbol = symbol.into();
        self.check_symbol(&symbol)?;
        Ok(self.push(InstructionData::StoreVar { symbol, arg }))
    }

    /// Load `base[index]` of element type `elem`.
    pub fn load_index(&mut self, base: Value, index: Value, elem: Type) -> CodegenResult<Value> {
        Ok(self.push_with_result(InstructionData::LoadIndex { base, index, elem }, elem))
    }

    /// Store `arg` into `base[index]`.
    pub fn store_index(
        &mut self,
        base: Value,
        index: Value,
        arg: Value,
        elem: Type,
    ) -> CodegenResult<Inst> {
        Ok(self.push(InstructionData::StoreIndex {
            base,
            index,
            arg,
            elem,
        }))
    }

    /// Load the named field of a struct through `base`.
    pub fn load_field(
        &mut self,
        base: Value,
        strct: TypeId,
        field: impl Into<String>,
        ty: Type,
    ) -> CodegenResult<Value> {
        let field = field.into();
        self.check_symbol(&field)?;
        Ok(self.push_with_result(InstructionData::LoadField { base, strct, field }, ty))
    }

    /// Store into the named field of a struct through `base`.
    pub fn store_field(
        &mut self,
        base: Value,
        strct: TypeId,
        field: impl Into<String>,
        arg: Value,
    ) -> CodegenResult<Inst> {
        let field = field.into();
        self.check_symbol(&field)?;
        Ok(self.push(InstructionData::StoreField {
            base,
            strct,
            field,
            arg,
        }))
    }

    /// Read a packed bit field out of the named cell.
    pub fn load_bit_field(
        &mut self,
        symbol: impl Into<String>,
        bits: TypeId,
        field: impl Into<String>,
    ) -> CodegenResult<Value> {
        let symbol = symbol.into();
        let field = field.into();
        self.check_symbol(&symbol)?;
        self.check_symbol(&field)?;
        Ok(self.push_with_result(
            InstructionData::LoadBitField {
                symbol,
                bits,
                field,
            },
            Type::U8,
        ))
    }

    /// Write a packed bit field into the named cell.
    pub fn store_bit_field(
        &mut self,
        symbol: impl Into<String>,
        bits: TypeId,
        field: impl Into<String>,
        arg: Value,
    ) -> CodegenResult<Inst> {
        let symbol = symbol.into();
        let field = field.into();
        self.check_symbol(&symbol)?;
        self.check_symbol(&field)?;
        Ok(self.push(InstructionData::StoreBitField {
            symbol,
            bits,
            field,
            arg,
        }))
    }

    /// Unconditional jump.
    pub fn jump(&mut self, destination: Label) -> Inst {
        self.push(InstructionData::Jump { destination })
    }

    /// Jump if `arg` is zero.
    pub fn brz(&mut self, arg: Value, destination: Label) -> Inst {
        self.push(InstructionData::Branch {
            opcode: Opcode::JumpIfZero,
            arg,
            destination,
        })
    }

    /// Jump if `arg` is non-zero.
    pub fn brnz(&mut self, arg: Value, destination: Label) -> Inst {
        self.push(InstructionData::Branch {
            opcode: Opcode::JumpIfNotZero,
            arg,
            destination,
        })
    }

    /// Fused compare-and-branch.
    pub fn br_cmp(
        &mut self,
        cond: CondCode,
        lhs: Value,
        rhs: Value,
        destination: Label,
    ) -> CodegenResult<Inst> {
        self.check_same_type(lhs, rhs)?;
        Ok(self.push(InstructionData::BranchCompare {
            cond,
            args: [lhs, rhs],
            destination,
        }))
    }

    /// Call `func` with `args`. When `ret` is given, the call defines a result value.
    pub fn call(
        &mut self,
        func: impl Into<String>,
        args: &[Value],
        ret: Option<Type>,
    ) -> CodegenResult<Option<Value>> {
        let func = func.into();
        self.check_symbol(&func)?;
        let data = InstructionData::Call {
            func,
            args: ValueList::from_slice(args),
        };
        match ret {
            Some(ty) => Ok(Some(self.push_with_result(data, ty))),
            None => {
                self.push(data);
                Ok(None)
            }
        }
    }

    /// Return, optionally with a value.
    pub fn ret(&mut self, arg: Option<Value>) -> Inst {
        self.push(InstructionData::Return { arg })
    }

    /// Declare a TSMC immediate slot for parameter `param`.
    pub fn smc_anchor(&mut self, param: u8) -> CodegenResult<Inst> {
        self.check_param_index(param)?;
        Ok(self.push(InstructionData::SmcAnchor { param }))
    }

    /// Patch parameter `param` of `func` with `arg` at this call site.
    pub fn smc_patch(
        &mut self,
        func: impl Into<String>,
        param: u8,
        arg: Value,
    ) -> CodegenResult<Inst> {
        let func = func.into();
        self.check_symbol(&func)?;
        Ok(self.push(InstructionData::SmcPatch { func, param, arg }))
    }

    /// Read parameter `param` by re-reading its anchor immediate.
    pub fn tsmc_load(&mut self, param: u8) -> CodegenResult<Value> {
        self.check_param_index(param)?;
        let ty = self.func.signature.params[param as usize].ty;
        Ok(self.push_with_result(InstructionData::TsmcLoad { param }, ty))
    }

    /// Begin a counted loop.
    pub fn iter_begin(&mut self, count: Value) -> Inst {
        self.push(InstructionData::IterBegin { count })
    }

    /// Step the counted loop, branching back to `destination` while non-zero.
    pub fn iter_step(&mut self, destination: Label) -> Inst {
        self.push(InstructionData::IterStep { destination })
    }

    /// End the counted loop region.
    pub fn iter_end(&mut self) -> Inst {
        self.push(InstructionData::IterEnd)
    }

    fn check_param_index(&self, param: u8) -> CodegenResult<()> {
        if (param as usize) >= self.func.signature.params.len() {
            return Err(CodegenError::invariant(
                InvariantCode::BadParamIndex,
                self.context(),
            ));
        }
        Ok(())
    }

    /// Mark the function ROM-resident.
    pub fn set_in_rom(&mut self, in_rom: bool) {
        self.func.in_rom = in_rom;
    }

    /// Mark the function as an interrupt handler.
    pub fn set_interrupt(&mut self, interrupt: bool) {
        self.func.interrupt = interrupt;
    }

    /// Forbid inlining of this function.
    pub fn set_no_inline(&mut self, no_inline: bool) {
        self.func.no_inline = no_inline;
    }

    /// Mark the function externally defined.
    pub fn set_extern(&mut self, is_extern: bool) {
        self.func.is_extern = is_extern;
    }

    /// Suppress prologue and epilogue.
    pub fn set_naked(&mut self, naked: bool) {
        self.func.naked = naked;
    }

    /// Record a front-end recursion hint; call-graph analysis recomputes it.
    pub fn set_recursion_hint(&mut self, recursion: Recursion) {
        self.func.recursion = recursion;
    }

    /// Force a calling convention from an `@abi` annotation.
    pub fn force_conv(&mut self, conv: CallConv) {
        self.func.forced_conv = Some(conv);
    }

    /// The name of the function being built.
    pub fn name(&self) -> &FuncName {
        &self.func.name
    }

    /// The signature of the function being built.
    pub fn signature(&self) -> &Signature {
        &self.func.signature
    }

    /// Index of the named parameter in the signature.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.func.signature.param_index(name)
    }

    /// Pin a parameter's placement, from an explicit `@abi` placement list.
    pub fn set_param_loc(&mut self, index: usize, loc: crate::mir::ParamLoc) -> CodegenResult<()> {
        if index >= self.func.signature.params.len() {
            return Err(CodegenError::invariant(
                InvariantCode::BadParamIndex,
                self.context(),
            ));
        }
        self.func.signature.params[index].loc = loc;
        Ok(())
    }

    /// Finish the function, checking that every branch target was placed exactly once.
    pub fn finish(mut self) -> CodegenResult<Function> {
        for &inst in &self.func.layout {
            if let Some(label) = self.func.insts[inst].branch_destination() {
                if self.func.labels.get(label).is_none() {
                    return Err(CodegenError::invariant(
                        InvariantCode::ForeignLabel,
                        self.context(),
                    ));
                }
                if self.func.label_position(label).is_none() {
                    return Err(CodegenError::invariant(
                        InvariantCode::UnplacedLabel,
                        format!("{}: {}", self.context(), self.func.labels[label].name),
                    ));
                }
            }
        }
        self.func.update_leaf_flag();
        Ok(self.func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::function::AbiParam;

    fn builder() -> FunctionBuilder {
        let mut sig = Signature::new();
        sig.params.push(AbiParam::new("n", Type::U8));
        sig.ret = Some(Type::U8);
        FunctionBuilder::new(FuncName::new("m", "f"), sig)
    }

    #[test]
    fn empty_symbol_is_rejected() {
        let mut b = builder();
        assert!(matches!(
            b.load_var("", Type::U8),
            Err(CodegenError::Invariant {
                code: InvariantCode::EmptySymbol,
                ..
            })
        ));
        // The function is unchanged by the failed insertion.
        let v = b.load_const(1, Type::U8);
        assert!(b.store_var("", v).is_err());
        let func = {
            b.ret(Some(v));
            b.finish().unwrap()
        };
        assert_eq!(func.layout.len(), 2);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut b = builder();
        let a = b.load_const(1, Type::U8);
        let c = b.load_const(2, Type::U16);
        assert!(matches!(
            b.binary(Opcode::Add, a, c),
            Err(CodegenError::Invariant {
                code: InvariantCode::TypeMismatch,
                ..
            })
        ));
    }

    #[test]
    fn unplaced_label_fails_finish() {
        let mut b = builder();
        let label = b.create_label("next");
        b.jump(label);
        assert!(matches!(
            b.finish(),
            Err(CodegenError::Invariant {
                code: InvariantCode::UnplacedLabel,
                ..
            })
        ));
    }

    #[test]
    fn duplicate_label_placement_fails() {
        let mut b = builder();
        let label = b.create_label("here");
        b.place_label(label).unwrap();
        assert!(b.place_label(label).is_err());
    }

    #[test]
    fn bad_param_index_is_rejected() {
        let mut b = builder();
        assert!(b.smc_anchor(0).is_ok());
        assert!(matches!(
            b.smc_anchor(3),
            Err(CodegenError::Invariant {
                code: InvariantCode::BadParamIndex,
                ..
            })
        ));
    }

    #[test]
    fn leaf_flag_tracks_calls() {
        let mut b = builder();
        let v = b.load_const(1, Type::U8);
        b.call("m.g", &[v], None).unwrap();
        b.ret(None);
        let func = b.finish().unwrap();
        assert!(!func.is_leaf);
    }
}
