//! Parser for the textual MIR format.
//!
//! The grammar mirrors what `minz_codegen::write` prints: a `module` line, then `import`,
//! `type` and `data` declarations, then functions. Function bodies are one instruction per
//! line; labels end with `:` and annotation lines (`local`, `abi`, the flag keywords) come
//! before the first instruction. Every construction goes through `FunctionBuilder`, so the
//! parser inherits all of its invariant checks; what the builder rejects, the parser reports
//! with a line number.

use crate::error::{Location, ParseResult};
use crate::lexer::{tokenize, Token};
use minz_codegen::mir::{
    AbiParam, BitField, CondCode, DataPayload, Field, FuncName, FunctionBuilder, Label, Module,
    Opcode, ParamLoc, Recursion, Signature, Type, TypeData, TypeStore, Value,
};
use minz_codegen::CodegenError;
use std::collections::HashMap;

/// Parse a whole module from its textual form.
pub fn parse_module(text: &str) -> ParseResult<Module> {
    let tokens = match tokenize(text) {
        Ok(tokens) => tokens,
        Err((location, message)) => return err!(location, message),
    };
    Parser {
        tokens,
        pos: 0,
    }
    .parse_module()
}

struct Parser {
    tokens: Vec<(Location, Token)>,
    pos: usize,
}

impl Parser {
    fn loc(&self) -> Location {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(location, _)| *location)
            .unwrap_or_default()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> ParseResult<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            err!(self.loc(), "expected {:?}, found {:?}", token, self.peek())
        }
    }

    fn expect_ident(&mut self) -> ParseResult<String> {
        match self.bump() {
            Some(Token::Ident(ident)) => Ok(ident),
            other => err!(self.loc(), "expected identifier, found {:?}", other),
        }
    }

    fn expect_number(&mut self) -> ParseResult<i64> {
        match self.bump() {
            Some(Token::Number(number)) => Ok(number),
            other => err!(self.loc(), "expected number, found {:?}", other),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<()> {
        let found = self.expect_ident()?;
        if found == keyword {
            Ok(())
        } else {
            err!(self.loc(), "expected '{}', found '{}'", keyword, found)
        }
    }

    fn skip_newlines(&mut self) {
        while self.eat(&Token::Newline) {}
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn parse_type(&mut self, types: &TypeStore) -> ParseResult<Type> {
        let name = self.expect_ident()?;
        self.resolve_type(&name, types)
    }

    fn resolve_type(&self, name: &str, types: &TypeStore) -> ParseResult<Type> {
        if let Ok(ty) = name.parse::<Type>() {
            return Ok(ty);
        }
        match types.find(name) {
            Some(id) => Ok(Type::Compound(id)),
            None => err!(self.loc(), "unknown type '{}'", name),
        }
    }

    fn parse_module(mut self) -> ParseResult<Module> {
        self.skip_newlines();
        self.expect_keyword("module")?;
        let name = self.expect_ident()?;
        let mut module = Module::new(name);
        self.expect(Token::Newline)?;

        loop {
            self.skip_newlines();
            if self.at_end() {
                break;
            }
            let keyword = self.expect_ident()?;
            match keyword.as_str() {
                "import" => {
                    let import = self.expect_ident()?;
                    module.imports.push(import);
                    self.expect(Token::Newline)?;
                }
                "type" => self.parse_type_decl(&mut module)?,
                "data" => self.parse_data_decl(&mut module)?,
                "fn" => self.parse_function(&mut module)?,
                other => return err!(self.loc(), "unexpected '{}' at module level", other),
            }
        }
        Ok(module)
    }

    fn parse_type_decl(&mut self, module: &mut Module) -> ParseResult<()> {
        let name = self.expect_ident()?;
        self.expect(Token::Equal)?;
        let kind = self.expect_ident()?;
        let data = match kind.as_str() {
            "struct" => {
                self.expect(Token::LBrace)?;
                let mut fields = Vec::new();
                loop {
                    let field = self.expect_ident()?;
                    self.expect(Token::Colon)?;
                    let ty = self.parse_type(&module.types)?;
                    fields.push(Field { name: field, ty });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RBrace)?;
                TypeData::Struct { name, fields }
            }
            "enum" => {
                self.expect(Token::LBrace)?;
                let mut variants = Vec::new();
                let mut next_tag = 0u8;
                loop {
                    let variant = self.expect_ident()?;
                    let tag = if self.eat(&Token::Equal) {
                        self.expect_number()? as u8
                    } else {
                        next_tag
                    };
                    next_tag = tag.wrapping_add(1);
                    variants.push((variant, tag));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RBrace)?;
                TypeData::Enum { name, variants }
            }
            "bits" => {
                let cell = self.parse_type(&module.types)?;
                if cell != Type::U8 && cell != Type::U16 {
                    return err!(self.loc(), "bit-struct cell must be u8 or u16");
                }
                self.expect(Token::LBrace)?;
                let mut fields = Vec::new();
                loop {
                    let field = self.expect_ident()?;
                    self.expect(Token::Colon)?;
                    let offset = self.expect_number()? as u8;
                    self.expect(Token::Colon)?;
                    let width = self.expect_number()? as u8;
                    fields.push(BitField {
                        name: field,
                        offset,
                        width,
                    });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RBrace)?;
                TypeData::BitStruct { name, cell, fields }
            }
            "array" => {
                self.expect(Token::LBracket)?;
                let elem = self.parse_type(&module.types)?;
                self.expect(Token::Comma)?;
                let len = self.expect_number()? as u16;
                self.expect(Token::RBracket)?;
                TypeData::Array { elem, len }
            }
            other => return err!(self.loc(), "unknown type kind '{}'", other),
        };
        module.types.declare(data);
        self.expect(Token::Newline)
    }

    fn parse_data_decl(&mut self, module: &mut Module) -> ParseResult<()> {
        let symbol = self.expect_ident()?;
        self.expect(Token::Equal)?;
        let kind = self.expect_ident()?;
        let payload = match kind.as_str() {
            "str" => match self.bump() {
                Some(Token::Str(bytes)) => DataPayload::Str(bytes),
                other => return err!(self.loc(), "expected string literal, found {:?}", other),
            },
            "bytes" => {
                self.expect(Token::LBracket)?;
                let mut bytes = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        bytes.push(self.expect_number()? as u8);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                DataPayload::Bytes(bytes)
            }
            "words" => {
                self.expect(Token::LBracket)?;
                let mut words = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        words.push(self.expect_number()? as u16);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                DataPayload::Words(words)
            }
            other => return err!(self.loc(), "unknown data kind '{}'", other),
        };
        module.add_data(symbol, payload);
        self.expect(Token::Newline)
    }

    fn parse_function(&mut self, module: &mut Module) -> ParseResult<()> {
        let full_name = self.expect_ident()?;
        let name = match full_name.rsplit_once('.') {
            Some((owner, simple)) => FuncName::new(owner, simple),
            None => FuncName::new(module.name.clone(), full_name),
        };

        let mut signature = Signature::new();
        self.expect(Token::LParen)?;
        if !self.eat(&Token::RParen) {
            loop {
                let param = self.expect_ident()?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type(&module.types)?;
                signature.params.push(AbiParam::new(param, ty));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen)?;
        }
        if self.eat(&Token::Arrow) {
            signature.ret = Some(self.parse_type(&module.types)?);
        }
        self.expect(Token::LBrace)?;
        self.expect(Token::Newline)?;

        let mut ctx = FunctionParser {
            builder: FunctionBuilder::new(name, signature),
            values: HashMap::new(),
            labels: HashMap::new(),
        };

        loop {
            self.skip_newlines();
            if self.eat(&Token::RBrace) {
                break;
            }
            self.parse_body_line(module, &mut ctx)?;
        }

        let func = ctx
            .builder
            .finish()
            .map_err(|e| self.codegen_error(e))?;
        module.add_function(func);
        Ok(())
    }

    fn codegen_error(&self, error: CodegenError) -> crate::error::ParseError {
        crate::error::ParseError {
            location: self.loc(),
            message: error.to_string(),
        }
    }

    fn parse_body_line(&mut self, module: &Module, ctx: &mut FunctionParser) -> ParseResult<()> {
        let first = self.expect_ident()?;

        // A label line: `name:` and nothing else.
        if self.peek() == Some(&Token::Colon) {
            // Distinguish labels from `local x: u8` by what follows the ident.
            self.expect(Token::Colon)?;
            let label = ctx.label(&first);
            ctx.builder
                .place_label(label)
                .map_err(|e| self.codegen_error(e))?;
            return self.expect(Token::Newline);
        }

        match first.as_str() {
            "extern" => {
                ctx.builder.set_extern(true);
                return self.expect(Token::Newline);
            }
            "in_rom" => {
                ctx.builder.set_in_rom(true);
                return self.expect(Token::Newline);
            }
            "interrupt" => {
                ctx.builder.set_interrupt(true);
                return self.expect(Token::Newline);
            }
            "no_inline" => {
                ctx.builder.set_no_inline(true);
                return self.expect(Token::Newline);
            }
            "naked" => {
                ctx.builder.set_naked(true);
                return self.expect(Token::Newline);
            }
            "recursive" => {
                ctx.builder.set_recursion_hint(Recursion::Direct);
                return self.expect(Token::Newline);
            }
            "abi" => {
                let spec = match self.bump() {
                    Some(Token::Str(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    other => return err!(self.loc(), "expected abi string, found {:?}", other),
                };
                self.apply_abi(&spec, ctx)?;
                return self.expect(Token::Newline);
            }
            "local" => {
                let local = self.expect_ident()?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type(&module.types)?;
                ctx.builder
                    .declare_local(local, ty)
                    .map_err(|e| self.codegen_error(e))?;
                return self.expect(Token::Newline);
            }
            _ => {}
        }

        // `vN = op ...` or a bare instruction.
        if self.peek() == Some(&Token::Equal) {
            self.expect(Token::Equal)?;
            let op = self.expect_ident()?;
            let value = self.parse_value_producer(module, ctx, &op)?;
            ctx.define(&first, value, self.loc())?;
        } else {
            self.parse_bare_instruction(module, ctx, &first)?;
        }
        self.expect(Token::Newline)
    }

    /// `@abi("stack")`, `@abi("smc")`, or `@abi("register: A=p1, stack=p3")`.
    fn apply_abi(&mut self, spec: &str, ctx: &mut FunctionParser) -> ParseResult<()> {
        let (conv, placements) = match spec.split_once(':') {
            Some((conv, rest)) => (conv.trim(), Some(rest)),
            None => (spec.trim(), None),
        };
        match conv {
            "register" => ctx.builder.force_conv(minz_codegen::callconv::CallConv::Register),
            "stack" => ctx.builder.force_conv(minz_codegen::callconv::CallConv::StackFrame),
            "smc" | "tsmc" => ctx.builder.force_conv(minz_codegen::callconv::CallConv::Tsmc),
            "naked" => {
                ctx.builder.set_naked(true);
                ctx.builder.force_conv(minz_codegen::callconv::CallConv::Register);
            }
            other => return err!(self.loc(), "unknown abi '{}'", other),
        }
        if let Some(placements) = placements {
            for piece in placements.split(',') {
                let (place, param) = match piece.split_once('=') {
                    Some((place, param)) => (place.trim(), param.trim()),
                    None => return err!(self.loc(), "bad abi placement '{}'", piece),
                };
                let index = match ctx.builder.param_index(param) {
                    Some(index) => index,
                    None => return err!(self.loc(), "unknown parameter '{}'", param),
                };
                let loc = if place == "stack" {
                    ParamLoc::Stack
                } else {
                    ParamLoc::Reg(place.to_string())
                };
                ctx.builder
                    .set_param_loc(index, loc)
                    .map_err(|e| self.codegen_error(e))?;
            }
        }
        Ok(())
    }

    fn value(&self, ctx: &FunctionParser, name: &str) -> ParseResult<Value> {
        match ctx.values.get(name) {
            Some(&value) => Ok(value),
            None => err!(self.loc(), "use of undefined value '{}'", name),
        }
    }

    fn expect_value(&mut self, ctx: &FunctionParser) -> ParseResult<Value> {
        let name = self.expect_ident()?;
        self.value(ctx, &name)
    }

    fn split_suffix<'s>(&self, op: &'s str) -> (&'s str, Option<&'s str>) {
        match op.split_once('.') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (op, None),
        }
    }

    fn suffix_type(
        &self,
        suffix: Option<&str>,
        types: &TypeStore,
    ) -> ParseResult<Type> {
        match suffix {
            Some(name) => self.resolve_type(name, types),
            None => err!(self.loc(), "missing type suffix"),
        }
    }

    fn parse_value_producer(
        &mut self,
        module: &Module,
        ctx: &mut FunctionParser,
        op: &str,
    ) -> ParseResult<Value> {
        let (base, suffix) = self.split_suffix(op);
        let value = match base {
            "ldc" => {
                let ty = self.suffix_type(suffix, &module.types)?;
                let imm = self.expect_number()?;
                ctx.builder.load_const(imm, ty)
            }
            "lda" => {
                let symbol = self.expect_ident()?;
                ctx.builder
                    .load_addr(symbol)
                    .map_err(|e| self.codegen_error(e))?
            }
            "mov" | "not" | "neg" | "inc" | "dec" | "test" => {
                let arg = self.expect_value(ctx)?;
                let opcode = base.parse::<Opcode>().expect("unary mnemonic");
                ctx.builder
                    .unary(opcode, arg)
                    .map_err(|e| self.codegen_error(e))?
            }
            "add" | "sub" | "mul" | "div" | "mod" | "and" | "or" | "xor" | "shl" | "shr" => {
                let _ty = self.suffix_type(suffix, &module.types)?;
                let lhs = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let rhs = self.expect_value(ctx)?;
                let opcode = base.parse::<Opcode>().expect("binary mnemonic");
                ctx.builder
                    .binary(opcode, lhs, rhs)
                    .map_err(|e| self.codegen_error(e))?
            }
            "cmp" => {
                let cond = self.parse_cond()?;
                let lhs = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let rhs = self.expect_value(ctx)?;
                ctx.builder
                    .cmp(cond, lhs, rhs)
                    .map_err(|e| self.codegen_error(e))?
            }
            "ldvar" => {
                let ty = self.suffix_type(suffix, &module.types)?;
                let symbol = self.expect_ident()?;
                ctx.builder
                    .load_var(symbol, ty)
                    .map_err(|e| self.codegen_error(e))?
            }
            "ldidx" => {
                let elem = self.suffix_type(suffix, &module.types)?;
                let array = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let index = self.expect_value(ctx)?;
                ctx.builder
                    .load_index(array, index, elem)
                    .map_err(|e| self.codegen_error(e))?
            }
            "ldfld" => {
                let array = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let (strct, field) = self.parse_field_ref(module)?;
                let ty = module
                    .types
                    .field_type(strct, &field)
                    .ok_or_else(|| crate::error::ParseError {
                        location: self.loc(),
                        message: format!("no field '{}'", field),
                    })?;
                ctx.builder
                    .load_field(array, strct, field, ty)
                    .map_err(|e| self.codegen_error(e))?
            }
            "ldbit" => {
                let symbol = self.expect_ident()?;
                self.expect(Token::Comma)?;
                let (bits, field) = self.parse_field_ref(module)?;
                ctx.builder
                    .load_bit_field(symbol, bits, field)
                    .map_err(|e| self.codegen_error(e))?
            }
            "call" => {
                let (callee, args) = self.parse_call_tail(ctx)?;
                // Self-calls resolve against the signature being built; other callees must
                // be declared earlier in the file or their result type defaults to u16.
                let own = ctx.builder.name();
                let is_self = callee == own.qualified() || callee == own.name;
                let ret = if is_self {
                    ctx.builder.signature().ret
                } else {
                    module
                        .find_function(&callee)
                        .and_then(|id| module.funcs[id].signature.ret)
                };
                let ret = ret.unwrap_or(Type::U16);
                ctx.builder
                    .call(callee, &args, Some(ret))
                    .map_err(|e| self.codegen_error(e))?
                    .expect("call with return type produces a value")
            }
            "tsmcld" => {
                let param = self.expect_ident()?;
                let index = match ctx.builder.param_index(&param) {
                    Some(index) => index as u8,
                    None => return err!(self.loc(), "unknown parameter '{}'", param),
                };
                ctx.builder
                    .tsmc_load(index)
                    .map_err(|e| self.codegen_error(e))?
            }
            other => return err!(self.loc(), "unknown instruction '{}'", other),
        };
        Ok(value)
    }

    fn parse_bare_instruction(
        &mut self,
        module: &Module,
        ctx: &mut FunctionParser,
        op: &str,
    ) -> ParseResult<()> {
        let (base, suffix) = self.split_suffix(op);
        match base {
            "stvar" => {
                let symbol = self.expect_ident()?;
                self.expect(Token::Comma)?;
                let arg = self.expect_value(ctx)?;
                ctx.builder
                    .store_var(symbol, arg)
                    .map_err(|e| self.codegen_error(e))?;
            }
            "stidx" => {
                let elem = self.suffix_type(suffix, &module.types)?;
                let array = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let index = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let arg = self.expect_value(ctx)?;
                ctx.builder
                    .store_index(array, index, arg, elem)
                    .map_err(|e| self.codegen_error(e))?;
            }
            "stfld" => {
                let array = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let (strct, field) = self.parse_field_ref(module)?;
                self.expect(Token::Comma)?;
                let arg = self.expect_value(ctx)?;
                ctx.builder
                    .store_field(array, strct, field, arg)
                    .map_err(|e| self.codegen_error(e))?;
            }
            "stbit" => {
                let symbol = self.expect_ident()?;
                self.expect(Token::Comma)?;
                let (bits, field) = self.parse_field_ref(module)?;
                self.expect(Token::Comma)?;
                let arg = self.expect_value(ctx)?;
                ctx.builder
                    .store_bit_field(symbol, bits, field, arg)
                    .map_err(|e| self.codegen_error(e))?;
            }
            "jmp" => {
                let label = self.expect_ident()?;
                let label = ctx.label(&label);
                ctx.builder.jump(label);
            }
            "jz" | "jnz" => {
                let arg = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let label = self.expect_ident()?;
                let label = ctx.label(&label);
                if base == "jz" {
                    ctx.builder.brz(arg, label);
                } else {
                    ctx.builder.brnz(arg, label);
                }
            }
            "jcc" => {
                let cond = self.parse_cond()?;
                let lhs = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let rhs = self.expect_value(ctx)?;
                self.expect(Token::Comma)?;
                let label = self.expect_ident()?;
                let label = ctx.label(&label);
                ctx.builder
                    .br_cmp(cond, lhs, rhs, label)
                    .map_err(|e| self.codegen_error(e))?;
            }
            "call" => {
                let (callee, args) = self.parse_call_tail(ctx)?;
                ctx.builder
                    .call(callee, &args, None)
                    .map_err(|e| self.codegen_error(e))?;
            }
            "ret" => {
                if self.peek() == Some(&Token::Newline) {
                    ctx.builder.ret(None);
                } else {
                    let arg = self.expect_value(ctx)?;
                    ctx.builder.ret(Some(arg));
                }
            }
            "anchor" => {
                let param = self.expect_ident()?;
                let index = match ctx.builder.param_index(&param) {
                    Some(index) => index as u8,
                    None => return err!(self.loc(), "unknown parameter '{}'", param),
                };
                ctx.builder
                    .smc_anchor(index)
                    .map_err(|e| self.codegen_error(e))?;
            }
            "patch" => {
                let callee = self.expect_ident()?;
                self.expect(Token::Colon)?;
                let param = self.expect_number()? as u8;
                self.expect(Token::Comma)?;
                let arg = self.expect_value(ctx)?;
                ctx.builder
                    .smc_patch(callee, param, arg)
                    .map_err(|e| self.codegen_error(e))?;
            }
            "iterb" => {
                let count = self.expect_value(ctx)?;
                ctx.builder.iter_begin(count);
            }
            "iters" => {
                let label = self.expect_ident()?;
                let label = ctx.label(&label);
                ctx.builder.iter_step(label);
            }
            "itere" => {
                ctx.builder.iter_end();
            }
            other => return err!(self.loc(), "unknown instruction '{}'", other),
        }
        Ok(())
    }

    fn parse_cond(&mut self) -> ParseResult<CondCode> {
        let name = self.expect_ident()?;
        name.parse::<CondCode>()
            .map_err(|()| crate::error::ParseError {
                location: self.loc(),
                message: format!("unknown condition '{}'", name),
            })
    }

    /// A `Type.field` reference.
    fn parse_field_ref(
        &mut self,
        module: &Module,
    ) -> ParseResult<(minz_codegen::mir::TypeId, String)> {
        let dotted = self.expect_ident()?;
        let (type_name, field) = match dotted.rsplit_once('.') {
            Some(pair) => pair,
            None => return err!(self.loc(), "expected Type.field, found '{}'", dotted),
        };
        match module.types.find(type_name) {
            Some(id) => Ok((id, field.to_string())),
            None => err!(self.loc(), "unknown type '{}'", type_name),
        }
    }

    fn parse_call_tail(
        &mut self,
        ctx: &FunctionParser,
    ) -> ParseResult<(String, Vec<Value>)> {
        let callee = self.expect_ident()?;
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expect_value(ctx)?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen)?;
        }
        Ok((callee, args))
    }
}

struct FunctionParser {
    builder: FunctionBuilder,
    values: HashMap<String, Value>,
    labels: HashMap<String, Label>,
}

impl FunctionParser {
    fn label(&mut self, name: &str) -> Label {
        if let Some(&label) = self.labels.get(name) {
            return label;
        }
        let label = self.builder.create_label(name);
        self.labels.insert(name.to_string(), label);
        label
    }

    fn define(
        &mut self,
        name: &str,
        value: Value,
        location: Location,
    ) -> ParseResult<()> {
        if self.values.insert(name.to_string(), value).is_some() {
            return err!(location, "value '{}' defined twice", name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minz_codegen::write_module;

    const GOLDEN: &str = "\
module math

data greeting = str \"Hello\"

fn math.add(a: u8, b: u8) -> u8 {
entry:
    v0 = ldvar.u8 a
    v1 = ldvar.u8 b
    v2 = add.u8 v0, v1
    ret v2
}

fn math.main() -> u8 {
    v0 = ldc.u8 10
    v1 = ldc.u8 20
    v2 = call math.add(v0, v1)
    ret v2
}
";

    #[test]
    fn golden_module_round_trips() {
        let module = parse_module(GOLDEN).unwrap();
        assert_eq!(write_module(&module), GOLDEN);
    }

    #[test]
    fn labels_resolve_forward() {
        let text = "\
module m

fn m.f(n: u8) -> u8 {
    v0 = ldvar.u8 n
    jz v0, out
    v1 = ldc.u8 1
    ret v1
out:
    ret v0
}
";
        let module = parse_module(text).unwrap();
        let id = module.find_function("f").unwrap();
        minz_codegen::verify_function(&module.funcs[id]).unwrap();
    }

    #[test]
    fn annotations_and_locals() {
        let text = "\
module m

fn m.f() {
    in_rom
    no_inline
    local tmp: u16
    v0 = ldc.u16 4
    stvar tmp, v0
    ret
}
";
        let module = parse_module(text).unwrap();
        let id = module.find_function("f").unwrap();
        let func = &module.funcs[id];
        assert!(func.in_rom);
        assert!(func.no_inline);
        assert!(func.find_local("tmp").is_some());
    }

    #[test]
    fn abi_placements_pin_parameters() {
        let text = "\
module m

fn m.f(x: u8, y: u8) -> u8 {
    abi \"register: C=x, stack=y\"
    v0 = ldvar.u8 x
    ret v0
}
";
        let module = parse_module(text).unwrap();
        let id = module.find_function("f").unwrap();
        let func = &module.funcs[id];
        assert_eq!(func.signature.params[0].loc, ParamLoc::Reg("C".to_string()));
        assert_eq!(func.signature.params[1].loc, ParamLoc::Stack);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let text = "module m\n\nfn m.f() {\n    v0 = frobnicate v1\n}\n";
        let err = parse_module(text).unwrap_err();
        assert_eq!(err.location.line_number, 4);
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn undefined_values_are_rejected() {
        let text = "module m\n\nfn m.f() {\n    stvar x, v9\n}\n";
        let err = parse_module(text).unwrap_err();
        assert!(err.message.contains("undefined value"));
    }

    #[test]
    fn types_parse_and_print() {
        let text = "\
module m

type Point = struct { x: u8, y: u16 }
type Flags = bits u8 { carry: 0:1, mode: 1:3 }

fn m.get(p: ptr) -> u16 {
    v0 = ldvar.ptr p
    v1 = ldfld v0, Point.y
    ret v1
}
";
        let module = parse_module(text).unwrap();
        assert!(module.types.find("Point").is_some());
        assert!(module.types.find("Flags").is_some());
        let rendered = write_module(&module);
        assert!(rendered.contains("type Point = struct { x: u8, y: u16 }"));
        assert!(rendered.contains("ldfld v0, Point.y"));
    }
}
