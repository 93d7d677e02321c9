//! The MIR module: the unit of compilation.
//!
//! A module owns its functions, data declarations and compound types. Symbol names are unique
//! within the module, and the optimizer borrows the module mutably while it runs; backends only
//! ever see a shared borrow.

use crate::entity::PrimaryMap;
use crate::mir::entities::{DataId, FuncId};
use crate::mir::function::Function;
use crate::mir::types::TypeStore;

/// Payload of a module-level data declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataPayload {
    /// A string literal: emitted length-prefixed, no NUL terminator.
    Str(Vec<u8>),
    /// Raw bytes, emitted with `DB`.
    Bytes(Vec<u8>),
    /// 16-bit words, emitted with `DW`.
    Words(Vec<u16>),
}

impl DataPayload {
    /// Size in bytes of the payload as emitted, including any length prefix.
    pub fn emitted_size(&self) -> usize {
        match self {
            DataPayload::Str(bytes) => {
                let prefix = if bytes.len() > 255 { 2 } else { 1 };
                prefix + bytes.len()
            }
            DataPayload::Bytes(bytes) => bytes.len(),
            DataPayload::Words(words) => words.len() * 2,
        }
    }
}

/// A named data declaration.
#[derive(Clone, Debug)]
pub struct DataDecl {
    /// Symbol name, unique within the module.
    pub symbol: String,
    /// The payload.
    pub payload: DataPayload,
}

/// A compilation unit: a named collection of functions, data and types.
#[derive(Clone, Debug)]
pub struct Module {
    /// Module name. Function labels are emitted as `name.func`.
    pub name: String,

    /// Imported module names. Informational; imported symbols resolve by qualified name.
    pub imports: Vec<String>,

    /// Compound type declarations.
    pub types: TypeStore,

    /// Functions, in declaration order.
    pub funcs: PrimaryMap<FuncId, Function>,

    /// Data declarations, in declaration order.
    pub data: PrimaryMap<DataId, DataDecl>,
}

impl Module {
    /// Create an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            types: TypeStore::new(),
            funcs: PrimaryMap::new(),
            data: PrimaryMap::new(),
        }
    }

    /// Add a function. The function's qualified name must be unique.
    pub fn add_function(&mut self, func: Function) -> FuncId {
        debug_assert!(
            self.find_function(&func.qualified_name()).is_none(),
            "duplicate function {}",
            func.qualified_name()
        );
        self.funcs.push(func)
    }

    /// Add a data declaration.
    pub fn add_data(&mut self, symbol: impl Into<String>, payload: DataPayload) -> DataId {
        self.data.push(DataDecl {
            symbol: symbol.into(),
            payload,
        })
    }

    /// Resolve a call target to a function in this module.
    ///
    /// Both spellings resolve: the exact qualified name, and a simple name qualified with this
    /// module's own name.
    pub fn find_function(&self, callee: &str) -> Option<FuncId> {
        self.funcs
            .iter()
            .find(|(_, func)| func.is_called_as(callee))
            .map(|(id, _)| id)
    }

    /// Find a data declaration by symbol.
    pub fn find_data(&self, symbol: &str) -> Option<DataId> {
        self.data
            .iter()
            .find(|(_, decl)| decl.symbol == symbol)
            .map(|(id, _)| id)
    }

    /// Does `symbol` name anything at module level?
    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.find_function(symbol).is_some() || self.find_data(symbol).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::function::{FuncName, Signature};

    #[test]
    fn string_prefix_size() {
        assert_eq!(DataPayload::Str(vec![b'H'; 5]).emitted_size(), 6);
        assert_eq!(DataPayload::Str(vec![0; 255]).emitted_size(), 256);
        // Past 255 bytes the prefix widens to a word.
        assert_eq!(DataPayload::Str(vec![0; 300]).emitted_size(), 302);
    }

    #[test]
    fn function_lookup() {
        let mut module = Module::new("game");
        let id = module.add_function(Function::with_name_signature(
            FuncName::new("game", "update"),
            Signature::new(),
        ));
        assert_eq!(module.find_function("update"), Some(id));
        assert_eq!(module.find_function("game.update"), Some(id));
        assert_eq!(module.find_function("other.update"), None);
        assert!(module.has_symbol("update"));
        assert!(!module.has_symbol("render"));
    }
}
