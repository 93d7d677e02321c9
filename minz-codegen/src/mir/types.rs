//! MIR types and the module type store.
//!
//! Scalar types are a small `Copy` enum carried directly in instruction payloads and value
//! tables. Compound types (arrays, structs, enums, bit-structs) live in the module's `TypeStore`
//! arena and are referenced through `TypeId`, following the rule that cross-references in the IR
//! are indices, never pointers.
//!
//! Pointers and references are deliberately non-parametric at this level: the element or field
//! type of a memory access is carried by the accessing instruction, which is all the backends
//! need. A reference (`ref`) is distinct from a pointer because it is the form the TSMC calling
//! convention may lower to immediate access.

use crate::entity::PrimaryMap;
use crate::mir::entities::TypeId;
use core::fmt;
use core::str::FromStr;

/// A MIR value type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Type {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Boolean, stored as one byte, 0 or 1.
    Bool,
    /// Pointer to memory. The pointee type is carried by the accessing instruction.
    Ptr,
    /// Reference. Distinct from `Ptr`; eligible for TSMC immediate lowering.
    Ref,
    /// Pointer to a function.
    FuncPtr,
    /// A compound type declared in the module's type store.
    Compound(TypeId),
}

impl Type {
    /// Is this one of the scalar integer types?
    pub fn is_int(self) -> bool {
        match self {
            Type::U8 | Type::U16 | Type::I8 | Type::I16 => true,
            _ => false,
        }
    }

    /// Is this a signed integer type?
    pub fn is_signed(self) -> bool {
        match self {
            Type::I8 | Type::I16 => true,
            _ => false,
        }
    }

    /// Does this type fit in a single byte?
    ///
    /// Compound types always answer `false` here; ask the `TypeStore` for their size.
    pub fn is_byte(self) -> bool {
        match self {
            Type::U8 | Type::I8 | Type::Bool => true,
            _ => false,
        }
    }

    /// The wrapping mask for arithmetic on this type, if it is an integer or pointer.
    pub fn mask(self) -> Option<i64> {
        match self {
            Type::U8 | Type::I8 | Type::Bool => Some(0xFF),
            Type::U16 | Type::I16 | Type::Ptr | Type::Ref | Type::FuncPtr => Some(0xFFFF),
            Type::Compound(_) => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Type::U8 => f.write_str("u8"),
            Type::U16 => f.write_str("u16"),
            Type::I8 => f.write_str("i8"),
            Type::I16 => f.write_str("i16"),
            Type::Bool => f.write_str("bool"),
            Type::Ptr => f.write_str("ptr"),
            Type::Ref => f.write_str("ref"),
            Type::FuncPtr => f.write_str("fptr"),
            Type::Compound(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Type {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u8" => Ok(Type::U8),
            "u16" => Ok(Type::U16),
            "i8" => Ok(Type::I8),
            "i16" => Ok(Type::I16),
            "bool" => Ok(Type::Bool),
            "ptr" => Ok(Type::Ptr),
            "ref" => Ok(Type::Ref),
            "fptr" => Ok(Type::FuncPtr),
            _ => Err(()),
        }
    }
}

/// A named field of a struct type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: Type,
}

/// A named field of a bit-struct, packed into an 8- or 16-bit cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitField {
    /// Field name.
    pub name: String,
    /// Bit offset of the least significant bit of the field within the cell.
    pub offset: u8,
    /// Width of the field in bits.
    pub width: u8,
}

/// The layout of a bit-struct field, as consumed by the backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitFieldLayout {
    /// Byte offset of the cell the field lives in. Always 0 for 8-bit cells.
    pub byte_offset: u16,
    /// Bit offset within the cell.
    pub bit_offset: u8,
    /// Width in bits.
    pub width: u8,
}

/// Payload of a compound type declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeData {
    /// Fixed-size array `[T; N]`.
    Array {
        /// Element type.
        elem: Type,
        /// Number of elements.
        len: u16,
    },
    /// Struct with ordered named fields. Packed, no padding.
    Struct {
        /// Declared name.
        name: String,
        /// Ordered fields.
        fields: Vec<Field>,
    },
    /// Enum tagged as `u8` constants.
    Enum {
        /// Declared name.
        name: String,
        /// Variant names with their `u8` tags, monotonically numbered from 0 unless explicit.
        variants: Vec<(String, u8)>,
    },
    /// Packed record inside a single 8- or 16-bit cell.
    BitStruct {
        /// Declared name.
        name: String,
        /// Cell type, `U8` or `U16`.
        cell: Type,
        /// Packed fields.
        fields: Vec<BitField>,
    },
}

impl TypeData {
    /// The declared name of this type, if it has one. Arrays are anonymous.
    pub fn name(&self) -> Option<&str> {
        match self {
            TypeData::Array { .. } => None,
            TypeData::Struct { name, .. }
            | TypeData::Enum { name, .. }
            | TypeData::BitStruct { name, .. } => Some(name),
        }
    }
}

/// The module's arena of compound type declarations, plus size and layout queries.
///
/// Structs are packed; there is no padding and `align_of` is 1 for everything on the byte-
/// addressed targets. The pointer size defaults to 2 bytes (Z80) and is adjusted by backends
/// with wider addresses.
#[derive(Clone, Debug)]
pub struct TypeStore {
    types: PrimaryMap<TypeId, TypeData>,
    pointer_size: u16,
}

impl TypeStore {
    /// Create an empty type store with a 2-byte pointer size.
    pub fn new() -> Self {
        Self {
            types: PrimaryMap::new(),
            pointer_size: 2,
        }
    }

    /// Declare a compound type and return its reference.
    pub fn declare(&mut self, data: TypeData) -> TypeId {
        self.types.push(data)
    }

    /// Look up a compound type payload.
    pub fn get(&self, id: TypeId) -> &TypeData {
        &self.types[id]
    }

    /// Iterate over all declared compound types.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeData)> {
        self.types.iter()
    }

    /// Find a declared type by name.
    pub fn find(&self, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .find(|(_, data)| data.name() == Some(name))
            .map(|(id, _)| id)
    }

    /// The pointer size used for `Ptr`, `Ref` and `FuncPtr`.
    pub fn pointer_size(&self) -> u16 {
        self.pointer_size
    }

    /// Override the pointer size. Backends with 32-bit addressing call this.
    pub fn set_pointer_size(&mut self, bytes: u16) {
        debug_assert!(bytes == 2 || bytes == 4);
        self.pointer_size = bytes;
    }

    /// Size of `ty` in bytes.
    pub fn size_of(&self, ty: Type) -> u16 {
        match ty {
            Type::U8 | Type::I8 | Type::Bool => 1,
            Type::U16 | Type::I16 => 2,
            Type::Ptr | Type::Ref | Type::FuncPtr => self.pointer_size,
            Type::Compound(id) => match &self.types[id] {
                TypeData::Array { elem, len } => self.size_of(*elem) * len,
                TypeData::Struct { fields, .. } => {
                    fields.iter().map(|f| self.size_of(f.ty)).sum()
                }
                TypeData::Enum { .. } => 1,
                TypeData::BitStruct { cell, .. } => self.size_of(*cell),
            },
        }
    }

    /// Alignment of `ty` in bytes. Structs are packed, so this is always 1.
    pub fn align_of(&self, _ty: Type) -> u16 {
        1
    }

    /// Byte offset of the named field within a packed struct.
    pub fn field_offset(&self, id: TypeId, field: &str) -> Option<u16> {
        match &self.types[id] {
            TypeData::Struct { fields, .. } => {
                let mut offset = 0;
                for f in fields {
                    if f.name == field {
                        return Some(offset);
                    }
                    offset += self.size_of(f.ty);
                }
                None
            }
            _ => None,
        }
    }

    /// Type of the named field within a struct.
    pub fn field_type(&self, id: TypeId, field: &str) -> Option<Type> {
        match &self.types[id] {
            TypeData::Struct { fields, .. } => {
                fields.iter().find(|f| f.name == field).map(|f| f.ty)
            }
            _ => None,
        }
    }

    /// Layout of the named bit-struct field: cell byte offset, bit offset, and width.
    pub fn bit_field_layout(&self, id: TypeId, field: &str) -> Option<BitFieldLayout> {
        match &self.types[id] {
            TypeData::BitStruct { fields, .. } => {
                fields.iter().find(|f| f.name == field).map(|f| BitFieldLayout {
                    byte_offset: (f.offset / 8) as u16,
                    bit_offset: f.offset % 8,
                    width: f.width,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(store: &mut TypeStore) -> TypeId {
        store.declare(TypeData::Struct {
            name: "Point".to_string(),
            fields: vec![
                Field {
                    name: "x".to_string(),
                    ty: Type::U8,
                },
                Field {
                    name: "y".to_string(),
                    ty: Type::U16,
                },
                Field {
                    name: "tag".to_string(),
                    ty: Type::U8,
                },
            ],
        })
    }

    #[test]
    fn scalar_sizes() {
        let store = TypeStore::new();
        assert_eq!(store.size_of(Type::U8), 1);
        assert_eq!(store.size_of(Type::Bool), 1);
        assert_eq!(store.size_of(Type::I16), 2);
        assert_eq!(store.size_of(Type::Ptr), 2);
        assert_eq!(store.align_of(Type::U16), 1);
    }

    #[test]
    fn packed_struct_layout() {
        let mut store = TypeStore::new();
        let id = point(&mut store);
        assert_eq!(store.size_of(Type::Compound(id)), 4);
        assert_eq!(store.field_offset(id, "x"), Some(0));
        assert_eq!(store.field_offset(id, "y"), Some(1));
        assert_eq!(store.field_offset(id, "tag"), Some(3));
        assert_eq!(store.field_offset(id, "z"), None);
        assert_eq!(store.field_type(id, "y"), Some(Type::U16));
    }

    #[test]
    fn array_size() {
        let mut store = TypeStore::new();
        let id = store.declare(TypeData::Array {
            elem: Type::U16,
            len: 10,
        });
        assert_eq!(store.size_of(Type::Compound(id)), 20);
    }

    #[test]
    fn bit_field_layout() {
        let mut store = TypeStore::new();
        let id = store.declare(TypeData::BitStruct {
            name: "Flags".to_string(),
            cell: Type::U8,
            fields: vec![
                BitField {
                    name: "carry".to_string(),
                    offset: 0,
                    width: 1,
                },
                BitField {
                    name: "mode".to_string(),
                    offset: 1,
                    width: 3,
                },
            ],
        });
        assert_eq!(store.size_of(Type::Compound(id)), 1);
        let layout = store.bit_field_layout(id, "mode").unwrap();
        assert_eq!(layout.byte_offset, 0);
        assert_eq!(layout.bit_offset, 1);
        assert_eq!(layout.width, 3);
        assert!(store.bit_field_layout(id, "nope").is_none());
    }

    #[test]
    fn find_by_name() {
        let mut store = TypeStore::new();
        let id = point(&mut store);
        assert_eq!(store.find("Point"), Some(id));
        assert_eq!(store.find("Missing"), None);
    }
}
