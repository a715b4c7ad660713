pub mod array;
pub mod bytes;
pub mod datetime;
pub mod r#enum;
pub mod map;
pub mod named;
pub mod oneof;
pub mod r#struct;

use std::io::{Read, Write};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::error::{Error, ErrorCode, Result};
use crate::wire::{WireRead, WireWrite};

pub use array::ArrayType;
pub use bytes::BytesType;
pub use datetime::{DateTimeType, Zone};
pub use map::{MapSlot, MapType};
pub use named::{NamedType, TypeRef};
pub use oneof::{OneOfElement, OneOfType};
pub use r#enum::{EnumElement, EnumType};
pub use r#struct::{Field, StructType};

/// Closed set of value kinds. The ordinal is the low 7 bits of the kind byte
/// on the wire; kinds below [`Kind::Named`] are basic and carry no payload.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum Kind {
    Undefined = 0,
    Boolean = 1,
    Int = 2,
    Int8 = 3,
    Int16 = 4,
    Int32 = 5,
    Int64 = 6,
    Uint = 7,
    Uint8 = 8,
    Uint16 = 9,
    Uint32 = 10,
    Uint64 = 11,
    Float32 = 12,
    Float64 = 13,
    String = 14,
    Duration = 15,
    Any = 16,
    Timestamp = 17,
    Named = 18,
    Bytes = 19,
    Struct = 20,
    Array = 21,
    Map = 22,
    Enum = 23,
    DateTime = 24,
    Nullable = 25,
    OneOf = 26,
}

/// Slot descending bit carried in the high bit of a struct-field or map
/// key/value kind byte.
pub(crate) const KIND_DESCENDING: u8 = 0x80;

impl Kind {
    pub fn is_basic(self) -> bool {
        (self as u8) < (Kind::Named as u8)
    }
}

/// Tagged representation of every value kind. Non-basic kinds carry the
/// payload described by their header format; recursion is boxed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Type {
    Undefined,
    Boolean,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    String,
    Duration,
    Any,
    Timestamp,
    Named(NamedType),
    Bytes(BytesType),
    Struct(StructType),
    Array(Box<ArrayType>),
    Map(Box<MapType>),
    Enum(EnumType),
    OneOf(OneOfType),
    DateTime(DateTimeType),
    Nullable(Box<Type>),
}

impl Type {
    pub fn kind(&self) -> Kind {
        match self {
            Type::Undefined => Kind::Undefined,
            Type::Boolean => Kind::Boolean,
            Type::Int => Kind::Int,
            Type::Int8 => Kind::Int8,
            Type::Int16 => Kind::Int16,
            Type::Int32 => Kind::Int32,
            Type::Int64 => Kind::Int64,
            Type::Uint => Kind::Uint,
            Type::Uint8 => Kind::Uint8,
            Type::Uint16 => Kind::Uint16,
            Type::Uint32 => Kind::Uint32,
            Type::Uint64 => Kind::Uint64,
            Type::Float32 => Kind::Float32,
            Type::Float64 => Kind::Float64,
            Type::String => Kind::String,
            Type::Duration => Kind::Duration,
            Type::Any => Kind::Any,
            Type::Timestamp => Kind::Timestamp,
            Type::Named(_) => Kind::Named,
            Type::Bytes(_) => Kind::Bytes,
            Type::Struct(_) => Kind::Struct,
            Type::Array(_) => Kind::Array,
            Type::Map(_) => Kind::Map,
            Type::Enum(_) => Kind::Enum,
            Type::OneOf(_) => Kind::OneOf,
            Type::DateTime(_) => Kind::DateTime,
            Type::Nullable(_) => Kind::Nullable,
        }
    }

    pub fn is_basic(&self) -> bool {
        self.kind().is_basic()
    }

    pub fn nullable(elem: Type) -> Type {
        Type::Nullable(Box::new(elem))
    }

    pub fn array(elem: Type) -> Type {
        Type::Array(Box::new(ArrayType { elem, fixed_size: 0 }))
    }

    pub fn array_fixed(elem: Type, fixed_size: u32) -> Type {
        Type::Array(Box::new(ArrayType { elem, fixed_size }))
    }

    pub fn map(key: Type, value: Type) -> Type {
        Type::Map(Box::new(MapType {
            key: MapSlot { elem: key, descending: false },
            value: MapSlot { elem: value, descending: false },
        }))
    }

    pub fn named(module: impl Into<String>, name: impl Into<String>) -> Type {
        Type::Named(NamedType {
            module: module.into(),
            name: name.into(),
            resolved: None,
        })
    }

    fn basic(kind: Kind) -> Option<Type> {
        Some(match kind {
            Kind::Undefined => Type::Undefined,
            Kind::Boolean => Type::Boolean,
            Kind::Int => Type::Int,
            Kind::Int8 => Type::Int8,
            Kind::Int16 => Type::Int16,
            Kind::Int32 => Type::Int32,
            Kind::Int64 => Type::Int64,
            Kind::Uint => Type::Uint,
            Kind::Uint8 => Type::Uint8,
            Kind::Uint16 => Type::Uint16,
            Kind::Uint32 => Type::Uint32,
            Kind::Uint64 => Type::Uint64,
            Kind::Float32 => Type::Float32,
            Kind::Float64 => Type::Float64,
            Kind::String => Type::String,
            Kind::Duration => Type::Duration,
            Kind::Any => Type::Any,
            Kind::Timestamp => Type::Timestamp,
            _ => return None,
        })
    }

    /// Reads a type header at a position where the slot descending bit is
    /// not meaningful; a set bit is malformed.
    pub fn read(input: &mut (impl Read + ?Sized)) -> Result<Type> {
        let (ty, descending) = Self::read_slot(input)?;
        if descending {
            return Err(Error::new(
                ErrorCode::DecodingBinaryType,
                "descending bit set outside a slot position",
            ));
        }
        Ok(ty)
    }

    /// Reads a slot kind byte (descending bit allowed) plus payload.
    pub(crate) fn read_slot(
        input: &mut (impl Read + ?Sized),
    ) -> Result<(Type, bool)> {
        let byte = input.read_byte()?;
        let descending = byte & KIND_DESCENDING != 0;
        let kind = Kind::try_from(byte & !KIND_DESCENDING).map_err(|_| {
            Error::new(ErrorCode::DecodingBinaryType, "unknown kind ordinal")
                .with_detail("byte", format!("{byte:#04x}"))
        })?;
        Ok((Self::read_payload(kind, input)?, descending))
    }

    fn read_payload(kind: Kind, input: &mut (impl Read + ?Sized)) -> Result<Type> {
        if let Some(basic) = Self::basic(kind) {
            return Ok(basic);
        }
        match kind {
            Kind::Bytes => BytesType::read(input).map(Type::Bytes),
            Kind::Array => {
                ArrayType::read(input).map(|a| Type::Array(Box::new(a)))
            }
            Kind::Map => MapType::read(input).map(|m| Type::Map(Box::new(m))),
            Kind::Struct => StructType::read(input).map(Type::Struct),
            Kind::Enum => EnumType::read(input).map(Type::Enum),
            Kind::OneOf => OneOfType::read(input).map(Type::OneOf),
            Kind::DateTime => DateTimeType::read(input).map(Type::DateTime),
            Kind::Nullable => Type::read(input).map(Type::nullable),
            Kind::Named => NamedType::read(input).map(Type::Named),
            _ => unreachable!(),
        }
    }

    pub fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        self.write_slot(out, false)
    }

    pub(crate) fn write_slot(
        &self,
        out: &mut (impl Write + ?Sized),
        descending: bool,
    ) -> Result<()> {
        let mut byte = u8::from(self.kind());
        if descending {
            byte |= KIND_DESCENDING;
        }
        out.write_byte(byte)?;
        match self {
            Type::Bytes(p) => p.write(out),
            Type::Array(p) => p.write(out),
            Type::Map(p) => p.write(out),
            Type::Struct(p) => p.write(out),
            Type::Enum(p) => p.write(out),
            Type::OneOf(p) => p.write(out),
            Type::DateTime(p) => p.write(out),
            Type::Nullable(elem) => elem.write(out),
            Type::Named(p) => p.write(out),
            _ => Ok(()),
        }
    }

    /// Moves past a type header without materializing the payload tree.
    /// Consumes exactly the byte count [`Type::read`] would.
    pub fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        let byte = input.read_byte()?;
        let kind = Kind::try_from(byte & !KIND_DESCENDING).map_err(|_| {
            Error::new(ErrorCode::SkippingBinaryType, "unknown kind ordinal")
                .with_detail("byte", format!("{byte:#04x}"))
        })?;
        if kind.is_basic() {
            return Ok(());
        }
        match kind {
            Kind::Bytes => BytesType::skip(input),
            Kind::Array => ArrayType::skip(input),
            Kind::Map => MapType::skip(input),
            Kind::Struct => StructType::skip(input),
            Kind::Enum => EnumType::skip(input),
            Kind::OneOf => OneOfType::skip(input),
            Kind::DateTime => DateTimeType::skip(input),
            Kind::Nullable => Type::skip(input),
            Kind::Named => NamedType::skip(input),
            _ => unreachable!(),
        }
    }

    /// Checks the declared invariants of the tree: index byte widths, unique
    /// enum/oneof indices, strictly increasing struct field indices and no
    /// directly nested nullables.
    pub fn validate(&self) -> Result<()> {
        match self {
            Type::Array(p) => p.elem.validate(),
            Type::Map(p) => {
                p.key.elem.validate()?;
                p.value.elem.validate()
            }
            Type::Struct(p) => p.validate(),
            Type::Enum(p) => p.validate(),
            Type::OneOf(p) => p.validate(),
            Type::Nullable(elem) => {
                if matches!(**elem, Type::Nullable(_)) {
                    return Err(Error::new(
                        ErrorCode::TypeConstraintViolation,
                        "nullable of nullable",
                    ));
                }
                elem.validate()
            }
            _ => Ok(()),
        }
    }

    /// True when the tree contains a named reference and therefore cannot be
    /// composed or extracted without a module table.
    pub fn needs_modules(&self) -> bool {
        let mut needed = false;
        self.visit_named(&mut |_| needed = true);
        needed
    }

    /// Count of bound named references in the tree; the module resolver sums
    /// this into its freshness checksum.
    pub(crate) fn ref_count(&self) -> u64 {
        let mut count = 0;
        self.visit_named(&mut |named| {
            if named.resolved.is_some() {
                count += 1;
            }
        });
        count
    }

    pub(crate) fn clear_resolution(&mut self) {
        self.visit_named_mut(&mut |named| named.resolved = None);
    }

    pub(crate) fn visit_named(&self, f: &mut impl FnMut(&NamedType)) {
        match self {
            Type::Named(named) => f(named),
            Type::Bytes(_) | Type::Enum(_) | Type::DateTime(_) => {}
            Type::Array(p) => p.elem.visit_named(f),
            Type::Map(p) => {
                p.key.elem.visit_named(f);
                p.value.elem.visit_named(f);
            }
            Type::Struct(p) => {
                for field in &p.fields {
                    field.elem.visit_named(f);
                }
            }
            Type::OneOf(p) => {
                for element in &p.elements {
                    element.elem.visit_named(f);
                }
            }
            Type::Nullable(elem) => elem.visit_named(f),
            _ => {}
        }
    }

    pub(crate) fn visit_named_mut(&mut self, f: &mut impl FnMut(&mut NamedType)) {
        match self {
            Type::Named(named) => f(named),
            Type::Bytes(_) | Type::Enum(_) | Type::DateTime(_) => {}
            Type::Array(p) => p.elem.visit_named_mut(f),
            Type::Map(p) => {
                p.key.elem.visit_named_mut(f);
                p.value.elem.visit_named_mut(f);
            }
            Type::Struct(p) => {
                for field in &mut p.fields {
                    field.elem.visit_named_mut(f);
                }
            }
            Type::OneOf(p) => {
                for element in &mut p.elements {
                    element.elem.visit_named_mut(f);
                }
            }
            Type::Nullable(elem) => elem.visit_named_mut(f),
            _ => {}
        }
    }
}

/// Skips a plain ascending variable uint inside a type header.
pub(crate) fn skip_varuint(input: &mut (impl Read + ?Sized)) -> Result<()> {
    let size = input.read_byte()?;
    if size > 8 {
        return Err(Error::new(
            ErrorCode::SkippingBinaryType,
            "variable uint size header out of range",
        )
        .with_detail("size", size));
    }
    input.skip_exact(u64::from(size))
}

/// Skips a length-prefixed string inside a type header.
pub(crate) fn skip_len_bytes(input: &mut (impl Read + ?Sized)) -> Result<()> {
    let len = input.read_varuint(false)?;
    input.skip_exact(len)
}

/// Reads a length-prefixed UTF-8 name inside a type header.
pub(crate) fn read_name(input: &mut (impl Read + ?Sized)) -> Result<String> {
    let raw = input.read_len_bytes(false)?;
    String::from_utf8(raw).map_err(|err| {
        Error::new(ErrorCode::DecodingBinaryType, "name is not valid UTF-8")
            .with_source(err)
    })
}

pub(crate) fn write_name(
    out: &mut (impl Write + ?Sized),
    name: &str,
) -> Result<()> {
    out.write_len_bytes(name.as_bytes(), false)
}
