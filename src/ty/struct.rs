use std::io::{Read, Write};

use serde::Serialize;

use crate::error::{Error, ErrorCode, Result};
use crate::ty::{read_name, skip_len_bytes, skip_varuint, write_name, Type};
use crate::wire::{WireRead, WireWrite};

/// One struct field. Indices are the field identity across schema versions
/// and must be strictly increasing along declaration order; the descending
/// bit rides in the high bit of the field's kind byte.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub index: u64,
    pub name: String,
    pub descending: bool,
    pub elem: Type,
}

impl Field {
    pub fn new(index: u64, name: impl Into<String>, elem: Type) -> Self {
        Self { index, name: name.into(), descending: false, elem }
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructType {
    pub fields: Vec<Field>,
}

impl StructType {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn max_index(&self) -> u64 {
        self.fields.last().map(|f| f.index).unwrap_or(0)
    }

    pub fn field_by_index(&self, index: u64) -> Option<&Field> {
        self.fields.iter().find(|f| f.index == index)
    }

    pub(crate) fn read(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        let count = input.read_varuint(false)?;
        let mut fields = Vec::new();
        let mut last: Option<u64> = None;
        for _ in 0..count {
            let index = input.read_varuint(false)?;
            if last.is_some_and(|prev| index <= prev) {
                return Err(Error::new(
                    ErrorCode::DecodingBinaryType,
                    "struct field indices not strictly increasing",
                )
                .with_detail("index", index));
            }
            last = Some(index);
            let name = read_name(input)?;
            let (elem, descending) = Type::read_slot(input)?;
            fields.push(Field { index, name, descending, elem });
        }
        Ok(Self { fields })
    }

    pub(crate) fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        out.write_varuint(self.fields.len() as u64, false)?;
        for field in &self.fields {
            out.write_varuint(field.index, false)?;
            write_name(out, &field.name)?;
            field.elem.write_slot(out, field.descending)?;
        }
        Ok(())
    }

    pub(crate) fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        let count = input.read_varuint(false)?;
        for _ in 0..count {
            skip_varuint(input)?;
            skip_len_bytes(input)?;
            Type::skip(input)?;
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let mut last: Option<u64> = None;
        for field in &self.fields {
            if last.is_some_and(|prev| field.index <= prev) {
                return Err(Error::new(
                    ErrorCode::TypeConstraintViolation,
                    "struct field indices not strictly increasing",
                )
                .with_detail("field", &field.name)
                .with_detail("index", field.index));
            }
            last = Some(field.index);
            field.elem.validate()?;
        }
        Ok(())
    }
}
