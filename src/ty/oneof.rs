use std::io::{Read, Write};

use serde::Serialize;

use crate::error::{Error, ErrorCode, Result};
use crate::ty::r#enum::valid_index_width;
use crate::ty::{read_name, skip_len_bytes, skip_varuint, write_name, Type};
use crate::wire::{WireRead, WireWrite};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OneOfElement {
    pub index: u64,
    pub name: String,
    pub elem: Type,
}

/// Discriminated union: an encoded value is the element index followed by
/// that element's value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OneOfType {
    pub index_bytes: u8,
    pub elements: Vec<OneOfElement>,
}

impl OneOfType {
    pub fn element_by_index(&self, index: u64) -> Option<&OneOfElement> {
        self.elements.iter().find(|e| e.index == index)
    }

    pub fn element_by_name(&self, name: &str) -> Option<&OneOfElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub(crate) fn read(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        let index_bytes = input.read_byte()?;
        if !valid_index_width(index_bytes) {
            return Err(Error::new(
                ErrorCode::DecodingBinaryType,
                "invalid oneof index byte width",
            )
            .with_detail("width", index_bytes));
        }
        let count = input.read_varuint(false)?;
        let mut elements = Vec::new();
        for _ in 0..count {
            let index = input.read_index(index_bytes, false)?;
            if elements.iter().any(|e: &OneOfElement| e.index == index) {
                return Err(Error::new(
                    ErrorCode::DecodingBinaryType,
                    "duplicate oneof element index",
                )
                .with_detail("index", index));
            }
            let name = read_name(input)?;
            let elem = Type::read(input)?;
            elements.push(OneOfElement { index, name, elem });
        }
        Ok(Self { index_bytes, elements })
    }

    pub(crate) fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        out.write_byte(self.index_bytes)?;
        out.write_varuint(self.elements.len() as u64, false)?;
        for element in &self.elements {
            out.write_index(element.index, self.index_bytes, false)?;
            write_name(out, &element.name)?;
            element.elem.write(out)?;
        }
        Ok(())
    }

    pub(crate) fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        let index_bytes = input.read_byte()?;
        let count = input.read_varuint(false)?;
        for _ in 0..count {
            if index_bytes == 0 {
                skip_varuint(input)?;
            } else {
                input.skip_exact(u64::from(index_bytes))?;
            }
            skip_len_bytes(input)?;
            Type::skip(input)?;
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !valid_index_width(self.index_bytes) {
            return Err(Error::new(
                ErrorCode::TypeConstraintViolation,
                "invalid oneof index byte width",
            )
            .with_detail("width", self.index_bytes));
        }
        for (pos, element) in self.elements.iter().enumerate() {
            if self.elements[..pos].iter().any(|e| e.index == element.index) {
                return Err(Error::new(
                    ErrorCode::TypeConstraintViolation,
                    "duplicate oneof element index",
                )
                .with_detail("name", &element.name)
                .with_detail("index", element.index));
            }
            element.elem.validate()?;
        }
        Ok(())
    }
}
