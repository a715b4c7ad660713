use std::io::{Read, Write};

use serde::Serialize;

use crate::error::{Error, ErrorCode, Result};
use crate::ty::{read_name, skip_len_bytes, skip_varuint, write_name};
use crate::wire::{WireRead, WireWrite};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumElement {
    pub label: String,
    pub index: u64,
}

/// Labelled index set. `value_bytes` is the wire width of an encoded index;
/// zero selects the variable unsigned layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumType {
    pub value_bytes: u8,
    pub elements: Vec<EnumElement>,
}

pub(crate) fn valid_index_width(width: u8) -> bool {
    matches!(width, 0 | 1 | 2 | 4 | 8)
}

impl EnumType {
    pub fn element_by_index(&self, index: u64) -> Option<&EnumElement> {
        self.elements.iter().find(|e| e.index == index)
    }

    pub(crate) fn read(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        let value_bytes = input.read_byte()?;
        if !valid_index_width(value_bytes) {
            return Err(Error::new(
                ErrorCode::DecodingBinaryType,
                "invalid enum value byte width",
            )
            .with_detail("width", value_bytes));
        }
        let count = input.read_varuint(false)?;
        let mut elements = Vec::new();
        for _ in 0..count {
            let label = read_name(input)?;
            let index = input.read_index(value_bytes, false)?;
            if elements.iter().any(|e: &EnumElement| e.index == index) {
                return Err(Error::new(
                    ErrorCode::DecodingBinaryType,
                    "duplicate enum element index",
                )
                .with_detail("index", index));
            }
            elements.push(EnumElement { label, index });
        }
        Ok(Self { value_bytes, elements })
    }

    pub(crate) fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        out.write_byte(self.value_bytes)?;
        out.write_varuint(self.elements.len() as u64, false)?;
        for element in &self.elements {
            write_name(out, &element.label)?;
            out.write_index(element.index, self.value_bytes, false)?;
        }
        Ok(())
    }

    pub(crate) fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        let value_bytes = input.read_byte()?;
        let count = input.read_varuint(false)?;
        for _ in 0..count {
            skip_len_bytes(input)?;
            if value_bytes == 0 {
                skip_varuint(input)?;
            } else {
                input.skip_exact(u64::from(value_bytes))?;
            }
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !valid_index_width(self.value_bytes) {
            return Err(Error::new(
                ErrorCode::TypeConstraintViolation,
                "invalid enum value byte width",
            )
            .with_detail("width", self.value_bytes));
        }
        for (pos, element) in self.elements.iter().enumerate() {
            if self.elements[..pos].iter().any(|e| e.index == element.index) {
                return Err(Error::new(
                    ErrorCode::TypeConstraintViolation,
                    "duplicate enum element index",
                )
                .with_detail("label", &element.label)
                .with_detail("index", element.index));
            }
        }
        Ok(())
    }
}
