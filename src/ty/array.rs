use std::io::{Read, Write};

use serde::Serialize;

use crate::error::Result;
use crate::ty::bytes::{skip_size_flag, write_size_flag};
use crate::ty::Type;

/// Array payload: element type plus an optional fixed element count
/// (`fixed_size == 0` means variable length).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayType {
    pub elem: Type,
    pub fixed_size: u32,
}

impl ArrayType {
    pub(crate) fn read(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        let elem = Type::read(input)?;
        let sized = super::bytes::BytesType::read(input)?;
        Ok(Self { elem, fixed_size: sized.fixed_size })
    }

    pub(crate) fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        self.elem.write(out)?;
        write_size_flag(out, self.fixed_size)
    }

    pub(crate) fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        Type::skip(input)?;
        skip_size_flag(input)
    }
}
