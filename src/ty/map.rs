use std::io::{Read, Write};

use serde::Serialize;

use crate::error::Result;
use crate::ty::Type;

/// One side of a map entry: the element type plus the slot descending bit
/// carried in the high bit of the slot's kind byte.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapSlot {
    pub elem: Type,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapType {
    pub key: MapSlot,
    pub value: MapSlot,
}

impl MapType {
    pub(crate) fn read(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        let (key_elem, key_desc) = Type::read_slot(input)?;
        let (value_elem, value_desc) = Type::read_slot(input)?;
        Ok(Self {
            key: MapSlot { elem: key_elem, descending: key_desc },
            value: MapSlot { elem: value_elem, descending: value_desc },
        })
    }

    pub(crate) fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        self.key.elem.write_slot(out, self.key.descending)?;
        self.value.elem.write_slot(out, self.value.descending)
    }

    pub(crate) fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        Type::skip(input)?;
        Type::skip(input)
    }
}
