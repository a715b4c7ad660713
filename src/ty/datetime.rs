use std::io::{Read, Write};

use serde::Serialize;

use crate::error::Result;
use crate::ty::{read_name, skip_len_bytes, write_name};
use crate::wire::{WireRead, WireWrite};

/// Fixed zone a date-time type can pin; when present the decoder overlays it
/// on every decoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    pub name: String,
    pub offset_seconds: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateTimeType {
    pub zone: Option<Zone>,
}

impl DateTimeType {
    pub(crate) fn read(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        if input.read_nullable_flag(false)? {
            return Ok(Self { zone: None });
        }
        let name = read_name(input)?;
        let offset_seconds = input.read_be_i32(false)?;
        Ok(Self { zone: Some(Zone { name, offset_seconds }) })
    }

    pub(crate) fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        out.write_nullable_flag(self.zone.is_some(), false)?;
        if let Some(zone) = &self.zone {
            write_name(out, &zone.name)?;
            out.write_be_i32(zone.offset_seconds, false)?;
        }
        Ok(())
    }

    pub(crate) fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        if input.read_nullable_flag(false)? {
            return Ok(());
        }
        skip_len_bytes(input)?;
        input.skip_exact(4)
    }
}
