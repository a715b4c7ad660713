use std::io::{Read, Write};

use serde::Serialize;

use crate::error::{Error, ErrorCode, Result};
use crate::wire::{significant_bytes, WireRead, WireWrite};

/// Byte-sequence payload. `fixed_size == 0` means variable length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BytesType {
    pub fixed_size: u32,
}

impl BytesType {
    /// One flag byte: `0x00` for variable, otherwise `0x80 | size_header`
    /// followed by the big-endian significant bytes of the fixed size.
    pub(crate) fn read(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        let flag = input.read_byte()?;
        if flag == 0 {
            return Ok(Self { fixed_size: 0 });
        }
        if flag & 0x80 == 0 {
            return Err(Error::new(
                ErrorCode::DecodingBinaryType,
                "invalid fixed-size flag byte",
            )
            .with_detail("byte", format!("{flag:#04x}")));
        }
        let size = flag & 0x7F;
        if size > 8 {
            return Err(Error::new(
                ErrorCode::DecodingBinaryType,
                "fixed-size header out of range",
            )
            .with_detail("size", size));
        }
        let mut value = 0u64;
        for _ in 0..size {
            value = (value << 8) | u64::from(input.read_byte()?);
        }
        let fixed_size = value.try_into().map_err(|_| {
            Error::new(ErrorCode::DecodingBinaryType, "fixed size overflows")
                .with_detail("size", value)
        })?;
        Ok(Self { fixed_size })
    }

    pub(crate) fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        write_size_flag(out, self.fixed_size)
    }

    pub(crate) fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        skip_size_flag(input)
    }
}

pub(crate) fn write_size_flag(
    out: &mut (impl Write + ?Sized),
    fixed_size: u32,
) -> Result<()> {
    if fixed_size == 0 {
        return out.write_byte(0);
    }
    let size = significant_bytes(u64::from(fixed_size));
    out.write_byte(0x80 | size)?;
    let be = u64::from(fixed_size).to_be_bytes();
    out.write_all(&be[8 - usize::from(size)..]).map_err(Error::writing)
}

pub(crate) fn skip_size_flag(input: &mut (impl Read + ?Sized)) -> Result<()> {
    let flag = input.read_byte()?;
    if flag == 0 {
        return Ok(());
    }
    if flag & 0x80 == 0 {
        return Err(Error::new(
            ErrorCode::SkippingBinaryType,
            "invalid fixed-size flag byte",
        )
        .with_detail("byte", format!("{flag:#04x}")));
    }
    input.skip_exact(u64::from(flag & 0x7F))
}
