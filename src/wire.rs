use std::io::{BufRead, Read, Write};

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use num_traits::ToBytes;

use crate::error::{Error, ErrorCode, Result};

pub(crate) const SIGN16: u16 = 0x8000;
pub(crate) const SIGN32: u32 = 0x8000_0000;
pub(crate) const SIGN64: u64 = 0x8000_0000_0000_0000;

/// Version byte emitted in front of every date-time value. Version 2 adds a
/// trailing byte and is accepted on read.
pub(crate) const DATETIME_VERSION: u8 = 1;

pub(crate) fn complement(bytes: &mut [u8]) {
    for b in bytes {
        *b = !*b;
    }
}

pub(crate) fn significant_bytes(value: u64) -> u8 {
    ((64 - value.leading_zeros()).div_ceil(8)) as u8
}

/// Terminator-framed escape encoding for variable-length comparable values.
/// A content byte equal to `escape` is written as `(escape, payload)`; the
/// value ends with `(escape, terminator)`. Distinct escape bytes per
/// composite kind let nested comparable values terminate without collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EscapeTable {
    pub escape: u8,
    pub terminator: u8,
    pub payload: u8,
}

const ESCAPE_BYTES: EscapeTable = EscapeTable {
    escape: 0x00,
    terminator: 0x01,
    payload: 0xFF,
};
const ESCAPE_BYTES_DESC: EscapeTable = EscapeTable {
    escape: 0xFF,
    terminator: 0xFE,
    payload: 0x00,
};
const ESCAPE_ARRAY: EscapeTable = EscapeTable {
    escape: 0x02,
    terminator: 0x01,
    payload: 0xFF,
};
const ESCAPE_ARRAY_DESC: EscapeTable = EscapeTable {
    escape: 0xFD,
    terminator: 0xFE,
    payload: 0x00,
};
const ESCAPE_MAP: EscapeTable = EscapeTable {
    escape: 0x03,
    terminator: 0x01,
    payload: 0xFF,
};
const ESCAPE_MAP_DESC: EscapeTable = EscapeTable {
    escape: 0xFC,
    terminator: 0xFE,
    payload: 0x00,
};

impl EscapeTable {
    pub(crate) fn bytes(descending: bool) -> Self {
        if descending {
            ESCAPE_BYTES_DESC
        } else {
            ESCAPE_BYTES
        }
    }

    pub(crate) fn array(descending: bool) -> Self {
        if descending {
            ESCAPE_ARRAY_DESC
        } else {
            ESCAPE_ARRAY
        }
    }

    pub(crate) fn map(descending: bool) -> Self {
        if descending {
            ESCAPE_MAP_DESC
        } else {
            ESCAPE_MAP
        }
    }
}

pub(crate) trait WireRead: Read {
    fn read_byte(&mut self) -> Result<u8> {
        let mut data = [0; 1];
        self.read_exact(&mut data).map_err(Error::reading)?;
        Ok(data[0])
    }

    fn read_be_u16(&mut self, descending: bool) -> Result<u16> {
        let mut raw: [u8; 2] =
            bincode::deserialize_from(&mut *self).map_err(Error::reading_frame)?;
        if descending {
            complement(&mut raw);
        }
        Ok(u16::from_be_bytes(raw))
    }

    fn read_be_u32(&mut self, descending: bool) -> Result<u32> {
        let mut raw: [u8; 4] =
            bincode::deserialize_from(&mut *self).map_err(Error::reading_frame)?;
        if descending {
            complement(&mut raw);
        }
        Ok(u32::from_be_bytes(raw))
    }

    fn read_be_u64(&mut self, descending: bool) -> Result<u64> {
        let mut raw: [u8; 8] =
            bincode::deserialize_from(&mut *self).map_err(Error::reading_frame)?;
        if descending {
            complement(&mut raw);
        }
        Ok(u64::from_be_bytes(raw))
    }

    fn read_be_u8(&mut self, descending: bool) -> Result<u8> {
        let b = self.read_byte()?;
        Ok(if descending { !b } else { b })
    }

    fn read_be_i8(&mut self, descending: bool) -> Result<i8> {
        Ok((self.read_be_u8(descending)? ^ 0x80) as i8)
    }

    fn read_be_i16(&mut self, descending: bool) -> Result<i16> {
        Ok((self.read_be_u16(descending)? ^ SIGN16) as i16)
    }

    fn read_be_i32(&mut self, descending: bool) -> Result<i32> {
        Ok((self.read_be_u32(descending)? ^ SIGN32) as i32)
    }

    fn read_be_i64(&mut self, descending: bool) -> Result<i64> {
        Ok((self.read_be_u64(descending)? ^ SIGN64) as i64)
    }

    fn read_f32(&mut self, descending: bool) -> Result<f32> {
        let enc = self.read_be_u32(descending)?;
        let bits = if enc & SIGN32 != 0 { enc ^ SIGN32 } else { !enc };
        Ok(f32::from_bits(bits))
    }

    fn read_f64(&mut self, descending: bool) -> Result<f64> {
        let enc = self.read_be_u64(descending)?;
        let bits = if enc & SIGN64 != 0 { enc ^ SIGN64 } else { !enc };
        Ok(f64::from_bits(bits))
    }

    /// Size-headed variable unsigned integer: one header byte holding the
    /// count of significant bytes, then that many big-endian bytes.
    fn read_varuint(&mut self, descending: bool) -> Result<u64> {
        let header = self.read_be_u8(descending)?;
        if header > 8 {
            return Err(Error::new(
                ErrorCode::MalformedBinary,
                "variable uint size header out of range",
            )
            .with_detail("size", header));
        }
        let mut value = 0u64;
        for _ in 0..header {
            value = (value << 8) | u64::from(self.read_be_u8(descending)?);
        }
        Ok(value)
    }

    /// Variable signed integer, the sign-symmetric extension of the
    /// unsigned layout: non-negative values carry header `0x80 | size`,
    /// negative values the complemented header plus complemented magnitude
    /// bytes, so the byte order equals the signed order.
    fn read_varint(&mut self, descending: bool) -> Result<i64> {
        let header = self.read_be_u8(descending)?;
        if header & 0x80 != 0 {
            let size = header & 0x7F;
            if size > 8 {
                return Err(Error::new(
                    ErrorCode::MalformedBinary,
                    "variable int size header out of range",
                )
                .with_detail("size", size));
            }
            let mut value = 0u64;
            for _ in 0..size {
                value = (value << 8) | u64::from(self.read_be_u8(descending)?);
            }
            if value > i64::MAX as u64 {
                return Err(Error::new(
                    ErrorCode::MalformedBinary,
                    "variable int magnitude out of range",
                ));
            }
            Ok(value as i64)
        } else {
            let size = !header & 0x7F;
            if size > 8 {
                return Err(Error::new(
                    ErrorCode::MalformedBinary,
                    "variable int size header out of range",
                )
                .with_detail("size", size));
            }
            let mut magnitude = 0u64;
            for _ in 0..size {
                magnitude =
                    (magnitude << 8) | u64::from(!self.read_be_u8(descending)?);
            }
            if magnitude > i64::MAX as u64 {
                return Err(Error::new(
                    ErrorCode::MalformedBinary,
                    "variable int magnitude out of range",
                ));
            }
            Ok(!magnitude as i64)
        }
    }

    fn read_bool_byte(&mut self, descending: bool) -> Result<bool> {
        match self.read_be_u8(descending)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(Error::new(
                ErrorCode::MalformedBinary,
                "invalid boolean byte",
            )
            .with_detail("byte", format!("{value:#04x}"))),
        }
    }

    /// Returns true when the flag marks a null value.
    fn read_nullable_flag(&mut self, descending: bool) -> Result<bool> {
        match self.read_be_u8(descending)? {
            0 => Ok(true),
            1 => Ok(false),
            value => Err(Error::new(
                ErrorCode::MalformedBinary,
                "invalid nullable flag",
            )
            .with_detail("byte", format!("{value:#04x}"))),
        }
    }

    /// Length-prefixed bytes, the non-comparable variable layout. The raw
    /// bytes are stored in reverse order in descending mode.
    fn read_len_bytes(&mut self, descending: bool) -> Result<Vec<u8>> {
        let len = self.read_varuint(descending)?;
        let len: usize = len.try_into().map_err(|_| {
            Error::new(ErrorCode::MalformedBinary, "length prefix overflows")
        })?;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).map_err(Error::reading)?;
        if descending {
            buf.reverse();
        }
        Ok(buf)
    }

    /// Enum/oneof index in the declared byte width; width 0 means the
    /// variable unsigned layout.
    fn read_index(&mut self, width: u8, descending: bool) -> Result<u64> {
        match width {
            0 => self.read_varuint(descending),
            1 => self.read_be_u8(descending).map(u64::from),
            2 => self.read_be_u16(descending).map(u64::from),
            4 => self.read_be_u32(descending).map(u64::from),
            8 => self.read_be_u64(descending),
            _ => Err(Error::new(
                ErrorCode::TypeConstraintViolation,
                "invalid index byte width",
            )
            .with_detail("width", width)),
        }
    }

    /// Unescapes a terminator-framed value. The returned bytes are the raw
    /// content as written (descending content stays complemented; the caller
    /// owns that transform).
    fn read_escaped(&mut self, table: EscapeTable) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let b = self.read_byte()?;
            if b != table.escape {
                out.push(b);
                continue;
            }
            let next = self.read_byte()?;
            if next == table.terminator {
                return Ok(out);
            }
            if next == table.payload {
                out.push(table.escape);
                continue;
            }
            return Err(Error::new(
                ErrorCode::MalformedBinary,
                "invalid escape sequence",
            )
            .with_detail("byte", format!("{next:#04x}")));
        }
    }

    /// Consumes a terminator-framed value without materializing it.
    fn skip_escaped(&mut self, table: EscapeTable) -> Result<()> {
        loop {
            let b = self.read_byte()?;
            if b != table.escape {
                continue;
            }
            let next = self.read_byte()?;
            if next == table.terminator {
                return Ok(());
            }
            if next != table.payload {
                return Err(Error::new(
                    ErrorCode::MalformedBinary,
                    "invalid escape sequence",
                )
                .with_detail("byte", format!("{next:#04x}")));
            }
        }
    }

    fn read_timestamp(&mut self, descending: bool) -> Result<DateTime<Utc>> {
        let secs = self.read_be_i64(descending)?;
        let nanos = self.read_be_u32(descending)?;
        DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
            Error::new(ErrorCode::InvalidValue, "timestamp out of range")
                .with_detail("seconds", secs)
        })
    }

    fn read_duration(&mut self, descending: bool) -> Result<TimeDelta> {
        let nanos = self.read_be_i64(descending)?;
        Ok(TimeDelta::nanoseconds(nanos))
    }

    /// Versioned date-time layout: version byte, 8 bytes epoch seconds,
    /// 4 bytes nanoseconds, 2 bytes zone offset in minutes, plus one
    /// trailing byte for version 2. Descending stores the bytes after the
    /// version in reverse order. A fixed zone declared on the type overrides
    /// the stored offset.
    fn read_datetime(
        &mut self,
        descending: bool,
        fixed_offset_seconds: Option<i32>,
    ) -> Result<DateTime<FixedOffset>> {
        let version = self.read_byte()?;
        let body_len = match version {
            1 => 14,
            2 => 15,
            _ => {
                return Err(Error::new(
                    ErrorCode::MalformedBinary,
                    "unknown date-time version",
                )
                .with_detail("version", version))
            }
        };
        let mut body = [0u8; 15];
        self.read_exact(&mut body[..body_len]).map_err(Error::reading)?;
        if descending {
            body[..body_len].reverse();
        }
        let secs = i64::from_be_bytes(body[..8].try_into().unwrap()) as u64;
        let secs = (secs ^ SIGN64) as i64;
        let nanos = u32::from_be_bytes(body[8..12].try_into().unwrap());
        let offset_minutes =
            (u16::from_be_bytes(body[12..14].try_into().unwrap()) ^ SIGN16)
                as i16;
        let offset_seconds = fixed_offset_seconds
            .unwrap_or_else(|| i32::from(offset_minutes) * 60);
        let offset = FixedOffset::east_opt(offset_seconds).ok_or_else(|| {
            Error::new(ErrorCode::InvalidValue, "zone offset out of range")
                .with_detail("offset_seconds", offset_seconds)
        })?;
        let utc = DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
            Error::new(ErrorCode::InvalidValue, "date-time out of range")
                .with_detail("seconds", secs)
        })?;
        Ok(utc.with_timezone(&offset))
    }

    fn skip_exact(&mut self, len: u64) -> Result<()> {
        let copied =
            std::io::copy(&mut (&mut *self).take(len), &mut std::io::sink())
                .map_err(Error::reading)?;
        if copied != len {
            return Err(Error::new(
                ErrorCode::ReadingFailed,
                "unexpected end of input",
            )
            .with_detail("missing", len - copied));
        }
        Ok(())
    }
}

impl<R: Read + ?Sized> WireRead for R {}

pub(crate) trait WireBufRead: WireRead + BufRead {
    fn peek_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.fill_buf().map_err(Error::reading)?.first().copied())
    }
}

impl<R: BufRead + ?Sized> WireBufRead for R {}

pub(crate) trait WireWrite: Write {
    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write_all(&[byte]).map_err(Error::writing)
    }

    fn write_be<T: ToBytes>(&mut self, value: T, descending: bool) -> Result<()> {
        let bytes = value.to_be_bytes();
        let bytes = bytes.as_ref();
        let mut buf = [0u8; 8];
        let frame = &mut buf[..bytes.len()];
        frame.copy_from_slice(bytes);
        if descending {
            complement(frame);
        }
        self.write_all(frame).map_err(Error::writing)
    }

    fn write_be_i8(&mut self, value: i8, descending: bool) -> Result<()> {
        self.write_be(value as u8 ^ 0x80, descending)
    }

    fn write_be_i16(&mut self, value: i16, descending: bool) -> Result<()> {
        self.write_be(value as u16 ^ SIGN16, descending)
    }

    fn write_be_i32(&mut self, value: i32, descending: bool) -> Result<()> {
        self.write_be(value as u32 ^ SIGN32, descending)
    }

    fn write_be_i64(&mut self, value: i64, descending: bool) -> Result<()> {
        self.write_be(value as u64 ^ SIGN64, descending)
    }

    fn write_f32(&mut self, value: f32, descending: bool) -> Result<()> {
        let bits = value.to_bits();
        let enc = if value.is_sign_negative() { !bits } else { bits | SIGN32 };
        self.write_be(enc, descending)
    }

    fn write_f64(&mut self, value: f64, descending: bool) -> Result<()> {
        let bits = value.to_bits();
        let enc = if value.is_sign_negative() { !bits } else { bits | SIGN64 };
        self.write_be(enc, descending)
    }

    fn write_varuint(&mut self, value: u64, descending: bool) -> Result<()> {
        let size = significant_bytes(value);
        let mut frame = [0u8; 9];
        frame[0] = size;
        let be = value.to_be_bytes();
        frame[1..=usize::from(size)]
            .copy_from_slice(&be[8 - usize::from(size)..]);
        let frame = &mut frame[..=usize::from(size)];
        if descending {
            complement(frame);
        }
        self.write_all(frame).map_err(Error::writing)
    }

    fn write_varint(&mut self, value: i64, descending: bool) -> Result<()> {
        let mut frame = [0u8; 9];
        let size;
        if value >= 0 {
            let magnitude = value as u64;
            size = significant_bytes(magnitude);
            frame[0] = 0x80 | size;
            let be = magnitude.to_be_bytes();
            frame[1..=usize::from(size)]
                .copy_from_slice(&be[8 - usize::from(size)..]);
        } else {
            let magnitude = !(value as u64);
            size = significant_bytes(magnitude);
            frame[0] = !(0x80 | size);
            let be = magnitude.to_be_bytes();
            for (dst, src) in frame[1..=usize::from(size)]
                .iter_mut()
                .zip(&be[8 - usize::from(size)..])
            {
                *dst = !src;
            }
        }
        let frame = &mut frame[..=usize::from(size)];
        if descending {
            complement(frame);
        }
        self.write_all(frame).map_err(Error::writing)
    }

    fn write_bool_byte(&mut self, value: bool, descending: bool) -> Result<()> {
        self.write_be(u8::from(value), descending)
    }

    fn write_nullable_flag(
        &mut self,
        not_null: bool,
        descending: bool,
    ) -> Result<()> {
        self.write_be(u8::from(not_null), descending)
    }

    fn write_len_bytes(&mut self, data: &[u8], descending: bool) -> Result<()> {
        self.write_varuint(data.len() as u64, descending)?;
        if descending {
            let mut rev = data.to_vec();
            rev.reverse();
            self.write_all(&rev).map_err(Error::writing)
        } else {
            self.write_all(data).map_err(Error::writing)
        }
    }

    fn write_index(
        &mut self,
        value: u64,
        width: u8,
        descending: bool,
    ) -> Result<()> {
        let narrow = |max: u64| {
            if value > max {
                Err(Error::new(
                    ErrorCode::InvalidValue,
                    "index does not fit the declared byte width",
                )
                .with_detail("index", value)
                .with_detail("width", width))
            } else {
                Ok(())
            }
        };
        match width {
            0 => self.write_varuint(value, descending),
            1 => {
                narrow(u8::MAX.into())?;
                self.write_be(value as u8, descending)
            }
            2 => {
                narrow(u16::MAX.into())?;
                self.write_be(value as u16, descending)
            }
            4 => {
                narrow(u32::MAX.into())?;
                self.write_be(value as u32, descending)
            }
            8 => self.write_be(value, descending),
            _ => Err(Error::new(
                ErrorCode::TypeConstraintViolation,
                "invalid index byte width",
            )
            .with_detail("width", width)),
        }
    }

    /// Escapes and terminates raw content bytes. Used both for data-plane
    /// bytes/strings (content already complemented in descending mode by the
    /// caller) and for re-framing buffered composite bodies.
    fn write_escaped(&mut self, content: &[u8], table: EscapeTable) -> Result<()> {
        for &b in content {
            if b == table.escape {
                self.write_all(&[table.escape, table.payload])
                    .map_err(Error::writing)?;
            } else {
                self.write_all(&[b]).map_err(Error::writing)?;
            }
        }
        self.write_all(&[table.escape, table.terminator])
            .map_err(Error::writing)
    }

    /// Comparable variable bytes/string: complements the data in descending
    /// mode, then escape-frames it with the bytes table.
    fn write_escaped_data(&mut self, data: &[u8], descending: bool) -> Result<()> {
        let table = EscapeTable::bytes(descending);
        for &b in data {
            let out = if descending { !b } else { b };
            if out == table.escape {
                self.write_all(&[table.escape, table.payload])
                    .map_err(Error::writing)?;
            } else {
                self.write_all(&[out]).map_err(Error::writing)?;
            }
        }
        self.write_all(&[table.escape, table.terminator])
            .map_err(Error::writing)
    }

    fn write_timestamp(
        &mut self,
        value: &DateTime<Utc>,
        descending: bool,
    ) -> Result<()> {
        self.write_be_i64(value.timestamp(), descending)?;
        self.write_be(value.timestamp_subsec_nanos(), descending)
    }

    fn write_duration(&mut self, value: TimeDelta, descending: bool) -> Result<()> {
        let nanos = value.num_nanoseconds().ok_or_else(|| {
            Error::new(ErrorCode::InvalidValue, "duration out of range")
        })?;
        self.write_be_i64(nanos, descending)
    }

    fn write_datetime(
        &mut self,
        value: &DateTime<FixedOffset>,
        descending: bool,
    ) -> Result<()> {
        let offset_minutes = value.offset().local_minus_utc() / 60;
        let offset: i16 = offset_minutes.try_into().map_err(|_| {
            Error::new(ErrorCode::InvalidValue, "zone offset out of range")
                .with_detail("offset_minutes", offset_minutes)
        })?;
        let mut body = [0u8; 14];
        body[..8].copy_from_slice(
            &((value.timestamp() as u64) ^ SIGN64).to_be_bytes(),
        );
        body[8..12]
            .copy_from_slice(&value.timestamp_subsec_nanos().to_be_bytes());
        body[12..14]
            .copy_from_slice(&((offset as u16) ^ SIGN16).to_be_bytes());
        if descending {
            body.reverse();
        }
        self.write_byte(DATETIME_VERSION)?;
        self.write_all(&body).map_err(Error::writing)
    }
}

impl<W: Write + ?Sized> WireWrite for W {}
