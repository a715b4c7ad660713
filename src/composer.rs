use std::io::Write;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};

use crate::error::{Error, ErrorCode, Result};
use crate::modules::{deref_chain, Modules};
use crate::ty::{Kind, MapType, StructType, Type};
use crate::wire::{EscapeTable, WireWrite};
use crate::{
    HEADER_COMPARABLE, HEADER_COMPATIBILITY, HEADER_DESCENDING,
    HEADER_EMBED_TYPE, HEADER_MODULES,
};

#[derive(Debug, Clone, Default)]
pub struct ComposerOptions {
    pub descending: bool,
    pub comparable: bool,
    pub compatibility: bool,
    /// Write the root type tree into the stream header.
    pub embed_type: bool,
    /// Module table for named references; embedded alongside the type when
    /// the root needs it.
    pub modules: Option<Modules>,
    /// Declared element count for an unbounded root array/map, written up
    /// front instead of buffering.
    pub length: Option<u64>,
}

/// Output funnel: every logical write lands either on the underlying writer
/// or on the innermost scratch buffer, and is counted exactly once. Popping
/// a buffer uncounts its bytes so the flush copy does not double-count.
#[derive(Debug)]
struct Sink<W: Write> {
    out: W,
    written: u64,
    bufs: Vec<Vec<u8>>,
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.bufs.last_mut() {
            Some(scratch) => scratch.extend_from_slice(buf),
            None => self.out.write_all(buf)?,
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

impl<W: Write> Sink<W> {
    fn push_buffer(&mut self) {
        self.bufs.push(Vec::new());
    }

    fn pop_buffer(&mut self) -> Vec<u8> {
        let buf = self.bufs.pop().expect("buffer stack underflow");
        self.written -= buf.len() as u64;
        buf
    }
}

#[derive(Debug)]
enum Body {
    Root {
        ty: Type,
    },
    Struct {
        st: StructType,
        field: usize,
        bool_buf: u8,
        bool_pos: u8,
        field_open: bool,
    },
    Array {
        elem: Type,
        expected: Option<u64>,
        count: u64,
        buffered: bool,
        pack: bool,
        bool_buf: u8,
        bool_pos: u8,
    },
    Map {
        mt: MapType,
        expected: Option<u64>,
        count: u64,
        on_value: bool,
        buffered: bool,
    },
}

enum OneOfPick<'a> {
    Index(u64),
    Name(&'a str),
}

#[derive(Debug)]
struct Frame {
    body: Body,
    /// Effective descending flag of the composite itself (global flag XORed
    /// with every slot flag on the path).
    descending: bool,
    /// Pending element override installed by not-null, oneof or any-type.
    over: Option<Type>,
    done: bool,
}

/// Streaming writer driven by a root type. Forward-only and single-pass;
/// values are supplied through per-kind `write_*` calls in schema order.
/// Errors are sticky: after the first failure every call replays it.
#[derive(Debug)]
pub struct Composer<W: Write> {
    sink: Sink<W>,
    descending: bool,
    comparable: bool,
    compatibility: bool,
    modules: Option<Modules>,
    frames: Vec<Frame>,
    root_length: Option<u64>,
    error: Option<Error>,
}

impl<W: Write> Composer<W> {
    pub fn new(out: W, root: Type, options: ComposerOptions) -> Result<Self> {
        let ComposerOptions {
            descending,
            comparable,
            compatibility,
            embed_type,
            mut modules,
            length,
        } = options;
        root.validate()?;
        let mut root = root;
        let needs_modules = root.needs_modules();
        if let Some(table) = modules.as_mut() {
            table.verify()?;
            table.ensure_resolved()?;
        }
        if needs_modules {
            let table = modules.as_ref().ok_or_else(|| {
                Error::new(
                    ErrorCode::ModulesUndefined,
                    "root type needs a module table",
                )
            })?;
            table.resolve_type(&mut root)?;
        }
        let embed_modules = embed_type && needs_modules && modules.is_some();

        let mut header = 0u8;
        if embed_type {
            header |= HEADER_EMBED_TYPE;
        }
        if compatibility {
            header |= HEADER_COMPATIBILITY;
        }
        if comparable {
            header |= HEADER_COMPARABLE;
        }
        if descending {
            header |= HEADER_DESCENDING;
        }
        if embed_modules {
            header |= HEADER_MODULES;
        }
        log::debug!("composing stream, header {header:#04x}");

        let mut sink = Sink { out, written: 0, bufs: Vec::new() };
        sink.write_byte(header)?;
        if embed_modules {
            modules.as_ref().unwrap().write_block(&mut sink)?;
        }
        if embed_type {
            root.write(&mut sink)?;
        }
        if compatibility {
            if let Type::Struct(st) = deref_chain(modules.as_ref(), &root)? {
                let max = st.fields.len().saturating_sub(1) as u64;
                sink.write_varuint(max, false)?;
            }
        }

        Ok(Self {
            sink,
            descending,
            comparable,
            compatibility,
            modules,
            frames: vec![Frame {
                body: Body::Root { ty: root },
                descending,
                over: None,
                done: false,
            }],
            root_length: length,
            error: None,
        })
    }

    pub fn is_done(&self) -> bool {
        self.frames.len() == 1 && self.frames[0].done
    }

    pub fn bytes_written(&self) -> u64 {
        self.sink.written
    }

    /// Verifies the value is complete and flushes the underlying writer.
    /// Safe to call in the sticky error state; the error is returned again.
    pub fn close(&mut self) -> Result<()> {
        self.guard()?;
        let result = self.close_inner();
        self.stickify(result)
    }

    pub fn into_inner(self) -> W {
        self.sink.out
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.frames.len() != 1 {
            return Err(Error::new(
                ErrorCode::TypeConstraintViolation,
                "composite still open at close",
            ));
        }
        if !self.frames[0].done {
            return Err(Error::new(
                ErrorCode::TypeConstraintViolation,
                "value not fully written at close",
            ));
        }
        self.sink.flush().map_err(Error::writing)?;
        log::trace!("composed {} bytes", self.sink.written);
        Ok(())
    }

    fn guard(&self) -> Result<()> {
        match &self.error {
            Some(err) => Err(err.replicate()),
            None => Ok(()),
        }
    }

    fn stickify<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.error = Some(err.replicate());
        }
        result
    }

    fn check_writable(&self) -> Result<()> {
        let top = self.frames.last().expect("frame stack underflow");
        if !top.done {
            return Ok(());
        }
        if self.frames.len() == 1 {
            Err(Error::new(
                ErrorCode::AlreadyWritten,
                "root value already written",
            ))
        } else {
            Err(Error::new(
                ErrorCode::OutOfBounds,
                "composite already holds all its elements",
            ))
        }
    }

    /// Declared element type and effective descending flag of the current
    /// slot, before named dereferencing and override substitution.
    fn current_slot(&self) -> Result<(&Type, bool)> {
        let frame = self.frames.last().expect("frame stack underflow");
        let (ty, desc) = match &frame.body {
            Body::Root { ty } => (ty, frame.descending),
            Body::Struct { st, field, .. } => {
                let f = st.fields.get(*field).ok_or_else(|| {
                    Error::new(
                        ErrorCode::OutOfBounds,
                        "no struct field left to write",
                    )
                })?;
                (&f.elem, frame.descending ^ f.descending)
            }
            Body::Array { elem, .. } => (elem, frame.descending),
            Body::Map { mt, on_value, .. } => {
                if *on_value {
                    (
                        &mt.value.elem,
                        frame.descending ^ mt.value.descending,
                    )
                } else {
                    (&mt.key.elem, frame.descending ^ mt.key.descending)
                }
            }
        };
        match &frame.over {
            Some(over) => Ok((over, desc)),
            None => Ok((ty, desc)),
        }
    }

    fn current_target(&self) -> Result<(&Type, bool)> {
        let (ty, desc) = self.current_slot()?;
        Ok((deref_chain(self.modules.as_ref(), ty)?, desc))
    }

    fn expect_kind(&self, kind: Kind) -> Result<bool> {
        let (ty, desc) = self.current_target()?;
        if ty.kind() != kind {
            return Err(Error::new(
                ErrorCode::InvalidType,
                "write does not match the element type",
            )
            .with_detail("element", format!("{:?}", ty.kind()))
            .with_detail("written", format!("{kind:?}")));
        }
        Ok(desc)
    }

    /// In compatibility mode a struct field's bytes are collected into a
    /// scratch buffer so the field header (index + body length) can precede
    /// them. Idempotent per field.
    fn begin_field_value(&mut self) -> Result<()> {
        if !self.compatibility {
            return Ok(());
        }
        let frame = self.frames.last_mut().expect("frame stack underflow");
        if let Body::Struct { field_open, .. } = &mut frame.body {
            if !*field_open {
                *field_open = true;
                self.sink.push_buffer();
            }
        }
        Ok(())
    }

    /// Advances the state machine after one element value is complete:
    /// clears the override, emits the compatibility field wrapper, steps the
    /// field/element/entry cursor and flushes a finished packed-bool byte.
    fn complete_element(&mut self) -> Result<()> {
        let frame = self.frames.last_mut().expect("frame stack underflow");
        frame.over = None;
        let mut wrapper: Option<u64> = None;
        let mut flush_bits: Option<u8> = None;
        match &mut frame.body {
            Body::Root { .. } => frame.done = true,
            Body::Struct { st, field, field_open, .. } => {
                let index = st.fields[*field].index;
                if *field_open {
                    *field_open = false;
                    wrapper = Some(index);
                }
                *field += 1;
                if *field >= st.fields.len() {
                    frame.done = true;
                }
            }
            Body::Array { expected, count, bool_buf, bool_pos, .. } => {
                *count += 1;
                if expected.is_some_and(|n| *count >= n) {
                    frame.done = true;
                    if *bool_pos > 0 {
                        flush_bits = Some(*bool_buf);
                        *bool_buf = 0;
                        *bool_pos = 0;
                    }
                }
            }
            Body::Map { expected, count, on_value, .. } => {
                if !*on_value {
                    *on_value = true;
                } else {
                    *on_value = false;
                    *count += 1;
                    if expected.is_some_and(|n| *count >= n) {
                        frame.done = true;
                    }
                }
            }
        }
        if let Some(bits) = flush_bits {
            self.sink.write_byte(bits)?;
        }
        if let Some(index) = wrapper {
            let body = self.sink.pop_buffer();
            self.sink.write_varuint(index, false)?;
            self.sink.write_varuint(body.len() as u64, false)?;
            self.sink.write_all(&body).map_err(Error::writing)?;
        }
        Ok(())
    }

    fn scalar(
        &mut self,
        kind: Kind,
        emit: impl FnOnce(&mut Sink<W>, bool) -> Result<()>,
    ) -> Result<()> {
        self.guard()?;
        let result = self.scalar_inner(kind, emit);
        self.stickify(result)
    }

    fn scalar_inner(
        &mut self,
        kind: Kind,
        emit: impl FnOnce(&mut Sink<W>, bool) -> Result<()>,
    ) -> Result<()> {
        self.check_writable()?;
        let desc = self.expect_kind(kind)?;
        self.begin_field_value()?;
        emit(&mut self.sink, desc)?;
        self.complete_element()
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.scalar(Kind::Uint8, |out, desc| out.write_be(value, desc))
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.scalar(Kind::Uint16, |out, desc| out.write_be(value, desc))
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.scalar(Kind::Uint32, |out, desc| out.write_be(value, desc))
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.scalar(Kind::Uint64, |out, desc| out.write_be(value, desc))
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.scalar(Kind::Int8, |out, desc| out.write_be_i8(value, desc))
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.scalar(Kind::Int16, |out, desc| out.write_be_i16(value, desc))
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.scalar(Kind::Int32, |out, desc| out.write_be_i32(value, desc))
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.scalar(Kind::Int64, |out, desc| out.write_be_i64(value, desc))
    }

    /// Variable-length unsigned integer.
    pub fn write_uint(&mut self, value: u64) -> Result<()> {
        self.scalar(Kind::Uint, |out, desc| out.write_varuint(value, desc))
    }

    /// Variable-length signed integer.
    pub fn write_int(&mut self, value: i64) -> Result<()> {
        self.scalar(Kind::Int, |out, desc| out.write_varint(value, desc))
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.scalar(Kind::Float32, |out, desc| out.write_f32(value, desc))
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.scalar(Kind::Float64, |out, desc| out.write_f64(value, desc))
    }

    pub fn write_timestamp(&mut self, value: &DateTime<Utc>) -> Result<()> {
        self.scalar(Kind::Timestamp, |out, desc| {
            out.write_timestamp(value, desc)
        })
    }

    pub fn write_datetime(
        &mut self,
        value: &DateTime<FixedOffset>,
    ) -> Result<()> {
        self.scalar(Kind::DateTime, |out, desc| out.write_datetime(value, desc))
    }

    pub fn write_duration(&mut self, value: TimeDelta) -> Result<()> {
        self.scalar(Kind::Duration, |out, desc| out.write_duration(value, desc))
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let comparable = self.comparable;
        self.scalar(Kind::String, |out, desc| {
            if comparable {
                out.write_escaped_data(value.as_bytes(), desc)
            } else {
                out.write_len_bytes(value.as_bytes(), desc)
            }
        })
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.guard()?;
        let result = self.write_bytes_inner(value);
        self.stickify(result)
    }

    fn write_bytes_inner(&mut self, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let (ty, desc) = self.current_target()?;
        let Type::Bytes(bt) = ty else {
            return Err(Error::new(
                ErrorCode::InvalidType,
                "write does not match the element type",
            )
            .with_detail("element", format!("{:?}", ty.kind()))
            .with_detail("written", format!("{:?}", Kind::Bytes)));
        };
        let fixed = bt.fixed_size;
        if fixed > 0 && value.len() as u64 != u64::from(fixed) {
            return Err(Error::new(
                ErrorCode::InvalidValue,
                "value does not match the fixed size",
            )
            .with_detail("fixed_size", fixed)
            .with_detail("len", value.len()));
        }
        let comparable = self.comparable;
        self.begin_field_value()?;
        if fixed > 0 {
            let mut raw = value.to_vec();
            if desc {
                if comparable {
                    crate::wire::complement(&mut raw);
                } else {
                    raw.reverse();
                }
            }
            self.sink.write_all(&raw).map_err(Error::writing)?;
        } else if comparable {
            self.sink.write_escaped_data(value, desc)?;
        } else {
            self.sink.write_len_bytes(value, desc)?;
        }
        self.complete_element()
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.guard()?;
        let result = self.write_bool_inner(value);
        self.stickify(result)
    }

    fn write_bool_inner(&mut self, value: bool) -> Result<()> {
        self.check_writable()?;
        let desc = self.expect_kind(Kind::Boolean)?;
        let compatibility = self.compatibility;
        let comparable = self.comparable;

        // Packing: LSB-first bits, seven values per byte. Struct fields pack
        // across consecutive boolean fields; boolean arrays pack all
        // elements. Overridden elements (nullable/oneof payloads) never do.
        let packed = {
            let frame = self.frames.last().expect("frame stack underflow");
            if frame.over.is_some() {
                None
            } else {
                match &frame.body {
                    Body::Struct { st, field, .. }
                        if !compatibility && !comparable =>
                    {
                        let next_is_bool = match st.fields.get(*field + 1) {
                            Some(next) => {
                                deref_chain(self.modules.as_ref(), &next.elem)?
                                    .kind()
                                    == Kind::Boolean
                            }
                            None => false,
                        };
                        Some(!next_is_bool)
                    }
                    Body::Array { pack: true, .. } => Some(false),
                    _ => None,
                }
            }
        };
        let Some(force_flush) = packed else {
            self.begin_field_value()?;
            self.sink.write_bool_byte(value, desc)?;
            return self.complete_element();
        };

        let frame = self.frames.last_mut().expect("frame stack underflow");
        let (bool_buf, bool_pos) = match &mut frame.body {
            Body::Struct { bool_buf, bool_pos, .. } => (bool_buf, bool_pos),
            Body::Array { bool_buf, bool_pos, .. } => (bool_buf, bool_pos),
            _ => unreachable!(),
        };
        if value ^ desc {
            *bool_buf |= 1 << *bool_pos;
        }
        *bool_pos += 1;
        let flush = *bool_pos == 7 || force_flush;
        let bits = *bool_buf;
        if flush {
            *bool_buf = 0;
            *bool_pos = 0;
        }
        if flush {
            self.sink.write_byte(bits)?;
        }
        self.complete_element()
    }

    pub fn write_null(&mut self) -> Result<()> {
        self.guard()?;
        let result = (|| {
            self.check_writable()?;
            let desc = self.expect_kind(Kind::Nullable)?;
            self.begin_field_value()?;
            self.sink.write_nullable_flag(false, desc)?;
            self.complete_element()
        })();
        self.stickify(result)
    }

    /// Writes the not-null flag and narrows the current element to the
    /// nullable payload; the next write supplies the value.
    pub fn write_not_null(&mut self) -> Result<()> {
        self.guard()?;
        let result = (|| {
            self.check_writable()?;
            let (ty, desc) = self.current_target()?;
            let Type::Nullable(inner) = ty else {
                return Err(Error::new(
                    ErrorCode::InvalidType,
                    "write does not match the element type",
                )
                .with_detail("element", format!("{:?}", ty.kind()))
                .with_detail("written", format!("{:?}", Kind::Nullable)));
            };
            let inner = (**inner).clone();
            self.begin_field_value()?;
            self.sink.write_nullable_flag(true, desc)?;
            let frame = self.frames.last_mut().expect("frame stack underflow");
            frame.over = Some(inner);
            Ok(())
        })();
        self.stickify(result)
    }

    pub fn write_enum_index(&mut self, index: u64) -> Result<()> {
        self.guard()?;
        let result = (|| {
            self.check_writable()?;
            let (ty, desc) = self.current_target()?;
            let Type::Enum(et) = ty else {
                return Err(Error::new(
                    ErrorCode::InvalidType,
                    "write does not match the element type",
                )
                .with_detail("element", format!("{:?}", ty.kind()))
                .with_detail("written", format!("{:?}", Kind::Enum)));
            };
            if et.element_by_index(index).is_none() {
                return Err(Error::new(
                    ErrorCode::InvalidValue,
                    "index is not an enum element",
                )
                .with_detail("index", index));
            }
            let width = et.value_bytes;
            self.begin_field_value()?;
            self.sink.write_index(index, width, desc)?;
            self.complete_element()
        })();
        self.stickify(result)
    }

    pub fn write_oneof_index(&mut self, index: u64) -> Result<()> {
        self.guard()?;
        let result = self.write_oneof(OneOfPick::Index(index));
        self.stickify(result)
    }

    pub fn write_oneof_by_name(&mut self, name: &str) -> Result<()> {
        self.guard()?;
        let result = self.write_oneof(OneOfPick::Name(name));
        self.stickify(result)
    }

    fn write_oneof(&mut self, pick: OneOfPick<'_>) -> Result<()> {
        self.check_writable()?;
        let (ty, desc) = self.current_target()?;
        let Type::OneOf(ot) = ty else {
            return Err(Error::new(
                ErrorCode::InvalidType,
                "write does not match the element type",
            )
            .with_detail("element", format!("{:?}", ty.kind()))
            .with_detail("written", format!("{:?}", Kind::OneOf)));
        };
        let element = match pick {
            OneOfPick::Index(index) => {
                ot.element_by_index(index).ok_or_else(|| {
                    Error::new(
                        ErrorCode::InvalidValue,
                        "index is not a oneof element",
                    )
                    .with_detail("index", index)
                })?
            }
            OneOfPick::Name(name) => {
                ot.element_by_name(name).ok_or_else(|| {
                    Error::new(
                        ErrorCode::InvalidValue,
                        "name is not a oneof element",
                    )
                    .with_detail("name", name)
                })?
            }
        };
        let index = element.index;
        let width = ot.index_bytes;
        let elem = element.elem.clone();
        self.begin_field_value()?;
        self.sink.write_index(index, width, desc)?;
        let frame = self.frames.last_mut().expect("frame stack underflow");
        frame.over = Some(elem);
        Ok(())
    }

    /// Writes a self-described element: a header byte (bit 4 marks an
    /// embedded module table), optionally the modules the type depends on,
    /// the type tree, and then expects the value of that type next.
    pub fn write_any_type(&mut self, ty: &Type) -> Result<()> {
        self.guard()?;
        let result = (|| {
            self.check_writable()?;
            self.expect_kind(Kind::Any)?;
            ty.validate()?;
            let mut resolved = ty.clone();
            let needs_modules = resolved.needs_modules();
            if needs_modules {
                let table = self.modules.as_mut().ok_or_else(|| {
                    Error::new(
                        ErrorCode::ModulesUndefined,
                        "self-described type needs a module table",
                    )
                })?;
                table.ensure_resolved()?;
                self.modules.as_ref().unwrap().resolve_type(&mut resolved)?;
            }
            self.begin_field_value()?;
            let header = if needs_modules { HEADER_MODULES } else { 0 };
            self.sink.write_byte(header)?;
            if needs_modules {
                self.modules.as_ref().unwrap().write_block(&mut self.sink)?;
            }
            resolved.write(&mut self.sink)?;
            let frame = self.frames.last_mut().expect("frame stack underflow");
            frame.over = Some(resolved);
            Ok(())
        })();
        self.stickify(result)
    }

    /// Advances past the current struct field without emitting anything;
    /// only meaningful under compatibility framing, where the reader aligns
    /// on field indices.
    pub fn skip_field(&mut self) -> Result<()> {
        self.guard()?;
        let result = (|| {
            self.check_writable()?;
            if !self.compatibility {
                return Err(Error::new(
                    ErrorCode::TypeConstraintViolation,
                    "field skipping requires compatibility framing",
                ));
            }
            let frame = self.frames.last_mut().expect("frame stack underflow");
            let Body::Struct { st, field, field_open, .. } = &mut frame.body
            else {
                return Err(Error::new(
                    ErrorCode::InvalidType,
                    "no struct field to skip",
                ));
            };
            if *field_open {
                return Err(Error::new(
                    ErrorCode::TypeConstraintViolation,
                    "field value already started",
                ));
            }
            if *field >= st.fields.len() {
                return Err(Error::new(
                    ErrorCode::OutOfBounds,
                    "no struct field left to skip",
                ));
            }
            *field += 1;
            if *field >= st.fields.len() {
                frame.done = true;
            }
            Ok(())
        })();
        self.stickify(result)
    }

    pub fn write_struct(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.guard()?;
        let result = self.write_struct_inner(f);
        self.stickify(result)
    }

    fn write_struct_inner(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.check_writable()?;
        let (ty, desc) = self.current_target()?;
        let Type::Struct(st) = ty else {
            return Err(Error::new(
                ErrorCode::InvalidType,
                "write does not match the element type",
            )
            .with_detail("element", format!("{:?}", ty.kind()))
            .with_detail("written", format!("{:?}", Kind::Struct)));
        };
        let st = st.clone();
        self.begin_field_value()?;
        let done = st.fields.is_empty();
        self.frames.push(Frame {
            body: Body::Struct {
                st,
                field: 0,
                bool_buf: 0,
                bool_pos: 0,
                field_open: false,
            },
            descending: desc,
            over: None,
            done,
        });
        f(self)?;
        let frame = self.frames.pop().expect("frame stack underflow");
        let Body::Struct { st, field, field_open, .. } = frame.body else {
            unreachable!()
        };
        if field_open {
            return Err(Error::new(
                ErrorCode::TypeConstraintViolation,
                "struct field value incomplete",
            ));
        }
        if field < st.fields.len() {
            return Err(Error::new(
                ErrorCode::TypeConstraintViolation,
                "struct fields missing",
            )
            .with_detail("next", &st.fields[field].name));
        }
        self.complete_element()
    }

    pub fn write_array(
        &mut self,
        length: Option<u64>,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.guard()?;
        let result = self.write_array_inner(length, f);
        self.stickify(result)
    }

    fn write_array_inner(
        &mut self,
        length: Option<u64>,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.check_writable()?;
        let (ty, desc) = self.current_target()?;
        let Type::Array(at) = ty else {
            return Err(Error::new(
                ErrorCode::InvalidType,
                "write does not match the element type",
            )
            .with_detail("element", format!("{:?}", ty.kind()))
            .with_detail("written", format!("{:?}", Kind::Array)));
        };
        let at = (**at).clone();
        let declared = if self.frames.len() == 1 {
            length.or(self.root_length.take())
        } else {
            length
        };
        let elem_kind = deref_chain(self.modules.as_ref(), &at.elem)?.kind();
        let pack = elem_kind == Kind::Boolean && !self.comparable;
        self.begin_field_value()?;
        let fixed = u64::from(at.fixed_size);
        let (expected, buffered) = if fixed > 0 {
            (Some(fixed), false)
        } else if self.comparable {
            (declared, true)
        } else if let Some(n) = declared {
            self.sink.write_varuint(n, desc)?;
            (Some(n), false)
        } else {
            (None, true)
        };
        if buffered {
            self.sink.push_buffer();
        }
        self.frames.push(Frame {
            body: Body::Array {
                elem: at.elem,
                expected,
                count: 0,
                buffered,
                pack,
                bool_buf: 0,
                bool_pos: 0,
            },
            descending: desc,
            over: None,
            done: expected == Some(0),
        });
        f(self)?;
        self.close_sequence()
    }

    pub fn write_map(
        &mut self,
        length: Option<u64>,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.guard()?;
        let result = self.write_map_inner(length, f);
        self.stickify(result)
    }

    fn write_map_inner(
        &mut self,
        length: Option<u64>,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.check_writable()?;
        let (ty, desc) = self.current_target()?;
        let Type::Map(mt) = ty else {
            return Err(Error::new(
                ErrorCode::InvalidType,
                "write does not match the element type",
            )
            .with_detail("element", format!("{:?}", ty.kind()))
            .with_detail("written", format!("{:?}", Kind::Map)));
        };
        let mt = (**mt).clone();
        let declared = if self.frames.len() == 1 {
            length.or(self.root_length.take())
        } else {
            length
        };
        self.begin_field_value()?;
        let (expected, buffered) = if self.comparable {
            (declared, true)
        } else if let Some(n) = declared {
            self.sink.write_varuint(n, desc)?;
            (Some(n), false)
        } else {
            (None, true)
        };
        if buffered {
            self.sink.push_buffer();
        }
        self.frames.push(Frame {
            body: Body::Map {
                mt,
                expected,
                count: 0,
                on_value: false,
                buffered,
            },
            descending: desc,
            over: None,
            done: expected == Some(0),
        });
        f(self)?;
        self.close_sequence()
    }

    /// Shared close for array and map frames: flushes a packed-bool
    /// remainder, verifies the element count, and for buffered bodies emits
    /// either the count prefix or the escape-framed body.
    fn close_sequence(&mut self) -> Result<()> {
        let frame = self.frames.pop().expect("frame stack underflow");
        match frame.body {
            Body::Array {
                expected,
                count,
                buffered,
                bool_buf,
                bool_pos,
                ..
            } => {
                if bool_pos > 0 {
                    self.sink.write_byte(bool_buf)?;
                }
                if let Some(n) = expected {
                    if count != n {
                        return Err(Error::new(
                            ErrorCode::TypeConstraintViolation,
                            "array element count mismatch",
                        )
                        .with_detail("expected", n)
                        .with_detail("written", count));
                    }
                }
                if buffered {
                    let body = self.sink.pop_buffer();
                    if self.comparable {
                        let table = EscapeTable::array(frame.descending);
                        self.sink.write_escaped(&body, table)?;
                    } else {
                        self.sink.write_varuint(count, frame.descending)?;
                        self.sink.write_all(&body).map_err(Error::writing)?;
                    }
                }
            }
            Body::Map { expected, count, on_value, buffered, .. } => {
                if on_value {
                    return Err(Error::new(
                        ErrorCode::TypeConstraintViolation,
                        "map entry is missing its value",
                    ));
                }
                if let Some(n) = expected {
                    if count != n {
                        return Err(Error::new(
                            ErrorCode::TypeConstraintViolation,
                            "map entry count mismatch",
                        )
                        .with_detail("expected", n)
                        .with_detail("written", count));
                    }
                }
                if buffered {
                    let body = self.sink.pop_buffer();
                    if self.comparable {
                        let table = EscapeTable::map(frame.descending);
                        self.sink.write_escaped(&body, table)?;
                    } else {
                        self.sink.write_varuint(count, frame.descending)?;
                        self.sink.write_all(&body).map_err(Error::writing)?;
                    }
                }
            }
            _ => unreachable!(),
        }
        self.complete_element()
    }
}
