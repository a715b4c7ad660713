use std::io::{BufRead, Cursor, Read};

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};

use crate::error::{Error, ErrorCode, Result};
use crate::modules::{deref_chain, Modules};
use crate::ty::{Kind, MapType, StructType, Type};
use crate::wire::{EscapeTable, WireBufRead, WireRead};
use crate::{
    HEADER_COMPARABLE, HEADER_COMPATIBILITY, HEADER_DESCENDING,
    HEADER_EMBED_TYPE, HEADER_MODULES, HEADER_RESERVED,
};

#[derive(Debug, Clone, Default)]
pub struct ExtractorOptions {
    /// Schema the caller wants to decode against. May be a field-index
    /// subset of the embedded schema.
    pub expected: Option<Type>,
    /// Module table filling gaps the stream header does not supply; header
    /// definitions always win.
    pub modules: Option<Modules>,
    /// The stream carries no header byte; the flags below apply instead.
    pub headless: bool,
    pub descending: bool,
    pub comparable: bool,
    pub compatibility: bool,
}

#[derive(Debug)]
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.count += amt as u64;
        self.inner.consume(amt);
    }
}

#[derive(Debug)]
struct StructCtx {
    exp: StructType,
    /// Writer-side schema; identical to `exp` unless the stream embedded a
    /// structurally different type.
    emb: StructType,
    two_schema: bool,
    exp_i: usize,
    emb_i: usize,
    /// Compatibility framing: total embed field records and how many were
    /// consumed. `None` means the count is unknowable (nested struct with no
    /// embedded schema) and the stream is trusted to match the expected
    /// schema.
    records_total: Option<u64>,
    records_read: u64,
    pending: Option<(u64, u64)>,
    bool_buf: u8,
    bool_pos: u8,
    bool_loaded: bool,
    ready: bool,
    base_done: bool,
}

#[derive(Debug)]
struct ArrayCtx {
    elem: Type,
    len: u64,
    i: u64,
    pack: bool,
    bool_buf: u8,
    bool_pos: u8,
    bool_loaded: bool,
    ready: bool,
}

#[derive(Debug)]
struct MapCtx {
    mt: MapType,
    len: u64,
    i: u64,
    on_value: bool,
    ready: bool,
}

#[derive(Debug)]
enum XBody {
    Root { pair: Option<(Type, Type)> },
    Struct(StructCtx),
    Array(ArrayCtx),
    Map(MapCtx),
}

#[derive(Debug)]
struct XFrame {
    body: XBody,
    descending: bool,
    /// Element override installed by not-null, oneof index or any-type:
    /// `(expected side, embed side)`.
    over: Option<(Type, Type)>,
    /// In-memory body of a comparable variable composite; reads inside the
    /// composite come from here.
    body_buf: Option<Cursor<Vec<u8>>>,
}

/// Per-value environment threaded through the kind-driven skip functions.
#[derive(Clone, Copy)]
struct SkipEnv<'a> {
    descending: bool,
    comparable: bool,
    compatibility: bool,
    modules: Option<&'a Modules>,
}

/// Streaming reader, the dual of the composer. Decoding is driven by the
/// embedded type when the stream carries one, reconciled field-by-field
/// against the caller's expected type: embed-only fields are skipped,
/// expected-only fields are reported absent. Errors are sticky.
#[derive(Debug)]
pub struct Extractor<R: BufRead> {
    input: CountingReader<R>,
    descending: bool,
    comparable: bool,
    compatibility: bool,
    modules: Option<Modules>,
    embed: Option<Type>,
    root_records_header: Option<u64>,
    frames: Vec<XFrame>,
    error: Option<Error>,
}

fn pick_src<'a, R: BufRead>(
    frames: &'a mut [XFrame],
    input: &'a mut CountingReader<R>,
) -> &'a mut dyn BufRead {
    for frame in frames.iter_mut().rev() {
        if let Some(body) = frame.body_buf.as_mut() {
            return body;
        }
    }
    input
}

impl<R: BufRead> Extractor<R> {
    pub fn new(input: R, options: ExtractorOptions) -> Result<Self> {
        let mut input = CountingReader { inner: input, count: 0 };
        let ExtractorOptions {
            expected,
            modules: user_modules,
            headless,
            descending,
            comparable,
            compatibility,
        } = options;

        let (descending, comparable, compatibility, embed_flag, modules_flag) =
            if headless {
                (descending, comparable, compatibility, false, false)
            } else {
                let header = input.read_byte()?;
                if header & HEADER_RESERVED != 0 {
                    return Err(Error::new(
                        ErrorCode::MalformedBinary,
                        "reserved stream header bits set",
                    )
                    .with_detail("header", format!("{header:#04x}")));
                }
                log::debug!("extracting stream, header {header:#04x}");
                (
                    header & HEADER_DESCENDING != 0,
                    header & HEADER_COMPARABLE != 0,
                    header & HEADER_COMPATIBILITY != 0,
                    header & HEADER_EMBED_TYPE != 0,
                    header & HEADER_MODULES != 0,
                )
            };

        let mut modules: Option<Modules> = None;
        if modules_flag {
            modules = Some(Modules::read_block(&mut input)?);
        }
        match (&mut modules, user_modules) {
            (Some(table), Some(user)) => table.merge(&user)?,
            (None, user @ Some(_)) => modules = user,
            _ => {}
        }
        if let Some(table) = modules.as_mut() {
            table.verify()?;
            table.ensure_resolved()?;
        }

        let mut embed = if embed_flag {
            let ty = Type::read(&mut input)?;
            ty.validate()?;
            Some(ty)
        } else {
            None
        };
        if let Some(ty) = embed.as_mut() {
            if ty.needs_modules() {
                let table = modules.as_ref().ok_or_else(|| {
                    Error::new(
                        ErrorCode::ModulesUndefined,
                        "embedded type needs a module table",
                    )
                })?;
                table.resolve_type(ty)?;
            }
        }

        let mut expected = expected;
        if let Some(ty) = expected.as_mut() {
            ty.validate()?;
            if ty.needs_modules() {
                let table = modules.as_ref().ok_or_else(|| {
                    Error::new(
                        ErrorCode::ModulesUndefined,
                        "expected type needs a module table",
                    )
                })?;
                table.resolve_type(ty)?;
            }
        }

        let (exp_root, emb_root) = match (expected, embed.clone()) {
            (Some(exp), Some(emb)) => (exp, emb),
            (Some(exp), None) => (exp.clone(), exp),
            (None, Some(emb)) => (emb.clone(), emb),
            (None, None) => {
                return Err(Error::new(
                    ErrorCode::UndefinedType,
                    "no type to drive extraction",
                ))
            }
        };

        let mut root_records_header = None;
        if compatibility
            && matches!(
                deref_chain(modules.as_ref(), &emb_root)?,
                Type::Struct(_)
            )
        {
            root_records_header = Some(input.read_varuint(false)?);
        }

        Ok(Self {
            input,
            descending,
            comparable,
            compatibility,
            modules,
            embed,
            root_records_header,
            frames: vec![XFrame {
                body: XBody::Root { pair: Some((exp_root, emb_root)) },
                descending,
                over: None,
                body_buf: None,
            }],
            error: None,
        })
    }

    pub fn bytes_read(&self) -> u64 {
        self.input.count
    }

    pub fn is_done(&self) -> bool {
        self.frames.len() == 1
            && matches!(&self.frames[0].body, XBody::Root { pair: None })
    }

    pub fn err(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Type embedded in the stream header, when present.
    pub fn embedded_type(&self) -> Option<&Type> {
        self.embed.as_ref()
    }

    pub fn modules(&self) -> Option<&Modules> {
        self.modules.as_ref()
    }

    /// Releases decoding state. Safe to call at any point, including after a
    /// sticky error.
    pub fn close(&mut self) {
        let descending = self.descending;
        self.frames.clear();
        self.frames.push(XFrame {
            body: XBody::Root { pair: None },
            descending,
            over: None,
            body_buf: None,
        });
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

    fn top(&self) -> &XFrame {
        self.frames.last().expect("frame stack underflow")
    }

    fn top_mut(&mut self) -> &mut XFrame {
        self.frames.last_mut().expect("frame stack underflow")
    }

    fn top_struct(&self) -> &StructCtx {
        match &self.top().body {
            XBody::Struct(ctx) => ctx,
            _ => unreachable!("struct frame expected"),
        }
    }

    fn top_struct_mut(&mut self) -> &mut StructCtx {
        match &mut self.top_mut().body {
            XBody::Struct(ctx) => ctx,
            _ => unreachable!("struct frame expected"),
        }
    }

    /// Reader and module table, borrowed side by side. The reader is the
    /// innermost comparable composite body when one is open.
    fn src_and_modules(&mut self) -> (&mut dyn BufRead, Option<&Modules>) {
        let src = pick_src(&mut self.frames, &mut self.input);
        (src, self.modules.as_ref())
    }

    /// Expected-side type of the current element.
    pub fn elem(&self) -> Option<&Type> {
        self.current_pair().ok().map(|(exp, _, _)| exp)
    }

    /// Current position: expected field index in a struct, element ordinal
    /// in an array, entry ordinal in a map.
    pub fn index(&self) -> Option<u64> {
        match &self.top().body {
            XBody::Struct(ctx) => {
                ctx.exp.fields.get(ctx.exp_i).map(|f| f.index)
            }
            XBody::Array(ctx) => Some(ctx.i),
            XBody::Map(ctx) => Some(ctx.i),
            XBody::Root { .. } => None,
        }
    }

    pub fn max_index(&self) -> Option<u64> {
        match &self.top().body {
            XBody::Struct(ctx) => Some(ctx.exp.max_index()),
            XBody::Array(ctx) => Some(ctx.len.saturating_sub(1)),
            XBody::Map(ctx) => Some(ctx.len.saturating_sub(1)),
            XBody::Root { .. } => None,
        }
    }

    pub fn field_name(&self) -> Option<&str> {
        match &self.top().body {
            XBody::Struct(ctx) => {
                ctx.exp.fields.get(ctx.exp_i).map(|f| f.name.as_str())
            }
            _ => None,
        }
    }

    /// Element count of the current array or entry count of the current
    /// map. Exact even for comparable variable composites (their body is
    /// scanned once at open).
    pub fn len(&self) -> Option<u64> {
        match &self.top().body {
            XBody::Array(ctx) => Some(ctx.len),
            XBody::Map(ctx) => Some(ctx.len),
            _ => None,
        }
    }

    /// True while the current map entry's key has been consumed and its
    /// value has not.
    pub fn key_done(&self) -> bool {
        match &self.top().body {
            XBody::Map(ctx) => ctx.on_value,
            _ => false,
        }
    }

    pub fn value_done(&self) -> bool {
        match &self.top().body {
            XBody::Map(ctx) => !ctx.on_value && !ctx.ready && ctx.i > 0,
            _ => false,
        }
    }

    fn current_pair(&self) -> Result<(&Type, &Type, bool)> {
        let frame = self.top();
        let (exp, emb, desc) = match &frame.body {
            XBody::Root { pair } => {
                let (exp, emb) = pair.as_ref().ok_or_else(|| {
                    Error::new(
                        ErrorCode::AlreadyRead,
                        "root value already read",
                    )
                })?;
                (exp, emb, frame.descending)
            }
            XBody::Struct(ctx) => {
                let ef = ctx.exp.fields.get(ctx.exp_i).ok_or_else(|| {
                    Error::new(
                        ErrorCode::OutOfBounds,
                        "no struct field left to read",
                    )
                })?;
                let mf = if ctx.two_schema && !self.compatibility {
                    ctx.emb.fields.get(ctx.emb_i).ok_or_else(|| {
                        Error::new(
                            ErrorCode::OutOfBounds,
                            "embedded struct exhausted",
                        )
                    })?
                } else {
                    ef
                };
                (&ef.elem, &mf.elem, frame.descending ^ mf.descending)
            }
            XBody::Array(ctx) => (&ctx.elem, &ctx.elem, frame.descending),
            XBody::Map(ctx) => {
                let slot = if ctx.on_value {
                    &ctx.mt.value
                } else {
                    &ctx.mt.key
                };
                (&slot.elem, &slot.elem, frame.descending ^ slot.descending)
            }
        };
        match &frame.over {
            Some((o_exp, o_emb)) => Ok((o_exp, o_emb, desc)),
            None => Ok((exp, emb, desc)),
        }
    }

    fn current_target(&self) -> Result<(&Type, &Type, bool)> {
        let (exp, emb, desc) = self.current_pair()?;
        let table = self.modules.as_ref();
        Ok((deref_chain(table, exp)?, deref_chain(table, emb)?, desc))
    }

    fn expect_kind(&self, kind: Kind) -> Result<bool> {
        let (exp, emb, desc) = self.current_target()?;
        if exp.kind() != kind || emb.kind() != kind {
            return Err(Error::new(
                ErrorCode::MismatchingValueType,
                "read does not match the element type",
            )
            .with_detail("expected", format!("{:?}", exp.kind()))
            .with_detail("embedded", format!("{:?}", emb.kind()))
            .with_detail("read", format!("{kind:?}")));
        }
        Ok(desc)
    }

    /// Makes sure the top frame has a value lined up, advancing with
    /// [`Extractor::next`] when the caller has not done so.
    fn ensure_value_available(&mut self) -> Result<()> {
        let available = match &self.top().body {
            XBody::Root { pair } => {
                return if pair.is_some() {
                    Ok(())
                } else {
                    Err(Error::new(
                        ErrorCode::AlreadyRead,
                        "root value already read",
                    ))
                }
            }
            XBody::Struct(ctx) => ctx.ready,
            XBody::Array(ctx) => ctx.ready,
            XBody::Map(ctx) => ctx.ready || ctx.on_value,
        };
        if available {
            return Ok(());
        }
        if self.next_inner()? {
            Ok(())
        } else {
            Err(Error::new(ErrorCode::OutOfBounds, "no element available"))
        }
    }

    /// Advances to the next element of the current composite. For structs
    /// this aligns the embedded stream with the expected schema: embed-only
    /// fields are skipped, and a false return with fields left means the
    /// current expected field is absent from the stream (the cursor then
    /// moves on). An unconsumed value from a previous call is skipped.
    pub fn next(&mut self) -> Result<bool> {
        self.guard()?;
        let result = self.next_inner();
        self.stickify(result)
    }

    fn next_inner(&mut self) -> Result<bool> {
        enum Top {
            Root(bool),
            Struct,
            Array,
            Map,
        }
        let top = match &self.top().body {
            XBody::Root { pair } => Top::Root(pair.is_some()),
            XBody::Struct(_) => Top::Struct,
            XBody::Array(_) => Top::Array,
            XBody::Map(_) => Top::Map,
        };
        match top {
            Top::Root(present) => Ok(present),
            Top::Struct => self.next_struct(),
            Top::Array => {
                let ready = match &self.top().body {
                    XBody::Array(ctx) => ctx.ready,
                    _ => unreachable!(),
                };
                if ready {
                    self.skip_ready()?;
                }
                let XBody::Array(ctx) = &mut self.top_mut().body else {
                    unreachable!()
                };
                if ctx.i >= ctx.len {
                    return Ok(false);
                }
                ctx.ready = true;
                Ok(true)
            }
            Top::Map => {
                loop {
                    let unconsumed = match &self.top().body {
                        XBody::Map(ctx) => ctx.ready || ctx.on_value,
                        _ => unreachable!(),
                    };
                    if !unconsumed {
                        break;
                    }
                    self.skip_ready()?;
                }
                let XBody::Map(ctx) = &mut self.top_mut().body else {
                    unreachable!()
                };
                if ctx.i >= ctx.len {
                    return Ok(false);
                }
                ctx.ready = true;
                Ok(true)
            }
        }
    }

    fn next_struct(&mut self) -> Result<bool> {
        let (base_done, ready) = {
            let ctx = self.top_struct();
            (ctx.base_done, ctx.ready)
        };
        if base_done {
            return Ok(false);
        }
        if ready {
            self.skip_ready()?;
        }
        let exp_exhausted = {
            let ctx = self.top_struct();
            ctx.exp_i >= ctx.exp.fields.len()
        };
        if exp_exhausted {
            self.drain_struct_remainder()?;
            self.top_struct_mut().base_done = true;
            return Ok(false);
        }
        if self.compatibility {
            self.next_struct_compat()
        } else {
            self.next_struct_plain()
        }
    }

    /// Compatibility alignment: each embed field record is prefixed with its
    /// index and body length, so skipping needs no type knowledge.
    fn next_struct_compat(&mut self) -> Result<bool> {
        loop {
            let (want, have_pending, exhausted, unknowable) = {
                let ctx = self.top_struct();
                let want = ctx.exp.fields[ctx.exp_i].index;
                let exhausted = ctx.pending.is_none()
                    && ctx
                        .records_total
                        .is_some_and(|total| ctx.records_read >= total);
                let unknowable = ctx.pending.is_none()
                    && ctx.records_total.is_none()
                    && ctx.records_read >= ctx.exp.fields.len() as u64;
                (want, ctx.pending.is_some(), exhausted, unknowable)
            };
            if exhausted || unknowable {
                self.top_struct_mut().exp_i += 1;
                return Ok(false);
            }
            if !have_pending {
                // A writer may skip fields without emitting records, so the
                // record count from the header is an upper bound; a stream
                // that simply ends has no more records.
                let at_end = {
                    let src = pick_src(&mut self.frames, &mut self.input);
                    src.peek_byte()?.is_none()
                };
                if at_end {
                    self.top_struct_mut().exp_i += 1;
                    return Ok(false);
                }
                let (index, length) = {
                    let src = pick_src(&mut self.frames, &mut self.input);
                    let index = src.read_varuint(false)?;
                    let length = src.read_varuint(false)?;
                    (index, length)
                };
                self.top_struct_mut().pending = Some((index, length));
            }
            let (index, length) = self.top_struct().pending.unwrap();
            if index == want {
                self.top_struct_mut().ready = true;
                return Ok(true);
            }
            if index < want {
                {
                    let src = pick_src(&mut self.frames, &mut self.input);
                    src.skip_exact(length)?;
                }
                let ctx = self.top_struct_mut();
                ctx.pending = None;
                ctx.records_read += 1;
                continue;
            }
            // The record belongs to a later expected field; the current one
            // is absent from the stream.
            self.top_struct_mut().exp_i += 1;
            return Ok(false);
        }
    }

    /// Plain-mode alignment over the embedded schema: skipping an embed-only
    /// field decodes it by type.
    fn next_struct_plain(&mut self) -> Result<bool> {
        enum Align {
            Ready,
            Absent,
            SkipEmbed,
        }
        loop {
            let step = {
                let ctx = self.top_struct();
                if !ctx.two_schema {
                    Align::Ready
                } else if ctx.emb_i >= ctx.emb.fields.len() {
                    Align::Absent
                } else {
                    let want = ctx.exp.fields[ctx.exp_i].index;
                    let have = ctx.emb.fields[ctx.emb_i].index;
                    if have == want {
                        Align::Ready
                    } else if have < want {
                        Align::SkipEmbed
                    } else {
                        Align::Absent
                    }
                }
            };
            match step {
                Align::Ready => {
                    self.top_struct_mut().ready = true;
                    return Ok(true);
                }
                Align::Absent => {
                    self.top_struct_mut().exp_i += 1;
                    return Ok(false);
                }
                Align::SkipEmbed => self.skip_embed_field()?,
            }
        }
    }

    /// Skips the embed field at the embed cursor (a field the expected
    /// schema does not declare) and advances the embed cursor only.
    fn skip_embed_field(&mut self) -> Result<()> {
        let (elem, desc, packed) = {
            let frame = self.top();
            let XBody::Struct(ctx) = &frame.body else { unreachable!() };
            let field = &ctx.emb.fields[ctx.emb_i];
            let target = deref_chain(self.modules.as_ref(), &field.elem)?;
            let packed = !self.comparable && target.kind() == Kind::Boolean;
            (
                field.elem.clone(),
                frame.descending ^ field.descending,
                packed,
            )
        };
        if packed {
            self.consume_struct_bool_bit()?;
        } else {
            let comparable = self.comparable;
            let compatibility = self.compatibility;
            let (src, modules) = self.src_and_modules();
            let env = SkipEnv {
                descending: desc,
                comparable,
                compatibility,
                modules,
            };
            skip_value(&elem, src, env)?;
        }
        self.top_struct_mut().emb_i += 1;
        Ok(())
    }

    /// Consumes and discards the value the last `next()` made available.
    fn skip_ready(&mut self) -> Result<()> {
        let compat_struct = self.compatibility
            && matches!(&self.top().body, XBody::Struct(_));
        if compat_struct {
            let length = self.top_struct().pending.map(|(_, len)| len);
            if let Some(length) = length {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.skip_exact(length)?;
            }
            return self.complete_element();
        }
        let (_, emb, desc) = self.current_target()?;
        let emb = emb.clone();
        let packed = emb.kind() == Kind::Boolean
            && !self.comparable
            && self.top().over.is_none()
            && match &self.top().body {
                XBody::Struct(_) => !self.compatibility,
                XBody::Array(ctx) => ctx.pack,
                _ => false,
            };
        if packed {
            match &self.top().body {
                XBody::Struct(_) => {
                    self.consume_struct_bool_bit()?;
                }
                XBody::Array(_) => {
                    self.consume_array_bool_bit()?;
                }
                _ => unreachable!(),
            }
        } else {
            let comparable = self.comparable;
            let compatibility = self.compatibility;
            let (src, modules) = self.src_and_modules();
            let env = SkipEnv {
                descending: desc,
                comparable,
                compatibility,
                modules,
            };
            skip_value(&emb, src, env)?;
        }
        self.complete_element()
    }

    /// Skips whatever remains of the embed stream for the current struct so
    /// the reader ends up positioned at end-of-struct.
    fn drain_struct_remainder(&mut self) -> Result<()> {
        if self.compatibility {
            loop {
                let (pending_len, remaining) = {
                    let ctx = self.top_struct();
                    let remaining = ctx
                        .records_total
                        .is_some_and(|total| ctx.records_read < total);
                    (ctx.pending.map(|(_, len)| len), remaining)
                };
                if pending_len.is_none() && !remaining {
                    return Ok(());
                }
                let length = match pending_len {
                    Some(len) => len,
                    None => {
                        let src = pick_src(&mut self.frames, &mut self.input);
                        if src.peek_byte()?.is_none() {
                            return Ok(());
                        }
                        let _index = src.read_varuint(false)?;
                        src.read_varuint(false)?
                    }
                };
                {
                    let src = pick_src(&mut self.frames, &mut self.input);
                    src.skip_exact(length)?;
                }
                let ctx = self.top_struct_mut();
                ctx.pending = None;
                ctx.records_read += 1;
            }
        }
        loop {
            let has_embed_left = {
                let ctx = self.top_struct();
                ctx.two_schema && ctx.emb_i < ctx.emb.fields.len()
            };
            if !has_embed_left {
                return Ok(());
            }
            self.skip_embed_field()?;
        }
    }

    /// Mirror of the writer's packing protocol: seven LSB-first value bits
    /// per byte, byte boundaries falling where the writer flushed (position
    /// seven, end of the consecutive boolean run, end of the struct).
    fn consume_struct_bool_bit(&mut self) -> Result<bool> {
        let (need_load, unload_after) = {
            let ctx = self.top_struct();
            let pos = if ctx.two_schema { ctx.emb_i } else { ctx.exp_i };
            let next_is_bool = match ctx.emb.fields.get(pos + 1) {
                Some(next) => {
                    deref_chain(self.modules.as_ref(), &next.elem)?.kind()
                        == Kind::Boolean
                }
                None => false,
            };
            (!ctx.bool_loaded, !next_is_bool)
        };
        if need_load {
            let byte = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_byte()?
            };
            let ctx = self.top_struct_mut();
            ctx.bool_buf = byte;
            ctx.bool_pos = 0;
            ctx.bool_loaded = true;
        }
        let ctx = self.top_struct_mut();
        let bit = (ctx.bool_buf >> ctx.bool_pos) & 1 == 1;
        ctx.bool_pos += 1;
        if ctx.bool_pos == 7 || unload_after {
            ctx.bool_loaded = false;
            ctx.bool_pos = 0;
        }
        Ok(bit)
    }

    fn consume_array_bool_bit(&mut self) -> Result<bool> {
        let need_load = match &self.top().body {
            XBody::Array(ctx) => !ctx.bool_loaded,
            _ => unreachable!(),
        };
        if need_load {
            let byte = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_byte()?
            };
            let XBody::Array(ctx) = &mut self.top_mut().body else {
                unreachable!()
            };
            ctx.bool_buf = byte;
            ctx.bool_pos = 0;
            ctx.bool_loaded = true;
        }
        let XBody::Array(ctx) = &mut self.top_mut().body else {
            unreachable!()
        };
        let bit = (ctx.bool_buf >> ctx.bool_pos) & 1 == 1;
        ctx.bool_pos += 1;
        if ctx.bool_pos == 7 || ctx.i + 1 >= ctx.len {
            ctx.bool_loaded = false;
            ctx.bool_pos = 0;
        }
        Ok(bit)
    }

    /// Advances the state machine after one element value was consumed.
    fn complete_element(&mut self) -> Result<()> {
        let compatibility = self.compatibility;
        let frame = self.top_mut();
        frame.over = None;
        match &mut frame.body {
            XBody::Root { pair } => *pair = None,
            XBody::Struct(ctx) => {
                ctx.ready = false;
                ctx.exp_i += 1;
                if compatibility {
                    ctx.pending = None;
                    ctx.records_read += 1;
                } else if ctx.two_schema {
                    ctx.emb_i += 1;
                } else {
                    ctx.emb_i = ctx.exp_i;
                }
            }
            XBody::Array(ctx) => {
                ctx.ready = false;
                ctx.i += 1;
            }
            XBody::Map(ctx) => {
                if ctx.ready {
                    ctx.ready = false;
                    ctx.on_value = true;
                } else {
                    ctx.on_value = false;
                    ctx.i += 1;
                }
            }
        }
        Ok(())
    }

    fn read_scalar<T>(
        &mut self,
        kind: Kind,
        decode: impl FnOnce(&mut dyn BufRead, bool) -> Result<T>,
    ) -> Result<T> {
        self.guard()?;
        let result = self.read_scalar_inner(kind, decode);
        self.stickify(result)
    }

    fn read_scalar_inner<T>(
        &mut self,
        kind: Kind,
        decode: impl FnOnce(&mut dyn BufRead, bool) -> Result<T>,
    ) -> Result<T> {
        self.ensure_value_available()?;
        let desc = self.expect_kind(kind)?;
        let value = {
            let src = pick_src(&mut self.frames, &mut self.input);
            decode(src, desc)?
        };
        self.complete_element()?;
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.read_scalar(Kind::Uint8, |src, desc| src.read_be_u8(desc))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_scalar(Kind::Uint16, |src, desc| src.read_be_u16(desc))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_scalar(Kind::Uint32, |src, desc| src.read_be_u32(desc))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_scalar(Kind::Uint64, |src, desc| src.read_be_u64(desc))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.read_scalar(Kind::Int8, |src, desc| src.read_be_i8(desc))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.read_scalar(Kind::Int16, |src, desc| src.read_be_i16(desc))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_scalar(Kind::Int32, |src, desc| src.read_be_i32(desc))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_scalar(Kind::Int64, |src, desc| src.read_be_i64(desc))
    }

    pub fn read_uint(&mut self) -> Result<u64> {
        self.read_scalar(Kind::Uint, |src, desc| src.read_varuint(desc))
    }

    pub fn read_int(&mut self) -> Result<i64> {
        self.read_scalar(Kind::Int, |src, desc| src.read_varint(desc))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_scalar(Kind::Float32, |src, desc| src.read_f32(desc))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_scalar(Kind::Float64, |src, desc| src.read_f64(desc))
    }

    pub fn read_timestamp(&mut self) -> Result<DateTime<Utc>> {
        self.read_scalar(Kind::Timestamp, |src, desc| src.read_timestamp(desc))
    }

    pub fn read_duration(&mut self) -> Result<TimeDelta> {
        self.read_scalar(Kind::Duration, |src, desc| src.read_duration(desc))
    }

    pub fn read_datetime(&mut self) -> Result<DateTime<FixedOffset>> {
        self.guard()?;
        let result = (|| {
            self.ensure_value_available()?;
            let (_, emb, desc) = self.current_target()?;
            let Type::DateTime(dt) = emb else {
                return Err(Error::new(
                    ErrorCode::MismatchingValueType,
                    "read does not match the element type",
                )
                .with_detail("embedded", format!("{:?}", emb.kind()))
                .with_detail("read", format!("{:?}", Kind::DateTime)));
            };
            let fixed = dt.zone.as_ref().map(|z| z.offset_seconds);
            let value = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_datetime(desc, fixed)?
            };
            self.complete_element()?;
            Ok(value)
        })();
        self.stickify(result)
    }

    pub fn read_string(&mut self) -> Result<String> {
        self.guard()?;
        let result = (|| {
            self.ensure_value_available()?;
            let desc = self.expect_kind(Kind::String)?;
            let comparable = self.comparable;
            let raw = {
                let src = pick_src(&mut self.frames, &mut self.input);
                if comparable {
                    let mut raw = src.read_escaped(EscapeTable::bytes(desc))?;
                    if desc {
                        crate::wire::complement(&mut raw);
                    }
                    raw
                } else {
                    src.read_len_bytes(desc)?
                }
            };
            let value = String::from_utf8(raw).map_err(|err| {
                Error::new(
                    ErrorCode::DecodingBinaryValue,
                    "string is not valid UTF-8",
                )
                .with_source(err)
            })?;
            self.complete_element()?;
            Ok(value)
        })();
        self.stickify(result)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.guard()?;
        let result = (|| {
            self.ensure_value_available()?;
            let (_, emb, desc) = self.current_target()?;
            let Type::Bytes(bt) = emb else {
                return Err(Error::new(
                    ErrorCode::MismatchingValueType,
                    "read does not match the element type",
                )
                .with_detail("embedded", format!("{:?}", emb.kind()))
                .with_detail("read", format!("{:?}", Kind::Bytes)));
            };
            let fixed = bt.fixed_size;
            let comparable = self.comparable;
            let raw = {
                let src = pick_src(&mut self.frames, &mut self.input);
                if fixed > 0 {
                    let mut raw = vec![0u8; fixed as usize];
                    src.read_exact(&mut raw).map_err(Error::reading)?;
                    if desc {
                        if comparable {
                            crate::wire::complement(&mut raw);
                        } else {
                            raw.reverse();
                        }
                    }
                    raw
                } else if comparable {
                    let mut raw = src.read_escaped(EscapeTable::bytes(desc))?;
                    if desc {
                        crate::wire::complement(&mut raw);
                    }
                    raw
                } else {
                    src.read_len_bytes(desc)?
                }
            };
            self.complete_element()?;
            Ok(raw)
        })();
        self.stickify(result)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.guard()?;
        let result = self.read_bool_inner();
        self.stickify(result)
    }

    fn read_bool_inner(&mut self) -> Result<bool> {
        self.ensure_value_available()?;
        let desc = self.expect_kind(Kind::Boolean)?;
        enum Packing {
            Struct,
            Array,
            Plain,
        }
        let packing = {
            let frame = self.top();
            if frame.over.is_some() || self.comparable {
                Packing::Plain
            } else {
                match &frame.body {
                    XBody::Struct(_) if !self.compatibility => Packing::Struct,
                    XBody::Array(ctx) if ctx.pack => Packing::Array,
                    _ => Packing::Plain,
                }
            }
        };
        let value = match packing {
            Packing::Struct => self.consume_struct_bool_bit()? ^ desc,
            Packing::Array => self.consume_array_bool_bit()? ^ desc,
            Packing::Plain => {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_bool_byte(desc)?
            }
        };
        self.complete_element()?;
        Ok(value)
    }

    /// Reads the nullable flag. On null the element is complete and true is
    /// returned; on not-null the current element narrows to the nullable
    /// payload and the value is read next.
    pub fn is_null(&mut self) -> Result<bool> {
        self.guard()?;
        let result = (|| {
            self.ensure_value_available()?;
            let (exp, emb, desc) = self.current_target()?;
            let (Type::Nullable(exp_inner), Type::Nullable(emb_inner)) =
                (exp, emb)
            else {
                return Err(Error::new(
                    ErrorCode::MismatchingValueType,
                    "read does not match the element type",
                )
                .with_detail("expected", format!("{:?}", exp.kind()))
                .with_detail("embedded", format!("{:?}", emb.kind()))
                .with_detail("read", format!("{:?}", Kind::Nullable)));
            };
            let pair = ((**exp_inner).clone(), (**emb_inner).clone());
            let is_null = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_nullable_flag(desc)?
            };
            if is_null {
                self.complete_element()?;
                return Ok(true);
            }
            self.top_mut().over = Some(pair);
            Ok(false)
        })();
        self.stickify(result)
    }

    /// Reads and validates an enum element index.
    pub fn read_enum_index(&mut self) -> Result<u64> {
        self.guard()?;
        let result = (|| {
            self.ensure_value_available()?;
            let (_, emb, desc) = self.current_target()?;
            let Type::Enum(et) = emb else {
                return Err(Error::new(
                    ErrorCode::MismatchingValueType,
                    "read does not match the element type",
                )
                .with_detail("embedded", format!("{:?}", emb.kind()))
                .with_detail("read", format!("{:?}", Kind::Enum)));
            };
            let et = et.clone();
            let index = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_index(et.value_bytes, desc)?
            };
            if et.element_by_index(index).is_none() {
                return Err(Error::new(
                    ErrorCode::InvalidValue,
                    "index is not an enum element",
                )
                .with_detail("index", index));
            }
            self.complete_element()?;
            Ok(index)
        })();
        self.stickify(result)
    }

    /// Reads a oneof element index and narrows the current element to the
    /// chosen payload type.
    pub fn read_oneof_index(&mut self) -> Result<u64> {
        self.guard()?;
        let result = (|| {
            self.ensure_value_available()?;
            let (exp, emb, desc) = self.current_target()?;
            let (Type::OneOf(exp_ot), Type::OneOf(emb_ot)) = (exp, emb) else {
                return Err(Error::new(
                    ErrorCode::MismatchingValueType,
                    "read does not match the element type",
                )
                .with_detail("expected", format!("{:?}", exp.kind()))
                .with_detail("embedded", format!("{:?}", emb.kind()))
                .with_detail("read", format!("{:?}", Kind::OneOf)));
            };
            let exp_ot = exp_ot.clone();
            let emb_ot = emb_ot.clone();
            let index = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_index(emb_ot.index_bytes, desc)?
            };
            let emb_elem = emb_ot.element_by_index(index).ok_or_else(|| {
                Error::new(
                    ErrorCode::InvalidValue,
                    "index is not a oneof element",
                )
                .with_detail("index", index)
            })?;
            let exp_elem = exp_ot.element_by_index(index).unwrap_or(emb_elem);
            self.top_mut().over =
                Some((exp_elem.elem.clone(), emb_elem.elem.clone()));
            Ok(index)
        })();
        self.stickify(result)
    }

    /// Reads a self-described element: the any-header byte, an optional
    /// module table, the type tree; the value of that type is read next.
    pub fn read_any_type(&mut self) -> Result<Type> {
        self.guard()?;
        let result = (|| {
            self.ensure_value_available()?;
            self.expect_kind(Kind::Any)?;
            let block = {
                let src = pick_src(&mut self.frames, &mut self.input);
                let header = src.read_byte()?;
                if header & !HEADER_MODULES != 0 {
                    return Err(Error::new(
                        ErrorCode::MalformedBinary,
                        "reserved bits set in self-described header",
                    )
                    .with_detail("header", format!("{header:#04x}")));
                }
                if header & HEADER_MODULES != 0 {
                    Some(Modules::read_block(src)?)
                } else {
                    None
                }
            };
            if let Some(block) = block {
                match self.modules.as_mut() {
                    Some(table) => table.merge(&block)?,
                    None => self.modules = Some(block),
                }
                let table = self.modules.as_mut().unwrap();
                table.verify()?;
                table.ensure_resolved()?;
            }
            let mut ty = {
                let src = pick_src(&mut self.frames, &mut self.input);
                Type::read(src)?
            };
            ty.validate()?;
            if ty.needs_modules() {
                let table = self.modules.as_ref().ok_or_else(|| {
                    Error::new(
                        ErrorCode::ModulesUndefined,
                        "self-described type needs a module table",
                    )
                })?;
                table.resolve_type(&mut ty)?;
            }
            self.top_mut().over = Some((ty.clone(), ty.clone()));
            Ok(ty)
        })();
        self.stickify(result)
    }

    /// Skips the current element using its kind's skip function.
    pub fn skip(&mut self) -> Result<()> {
        self.guard()?;
        let result = (|| {
            self.ensure_value_available()?;
            let at_root = matches!(&self.top().body, XBody::Root { .. });
            if at_root {
                let (_, emb, desc) = self.current_target()?;
                let emb = emb.clone();
                let comparable = self.comparable;
                let compatibility = self.compatibility;
                let (src, modules) = self.src_and_modules();
                let env = SkipEnv {
                    descending: desc,
                    comparable,
                    compatibility,
                    modules,
                };
                skip_value(&emb, src, env)?;
                self.complete_element()
            } else {
                self.skip_ready()
            }
        })();
        self.stickify(result)
    }

    pub fn read_struct(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.guard()?;
        let result = self.read_struct_inner(f);
        self.stickify(result)
    }

    fn read_struct_inner(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.ensure_value_available()?;
        let (exp, emb, desc) = self.current_target()?;
        let (Type::Struct(exp_st), Type::Struct(emb_st)) = (exp, emb) else {
            return Err(Error::new(
                ErrorCode::MismatchingValueType,
                "read does not match the element type",
            )
            .with_detail("expected", format!("{:?}", exp.kind()))
            .with_detail("embedded", format!("{:?}", emb.kind()))
            .with_detail("read", format!("{:?}", Kind::Struct)));
        };
        let exp_st = exp_st.clone();
        let emb_st = emb_st.clone();
        let two_schema = exp_st != emb_st;
        let records_total = if self.compatibility {
            if self.embed.is_some() {
                Some(emb_st.fields.len() as u64)
            } else if self.frames.len() == 1 {
                if exp_st.fields.is_empty() {
                    Some(0)
                } else {
                    self.root_records_header.map(|max| max + 1)
                }
            } else {
                None
            }
        } else {
            None
        };
        self.frames.push(XFrame {
            body: XBody::Struct(StructCtx {
                exp: exp_st,
                emb: emb_st,
                two_schema,
                exp_i: 0,
                emb_i: 0,
                records_total,
                records_read: 0,
                pending: None,
                bool_buf: 0,
                bool_pos: 0,
                bool_loaded: false,
                ready: false,
                base_done: false,
            }),
            descending: desc,
            over: None,
            body_buf: None,
        });
        f(self)?;
        loop {
            if self.top_struct().base_done {
                break;
            }
            self.next_struct()?;
        }
        self.frames.pop();
        self.complete_element()
    }

    pub fn read_array(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.guard()?;
        let result = self.read_array_inner(f);
        self.stickify(result)
    }

    fn read_array_inner(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.ensure_value_available()?;
        let (exp, emb, desc) = self.current_target()?;
        let (Type::Array(exp_at), Type::Array(emb_at)) = (exp, emb) else {
            return Err(Error::new(
                ErrorCode::MismatchingValueType,
                "read does not match the element type",
            )
            .with_detail("expected", format!("{:?}", exp.kind()))
            .with_detail("embedded", format!("{:?}", emb.kind()))
            .with_detail("read", format!("{:?}", Kind::Array)));
        };
        if exp_at != emb_at {
            return Err(Error::new(
                ErrorCode::MismatchingValueType,
                "expected and embedded array types diverge",
            ));
        }
        let at = (**emb_at).clone();
        let elem_kind = deref_chain(self.modules.as_ref(), &at.elem)?.kind();
        let pack = elem_kind == Kind::Boolean && !self.comparable;
        let fixed = u64::from(at.fixed_size);
        let (len, body_buf) = if fixed > 0 {
            (fixed, None)
        } else if self.comparable {
            let body = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_escaped(EscapeTable::array(desc))?
            };
            let env = SkipEnv {
                descending: desc,
                comparable: self.comparable,
                compatibility: self.compatibility,
                modules: self.modules.as_ref(),
            };
            let count =
                count_elements(&body, |cur| skip_value(&at.elem, cur, env))?;
            (count, Some(Cursor::new(body)))
        } else {
            let len = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_varuint(desc)?
            };
            (len, None)
        };
        self.frames.push(XFrame {
            body: XBody::Array(ArrayCtx {
                elem: at.elem,
                len,
                i: 0,
                pack,
                bool_buf: 0,
                bool_pos: 0,
                bool_loaded: false,
                ready: false,
            }),
            descending: desc,
            over: None,
            body_buf,
        });
        f(self)?;
        while self.next_inner()? {}
        self.finish_body_buf()?;
        self.frames.pop();
        self.complete_element()
    }

    pub fn read_map(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.guard()?;
        let result = self.read_map_inner(f);
        self.stickify(result)
    }

    fn read_map_inner(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.ensure_value_available()?;
        let (exp, emb, desc) = self.current_target()?;
        let (Type::Map(exp_mt), Type::Map(emb_mt)) = (exp, emb) else {
            return Err(Error::new(
                ErrorCode::MismatchingValueType,
                "read does not match the element type",
            )
            .with_detail("expected", format!("{:?}", exp.kind()))
            .with_detail("embedded", format!("{:?}", emb.kind()))
            .with_detail("read", format!("{:?}", Kind::Map)));
        };
        if exp_mt != emb_mt {
            return Err(Error::new(
                ErrorCode::MismatchingValueType,
                "expected and embedded map types diverge",
            ));
        }
        let mt = (**emb_mt).clone();
        let (len, body_buf) = if self.comparable {
            let body = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_escaped(EscapeTable::map(desc))?
            };
            let key_env = SkipEnv {
                descending: desc ^ mt.key.descending,
                comparable: self.comparable,
                compatibility: self.compatibility,
                modules: self.modules.as_ref(),
            };
            let value_env = SkipEnv {
                descending: desc ^ mt.value.descending,
                ..key_env
            };
            let count = count_elements(&body, |cur| {
                skip_value(&mt.key.elem, cur, key_env)?;
                skip_value(&mt.value.elem, cur, value_env)
            })?;
            (count, Some(Cursor::new(body)))
        } else {
            let len = {
                let src = pick_src(&mut self.frames, &mut self.input);
                src.read_varuint(desc)?
            };
            (len, None)
        };
        self.frames.push(XFrame {
            body: XBody::Map(MapCtx {
                mt,
                len,
                i: 0,
                on_value: false,
                ready: false,
            }),
            descending: desc,
            over: None,
            body_buf,
        });
        f(self)?;
        while self.next_inner()? {}
        self.finish_body_buf()?;
        self.frames.pop();
        self.complete_element()
    }

    /// A comparable composite's in-memory body must be exactly exhausted
    /// once every element was consumed.
    fn finish_body_buf(&self) -> Result<()> {
        let frame = self.top();
        if let Some(body) = &frame.body_buf {
            let len = body.get_ref().len() as u64;
            if body.position() != len {
                return Err(Error::new(
                    ErrorCode::MalformedBinary,
                    "composite body has trailing bytes",
                )
                .with_detail("trailing", len - body.position()));
            }
        }
        Ok(())
    }
}

fn count_elements(
    body: &[u8],
    mut skip_one: impl FnMut(&mut Cursor<&[u8]>) -> Result<()>,
) -> Result<u64> {
    let mut cursor = Cursor::new(body);
    let mut count = 0u64;
    while (cursor.position() as usize) < body.len() {
        skip_one(&mut cursor)?;
        count += 1;
    }
    Ok(count)
}

/// Kind-driven value skip: consumes exactly the bytes one value of `ty`
/// occupies under the given flags.
fn skip_value(ty: &Type, src: &mut dyn BufRead, env: SkipEnv<'_>) -> Result<()> {
    match ty {
        Type::Undefined => Ok(()),
        Type::Boolean => src.skip_exact(1),
        Type::Int => {
            let header = src.read_be_u8(env.descending)?;
            let size = if header & 0x80 != 0 {
                header & 0x7F
            } else {
                !header & 0x7F
            };
            if size > 8 {
                return Err(Error::new(
                    ErrorCode::SkippingBinaryValue,
                    "variable int size header out of range",
                )
                .with_detail("size", size));
            }
            src.skip_exact(u64::from(size))
        }
        Type::Uint => skip_varuint_value(src, env.descending),
        Type::Int8 | Type::Uint8 => src.skip_exact(1),
        Type::Int16 | Type::Uint16 => src.skip_exact(2),
        Type::Int32 | Type::Uint32 | Type::Float32 => src.skip_exact(4),
        Type::Int64 | Type::Uint64 | Type::Float64 | Type::Duration => {
            src.skip_exact(8)
        }
        Type::Timestamp => src.skip_exact(12),
        Type::String => {
            if env.comparable {
                src.skip_escaped(EscapeTable::bytes(env.descending))
            } else {
                let len = src.read_varuint(env.descending)?;
                src.skip_exact(len)
            }
        }
        Type::Bytes(bt) => {
            if bt.fixed_size > 0 {
                src.skip_exact(u64::from(bt.fixed_size))
            } else if env.comparable {
                src.skip_escaped(EscapeTable::bytes(env.descending))
            } else {
                let len = src.read_varuint(env.descending)?;
                src.skip_exact(len)
            }
        }
        Type::DateTime(_) => {
            let version = src.read_byte()?;
            match version {
                1 => src.skip_exact(14),
                2 => src.skip_exact(15),
                _ => Err(Error::new(
                    ErrorCode::SkippingBinaryValue,
                    "unknown date-time version",
                )
                .with_detail("version", version)),
            }
        }
        Type::Nullable(inner) => {
            if src.read_nullable_flag(env.descending)? {
                Ok(())
            } else {
                skip_value(inner, src, env)
            }
        }
        Type::Enum(et) => {
            if et.value_bytes == 0 {
                skip_varuint_value(src, env.descending)
            } else {
                src.skip_exact(u64::from(et.value_bytes))
            }
        }
        Type::OneOf(ot) => {
            let index = src.read_index(ot.index_bytes, env.descending)?;
            let element = ot.element_by_index(index).ok_or_else(|| {
                Error::new(
                    ErrorCode::SkippingBinaryValue,
                    "index is not a oneof element",
                )
                .with_detail("index", index)
            })?;
            skip_value(&element.elem, src, env)
        }
        Type::Named(_) => {
            let target = deref_chain(env.modules, ty)?;
            skip_value(target, src, env)
        }
        Type::Struct(st) => {
            if env.compatibility {
                for _ in 0..st.fields.len() {
                    let _index = src.read_varuint(false)?;
                    let len = src.read_varuint(false)?;
                    src.skip_exact(len)?;
                }
                return Ok(());
            }
            let mut i = 0;
            while i < st.fields.len() {
                let field = &st.fields[i];
                let target = deref_chain(env.modules, &field.elem)?;
                if !env.comparable && target.kind() == Kind::Boolean {
                    let mut run = 1usize;
                    while i + run < st.fields.len() {
                        let next =
                            deref_chain(env.modules, &st.fields[i + run].elem)?;
                        if next.kind() != Kind::Boolean {
                            break;
                        }
                        run += 1;
                    }
                    src.skip_exact(run.div_ceil(7) as u64)?;
                    i += run;
                } else {
                    let field_env = SkipEnv {
                        descending: env.descending ^ field.descending,
                        ..env
                    };
                    skip_value(&field.elem, src, field_env)?;
                    i += 1;
                }
            }
            Ok(())
        }
        Type::Array(at) => {
            let fixed = u64::from(at.fixed_size);
            if fixed == 0 && env.comparable {
                return src.skip_escaped(EscapeTable::array(env.descending));
            }
            let len = if fixed > 0 {
                fixed
            } else {
                src.read_varuint(env.descending)?
            };
            let target = deref_chain(env.modules, &at.elem)?;
            if !env.comparable && target.kind() == Kind::Boolean {
                return src.skip_exact(len.div_ceil(7));
            }
            for _ in 0..len {
                skip_value(&at.elem, src, env)?;
            }
            Ok(())
        }
        Type::Map(mt) => {
            if env.comparable {
                return src.skip_escaped(EscapeTable::map(env.descending));
            }
            let len = src.read_varuint(env.descending)?;
            let key_env = SkipEnv {
                descending: env.descending ^ mt.key.descending,
                ..env
            };
            let value_env = SkipEnv {
                descending: env.descending ^ mt.value.descending,
                ..env
            };
            for _ in 0..len {
                skip_value(&mt.key.elem, src, key_env)?;
                skip_value(&mt.value.elem, src, value_env)?;
            }
            Ok(())
        }
        Type::Any => {
            let header = src.read_byte()?;
            if header & !HEADER_MODULES != 0 {
                return Err(Error::new(
                    ErrorCode::SkippingBinaryValue,
                    "reserved bits set in self-described header",
                )
                .with_detail("header", format!("{header:#04x}")));
            }
            let block = if header & HEADER_MODULES != 0 {
                let mut block = Modules::read_block(src)?;
                block.resolve()?;
                Some(block)
            } else {
                None
            };
            let ty = Type::read(src)?;
            let env = SkipEnv {
                modules: block.as_ref().or(env.modules),
                ..env
            };
            skip_value(&ty, src, env)
        }
    }
}

fn skip_varuint_value(src: &mut dyn BufRead, descending: bool) -> Result<()> {
    let size = src.read_be_u8(descending)?;
    if size > 8 {
        return Err(Error::new(
            ErrorCode::SkippingBinaryValue,
            "variable uint size header out of range",
        )
        .with_detail("size", size));
    }
    src.skip_exact(u64::from(size))
}
