use std::io::{Read, Write};

use serde::Serialize;

use crate::error::Result;
use crate::ty::{read_name, skip_len_bytes, write_name};

/// Index of a definition inside a module table. Named references resolve to
/// indices rather than owning pointers so that reference graphs with
/// nullable-broken cycles stay representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypeRef {
    pub module: u32,
    pub def: u32,
}

/// Reference to a definition in another (or the same) module. `resolved` is
/// never serialized; it is rebuilt by module resolution.
#[derive(Debug, Clone, Serialize)]
pub struct NamedType {
    pub module: String,
    pub name: String,
    pub resolved: Option<TypeRef>,
}

/// Equality is by reference identity (module and name); the resolution state
/// is transient and does not participate.
impl PartialEq for NamedType {
    fn eq(&self, other: &Self) -> bool {
        self.module == other.module && self.name == other.name
    }
}

impl NamedType {
    pub(crate) fn read(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        let module = read_name(input)?;
        let name = read_name(input)?;
        Ok(Self { module, name, resolved: None })
    }

    pub(crate) fn write(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        write_name(out, &self.module)?;
        write_name(out, &self.name)
    }

    pub(crate) fn skip(input: &mut (impl Read + ?Sized)) -> Result<()> {
        skip_len_bytes(input)?;
        skip_len_bytes(input)
    }
}
