use std::io::{Read, Write};

use serde::Serialize;

use crate::error::{Error, ErrorCode, Result};
use crate::ty::{read_name, write_name, NamedType, Type, TypeRef};
use crate::wire::{WireRead, WireWrite};

/// One named definition inside a module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Definition {
    pub name: String,
    pub ty: Type,
}

/// Ordered list of definitions under one module name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Module {
    pub name: String,
    pub defs: Vec<Definition>,
}

/// Named type registry spanning multiple modules. Resolution binds every
/// reachable `Named` reference to a table index and caches a checksum (the
/// sum of bound-reference counts) so staleness is detectable after any
/// mutation of the table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Modules {
    modules: Vec<Module>,
    resolved: bool,
    checksum: u64,
}

impl Modules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Index of the module with this name, creating it when absent.
    pub fn insert_module(&mut self, name: &str) -> usize {
        if let Some(pos) = self.modules.iter().position(|m| m.name == name) {
            return pos;
        }
        self.resolved = false;
        self.modules.push(Module { name: name.to_owned(), defs: Vec::new() });
        self.modules.len() - 1
    }

    /// Appends a definition. A duplicate `(module, name)` pair fails unless
    /// `if_not_exists` is set, in which case the existing definition wins.
    pub fn define(
        &mut self,
        module: &str,
        name: &str,
        ty: Type,
        if_not_exists: bool,
    ) -> Result<()> {
        ty.validate()?;
        let pos = self.insert_module(module);
        if self.modules[pos].defs.iter().any(|d| d.name == name) {
            if if_not_exists {
                return Ok(());
            }
            return Err(Error::new(
                ErrorCode::TypeAlreadyMapped,
                "definition already mapped",
            )
            .with_detail("module", module)
            .with_detail("name", name));
        }
        let mut ty = ty;
        ty.clear_resolution();
        self.modules[pos]
            .defs
            .push(Definition { name: name.to_owned(), ty });
        self.resolved = false;
        Ok(())
    }

    pub fn find(&self, module: &str, name: &str) -> Option<TypeRef> {
        let (mi, m) = self
            .modules
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == module)?;
        let di = m.defs.iter().position(|d| d.name == name)?;
        Some(TypeRef { module: mi as u32, def: di as u32 })
    }

    pub fn get(&self, r: TypeRef) -> Option<&Type> {
        self.modules
            .get(r.module as usize)?
            .defs
            .get(r.def as usize)
            .map(|d| &d.ty)
    }

    /// Follows a named reference to its definition, preferring the bound
    /// index and falling back to a name lookup.
    pub(crate) fn deref<'a>(&'a self, named: &NamedType) -> Result<&'a Type> {
        if let Some(ty) = named.resolved.and_then(|r| self.get(r)) {
            return Ok(ty);
        }
        self.find(&named.module, &named.name)
            .and_then(|r| self.get(r))
            .ok_or_else(|| {
                Error::new(ErrorCode::TypeNotMapped, "named type is not mapped")
                    .with_detail("module", &named.module)
                    .with_detail("name", &named.name)
            })
    }

    /// Scans every module for duplicated definition names.
    pub fn find_duplicates(&self) -> Result<()> {
        for module in &self.modules {
            for (pos, def) in module.defs.iter().enumerate() {
                if module.defs[..pos].iter().any(|d| d.name == def.name) {
                    return Err(Error::new(
                        ErrorCode::TypeAlreadyMapped,
                        "duplicate definition",
                    )
                    .with_detail("module", &module.name)
                    .with_detail("name", &def.name));
                }
            }
        }
        Ok(())
    }

    /// Rejects definitions that contain themselves by value. Every element
    /// edge (struct field, oneof element, array element, map key/value) is
    /// cycle-forming; a nullable edge breaks the cycle because the chain can
    /// terminate at runtime.
    pub fn detect_cycles(&self) -> Result<()> {
        for module in &self.modules {
            for def in &module.defs {
                let mut path =
                    vec![(module.name.as_str(), def.name.as_str())];
                self.cycle_walk(&def.ty, &mut path)?;
            }
        }
        Ok(())
    }

    fn cycle_walk<'a>(
        &'a self,
        ty: &'a Type,
        path: &mut Vec<(&'a str, &'a str)>,
    ) -> Result<()> {
        match ty {
            Type::Named(named) => {
                let key = (named.module.as_str(), named.name.as_str());
                if path.contains(&key) {
                    return Err(Error::new(
                        ErrorCode::CyclicDependency,
                        "named type contains itself by value",
                    )
                    .with_detail("module", &named.module)
                    .with_detail("name", &named.name));
                }
                let target = self.deref(named)?;
                path.push(key);
                self.cycle_walk(target, path)?;
                path.pop();
                Ok(())
            }
            Type::Array(p) => self.cycle_walk(&p.elem, path),
            Type::Map(p) => {
                self.cycle_walk(&p.key.elem, path)?;
                self.cycle_walk(&p.value.elem, path)
            }
            Type::Struct(p) => {
                for field in &p.fields {
                    self.cycle_walk(&field.elem, path)?;
                }
                Ok(())
            }
            Type::OneOf(p) => {
                for element in &p.elements {
                    self.cycle_walk(&element.elem, path)?;
                }
                Ok(())
            }
            Type::Nullable(_) => Ok(()),
            _ => Ok(()),
        }
    }

    pub fn verify(&self) -> Result<()> {
        self.find_duplicates()?;
        self.detect_cycles()
    }

    /// Binds every named reference whose target exists in any module and
    /// caches the freshness checksum. Idempotent; references without a
    /// target stay unbound and fail later at dereference time.
    pub fn resolve(&mut self) -> Result<()> {
        let names: Vec<(String, Vec<String>)> = self
            .modules
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    m.defs.iter().map(|d| d.name.clone()).collect(),
                )
            })
            .collect();
        let lookup = |module: &str, name: &str| -> Option<TypeRef> {
            let (mi, (_, defs)) = names
                .iter()
                .enumerate()
                .find(|(_, (m, _))| m == module)?;
            let di = defs.iter().position(|d| d == name)?;
            Some(TypeRef { module: mi as u32, def: di as u32 })
        };
        for module in &mut self.modules {
            for def in &mut module.defs {
                def.ty.visit_named_mut(&mut |named| {
                    named.resolved = lookup(&named.module, &named.name);
                });
            }
        }
        self.checksum = self.live_checksum();
        self.resolved = true;
        log::debug!(
            "resolved {} modules, checksum {}",
            self.modules.len(),
            self.checksum
        );
        Ok(())
    }

    fn live_checksum(&self) -> u64 {
        self.modules
            .iter()
            .flat_map(|m| m.defs.iter())
            .map(|d| d.ty.ref_count())
            .sum()
    }

    /// True only while the cached checksum still matches the live reference
    /// count, i.e. nothing was redefined since the last resolution.
    pub fn is_resolved(&self) -> bool {
        self.resolved && self.checksum == self.live_checksum()
    }

    pub(crate) fn ensure_resolved(&mut self) -> Result<()> {
        if self.is_resolved() {
            return Ok(());
        }
        self.resolve()
    }

    /// Binds the named references of a caller-owned type against this table.
    /// Unlike [`Modules::resolve`], a missing target is an error because the
    /// type is about to drive a composer or extractor.
    pub(crate) fn resolve_type(&self, ty: &mut Type) -> Result<()> {
        let mut missing: Option<(String, String)> = None;
        ty.visit_named_mut(&mut |named| {
            match self.find(&named.module, &named.name) {
                Some(r) => named.resolved = Some(r),
                None => {
                    if missing.is_none() {
                        missing =
                            Some((named.module.clone(), named.name.clone()));
                    }
                }
            }
        });
        if let Some((module, name)) = missing {
            return Err(Error::new(
                ErrorCode::TypeNotMapped,
                "named type is not mapped",
            )
            .with_detail("module", module)
            .with_detail("name", name));
        }
        Ok(())
    }

    /// Unions `other` into this table module-by-module and name-by-name.
    /// Existing definitions win; copied definitions own their trees
    /// independently, so their bindings are cleared and the destination is
    /// marked stale.
    pub fn merge(&mut self, other: &Modules) -> Result<()> {
        for om in &other.modules {
            let pos = self.insert_module(&om.name);
            for od in &om.defs {
                if self.modules[pos].defs.iter().any(|d| d.name == od.name) {
                    continue;
                }
                let mut ty = od.ty.clone();
                ty.clear_resolution();
                log::trace!("merged definition {}.{}", om.name, od.name);
                self.modules[pos]
                    .defs
                    .push(Definition { name: od.name.clone(), ty });
            }
        }
        self.resolved = false;
        Ok(())
    }

    /// Module table block as embedded in a stream header: module count, then
    /// per module its name and definitions.
    pub(crate) fn read_block(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        let count = input.read_varuint(false)?;
        let mut modules = Vec::new();
        for _ in 0..count {
            let name = read_name(input)?;
            let def_count = input.read_varuint(false)?;
            let mut defs = Vec::new();
            for _ in 0..def_count {
                let def_name = read_name(input)?;
                let ty = Type::read(input)?;
                defs.push(Definition { name: def_name, ty });
            }
            modules.push(Module { name, defs });
        }
        Ok(Self { modules, resolved: false, checksum: 0 })
    }

    pub(crate) fn write_block(
        &self,
        out: &mut (impl Write + ?Sized),
    ) -> Result<()> {
        out.write_varuint(self.modules.len() as u64, false)?;
        for module in &self.modules {
            write_name(out, &module.name)?;
            out.write_varuint(module.defs.len() as u64, false)?;
            for def in &module.defs {
                write_name(out, &def.name)?;
                def.ty.write(out)?;
            }
        }
        Ok(())
    }
}

/// Follows a chain of named references down to a concrete type. A missing
/// table is `ModulesUndefined`; a missing target is `TypeNotMapped`.
pub(crate) fn deref_chain<'a>(
    modules: Option<&'a Modules>,
    mut ty: &'a Type,
) -> Result<&'a Type> {
    let mut depth = 0u32;
    while let Type::Named(named) = ty {
        let table = modules.ok_or_else(|| {
            Error::new(
                ErrorCode::ModulesUndefined,
                "named type requires a module table",
            )
            .with_detail("module", &named.module)
            .with_detail("name", &named.name)
        })?;
        ty = table.deref(named)?;
        depth += 1;
        if depth > 64 {
            return Err(Error::new(
                ErrorCode::CyclicDependency,
                "named reference chain too deep",
            )
            .with_detail("module", &named.module)
            .with_detail("name", &named.name));
        }
    }
    Ok(ty)
}
