//! Owned, queryable view of one ELF image.
//!
//! Parsing is delegated to goblin; the engine keeps an owned extraction so
//! images can outlive the parse borrow and be materialised from tracee
//! memory (vDSO) as well as from disk.

use crate::address::{AddressRange, FileAddress};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SymbolKind {
    Function,
    Object,
    Tls,
    Other(u8),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
    Other(u8),
}

/// One symbol-table record, with its derived type/binding and demangled
/// name when the demangler recognises the mangling scheme.
#[derive(Clone, Debug)]
pub struct ElfSymbol {
    pub name: String,
    pub demangled: Option<String>,
    pub kind: SymbolKind,
    pub binding: SymbolBinding,
    pub visibility: u8,
    pub section_index: usize,
    pub value: u64,
    pub size: u64,
}

impl ElfSymbol {
    /// [low, high) file-space range, or None for unplaced names (zero
    /// value, unset name, TLS symbols).
    pub fn address_range(&self) -> Option<AddressRange> {
        if self.value == 0 || self.name.is_empty() || self.kind == SymbolKind::Tls {
            return None;
        }
        Some(AddressRange::new(
            FileAddress::new(self.value),
            FileAddress::new(self.value + self.size.max(1)),
        ))
    }

    pub fn matches_name(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        match &self.demangled {
            Some(d) => d == name || base_name(d) == name,
            None => false,
        }
    }
}

/// `foo::bar::baz` or `ns::f(...)` reduced to its trailing identifier.
fn base_name(demangled: &str) -> &str {
    let no_args = demangled.split('(').next().unwrap_or(demangled);
    no_args.rsplit("::").next().unwrap_or(no_args).trim()
}

#[derive(Clone, Debug)]
pub struct ElfSection {
    pub name: String,
    pub sh_type: u32,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

/// Parsed image: entry point, sections, merged symbol tables, and the
/// `.dynamic` slot the rendezvous protocol reads.
pub struct ElfImage {
    path: Option<PathBuf>,
    bytes: Vec<u8>,
    entry_point: FileAddress,
    is_pie: bool,
    sections: Vec<ElfSection>,
    section_index_by_name: HashMap<String, usize>,
    symbols: Vec<ElfSymbol>,
    /// File-space address of the DT_DEBUG value slot inside `.dynamic`,
    /// where the dynamic linker publishes the `r_debug` pointer.
    debug_slot: Option<FileAddress>,
}

impl ElfImage {
    pub fn from_file(path: &Path) -> Result<ElfImage> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::io(format!("read ELF image {:?}", path), e))?;
        ElfImage::from_bytes(bytes, Some(path.to_path_buf()))
    }

    pub fn from_bytes(bytes: Vec<u8>, path: Option<PathBuf>) -> Result<ElfImage> {
        let elf = goblin::elf::Elf::parse(&bytes)?;

        let mut sections = Vec::with_capacity(elf.section_headers.len());
        let mut section_index_by_name = HashMap::new();
        for sh in &elf.section_headers {
            let name = elf
                .shdr_strtab
                .get(sh.sh_name)
                .and_then(|r| r.ok())
                .unwrap_or("")
                .to_string();
            section_index_by_name.insert(name.clone(), sections.len());
            sections.push(ElfSection {
                name,
                sh_type: sh.sh_type,
                addr: sh.sh_addr,
                offset: sh.sh_offset,
                size: sh.sh_size,
            });
        }

        let mut symbols = Vec::new();
        collect_symbols(&mut symbols, &elf.syms, &elf.strtab);
        collect_symbols(&mut symbols, &elf.dynsyms, &elf.dynstrtab);

        let debug_slot = elf.dynamic.as_ref().and_then(|dynamic| {
            let dyn_addr = sections
                .iter()
                .find(|s| s.name == ".dynamic")
                .map(|s| s.addr)?;
            dynamic
                .dyns
                .iter()
                .position(|d| d.d_tag == goblin::elf::dynamic::DT_DEBUG)
                .map(|idx| FileAddress::new(dyn_addr + idx as u64 * 16 + 8))
        });

        let entry_point = FileAddress::new(elf.header.e_entry);
        let is_pie = elf.header.e_type == goblin::elf::header::ET_DYN;
        drop(elf);

        Ok(ElfImage {
            path,
            entry_point,
            is_pie,
            sections,
            section_index_by_name,
            symbols,
            debug_slot,
            bytes,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entry_point(&self) -> FileAddress {
        self.entry_point
    }

    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    pub fn debug_slot(&self) -> Option<FileAddress> {
        self.debug_slot
    }

    pub fn section(&self, name: &str) -> Option<&ElfSection> {
        self.section_index_by_name
            .get(name)
            .map(|&i| &self.sections[i])
    }

    pub fn sections(&self) -> &[ElfSection] {
        &self.sections
    }

    pub fn section_data(&self, name: &str) -> Option<&[u8]> {
        let section = self.section(name)?;
        if section.sh_type == goblin::elf::section_header::SHT_NOBITS {
            return None;
        }
        let start = section.offset as usize;
        let end = start.checked_add(section.size as usize)?;
        self.bytes.get(start..end)
    }

    pub fn symbols(&self) -> &[ElfSymbol] {
        &self.symbols
    }

    pub fn symbols_named(&self, name: &str) -> Vec<&ElfSymbol> {
        self.symbols
            .iter()
            .filter(|sym| sym.matches_name(name))
            .collect()
    }

    /// Innermost placed symbol whose range contains `addr`.
    pub fn symbol_containing(&self, addr: FileAddress) -> Option<&ElfSymbol> {
        self.symbols
            .iter()
            .filter_map(|sym| sym.address_range().map(|r| (sym, r)))
            .filter(|(_, r)| r.contains(addr))
            .min_by_key(|(_, r)| r.len())
            .map(|(sym, _)| sym)
    }

    pub fn function_symbols(&self) -> impl Iterator<Item = &ElfSymbol> {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Function)
    }

    /// File-space span [low, high) covered by allocated sections.
    pub fn allocated_span(&self) -> Option<(u64, u64)> {
        let mut low = u64::MAX;
        let mut high = 0u64;
        for section in &self.sections {
            if section.addr == 0 {
                continue;
            }
            low = low.min(section.addr);
            high = high.max(section.addr + section.size);
        }
        if low < high {
            Some((low, high))
        } else {
            None
        }
    }
}

impl fmt::Debug for ElfImage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ElfImage")
            .field("path", &self.path)
            .field("entry_point", &self.entry_point)
            .field("sections", &self.sections.len())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

fn collect_symbols(
    out: &mut Vec<ElfSymbol>,
    table: &goblin::elf::sym::Symtab,
    names: &goblin::strtab::Strtab,
) {
    for sym in table.iter() {
        let name = names
            .get(sym.st_name)
            .and_then(|r| r.ok())
            .unwrap_or("")
            .to_string();
        if name.is_empty() && sym.st_value == 0 {
            continue;
        }
        let demangled = demangle(&name);
        let kind = match sym.st_type() {
            goblin::elf::sym::STT_FUNC => SymbolKind::Function,
            goblin::elf::sym::STT_OBJECT => SymbolKind::Object,
            goblin::elf::sym::STT_TLS => SymbolKind::Tls,
            other => SymbolKind::Other(other),
        };
        let binding = match sym.st_bind() {
            goblin::elf::sym::STB_LOCAL => SymbolBinding::Local,
            goblin::elf::sym::STB_GLOBAL => SymbolBinding::Global,
            goblin::elf::sym::STB_WEAK => SymbolBinding::Weak,
            other => SymbolBinding::Other(other),
        };
        out.push(ElfSymbol {
            name,
            demangled,
            kind,
            binding,
            visibility: sym.st_other & 0x3,
            section_index: sym.st_shndx,
            value: sym.st_value,
            size: sym.st_size,
        });
    }
}

fn demangle(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    rustc_demangle::try_demangle(name)
        .ok()
        .map(|d| format!("{:#}", d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unplaced_symbols_have_no_range() {
        let sym = ElfSymbol {
            name: "tls_thing".into(),
            demangled: None,
            kind: SymbolKind::Tls,
            binding: SymbolBinding::Global,
            visibility: 0,
            section_index: 1,
            value: 0x1000,
            size: 8,
        };
        assert!(sym.address_range().is_none());

        let sym = ElfSymbol {
            name: String::new(),
            demangled: None,
            kind: SymbolKind::Function,
            binding: SymbolBinding::Local,
            visibility: 0,
            section_index: 1,
            value: 0x1000,
            size: 8,
        };
        assert!(sym.address_range().is_none());
    }

    #[test]
    fn zero_sized_functions_still_get_a_slot() {
        let sym = ElfSymbol {
            name: "stub".into(),
            demangled: None,
            kind: SymbolKind::Function,
            binding: SymbolBinding::Global,
            visibility: 0,
            section_index: 1,
            value: 0x2000,
            size: 0,
        };
        let range = sym.address_range().unwrap();
        assert!(range.contains(FileAddress::new(0x2000)));
        assert!(!range.contains(FileAddress::new(0x2001)));
    }

    #[test]
    fn demangled_base_names_match() {
        let sym = ElfSymbol {
            name: "_ZN3foo3barE".into(),
            demangled: Some("foo::bar".into()),
            kind: SymbolKind::Function,
            binding: SymbolBinding::Global,
            visibility: 0,
            section_index: 1,
            value: 0x2000,
            size: 4,
        };
        assert!(sym.matches_name("foo::bar"));
        assert!(sym.matches_name("bar"));
        assert!(!sym.matches_name("baz"));
    }

    #[test]
    fn parses_own_test_binary() {
        // The test runner itself is a handy real ELF.
        let image = ElfImage::from_file(Path::new("/proc/self/exe")).unwrap();
        assert!(image.section(".text").is_some());
        assert!(image.entry_point().as_u64() != 0);
    }
}
