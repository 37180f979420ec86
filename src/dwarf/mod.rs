//! DWARF consumption layer: a flattened DIE arena per compile unit,
//! materialised line tables, and CFI unwind rules.
//!
//! Cyclic structures in the debug info (unit ↔ DIE ↔ referenced DIE) are
//! broken with the arena-and-index scheme: the loader owns every node and
//! hands out `DieRef` handles (unit index + DIE index) instead of
//! ownership edges.

mod load;
mod unwind;

pub use unwind::{
    evaluate_unwind_expression, CfaRule, ExpressionOutcome, RegisterRule, UnwindRules,
};

use crate::address::{AddressRanges, FileAddress};
use crate::error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type Reader = gimli::EndianRcSlice<gimli::RunTimeEndian>;

/// Handle to one DIE in the arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DieRef {
    pub unit: usize,
    pub die: usize,
}

/// Handle to one row of a unit's line table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LineEntryRef {
    pub unit: usize,
    pub index: usize,
}

/// One materialised line-table row.
#[derive(Clone, Debug)]
pub struct LineEntry {
    pub address: FileAddress,
    pub file_index: usize,
    pub line: u64,
    pub column: u64,
    pub is_stmt: bool,
    pub end_sequence: bool,
}

/// The attributes the engine consumes, extracted once at load time.
#[derive(Clone, Debug, Default)]
pub struct Die {
    pub tag: Option<gimli::DwTag>,
    /// Offset within `.debug_info`; stable identity across lookups.
    pub global_offset: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub name: Option<String>,
    pub linkage_name: Option<String>,
    pub ranges: AddressRanges,
    pub decl_file: Option<u64>,
    pub decl_line: Option<u64>,
    pub call_file: Option<u64>,
    pub call_line: Option<u64>,
    /// Global `.debug_info` offset of DW_AT_type.
    pub type_ref: Option<usize>,
    /// Global offset of DW_AT_specification / DW_AT_abstract_origin.
    pub origin_ref: Option<usize>,
    pub byte_size: Option<u64>,
    pub bit_size: Option<u64>,
    pub data_bit_offset: Option<u64>,
    pub data_member_location: Option<u64>,
    pub encoding: Option<gimli::DwAte>,
    pub upper_bound: Option<u64>,
    pub count: Option<u64>,
    pub const_value: Option<i64>,
    /// DW_AT_location, when it is a plain expression block.
    pub location_expr: Option<Vec<u8>>,
    /// DW_AT_frame_base expression of a function.
    pub frame_base_expr: Option<Vec<u8>>,
    pub declaration: bool,
    pub external: bool,
    pub is_virtual: bool,
    /// DW_AT_defaulted: present and != DW_DEFAULTED_no means the member
    /// function was explicitly defaulted.
    pub defaulted: Option<u64>,
    pub artificial: bool,
}

impl Die {
    pub fn is_function_definition(&self) -> bool {
        self.tag == Some(gimli::DW_TAG_subprogram) && !self.declaration && !self.ranges.is_empty()
    }

    pub fn is_inlined_subroutine(&self) -> bool {
        self.tag == Some(gimli::DW_TAG_inlined_subroutine)
    }
}

pub struct CompileUnit {
    pub name: String,
    pub comp_dir: String,
    pub files: Vec<PathBuf>,
    /// Sorted by address.
    pub lines: Vec<LineEntry>,
    pub dies: Vec<Die>,
}

impl CompileUnit {
    pub fn file_path(&self, file_index: usize) -> Option<&Path> {
        self.files.get(file_index).map(|p| p.as_path())
    }
}

/// Everything the engine asks of one image's debug info.
pub struct DwarfData {
    units: Vec<CompileUnit>,
    die_by_global_offset: HashMap<usize, DieRef>,
    /// (low, high, die) for every function definition, sorted by low.
    function_index: Vec<(u64, u64, DieRef)>,
    functions_by_name: HashMap<String, Vec<DieRef>>,
    unwind: unwind::UnwindData,
}

impl DwarfData {
    /// Build from an ELF image. Produces a value even when `.debug_info`
    /// is absent, since `.eh_frame` alone still drives unwinding.
    pub fn load(image: &crate::elf::ElfImage) -> Result<DwarfData> {
        load::load(image)
    }

    pub fn units(&self) -> &[CompileUnit] {
        &self.units
    }

    pub fn die(&self, r: DieRef) -> &Die {
        &self.units[r.unit].dies[r.die]
    }

    pub fn unit_of(&self, r: DieRef) -> &CompileUnit {
        &self.units[r.unit]
    }

    pub fn die_at_global_offset(&self, offset: usize) -> Option<DieRef> {
        self.die_by_global_offset.get(&offset).copied()
    }

    /// Follow DW_AT_type.
    pub fn type_of(&self, r: DieRef) -> Option<DieRef> {
        self.die(r)
            .type_ref
            .and_then(|off| self.die_at_global_offset(off))
    }

    /// Follow DW_AT_specification / DW_AT_abstract_origin.
    pub fn origin_of(&self, r: DieRef) -> Option<DieRef> {
        self.die(r)
            .origin_ref
            .and_then(|off| self.die_at_global_offset(off))
    }

    pub fn parent_of(&self, r: DieRef) -> Option<DieRef> {
        self.die(r).parent.map(|die| DieRef { unit: r.unit, die })
    }

    pub fn children_of(&self, r: DieRef) -> impl Iterator<Item = DieRef> + '_ {
        self.die(r)
            .children
            .iter()
            .map(move |&die| DieRef { unit: r.unit, die })
    }

    /// A DIE's name, chasing specification/origin references the way C++
    /// out-of-line definitions require.
    pub fn die_name(&self, r: DieRef) -> Option<String> {
        let die = self.die(r);
        if let Some(name) = &die.name {
            return Some(name.clone());
        }
        self.origin_of(r).and_then(|origin| self.die_name(origin))
    }

    /// Innermost function definition DIE whose ranges contain `fa`.
    pub fn function_definition_containing(&self, fa: FileAddress) -> Option<DieRef> {
        let addr = fa.as_u64();
        self.function_index
            .iter()
            .filter(|&&(low, high, _)| low <= addr && addr < high)
            .filter(|&&(_, _, r)| self.die(r).ranges.contains(fa))
            .min_by_key(|&&(low, high, _)| high - low)
            .map(|&(_, _, r)| r)
    }

    /// Every function definition DIE matching `name` (plain, qualified or
    /// linkage name).
    pub fn function_definitions_named(&self, name: &str) -> Vec<DieRef> {
        self.functions_by_name
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Inlined-subroutine DIEs whose (origin) name matches. Inlined copies
    /// resolve to their entry point; they carry no prologue.
    pub fn inlined_subroutines_named(&self, name: &str) -> Vec<DieRef> {
        let mut out = Vec::new();
        for (unit_index, unit) in self.units.iter().enumerate() {
            for (die_index, die) in unit.dies.iter().enumerate() {
                if !die.is_inlined_subroutine() {
                    continue;
                }
                let r = DieRef {
                    unit: unit_index,
                    die: die_index,
                };
                if self.die_name(r).as_deref() == Some(name) {
                    out.push(r);
                }
            }
        }
        out
    }

    /// Last line entry at or before `fa` within its sequence.
    pub fn line_entry_at(&self, fa: FileAddress) -> Option<LineEntryRef> {
        for (unit_index, unit) in self.units.iter().enumerate() {
            let lines = &unit.lines;
            if lines.is_empty() {
                continue;
            }
            let pos = match lines.binary_search_by_key(&fa.as_u64(), |e| e.address.as_u64()) {
                Ok(found) => found,
                Err(0) => continue,
                Err(insert) => insert - 1,
            };
            let entry = &lines[pos];
            if entry.end_sequence {
                continue;
            }
            // The next row bounds this one's address range.
            if let Some(next) = lines.get(pos + 1) {
                if fa.as_u64() >= next.address.as_u64() && !next.end_sequence {
                    continue;
                }
                if fa.as_u64() >= next.address.as_u64() && next.end_sequence {
                    continue;
                }
                return Some(LineEntryRef {
                    unit: unit_index,
                    index: pos,
                });
            }
        }
        None
    }

    pub fn line_entry(&self, r: LineEntryRef) -> &LineEntry {
        &self.units[r.unit].lines[r.index]
    }

    /// The successor row inside the same sequence.
    pub fn next_line_entry(&self, r: LineEntryRef) -> Option<LineEntryRef> {
        let lines = &self.units[r.unit].lines;
        let next = lines.get(r.index + 1)?;
        if next.end_sequence {
            return None;
        }
        Some(LineEntryRef {
            unit: r.unit,
            index: r.index + 1,
        })
    }

    /// All rows matching (path suffix, line).
    pub fn line_entries_by_line(&self, path: &Path, line: u64) -> Vec<LineEntryRef> {
        let mut out = Vec::new();
        for (unit_index, unit) in self.units.iter().enumerate() {
            for (index, entry) in unit.lines.iter().enumerate() {
                if entry.end_sequence || entry.line != line {
                    continue;
                }
                let matches = unit
                    .file_path(entry.file_index)
                    .map(|p| p.ends_with(path) || p == path)
                    .unwrap_or(false);
                if matches {
                    out.push(LineEntryRef {
                        unit: unit_index,
                        index,
                    });
                }
            }
        }
        out
    }

    /// Source path and line for a DIE's call site (inlined frames).
    pub fn call_site(&self, r: DieRef) -> (Option<PathBuf>, Option<u64>) {
        let die = self.die(r);
        let path = die.call_file.and_then(|fi| {
            self.units[r.unit]
                .file_path(fi as usize)
                .map(|p| p.to_path_buf())
        });
        (path, die.call_line)
    }

    /// Source path for a line entry.
    pub fn line_entry_path(&self, r: LineEntryRef) -> Option<PathBuf> {
        let entry = self.line_entry(r);
        self.units[r.unit]
            .file_path(entry.file_index)
            .map(|p| p.to_path_buf())
    }

    /// CFI unwind rules covering `fa`, or None when no FDE covers it.
    pub fn compute_unwind_rules_at(&self, fa: FileAddress) -> Result<Option<UnwindRules>> {
        self.unwind.compute_rules_at(fa)
    }

    pub fn has_units(&self) -> bool {
        !self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: u64, line: u64, end: bool) -> LineEntry {
        LineEntry {
            address: FileAddress::new(addr),
            file_index: 1,
            line,
            column: 0,
            is_stmt: true,
            end_sequence: end,
        }
    }

    fn data_with_lines(lines: Vec<LineEntry>) -> DwarfData {
        DwarfData {
            units: vec![CompileUnit {
                name: "test.c".into(),
                comp_dir: "/src".into(),
                files: vec![PathBuf::from("/src/test.c"), PathBuf::from("/src/test.c")],
                lines,
                dies: Vec::new(),
            }],
            die_by_global_offset: HashMap::new(),
            function_index: Vec::new(),
            functions_by_name: HashMap::new(),
            unwind: unwind::UnwindData::empty(),
        }
    }

    #[test]
    fn line_lookup_snaps_to_preceding_row() {
        let data = data_with_lines(vec![
            entry(0x1000, 10, false),
            entry(0x1008, 11, false),
            entry(0x1010, 0, true),
        ]);
        let hit = data.line_entry_at(FileAddress::new(0x1004)).unwrap();
        assert_eq!(data.line_entry(hit).line, 10);
        let hit = data.line_entry_at(FileAddress::new(0x1008)).unwrap();
        assert_eq!(data.line_entry(hit).line, 11);
        assert!(data.line_entry_at(FileAddress::new(0x0fff)).is_none());
        assert!(data.line_entry_at(FileAddress::new(0x1010)).is_none());
    }

    #[test]
    fn next_line_entry_stops_at_sequence_end() {
        let data = data_with_lines(vec![
            entry(0x1000, 10, false),
            entry(0x1008, 11, false),
            entry(0x1010, 0, true),
        ]);
        let first = data.line_entry_at(FileAddress::new(0x1000)).unwrap();
        let second = data.next_line_entry(first).unwrap();
        assert_eq!(data.line_entry(second).line, 11);
        assert!(data.next_line_entry(second).is_none());
    }

    #[test]
    fn entries_by_line_match_path_suffix() {
        let data = data_with_lines(vec![entry(0x1000, 10, false), entry(0x1010, 0, true)]);
        assert_eq!(
            data.line_entries_by_line(Path::new("test.c"), 10).len(),
            1
        );
        assert_eq!(
            data.line_entries_by_line(Path::new("other.c"), 10).len(),
            0
        );
    }
}
