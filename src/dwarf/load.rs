//! One-shot extraction of the DIE arena and line tables from an ELF image.

use super::{unwind, CompileUnit, Die, DieRef, DwarfData, LineEntry, Reader};
use crate::address::{AddressRange, AddressRanges, FileAddress};
use crate::elf::ElfImage;
use crate::error::Result;
use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

pub(super) fn load(image: &ElfImage) -> Result<DwarfData> {
    let endian = gimli::RunTimeEndian::Little;

    // Dwarf::load wants one closure type for both the main and the
    // supplementary loader; boxing unifies them.
    let loader: Box<dyn FnMut(gimli::SectionId) -> std::result::Result<Reader, gimli::Error> + '_> =
        Box::new(|id: gimli::SectionId| {
            let bytes = image.section_data(id.name()).unwrap_or(&[]);
            Ok(gimli::EndianRcSlice::new(Rc::from(bytes), endian))
        });
    let sup: Box<dyn FnMut(gimli::SectionId) -> std::result::Result<Reader, gimli::Error> + '_> =
        Box::new(move |_| Ok(gimli::EndianRcSlice::new(Rc::from(&[][..]), endian)));
    let dwarf: gimli::Dwarf<Reader> = gimli::Dwarf::load(loader, sup)?;

    let mut units = Vec::new();
    let mut die_by_global_offset = HashMap::new();
    let mut function_index = Vec::new();
    let mut functions_by_name: HashMap<String, Vec<DieRef>> = HashMap::new();

    let mut headers = dwarf.units();
    while let Some(header) = headers.next()? {
        let unit_index = units.len();
        let header_offset = header.offset().0;
        let unit = match dwarf.unit(header) {
            Ok(unit) => unit,
            Err(e) => {
                debug!("skipping undecodable compile unit: {}", e);
                continue;
            }
        };
        let unit_base = header_offset;

        let name = unit
            .name
            .as_ref()
            .and_then(|r| reader_to_string(r))
            .unwrap_or_default();
        let comp_dir = unit
            .comp_dir
            .as_ref()
            .and_then(|r| reader_to_string(r))
            .unwrap_or_default();

        let mut dies: Vec<Die> = Vec::new();
        let mut path_at_depth: Vec<usize> = Vec::new();
        let mut depth: isize = 0;

        let mut cursor = unit.entries();
        while let Some((delta, entry)) = cursor.next_dfs()? {
            depth += delta;
            let depth = depth.max(0) as usize;
            path_at_depth.truncate(depth);

            let die_index = dies.len();
            let mut die = extract_die(&dwarf, &unit, entry, unit_base)?;
            die.parent = depth.checked_sub(1).and_then(|d| path_at_depth.get(d).copied());
            if let Some(parent) = die.parent {
                dies[parent].children.push(die_index);
            }

            let global_offset = die.global_offset;
            let die_ref = DieRef {
                unit: unit_index,
                die: die_index,
            };
            die_by_global_offset.insert(global_offset, die_ref);

            if die.is_function_definition() {
                for range in die.ranges.iter() {
                    function_index.push((range.low.as_u64(), range.high.as_u64(), die_ref));
                }
            }

            dies.push(die);
            path_at_depth.push(die_index);
        }

        let (files, lines) = extract_lines(&dwarf, &unit)?;

        units.push(CompileUnit {
            name,
            comp_dir,
            files,
            lines,
            dies,
        });
    }

    // Name index, including names reached through specification and
    // abstract-origin links; built after the arena so lookups can chase
    // cross-unit references.
    let data_view = |r: DieRef, units: &Vec<CompileUnit>| -> Die {
        units[r.unit].dies[r.die].clone()
    };
    for (unit_index, unit) in units.iter().enumerate() {
        for (die_index, die) in unit.dies.iter().enumerate() {
            if !die.is_function_definition() {
                continue;
            }
            let die_ref = DieRef {
                unit: unit_index,
                die: die_index,
            };
            let mut names = Vec::new();
            let mut current = Some(die.clone());
            let mut guard = 0;
            while let Some(d) = current {
                if let Some(n) = &d.name {
                    names.push(n.clone());
                }
                if let Some(ln) = &d.linkage_name {
                    names.push(ln.clone());
                    if let Ok(dem) = rustc_demangle::try_demangle(ln) {
                        names.push(format!("{:#}", dem));
                    }
                }
                guard += 1;
                current = if guard < 4 {
                    d.origin_ref
                        .and_then(|off| die_by_global_offset.get(&off).copied())
                        .map(|r| data_view(r, &units))
                } else {
                    None
                };
            }
            names.sort();
            names.dedup();
            for name in names {
                functions_by_name.entry(name).or_default().push(die_ref);
            }
        }
    }

    function_index.sort_by_key(|&(low, _, _)| low);

    let unwind = unwind::UnwindData::load(image, endian);

    Ok(DwarfData {
        units,
        die_by_global_offset,
        function_index,
        functions_by_name,
        unwind,
    })
}

fn reader_to_string(r: &Reader) -> Option<String> {
    gimli::Reader::to_string_lossy(r).ok().map(|c| c.into_owned())
}

fn extract_die(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
    unit_base: usize,
) -> Result<Die> {
    let mut die = Die::default();
    die.tag = Some(entry.tag());
    die.global_offset = unit_base + entry.offset().0;

    let to_global = |value: gimli::AttributeValue<Reader>| -> Option<usize> {
        match value {
            gimli::AttributeValue::UnitRef(offset) => Some(unit_base + offset.0),
            gimli::AttributeValue::DebugInfoRef(offset) => Some(offset.0),
            _ => None,
        }
    };

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        let value = attr.value();
        match attr.name() {
            gimli::DW_AT_name => {
                die.name = dwarf
                    .attr_string(unit, value)
                    .ok()
                    .and_then(|r| reader_to_string(&r));
            }
            gimli::DW_AT_linkage_name | gimli::DW_AT_MIPS_linkage_name => {
                die.linkage_name = dwarf
                    .attr_string(unit, value)
                    .ok()
                    .and_then(|r| reader_to_string(&r));
            }
            gimli::DW_AT_decl_file => die.decl_file = file_index_value(&attr),
            gimli::DW_AT_decl_line => die.decl_line = attr.udata_value(),
            gimli::DW_AT_call_file => die.call_file = file_index_value(&attr),
            gimli::DW_AT_call_line => die.call_line = attr.udata_value(),
            gimli::DW_AT_type => die.type_ref = to_global(value),
            gimli::DW_AT_specification | gimli::DW_AT_abstract_origin => {
                die.origin_ref = to_global(value)
            }
            gimli::DW_AT_byte_size => die.byte_size = attr.udata_value(),
            gimli::DW_AT_bit_size => die.bit_size = attr.udata_value(),
            gimli::DW_AT_data_bit_offset => die.data_bit_offset = attr.udata_value(),
            gimli::DW_AT_data_member_location => {
                die.data_member_location = attr.udata_value();
            }
            gimli::DW_AT_encoding => {
                if let gimli::AttributeValue::Encoding(ate) = value {
                    die.encoding = Some(ate);
                } else if let Some(v) = attr.udata_value() {
                    die.encoding = Some(gimli::DwAte(v as u8));
                }
            }
            gimli::DW_AT_upper_bound => die.upper_bound = attr.udata_value(),
            gimli::DW_AT_count => die.count = attr.udata_value(),
            gimli::DW_AT_location => {
                if let gimli::AttributeValue::Exprloc(expr) = value {
                    die.location_expr = gimli::Reader::to_slice(&expr.0)
                        .ok()
                        .map(|s| s.into_owned());
                }
            }
            gimli::DW_AT_frame_base => {
                if let gimli::AttributeValue::Exprloc(expr) = value {
                    die.frame_base_expr = gimli::Reader::to_slice(&expr.0)
                        .ok()
                        .map(|s| s.into_owned());
                }
            }
            gimli::DW_AT_const_value => {
                die.const_value = attr
                    .sdata_value()
                    .or_else(|| attr.udata_value().map(|v| v as i64));
            }
            gimli::DW_AT_declaration => die.declaration = flag_value(&attr),
            gimli::DW_AT_external => die.external = flag_value(&attr),
            gimli::DW_AT_virtuality => {
                die.is_virtual = match value {
                    gimli::AttributeValue::Virtuality(v) => v != gimli::DW_VIRTUALITY_none,
                    _ => attr.udata_value().map(|v| v != 0).unwrap_or(false),
                };
            }
            gimli::DW_AT_defaulted => die.defaulted = attr.udata_value(),
            gimli::DW_AT_artificial => die.artificial = flag_value(&attr),
            _ => {}
        }
    }

    // Code ranges only matter for a few tags; skip the range-list walk
    // everywhere else.
    match entry.tag() {
        gimli::DW_TAG_compile_unit
        | gimli::DW_TAG_subprogram
        | gimli::DW_TAG_inlined_subroutine
        | gimli::DW_TAG_lexical_block => {
            let mut ranges = Vec::new();
            let mut iter = dwarf.die_ranges(unit, entry)?;
            while let Some(range) = iter.next()? {
                if range.begin < range.end {
                    ranges.push(AddressRange::new(
                        FileAddress::new(range.begin),
                        FileAddress::new(range.end),
                    ));
                }
            }
            die.ranges = AddressRanges::new(ranges);
        }
        _ => {}
    }

    Ok(die)
}

fn file_index_value(attr: &gimli::Attribute<Reader>) -> Option<u64> {
    match attr.value() {
        gimli::AttributeValue::FileIndex(i) => Some(i),
        _ => attr.udata_value(),
    }
}

fn flag_value(attr: &gimli::Attribute<Reader>) -> bool {
    match attr.value() {
        gimli::AttributeValue::Flag(f) => f,
        _ => attr.udata_value().map(|v| v != 0).unwrap_or(false),
    }
}

fn extract_lines(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
) -> Result<(Vec<PathBuf>, Vec<LineEntry>)> {
    let program = match unit.line_program.clone() {
        Some(program) => program,
        None => return Ok((Vec::new(), Vec::new())),
    };

    let comp_dir = unit
        .comp_dir
        .as_ref()
        .and_then(|r| reader_to_string(r))
        .unwrap_or_default();

    let mut files: Vec<PathBuf> = Vec::new();
    let mut file_map: HashMap<u64, usize> = HashMap::new();
    let mut lines: Vec<LineEntry> = Vec::new();

    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row()? {
        let file_index = *file_map.entry(row.file_index()).or_insert_with(|| {
            let path = row
                .file(header)
                .map(|file| {
                    let mut path = PathBuf::from(&comp_dir);
                    if let Some(dir) = file.directory(header) {
                        if let Ok(dir) = dwarf.attr_string(unit, dir) {
                            if let Some(dir) = reader_to_string(&dir) {
                                if dir.starts_with('/') {
                                    path = PathBuf::from(dir);
                                } else {
                                    path.push(dir);
                                }
                            }
                        }
                    }
                    if let Ok(name) = dwarf.attr_string(unit, file.path_name()) {
                        if let Some(name) = reader_to_string(&name) {
                            path.push(name);
                        }
                    }
                    path
                })
                .unwrap_or_default();
            files.push(path);
            files.len() - 1
        });

        lines.push(LineEntry {
            address: FileAddress::new(row.address()),
            file_index,
            line: row.line().unwrap_or(0),
            column: match row.column() {
                gimli::ColumnType::Column(c) => c,
                gimli::ColumnType::LeftEdge => 0,
            },
            is_stmt: row.is_stmt(),
            end_sequence: row.end_sequence(),
        });
    }

    lines.sort_by_key(|e| (e.address.as_u64(), e.end_sequence));
    Ok((files, lines))
}
