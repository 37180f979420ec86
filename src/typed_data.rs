//! DIE-backed typed access to tracee data: type descriptors, field and
//! array navigation, pointer dereference, scalar decoding and C-string
//! reads. The expression evaluator and the invoker consume this layer.

use crate::address::VirtualAddress;
use crate::dwarf::{Die, DieRef, DwarfData};
use crate::error::{Error, Result};
use crate::loaded_elves::{LoadedElf, LoadedElves};
use crate::memory::{read_c_string, Memory};
use std::convert::TryInto;
use std::fmt;

const MAX_TYPE_DEPTH: usize = 32;

/// Owned description of one type, extracted from the debug info once so
/// values survive library unloads. Pointers keep a DIE handle instead of
/// a nested descriptor; linked structures would otherwise recurse
/// forever.
#[derive(Clone, Debug)]
pub enum TypeDescriptor {
    Void,
    Bool,
    Char { signed: bool },
    Int { size: u64 },
    Uint { size: u64 },
    Float { size: u64 },
    Pointer { pointee: PointeeRef },
    Array { element: Box<TypeDescriptor>, count: Option<u64> },
    Struct(StructDescriptor),
    Enum { underlying: Box<TypeDescriptor>, enumerators: Vec<(String, i64)> },
    Function(Box<SignatureDescriptor>),
}

#[derive(Clone, Debug)]
pub enum PointeeRef {
    /// void* or an unreadable target type.
    Opaque,
    /// Fully described (literals such as `char*` strings).
    Known(Box<TypeDescriptor>),
    /// Deferred extraction from the owning image's debug info.
    Die { elf: String, global_offset: usize },
}

#[derive(Clone, Debug)]
pub struct StructDescriptor {
    pub name: Option<String>,
    pub byte_size: u64,
    pub members: Vec<MemberDescriptor>,
    pub methods: Vec<MethodDescriptor>,
    /// Any field whose offset breaks its natural alignment.
    pub has_unaligned_fields: bool,
    /// Virtual methods, or a user-provided (not in-class-defaulted)
    /// copy/move constructor or destructor, here or in a base class.
    pub call_nontrivial: bool,
    pub is_union: bool,
}

#[derive(Clone, Debug)]
pub struct MemberDescriptor {
    pub name: String,
    pub ty: TypeDescriptor,
    pub byte_offset: u64,
    pub bit_offset: Option<u64>,
    pub bit_size: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    pub name: String,
    pub signatures: Vec<SignatureDescriptor>,
}

#[derive(Clone, Debug)]
pub struct SignatureDescriptor {
    pub name: String,
    pub return_type: TypeDescriptor,
    pub parameters: Vec<TypeDescriptor>,
    /// Entry address of the definition, when it has code.
    pub address: Option<VirtualAddress>,
    pub is_method: bool,
}

impl TypeDescriptor {
    pub fn byte_size(&self) -> u64 {
        match self {
            TypeDescriptor::Void => 0,
            TypeDescriptor::Bool | TypeDescriptor::Char { .. } => 1,
            TypeDescriptor::Int { size }
            | TypeDescriptor::Uint { size }
            | TypeDescriptor::Float { size } => *size,
            TypeDescriptor::Pointer { .. } => 8,
            TypeDescriptor::Array { element, count } => {
                element.byte_size() * count.unwrap_or(0)
            }
            TypeDescriptor::Struct(s) => s.byte_size,
            TypeDescriptor::Enum { underlying, .. } => underlying.byte_size(),
            TypeDescriptor::Function(_) => 0,
        }
    }

    /// Natural alignment, for the unaligned-field ABI test.
    pub fn alignment(&self) -> u64 {
        match self {
            TypeDescriptor::Struct(s) => s
                .members
                .iter()
                .map(|m| m.ty.alignment())
                .max()
                .unwrap_or(1),
            TypeDescriptor::Array { element, .. } => element.alignment(),
            other => other.byte_size().clamp(1, 8),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::Array { .. } | TypeDescriptor::Struct(_)
        )
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::Bool
                | TypeDescriptor::Char { .. }
                | TypeDescriptor::Int { .. }
                | TypeDescriptor::Uint { .. }
                | TypeDescriptor::Float { .. }
                | TypeDescriptor::Pointer { .. }
                | TypeDescriptor::Enum { .. }
        )
    }

    /// Structural equality for signature matching: same shape and size,
    /// pointers match pointers, aggregates match by name and size.
    pub fn structurally_equal(&self, other: &TypeDescriptor) -> bool {
        use TypeDescriptor::*;
        match (self, other) {
            (Void, Void) | (Bool, Bool) => true,
            (Char { .. }, Char { .. }) => true,
            // Integer literals are freely convertible between signedness
            // of the same width.
            (Int { size: a }, Int { size: b })
            | (Uint { size: a }, Uint { size: b })
            | (Int { size: a }, Uint { size: b })
            | (Uint { size: a }, Int { size: b }) => a == b,
            (Float { size: a }, Float { size: b }) => a == b,
            (Pointer { .. }, Pointer { .. }) => true,
            (Array { element: a, count: ca }, Array { element: b, count: cb }) => {
                ca == cb && a.structurally_equal(b)
            }
            (Struct(a), Struct(b)) => a.name == b.name && a.byte_size == b.byte_size,
            (Enum { underlying: a, .. }, Enum { underlying: b, .. }) => {
                a.structurally_equal(b)
            }
            (Enum { underlying, .. }, other) | (other, Enum { underlying, .. }) => {
                underlying.structurally_equal(other)
            }
            _ => false,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypeDescriptor::Void => write!(f, "void"),
            TypeDescriptor::Bool => write!(f, "bool"),
            TypeDescriptor::Char { signed: true } => write!(f, "char"),
            TypeDescriptor::Char { signed: false } => write!(f, "unsigned char"),
            TypeDescriptor::Int { size } => write!(f, "int{}", size * 8),
            TypeDescriptor::Uint { size } => write!(f, "uint{}", size * 8),
            TypeDescriptor::Float { size } => write!(f, "float{}", size * 8),
            TypeDescriptor::Pointer { .. } => write!(f, "pointer"),
            TypeDescriptor::Array { element, count } => match count {
                Some(count) => write!(f, "{}[{}]", element, count),
                None => write!(f, "{}[]", element),
            },
            TypeDescriptor::Struct(s) => {
                write!(f, "struct {}", s.name.as_deref().unwrap_or("<anonymous>"))
            }
            TypeDescriptor::Enum { .. } => write!(f, "enum"),
            TypeDescriptor::Function(sig) => write!(f, "function {}", sig.name),
        }
    }
}

/// Extract an owned descriptor from a type DIE.
pub fn type_descriptor_from_die(
    elf: &LoadedElf,
    dwarf: &DwarfData,
    die_ref: DieRef,
) -> Result<TypeDescriptor> {
    extract(elf, dwarf, die_ref, 0)
}

fn extract(
    elf: &LoadedElf,
    dwarf: &DwarfData,
    die_ref: DieRef,
    depth: usize,
) -> Result<TypeDescriptor> {
    if depth > MAX_TYPE_DEPTH {
        return Err(Error::decode("type nesting too deep"));
    }
    let die = dwarf.die(die_ref);
    let tag = die.tag.ok_or_else(|| Error::decode("typeless DIE"))?;

    match tag {
        gimli::DW_TAG_base_type => base_type(die),
        gimli::DW_TAG_pointer_type => Ok(TypeDescriptor::Pointer {
            pointee: match dwarf.type_of(die_ref) {
                Some(pointee) => PointeeRef::Die {
                    elf: elf.name.clone(),
                    global_offset: dwarf.die(pointee).global_offset,
                },
                None => PointeeRef::Opaque,
            },
        }),
        gimli::DW_TAG_typedef
        | gimli::DW_TAG_const_type
        | gimli::DW_TAG_volatile_type
        | gimli::DW_TAG_restrict_type => match dwarf.type_of(die_ref) {
            Some(inner) => extract(elf, dwarf, inner, depth + 1),
            None => Ok(TypeDescriptor::Void),
        },
        gimli::DW_TAG_array_type => {
            let element = match dwarf.type_of(die_ref) {
                Some(inner) => extract(elf, dwarf, inner, depth + 1)?,
                None => return Err(Error::decode("array without element type")),
            };
            let count = dwarf
                .children_of(die_ref)
                .filter(|&c| dwarf.die(c).tag == Some(gimli::DW_TAG_subrange_type))
                .find_map(|c| {
                    let d = dwarf.die(c);
                    d.count.or_else(|| d.upper_bound.map(|u| u + 1))
                });
            Ok(TypeDescriptor::Array {
                element: Box::new(element),
                count,
            })
        }
        gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type | gimli::DW_TAG_union_type => {
            struct_type(elf, dwarf, die_ref, depth, tag == gimli::DW_TAG_union_type)
        }
        gimli::DW_TAG_enumeration_type => {
            let underlying = match dwarf.type_of(die_ref) {
                Some(inner) => extract(elf, dwarf, inner, depth + 1)?,
                None => TypeDescriptor::Uint {
                    size: die.byte_size.unwrap_or(4),
                },
            };
            let enumerators = dwarf
                .children_of(die_ref)
                .filter(|&c| dwarf.die(c).tag == Some(gimli::DW_TAG_enumerator))
                .filter_map(|c| {
                    let d = dwarf.die(c);
                    Some((d.name.clone()?, d.const_value?))
                })
                .collect();
            Ok(TypeDescriptor::Enum {
                underlying: Box::new(underlying),
                enumerators,
            })
        }
        gimli::DW_TAG_subprogram | gimli::DW_TAG_subroutine_type => Ok(TypeDescriptor::Function(
            Box::new(signature_from_die(elf, dwarf, die_ref)?),
        )),
        other => Err(Error::decode(format!(
            "unsupported type DIE {:?}",
            other
        ))),
    }
}

fn base_type(die: &Die) -> Result<TypeDescriptor> {
    let size = die.byte_size.unwrap_or(0);
    let encoding = die
        .encoding
        .ok_or_else(|| Error::decode("base type without encoding"))?;
    Ok(match encoding {
        gimli::DW_ATE_boolean => TypeDescriptor::Bool,
        gimli::DW_ATE_signed_char => TypeDescriptor::Char { signed: true },
        gimli::DW_ATE_unsigned_char => TypeDescriptor::Char { signed: false },
        gimli::DW_ATE_signed => TypeDescriptor::Int { size },
        gimli::DW_ATE_unsigned => TypeDescriptor::Uint { size },
        gimli::DW_ATE_float => TypeDescriptor::Float { size },
        other => {
            return Err(Error::decode(format!(
                "unsupported base-type encoding {:?}",
                other
            )))
        }
    })
}

fn struct_type(
    elf: &LoadedElf,
    dwarf: &DwarfData,
    die_ref: DieRef,
    depth: usize,
    is_union: bool,
) -> Result<TypeDescriptor> {
    let die = dwarf.die(die_ref);
    let name = dwarf.die_name(die_ref);
    let mut members = Vec::new();
    let mut methods: Vec<MethodDescriptor> = Vec::new();
    let mut has_unaligned_fields = false;
    let mut call_nontrivial = false;

    for child_ref in dwarf.children_of(die_ref) {
        let child = dwarf.die(child_ref);
        match child.tag {
            Some(gimli::DW_TAG_member) => {
                let member_name = child.name.clone().unwrap_or_default();
                let ty = match dwarf.type_of(child_ref) {
                    Some(t) => extract(elf, dwarf, t, depth + 1)?,
                    None => continue,
                };
                let byte_offset = child.data_member_location.unwrap_or(0);
                if byte_offset % ty.alignment() != 0 {
                    has_unaligned_fields = true;
                }
                members.push(MemberDescriptor {
                    name: member_name,
                    ty,
                    byte_offset,
                    bit_offset: child.data_bit_offset,
                    bit_size: child.bit_size,
                });
            }
            Some(gimli::DW_TAG_subprogram) => {
                let method_name = match dwarf.die_name(child_ref) {
                    Some(n) => n,
                    None => continue,
                };
                if child.is_virtual {
                    call_nontrivial = true;
                }
                if is_special_member(&method_name, name.as_deref())
                    && !child.artificial
                    && child.defaulted.is_none()
                {
                    call_nontrivial = true;
                }
                let signature = signature_from_die(elf, dwarf, child_ref)?;
                match methods.iter_mut().find(|m| m.name == method_name) {
                    Some(method) => method.signatures.push(signature),
                    None => methods.push(MethodDescriptor {
                        name: method_name,
                        signatures: vec![signature],
                    }),
                }
            }
            Some(gimli::DW_TAG_inheritance) => {
                if let Some(base) = dwarf.type_of(child_ref) {
                    if let TypeDescriptor::Struct(base_struct) =
                        extract(elf, dwarf, base, depth + 1)?
                    {
                        call_nontrivial |= base_struct.call_nontrivial;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(TypeDescriptor::Struct(StructDescriptor {
        name,
        byte_size: die.byte_size.unwrap_or(0),
        members,
        methods,
        has_unaligned_fields,
        call_nontrivial,
        is_union,
    }))
}

/// Copy/move constructor or destructor names.
fn is_special_member(method: &str, type_name: Option<&str>) -> bool {
    match type_name {
        Some(type_name) => {
            method == type_name || method == format!("~{}", type_name).as_str()
        }
        None => method.starts_with('~'),
    }
}

/// Signature of a callable DIE; artificial parameters (the receiver) are
/// excluded and flagged instead.
pub fn signature_from_die(
    elf: &LoadedElf,
    dwarf: &DwarfData,
    die_ref: DieRef,
) -> Result<SignatureDescriptor> {
    let die = dwarf.die(die_ref);
    let name = dwarf.die_name(die_ref).unwrap_or_default();
    let return_type = match dwarf.type_of(die_ref) {
        Some(t) => extract(elf, dwarf, t, 0)?,
        None => TypeDescriptor::Void,
    };
    let mut parameters = Vec::new();
    let mut is_method = false;
    for child_ref in dwarf.children_of(die_ref) {
        let child = dwarf.die(child_ref);
        if child.tag != Some(gimli::DW_TAG_formal_parameter) {
            continue;
        }
        if child.artificial {
            is_method = true;
            continue;
        }
        if let Some(t) = dwarf.type_of(child_ref) {
            parameters.push(extract(elf, dwarf, t, 0)?);
        }
    }
    let address = die.ranges.low().map(|low| elf.to_virtual(low));
    Ok(SignatureDescriptor {
        name,
        return_type,
        parameters,
        address,
        is_method,
    })
}

/// Resolve a deferred pointee descriptor.
pub fn resolve_pointee(elves: &LoadedElves, pointee: &PointeeRef) -> Result<TypeDescriptor> {
    match pointee {
        PointeeRef::Opaque => Ok(TypeDescriptor::Void),
        PointeeRef::Known(ty) => Ok((**ty).clone()),
        PointeeRef::Die { elf, global_offset } => {
            let elf = elves
                .by_name(elf)
                .ok_or_else(|| Error::not_found(format!("image {} is no longer loaded", elf)))?;
            let dwarf = elf
                .dwarf
                .as_ref()
                .ok_or_else(|| Error::not_found("image lost its debug info"))?;
            let die_ref = dwarf
                .die_at_global_offset(*global_offset)
                .ok_or_else(|| Error::decode("dangling type reference"))?;
            type_descriptor_from_die(elf, dwarf, die_ref)
        }
    }
}

/// Where a typed value lives.
#[derive(Clone, Debug)]
pub enum DataLocation {
    /// In tracee memory, possibly a bit field.
    Memory {
        address: VirtualAddress,
        bit_offset: u64,
        bit_size: Option<u64>,
    },
    /// Debugger-side bytes (literals, register returns).
    Implicit(Vec<u8>),
    /// No storage (function names before a call).
    None,
}

/// Decoded scalar view of a typed value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Char(u8),
    Int(i64),
    Uint(u64),
    Float(f64),
    Pointer(u64),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScalarValue::Bool(v) => write!(f, "{}", v),
            ScalarValue::Char(v) => write!(f, "'{}'", *v as char),
            ScalarValue::Int(v) => write!(f, "{}", v),
            ScalarValue::Uint(v) => write!(f, "{}", v),
            ScalarValue::Float(v) => write!(f, "{}", v),
            ScalarValue::Pointer(v) => write!(f, "{:#x}", v),
        }
    }
}

/// A value with its type: either a place in the tracee or an implicit
/// debugger-side value, plus candidate entry addresses for callables.
#[derive(Clone, Debug)]
pub struct TypedData {
    pub descriptor: TypeDescriptor,
    pub location: DataLocation,
    pub function_addresses: Vec<VirtualAddress>,
}

impl TypedData {
    pub fn in_memory(descriptor: TypeDescriptor, address: VirtualAddress) -> TypedData {
        TypedData {
            descriptor,
            location: DataLocation::Memory {
                address,
                bit_offset: 0,
                bit_size: None,
            },
            function_addresses: Vec::new(),
        }
    }

    pub fn implicit(descriptor: TypeDescriptor, bytes: Vec<u8>) -> TypedData {
        TypedData {
            descriptor,
            location: DataLocation::Implicit(bytes),
            function_addresses: Vec::new(),
        }
    }

    pub fn implicit_i32(value: i32) -> TypedData {
        TypedData::implicit(TypeDescriptor::Int { size: 4 }, value.to_le_bytes().to_vec())
    }

    pub fn implicit_i64(value: i64) -> TypedData {
        TypedData::implicit(TypeDescriptor::Int { size: 8 }, value.to_le_bytes().to_vec())
    }

    pub fn implicit_f64(value: f64) -> TypedData {
        TypedData::implicit(TypeDescriptor::Float { size: 8 }, value.to_le_bytes().to_vec())
    }

    pub fn implicit_bool(value: bool) -> TypedData {
        TypedData::implicit(TypeDescriptor::Bool, vec![value as u8])
    }

    pub fn implicit_char(value: u8) -> TypedData {
        TypedData::implicit(TypeDescriptor::Char { signed: true }, vec![value])
    }

    pub fn function(signature: SignatureDescriptor) -> TypedData {
        let function_addresses = signature.address.into_iter().collect();
        TypedData {
            descriptor: TypeDescriptor::Function(Box::new(signature)),
            location: DataLocation::None,
            function_addresses,
        }
    }

    pub fn address(&self) -> Option<VirtualAddress> {
        match &self.location {
            DataLocation::Memory { address, .. } => Some(*address),
            _ => None,
        }
    }

    /// The value's raw bytes (descriptor-sized).
    pub fn raw_bytes(&self, memory: &dyn Memory) -> Result<Vec<u8>> {
        let size = self.descriptor.byte_size() as usize;
        match &self.location {
            DataLocation::Memory {
                address,
                bit_offset,
                bit_size,
            } => {
                let mut bytes = memory.read_vec(*address, size.max(1))?;
                if let Some(bit_size) = bit_size {
                    bytes = extract_bit_field(&bytes, *bit_offset, *bit_size)?;
                }
                Ok(bytes)
            }
            DataLocation::Implicit(bytes) => {
                let mut bytes = bytes.clone();
                bytes.resize(size.max(bytes.len()).max(1), 0);
                Ok(bytes)
            }
            DataLocation::None => Err(Error::invalid("value has no storage")),
        }
    }

    /// Decode a scalar. Bit fields are masked and shifted first.
    pub fn read_scalar(&self, memory: &dyn Memory) -> Result<ScalarValue> {
        let bytes = self.raw_bytes(memory)?;
        let le = |n: usize| -> u64 {
            let mut buf = [0u8; 8];
            let n = n.min(bytes.len()).min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            u64::from_le_bytes(buf)
        };
        Ok(match &self.descriptor {
            TypeDescriptor::Bool => ScalarValue::Bool(le(1) != 0),
            TypeDescriptor::Char { .. } => ScalarValue::Char(le(1) as u8),
            TypeDescriptor::Int { size } => {
                let raw = le(*size as usize);
                let shift = 64 - (*size as u32 * 8).min(64);
                ScalarValue::Int(((raw << shift) as i64) >> shift)
            }
            TypeDescriptor::Uint { size } => ScalarValue::Uint(le(*size as usize)),
            TypeDescriptor::Float { size: 4 } => {
                let buf: [u8; 4] = bytes
                    .get(..4)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| Error::decode("short float"))?;
                ScalarValue::Float(f32::from_le_bytes(buf) as f64)
            }
            TypeDescriptor::Float { .. } => {
                let buf: [u8; 8] = bytes
                    .get(..8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| Error::decode("short double"))?;
                ScalarValue::Float(f64::from_le_bytes(buf))
            }
            TypeDescriptor::Pointer { .. } => ScalarValue::Pointer(le(8)),
            TypeDescriptor::Enum { underlying, .. } => {
                let inner = TypedData {
                    descriptor: (**underlying).clone(),
                    location: self.location.clone(),
                    function_addresses: Vec::new(),
                };
                return inner.read_scalar(memory);
            }
            other => {
                return Err(Error::invalid(format!(
                    "{} is not a simple value",
                    other
                )))
            }
        })
    }

    /// `.name` member access.
    pub fn field(&self, name: &str) -> Result<TypedData> {
        let members = match &self.descriptor {
            TypeDescriptor::Struct(s) => &s.members,
            other => {
                return Err(Error::invalid(format!(
                    "{} has no fields",
                    other
                )))
            }
        };
        let member = members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::not_found(format!("no field named {:?}", name)))?;

        let base = self
            .address()
            .ok_or_else(|| Error::invalid("field access needs an in-memory value"))?;

        if let Some(bit_offset) = member.bit_offset {
            // Bit-packed member: without an explicit width the layout is
            // ambiguous.
            let bit_size = member.bit_size.ok_or_else(|| {
                Error::decode(format!(
                    "bit-packed field {:?} is missing a bit size",
                    name
                ))
            })?;
            return Ok(TypedData {
                descriptor: member.ty.clone(),
                location: DataLocation::Memory {
                    address: base,
                    bit_offset,
                    bit_size: Some(bit_size),
                },
                function_addresses: Vec::new(),
            });
        }

        Ok(TypedData::in_memory(
            member.ty.clone(),
            base + member.byte_offset,
        ))
    }

    /// `[i]` array or pointer indexing.
    pub fn index(&self, i: u64, elves: &LoadedElves, memory: &dyn Memory) -> Result<TypedData> {
        match &self.descriptor {
            TypeDescriptor::Array { element, count } => {
                if let Some(count) = count {
                    if i >= *count {
                        return Err(Error::invalid(format!(
                            "index {} out of bounds for array of {}",
                            i, count
                        )));
                    }
                }
                let base = self
                    .address()
                    .ok_or_else(|| Error::invalid("indexing needs an in-memory array"))?;
                Ok(TypedData::in_memory(
                    (**element).clone(),
                    base + i * element.byte_size(),
                ))
            }
            TypeDescriptor::Pointer { pointee } => {
                let target = match self.read_scalar(memory)? {
                    ScalarValue::Pointer(p) => p,
                    _ => unreachable!("pointer scalars decode as pointers"),
                };
                let element = resolve_pointee(elves, pointee)?;
                let address = VirtualAddress::new(target + i * element.byte_size());
                Ok(TypedData::in_memory(element, address))
            }
            other => Err(Error::invalid(format!("{} cannot be indexed", other))),
        }
    }

    /// `*p` / `->` base: follow a pointer.
    pub fn deref(&self, elves: &LoadedElves, memory: &dyn Memory) -> Result<TypedData> {
        match &self.descriptor {
            TypeDescriptor::Pointer { pointee } => {
                let target = match self.read_scalar(memory)? {
                    ScalarValue::Pointer(p) => p,
                    _ => unreachable!("pointer scalars decode as pointers"),
                };
                if target == 0 {
                    return Err(Error::invalid("dereference of null pointer"));
                }
                let element = resolve_pointee(elves, pointee)?;
                Ok(TypedData::in_memory(element, VirtualAddress::new(target)))
            }
            other => Err(Error::invalid(format!(
                "{} cannot be dereferenced",
                other
            ))),
        }
    }

    /// Read the NUL-terminated string a `char*` or `char[]` points at.
    pub fn read_string(&self, memory: &dyn Memory) -> Result<String> {
        match &self.descriptor {
            TypeDescriptor::Pointer { .. } => {
                let target = match self.read_scalar(memory)? {
                    ScalarValue::Pointer(p) => p,
                    _ => unreachable!("pointer scalars decode as pointers"),
                };
                read_c_string(memory, VirtualAddress::new(target))
            }
            TypeDescriptor::Array { element, .. }
                if matches!(**element, TypeDescriptor::Char { .. }) =>
            {
                let base = self
                    .address()
                    .ok_or_else(|| Error::invalid("string read needs memory storage"))?;
                read_c_string(memory, base)
            }
            other => Err(Error::invalid(format!("{} is not a string", other))),
        }
    }

    /// Look up a method and the receiver pointer for dispatch.
    pub fn method(&self, name: &str) -> Result<(Vec<SignatureDescriptor>, TypedData)> {
        let s = match &self.descriptor {
            TypeDescriptor::Struct(s) => s,
            other => {
                return Err(Error::invalid(format!(
                    "{} has no methods",
                    other
                )))
            }
        };
        let method = s
            .methods
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::not_found(format!("no method named {:?}", name)))?;
        let receiver_addr = self
            .address()
            .ok_or_else(|| Error::invalid("method receiver must live in tracee memory"))?;
        let receiver = TypedData::implicit(
            TypeDescriptor::Pointer {
                pointee: PointeeRef::Known(Box::new(self.descriptor.clone())),
            },
            receiver_addr.as_u64().to_le_bytes().to_vec(),
        );
        Ok((method.signatures.clone(), receiver))
    }
}

/// Pull `bit_size` bits starting `bit_offset` bits into `bytes`, little
/// endian, into a byte-aligned buffer.
fn extract_bit_field(bytes: &[u8], bit_offset: u64, bit_size: u64) -> Result<Vec<u8>> {
    if bit_size == 0 || bit_size > 64 {
        return Err(Error::decode(format!("bad bit-field width {}", bit_size)));
    }
    let mut word = 0u128;
    for (i, b) in bytes.iter().take(16).enumerate() {
        word |= (*b as u128) << (8 * i);
    }
    let value = (word >> bit_offset) as u64 & mask(bit_size);
    Ok(value.to_le_bytes().to_vec())
}

fn mask(bits: u64) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;

    fn int4() -> TypeDescriptor {
        TypeDescriptor::Int { size: 4 }
    }

    #[test]
    fn scalar_decoding_sign_extends() {
        let memory = FakeMemory::new();
        memory.preload(0x1000, &(-5i32).to_le_bytes());
        let data = TypedData::in_memory(int4(), VirtualAddress::new(0x1000));
        assert_eq!(data.read_scalar(&memory).unwrap(), ScalarValue::Int(-5));
    }

    #[test]
    fn field_access_walks_offsets() {
        let memory = FakeMemory::new();
        memory.preload(0x1000, &1i32.to_le_bytes());
        memory.preload(0x1004, &2i32.to_le_bytes());
        let desc = TypeDescriptor::Struct(StructDescriptor {
            name: Some("pair".into()),
            byte_size: 8,
            members: vec![
                MemberDescriptor {
                    name: "a".into(),
                    ty: int4(),
                    byte_offset: 0,
                    bit_offset: None,
                    bit_size: None,
                },
                MemberDescriptor {
                    name: "b".into(),
                    ty: int4(),
                    byte_offset: 4,
                    bit_offset: None,
                    bit_size: None,
                },
            ],
            methods: Vec::new(),
            has_unaligned_fields: false,
            call_nontrivial: false,
            is_union: false,
        });
        let data = TypedData::in_memory(desc, VirtualAddress::new(0x1000));
        let b = data.field("b").unwrap();
        assert_eq!(b.read_scalar(&memory).unwrap(), ScalarValue::Int(2));
        assert!(matches!(data.field("c").unwrap_err(), Error::NotFound(_)));
    }

    #[test]
    fn bit_fields_need_a_width() {
        let desc = TypeDescriptor::Struct(StructDescriptor {
            name: None,
            byte_size: 4,
            members: vec![MemberDescriptor {
                name: "flags".into(),
                ty: TypeDescriptor::Uint { size: 4 },
                byte_offset: 0,
                bit_offset: Some(3),
                bit_size: None,
            }],
            methods: Vec::new(),
            has_unaligned_fields: false,
            call_nontrivial: false,
            is_union: false,
        });
        let data = TypedData::in_memory(desc, VirtualAddress::new(0x1000));
        assert!(matches!(
            data.field("flags").unwrap_err(),
            Error::Decode(_)
        ));
    }

    #[test]
    fn bit_field_extraction_masks_and_shifts() {
        let memory = FakeMemory::new();
        memory.preload(0x1000, &[0b1101_1000]);
        let desc = TypeDescriptor::Struct(StructDescriptor {
            name: None,
            byte_size: 1,
            members: vec![MemberDescriptor {
                name: "mid".into(),
                ty: TypeDescriptor::Uint { size: 1 },
                byte_offset: 0,
                bit_offset: Some(3),
                bit_size: Some(3),
            }],
            methods: Vec::new(),
            has_unaligned_fields: false,
            call_nontrivial: false,
            is_union: false,
        });
        let data = TypedData::in_memory(desc, VirtualAddress::new(0x1000));
        let mid = data.field("mid").unwrap();
        // bits 3..6 of 0b11011000 = 0b011
        assert_eq!(mid.read_scalar(&memory).unwrap(), ScalarValue::Uint(3));
    }

    #[test]
    fn array_indexing_is_bounds_checked() {
        let memory = FakeMemory::new();
        for i in 0..4u8 {
            memory.preload(0x1000 + i as u64 * 4, &(i as i32 * 10).to_le_bytes());
        }
        let desc = TypeDescriptor::Array {
            element: Box::new(int4()),
            count: Some(4),
        };
        let elves = test_elves();
        let data = TypedData::in_memory(desc, VirtualAddress::new(0x1000));
        let third = data.index(2, &elves, &memory).unwrap();
        assert_eq!(third.read_scalar(&memory).unwrap(), ScalarValue::Int(20));
        assert!(matches!(
            data.index(4, &elves, &memory).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn char_pointer_reads_strings() {
        let memory = FakeMemory::new();
        memory.preload(0x2000, b"meow\0");
        let desc = TypeDescriptor::Pointer {
            pointee: PointeeRef::Known(Box::new(TypeDescriptor::Char { signed: true })),
        };
        let data = TypedData::implicit(desc, 0x2000u64.to_le_bytes().to_vec());
        assert_eq!(data.read_string(&memory).unwrap(), "meow");
    }

    fn test_elves() -> LoadedElves {
        let image =
            crate::elf::ElfImage::from_file(std::path::Path::new("/proc/self/exe")).unwrap();
        LoadedElves::new(crate::loaded_elves::LoadedElf::without_debug_info(
            "self".into(),
            image,
            0,
            true,
        ))
    }
}
