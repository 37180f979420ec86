//! CFI consumption: turn `.eh_frame`/`.debug_frame` rows into the small
//! rule set the unwinder evaluates, and run DWARF expressions for the
//! expression-based rules.

use super::Reader;
use crate::address::FileAddress;
use crate::elf::ElfImage;
use crate::error::{Error, Result};
use gimli::UnwindSection;
use std::rc::Rc;

/// How to compute the canonical frame address.
#[derive(Clone, Debug)]
pub enum CfaRule {
    RegisterOffset { register: u16, offset: i64 },
    Expression(Vec<u8>),
}

/// How to recover one caller register.
#[derive(Clone, Debug)]
pub enum RegisterRule {
    Undefined,
    SameValue,
    InRegister(u16),
    /// caller's register = mem64(CFA + offset)
    Offset(i64),
    /// caller's register = CFA + offset
    ValueOffset(i64),
    /// caller's register = mem64(eval(expr))
    Expression(Vec<u8>),
    /// caller's register = eval(expr)
    ValueExpression(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct UnwindRules {
    pub cfa: CfaRule,
    pub registers: Vec<(u16, RegisterRule)>,
    /// DWARF register holding the return address (rip on x86-64).
    pub return_address_register: u16,
}

pub(super) struct UnwindData {
    eh_frame: Option<(gimli::EhFrame<Reader>, gimli::BaseAddresses)>,
    debug_frame: Option<(gimli::DebugFrame<Reader>, gimli::BaseAddresses)>,
    endian: gimli::RunTimeEndian,
}

impl UnwindData {
    pub(super) fn empty() -> UnwindData {
        UnwindData {
            eh_frame: None,
            debug_frame: None,
            endian: gimli::RunTimeEndian::Little,
        }
    }

    pub(super) fn load(image: &ElfImage, endian: gimli::RunTimeEndian) -> UnwindData {
        let reader =
            |bytes: &[u8]| gimli::EndianRcSlice::new(Rc::from(bytes), endian);

        let mut bases = gimli::BaseAddresses::default();
        if let Some(text) = image.section(".text") {
            bases = bases.set_text(text.addr);
        }
        if let Some(got) = image.section(".got") {
            bases = bases.set_got(got.addr);
        }

        let eh_frame = image.section(".eh_frame").and_then(|section| {
            let data = image.section_data(".eh_frame")?;
            let mut eh = gimli::EhFrame::from(reader(data));
            eh.set_address_size(8);
            let mut bases = bases.clone().set_eh_frame(section.addr);
            if let Some(hdr) = image.section(".eh_frame_hdr") {
                bases = bases.set_eh_frame_hdr(hdr.addr);
            }
            Some((eh, bases))
        });

        let debug_frame = image.section(".debug_frame").and_then(|_| {
            let data = image.section_data(".debug_frame")?;
            let mut df = gimli::DebugFrame::from(reader(data));
            df.set_address_size(8);
            Some((df, bases.clone()))
        });

        UnwindData {
            eh_frame,
            debug_frame,
            endian,
        }
    }

    pub(super) fn compute_rules_at(&self, fa: FileAddress) -> Result<Option<UnwindRules>> {
        if let Some((section, bases)) = &self.eh_frame {
            if let Some(rules) = rules_from_section(section, bases, fa)? {
                return Ok(Some(rules));
            }
        }
        if let Some((section, bases)) = &self.debug_frame {
            if let Some(rules) = rules_from_section(section, bases, fa)? {
                return Ok(Some(rules));
            }
        }
        Ok(None)
    }
}

fn rules_from_section<S>(
    section: &S,
    bases: &gimli::BaseAddresses,
    fa: FileAddress,
) -> Result<Option<UnwindRules>>
where
    S: UnwindSection<Reader>,
{
    let fde = match section.fde_for_address(bases, fa.as_u64(), |sec, bases, offset| {
        sec.cie_from_offset(bases, offset)
    }) {
        Ok(fde) => fde,
        Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut ctx = gimli::UninitializedUnwindContext::new();
    let row = match fde.unwind_info_for_address(section, bases, &mut ctx, fa.as_u64()) {
        Ok(row) => row.clone(),
        Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let cfa = match row.cfa() {
        gimli::CfaRule::RegisterAndOffset { register, offset } => CfaRule::RegisterOffset {
            register: register.0,
            offset: *offset,
        },
        gimli::CfaRule::Expression(expr) => CfaRule::Expression(expression_bytes(expr)?),
    };

    let mut registers = Vec::new();
    for item in row.registers() {
        let &(register, ref rule) = item;
        let converted = match rule {
            gimli::RegisterRule::Undefined => RegisterRule::Undefined,
            gimli::RegisterRule::SameValue => RegisterRule::SameValue,
            gimli::RegisterRule::Register(r) => RegisterRule::InRegister(r.0),
            gimli::RegisterRule::Offset(o) => RegisterRule::Offset(*o),
            gimli::RegisterRule::ValOffset(o) => RegisterRule::ValueOffset(*o),
            gimli::RegisterRule::Expression(expr) => {
                RegisterRule::Expression(expression_bytes(expr)?)
            }
            gimli::RegisterRule::ValExpression(expr) => {
                RegisterRule::ValueExpression(expression_bytes(expr)?)
            }
            gimli::RegisterRule::Architectural => {
                return Err(Error::decode(format!(
                    "architectural register rule at {}",
                    fa
                )))
            }
        };
        registers.push((register.0, converted));
    }

    Ok(Some(UnwindRules {
        cfa,
        registers,
        return_address_register: fde.cie().return_address_register().0,
    }))
}

fn expression_bytes(expr: &gimli::Expression<Reader>) -> Result<Vec<u8>> {
    let slice = gimli::Reader::to_slice(&expr.0)?;
    Ok(slice.into_owned())
}

/// Outcome of a CFI expression: either a memory location holding the value
/// or the value itself.
pub enum ExpressionOutcome {
    Address(u64),
    Value(u64),
}

/// Run a CFI expression against the current frame. `initial` seeds the
/// evaluation stack (the CFA, for register-rule expressions);
/// `load_bias` relocates DW_OP_addr operands into virtual space.
pub fn evaluate_unwind_expression(
    bytes: &[u8],
    initial: Option<u64>,
    get_register: &mut dyn FnMut(u16) -> Option<u64>,
    read_memory: &mut dyn FnMut(u64, u8) -> Option<u64>,
    load_bias: u64,
) -> Result<ExpressionOutcome> {
    let reader = gimli::EndianRcSlice::new(Rc::from(bytes), gimli::RunTimeEndian::Little);
    let encoding = gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: 8,
    };
    let mut eval = gimli::Evaluation::new(reader, encoding);
    if let Some(value) = initial {
        eval.set_initial_value(value);
    }

    let mut state = eval.evaluate()?;
    loop {
        match state {
            gimli::EvaluationResult::Complete => break,
            gimli::EvaluationResult::RequiresMemory { address, size, .. } => {
                let value = read_memory(address, size).ok_or_else(|| {
                    Error::decode(format!("unreadable memory {:#x} in CFI expression", address))
                })?;
                state = eval.resume_with_memory(gimli::Value::Generic(value))?;
            }
            gimli::EvaluationResult::RequiresRegister { register, .. } => {
                let value = get_register(register.0).ok_or_else(|| {
                    Error::decode(format!(
                        "undefined register {} in CFI expression",
                        register.0
                    ))
                })?;
                state = eval.resume_with_register(gimli::Value::Generic(value))?;
            }
            gimli::EvaluationResult::RequiresRelocatedAddress(addr) => {
                state = eval.resume_with_relocated_address(addr.wrapping_add(load_bias))?;
            }
            other => {
                return Err(Error::decode(format!(
                    "unsupported CFI expression requirement: {:?}",
                    other
                )))
            }
        }
    }

    let pieces = eval.result();
    let piece = pieces
        .first()
        .ok_or_else(|| Error::decode("empty CFI expression result"))?;
    match &piece.location {
        gimli::Location::Address { address } => Ok(ExpressionOutcome::Address(*address)),
        gimli::Location::Value { value } => Ok(ExpressionOutcome::Value(
            value.to_u64(u64::MAX).map_err(Error::from)?,
        )),
        gimli::Location::Register { register } => get_register(register.0)
            .map(ExpressionOutcome::Value)
            .ok_or_else(|| Error::decode("register location names an undefined register")),
        _ => Err(Error::decode("unsupported CFI expression result location")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_breg_plus_offset() {
        // DW_OP_breg7 16: rsp + 16
        let bytes = [0x77, 0x10];
        let mut get_register = |r: u16| if r == 7 { Some(0x7fff_0000u64) } else { None };
        let mut read_memory = |_a: u64, _s: u8| None;
        match evaluate_unwind_expression(&bytes, None, &mut get_register, &mut read_memory, 0)
            .unwrap()
        {
            ExpressionOutcome::Address(addr) => assert_eq!(addr, 0x7fff_0010),
            _ => panic!("expected address outcome"),
        }
    }

    #[test]
    fn evaluates_deref() {
        // DW_OP_breg7 0; DW_OP_deref
        let bytes = [0x77, 0x00, 0x06];
        let mut get_register = |r: u16| if r == 7 { Some(0x1000u64) } else { None };
        let mut read_memory = |a: u64, _s: u8| if a == 0x1000 { Some(0xdeadbeefu64) } else { None };
        match evaluate_unwind_expression(&bytes, None, &mut get_register, &mut read_memory, 0)
            .unwrap()
        {
            ExpressionOutcome::Address(addr) => assert_eq!(addr, 0xdeadbeef),
            _ => panic!("expected address outcome"),
        }
    }
}
