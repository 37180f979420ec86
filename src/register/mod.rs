//! Typed view over the tracee's GPR/FPR/debug register files.
//!
//! `RegisterState` is an immutable value: `with_value`/`with_undefined`
//! return a new state and the engine never mutates a held snapshot in
//! place.

mod spec;

pub use spec::{
    all_registers, register_by_dwarf_id, register_by_index, register_by_name, RegisterClass,
    RegisterSpec, RegisterStorage,
};

use crate::address::VirtualAddress;
use crate::error::{Error, Result};
use static_assertions::const_assert;
use std::fmt;

// Undefined-value tracking uses one bit per registry entry.
const_assert!(std::mem::size_of::<u128>() * 8 >= 112);

/// Tagged register value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RegisterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Unknown after an unwind rule declared the register dead.
    Undefined,
}

impl RegisterValue {
    pub fn width(&self) -> usize {
        match self {
            RegisterValue::U8(_) | RegisterValue::I8(_) => 1,
            RegisterValue::U16(_) | RegisterValue::I16(_) => 2,
            RegisterValue::U32(_) | RegisterValue::I32(_) | RegisterValue::F32(_) => 4,
            RegisterValue::U64(_) | RegisterValue::I64(_) | RegisterValue::F64(_) => 8,
            RegisterValue::U128(_) => 16,
            RegisterValue::Undefined => 0,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, RegisterValue::F32(_) | RegisterValue::F64(_))
    }

    /// The value's bits, zero-extended to 128.
    pub fn to_bits(&self) -> Option<u128> {
        Some(match *self {
            RegisterValue::U8(v) => v as u128,
            RegisterValue::U16(v) => v as u128,
            RegisterValue::U32(v) => v as u128,
            RegisterValue::U64(v) => v as u128,
            RegisterValue::U128(v) => v,
            RegisterValue::I8(v) => v as u8 as u128,
            RegisterValue::I16(v) => v as u16 as u128,
            RegisterValue::I32(v) => v as u32 as u128,
            RegisterValue::I64(v) => v as u64 as u128,
            RegisterValue::F32(v) => v.to_bits() as u128,
            RegisterValue::F64(v) => v.to_bits() as u128,
            RegisterValue::Undefined => return None,
        })
    }

    pub fn to_u64(&self) -> Option<u64> {
        self.to_bits().map(|bits| bits as u64)
    }

    /// Parse a user-supplied register parameter. Accepted forms:
    /// `f:<float>` (f32), `d:<float>` (f64), `i:<signed dec/hex>`,
    /// `<high>:<low>` (128-bit pair), bare unsigned dec/hex otherwise.
    pub fn parse(input: &str) -> Result<RegisterValue> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix("f:") {
            let v: f32 = rest
                .parse()
                .map_err(|_| Error::invalid(format!("bad f32 literal {:?}", rest)))?;
            return Ok(RegisterValue::F32(v));
        }
        if let Some(rest) = input.strip_prefix("d:") {
            let v: f64 = rest
                .parse()
                .map_err(|_| Error::invalid(format!("bad f64 literal {:?}", rest)))?;
            return Ok(RegisterValue::F64(v));
        }
        if let Some(rest) = input.strip_prefix("i:") {
            let v = parse_i64(rest)?;
            return Ok(RegisterValue::I64(v));
        }
        if let Some(colon) = input.find(':') {
            let high = parse_u64(&input[..colon])?;
            let low = parse_u64(&input[colon + 1..])?;
            return Ok(RegisterValue::U128(((high as u128) << 64) | low as u128));
        }
        Ok(RegisterValue::U64(parse_u64(input)?))
    }
}

fn parse_u64(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| Error::invalid(format!("bad unsigned literal {:?}", s)))
}

fn parse_i64(s: &str) -> Result<i64> {
    let s = s.trim();
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        body.parse()
    }
    .map_err(|_| Error::invalid(format!("bad signed literal {:?}", s)))?;
    Ok(if neg { -magnitude } else { magnitude })
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegisterValue::U8(v) => write!(f, "{:#x}", v),
            RegisterValue::U16(v) => write!(f, "{:#x}", v),
            RegisterValue::U32(v) => write!(f, "{:#x}", v),
            RegisterValue::U64(v) => write!(f, "{:#x}", v),
            RegisterValue::U128(v) => write!(f, "{:#x}", v),
            RegisterValue::I8(v) => write!(f, "{}", v),
            RegisterValue::I16(v) => write!(f, "{}", v),
            RegisterValue::I32(v) => write!(f, "{}", v),
            RegisterValue::I64(v) => write!(f, "{}", v),
            RegisterValue::F32(v) => write!(f, "{}", v),
            RegisterValue::F64(v) => write!(f, "{}", v),
            RegisterValue::Undefined => write!(f, "<undefined>"),
        }
    }
}

/// Snapshot of a thread's register files, plus the set of registers an
/// unwind has explicitly marked undefined.
#[derive(Copy, Clone)]
pub struct RegisterState {
    gprs: libc::user_regs_struct,
    fprs: libc::user_fpregs_struct,
    debug: [u64; 8],
    undefined: u128,
}

impl RegisterState {
    pub fn new(
        gprs: libc::user_regs_struct,
        fprs: libc::user_fpregs_struct,
        debug: [u64; 8],
    ) -> RegisterState {
        RegisterState {
            gprs,
            fprs,
            debug,
            undefined: 0,
        }
    }

    pub fn empty() -> RegisterState {
        // Plain data; the all-zero bit pattern is a valid value for both
        // kernel register structs.
        RegisterState {
            gprs: unsafe { std::mem::zeroed() },
            fprs: unsafe { std::mem::zeroed() },
            debug: [0; 8],
            undefined: 0,
        }
    }

    pub fn gprs(&self) -> &libc::user_regs_struct {
        &self.gprs
    }

    pub fn fprs(&self) -> &libc::user_fpregs_struct {
        &self.fprs
    }

    pub fn debug_registers(&self) -> &[u64; 8] {
        &self.debug
    }

    pub fn program_counter(&self) -> VirtualAddress {
        VirtualAddress::new(self.gprs.rip)
    }

    pub fn stack_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.gprs.rsp)
    }

    pub fn frame_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.gprs.rbp)
    }

    pub fn with_program_counter(&self, pc: VirtualAddress) -> RegisterState {
        let mut next = *self;
        next.gprs.rip = pc.as_u64();
        next.undefined &= !(1u128 << register_by_name("rip").unwrap().index);
        next
    }

    pub fn with_stack_pointer(&self, sp: VirtualAddress) -> RegisterState {
        let mut next = *self;
        next.gprs.rsp = sp.as_u64();
        next
    }

    pub fn is_undefined(&self, spec: &RegisterSpec) -> bool {
        self.undefined & (1u128 << spec.index) != 0
    }

    /// A new state with `spec` marked undefined.
    pub fn with_undefined(&self, spec: &RegisterSpec) -> RegisterState {
        let mut next = *self;
        next.undefined |= 1u128 << spec.index;
        next
    }

    /// Read the typed value of a register.
    pub fn value(&self, spec: &RegisterSpec) -> RegisterValue {
        if self.is_undefined(spec) {
            return RegisterValue::Undefined;
        }
        match spec.storage {
            RegisterStorage::Gpr { slot_offset } => {
                let slot = self.gpr_slot(slot_offset);
                match (spec.size, spec.high_byte) {
                    (1, true) => RegisterValue::U8((slot >> 8) as u8),
                    (1, false) => RegisterValue::U8(slot as u8),
                    (2, _) => RegisterValue::U16(slot as u16),
                    (4, _) => RegisterValue::U32(slot as u32),
                    (8, _) => RegisterValue::U64(slot),
                    _ => unreachable!("register table holds no other GPR sizes"),
                }
            }
            RegisterStorage::Fpr { index } => RegisterValue::U128(self.fpr_slot(index)),
            RegisterStorage::Debug { index } => RegisterValue::U64(self.debug[index]),
        }
    }

    /// A new state with `spec` set to `value`, applying sub-register
    /// aliasing:
    /// - writing a 32-bit sub-GPR zero-extends into the 64-bit parent,
    /// - writing 16-bit or 8-bit-low views touches only those bits,
    /// - writing an 8-bit-high view touches bits 8..15,
    /// - writing a float to a 16-byte FPR slot fills the low bits and
    ///   zeroes the rest.
    pub fn with_value(&self, spec: &RegisterSpec, value: RegisterValue) -> Result<RegisterState> {
        if spec.is_read_only() {
            return Err(Error::invalid(format!("register {} is read-only", spec.name)));
        }
        let bits = value
            .to_bits()
            .ok_or_else(|| Error::invalid("cannot write an undefined value"))?;

        let fpr_float_special = matches!(spec.storage, RegisterStorage::Fpr { .. }) && value.is_float();
        if value.width() != spec.size && !fpr_float_special {
            return Err(Error::invalid(format!(
                "{}-byte value does not fit register {} ({} bytes)",
                value.width(),
                spec.name,
                spec.size
            )));
        }

        let mut next = *self;
        next.undefined &= !(1u128 << spec.index);
        match spec.storage {
            RegisterStorage::Gpr { slot_offset } => {
                let slot = next.gpr_slot(slot_offset);
                let merged = match (spec.size, spec.high_byte) {
                    (1, true) => (slot & !0xff00) | (((bits as u64) & 0xff) << 8),
                    (1, false) => (slot & !0xff) | ((bits as u64) & 0xff),
                    (2, _) => (slot & !0xffff) | ((bits as u64) & 0xffff),
                    // Hardware semantics: 32-bit writes clear the upper half.
                    (4, _) => bits as u32 as u64,
                    (8, _) => bits as u64,
                    _ => unreachable!("register table holds no other GPR sizes"),
                };
                next.set_gpr_slot(slot_offset, merged);
            }
            RegisterStorage::Fpr { index } => {
                next.set_fpr_slot(index, bits);
            }
            RegisterStorage::Debug { index } => {
                next.debug[index] = bits as u64;
            }
        }
        Ok(next)
    }

    /// Read the full backing 8-byte slot of a GPR spec, or the debug word.
    /// Used by the unwinder, which works in whole registers.
    pub fn canonical_u64(&self, spec: &RegisterSpec) -> Option<u64> {
        if self.is_undefined(spec) {
            return None;
        }
        match spec.storage {
            RegisterStorage::Gpr { slot_offset } => Some(self.gpr_slot(slot_offset)),
            RegisterStorage::Debug { index } => Some(self.debug[index]),
            RegisterStorage::Fpr { index } => Some(self.fpr_slot(index) as u64),
        }
    }

    fn gpr_slot(&self, slot_offset: usize) -> u64 {
        // Offsets come from offset_of! on the same struct type; every slot
        // is a naturally-aligned u64.
        unsafe {
            let base = &self.gprs as *const libc::user_regs_struct as *const u8;
            (base.add(slot_offset) as *const u64).read()
        }
    }

    fn set_gpr_slot(&mut self, slot_offset: usize, value: u64) {
        unsafe {
            let base = &mut self.gprs as *mut libc::user_regs_struct as *mut u8;
            (base.add(slot_offset) as *mut u64).write(value);
        }
    }

    fn fpr_slot(&self, index: usize) -> u128 {
        let words = &self.fprs.xmm_space[index * 4..index * 4 + 4];
        (words[0] as u128)
            | (words[1] as u128) << 32
            | (words[2] as u128) << 64
            | (words[3] as u128) << 96
    }

    fn set_fpr_slot(&mut self, index: usize, value: u128) {
        for (i, word) in self.fprs.xmm_space[index * 4..index * 4 + 4]
            .iter_mut()
            .enumerate()
        {
            *word = (value >> (32 * i)) as u32;
        }
    }
}

impl fmt::Debug for RegisterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RegisterState")
            .field("rip", &format_args!("{:#x}", self.gprs.rip))
            .field("rsp", &format_args!("{:#x}", self.gprs.rsp))
            .field("rbp", &format_args!("{:#x}", self.gprs.rbp))
            .field("undefined", &format_args!("{:#x}", self.undefined))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RegisterState {
        RegisterState::empty()
    }

    #[test]
    fn full_width_write_and_read() {
        let rax = register_by_name("rax").unwrap();
        let s = state().with_value(rax, RegisterValue::U64(0x1122334455667788)).unwrap();
        assert_eq!(s.value(rax), RegisterValue::U64(0x1122334455667788));
    }

    #[test]
    fn thirty_two_bit_write_zero_extends() {
        let rax = register_by_name("rax").unwrap();
        let eax = register_by_name("eax").unwrap();
        let s = state()
            .with_value(rax, RegisterValue::U64(0xffff_ffff_ffff_ffff))
            .unwrap()
            .with_value(eax, RegisterValue::U32(0x1234_5678))
            .unwrap();
        assert_eq!(s.value(rax), RegisterValue::U64(0x1234_5678));
    }

    #[test]
    fn high_byte_write_touches_bits_8_to_15() {
        let rax = register_by_name("rax").unwrap();
        let ah = register_by_name("ah").unwrap();
        let s = state()
            .with_value(rax, RegisterValue::U64(0xaaaa_aaaa_aaaa_aaaa))
            .unwrap()
            .with_value(ah, RegisterValue::U8(0x7f))
            .unwrap();
        assert_eq!(s.value(rax), RegisterValue::U64(0xaaaa_aaaa_aaaa_7faa));
        assert_eq!(s.value(ah), RegisterValue::U8(0x7f));
    }

    #[test]
    fn low_byte_and_word_writes_preserve_rest() {
        let rbx = register_by_name("rbx").unwrap();
        let bl = register_by_name("bl").unwrap();
        let bx = register_by_name("bx").unwrap();
        let s = state()
            .with_value(rbx, RegisterValue::U64(0x1111_1111_1111_1111))
            .unwrap()
            .with_value(bl, RegisterValue::U8(0xee))
            .unwrap();
        assert_eq!(s.value(rbx), RegisterValue::U64(0x1111_1111_1111_11ee));
        let s = s.with_value(bx, RegisterValue::U16(0xbeef)).unwrap();
        assert_eq!(s.value(rbx), RegisterValue::U64(0x1111_1111_1111_beef));
    }

    #[test]
    fn float_write_to_fpr_zeroes_high_bits() {
        let xmm0 = register_by_name("xmm0").unwrap();
        let s = state()
            .with_value(xmm0, RegisterValue::U128(u128::MAX))
            .unwrap()
            .with_value(xmm0, RegisterValue::F64(1.5))
            .unwrap();
        assert_eq!(
            s.value(xmm0),
            RegisterValue::U128(1.5f64.to_bits() as u128)
        );
    }

    #[test]
    fn width_mismatch_is_invalid() {
        let rax = register_by_name("rax").unwrap();
        assert!(state().with_value(rax, RegisterValue::U32(1)).is_err());
        let dr4 = register_by_name("dr4").unwrap();
        assert!(state().with_value(dr4, RegisterValue::U64(1)).is_err());
    }

    #[test]
    fn undefined_tracking() {
        let rbp = register_by_name("rbp").unwrap();
        let s = state().with_undefined(rbp);
        assert!(s.is_undefined(rbp));
        assert_eq!(s.value(rbp), RegisterValue::Undefined);
        assert_eq!(s.canonical_u64(rbp), None);
        let s = s.with_value(rbp, RegisterValue::U64(7)).unwrap();
        assert!(!s.is_undefined(rbp));
    }

    #[test]
    fn parse_forms() {
        assert_eq!(RegisterValue::parse("42").unwrap(), RegisterValue::U64(42));
        assert_eq!(
            RegisterValue::parse("0xff").unwrap(),
            RegisterValue::U64(255)
        );
        assert_eq!(
            RegisterValue::parse("i:-7").unwrap(),
            RegisterValue::I64(-7)
        );
        assert_eq!(
            RegisterValue::parse("f:1.5").unwrap(),
            RegisterValue::F32(1.5)
        );
        assert_eq!(
            RegisterValue::parse("d:2.25").unwrap(),
            RegisterValue::F64(2.25)
        );
        assert_eq!(
            RegisterValue::parse("0x1:0x2").unwrap(),
            RegisterValue::U128((1u128 << 64) | 2)
        );
        assert!(RegisterValue::parse("zzz").is_err());
    }
}
