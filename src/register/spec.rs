//! The register spec registry: one entry per addressable register name,
//! including sub-registers that alias a backing 8-byte GPR slot or a
//! 16-byte FPR slot.
//!
//! The table is the single source of truth; it is expanded once into an
//! immutable registry at first use.

use lazy_static::lazy_static;
use memoffset::offset_of;
use std::collections::HashMap;

/// Which register file a spec lives in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RegisterClass {
    Gpr,
    Fpr,
    Debug,
}

/// Where a register's bytes live inside the snapshot owned by
/// `RegisterState`.
#[derive(Copy, Clone, Debug)]
pub enum RegisterStorage {
    /// Byte offset of the backing 8-byte slot inside
    /// `libc::user_regs_struct`.
    Gpr { slot_offset: usize },
    /// Index of the backing 16-byte slot in `xmm_space`.
    Fpr { index: usize },
    /// dr0..dr7. Indices 4 and 5 are reserved and read-only.
    Debug { index: usize },
}

/// Typed description of one addressable register.
#[derive(Clone, Debug)]
pub struct RegisterSpec {
    pub name: &'static str,
    /// DWARF register number, -1 when the register has none.
    pub dwarf_id: i16,
    /// Size in bytes of the addressable view (1, 2, 4, 8 or 16).
    pub size: usize,
    pub class: RegisterClass,
    pub storage: RegisterStorage,
    /// ah/bh/ch/dh: the view covers bits 8..15 of the backing slot.
    pub high_byte: bool,
    /// Stable index into the registry; used for undefined-value tracking.
    pub index: usize,
}

impl RegisterSpec {
    pub fn is_debug(&self) -> bool {
        self.class == RegisterClass::Debug
    }

    /// dr4 and dr5 are aliases for dr6/dr7 on some hardware and must not be
    /// written through the user area.
    pub fn is_read_only(&self) -> bool {
        matches!(self.storage, RegisterStorage::Debug { index: 4 } | RegisterStorage::Debug { index: 5 })
    }
}

macro_rules! gpr {
    ($list:ident, $name:expr, $dwarf:expr, $size:expr, $field:ident) => {
        gpr!($list, $name, $dwarf, $size, $field, false)
    };
    ($list:ident, $name:expr, $dwarf:expr, $size:expr, $field:ident, $high:expr) => {
        $list.push(RegisterSpec {
            name: $name,
            dwarf_id: $dwarf,
            size: $size,
            class: RegisterClass::Gpr,
            storage: RegisterStorage::Gpr {
                slot_offset: offset_of!(libc::user_regs_struct, $field),
            },
            high_byte: $high,
            index: 0,
        });
    };
}

macro_rules! sub_gprs {
    ($list:ident, $field:ident, $e:expr, $w:expr, $b:expr) => {
        gpr!($list, $e, -1, 4, $field);
        gpr!($list, $w, -1, 2, $field);
        gpr!($list, $b, -1, 1, $field);
    };
}

fn build_registry() -> Vec<RegisterSpec> {
    let mut list: Vec<RegisterSpec> = Vec::with_capacity(112);

    // 64-bit general purpose registers, DWARF numbering per the SysV psABI.
    gpr!(list, "rax", 0, 8, rax);
    gpr!(list, "rdx", 1, 8, rdx);
    gpr!(list, "rcx", 2, 8, rcx);
    gpr!(list, "rbx", 3, 8, rbx);
    gpr!(list, "rsi", 4, 8, rsi);
    gpr!(list, "rdi", 5, 8, rdi);
    gpr!(list, "rbp", 6, 8, rbp);
    gpr!(list, "rsp", 7, 8, rsp);
    gpr!(list, "r8", 8, 8, r8);
    gpr!(list, "r9", 9, 8, r9);
    gpr!(list, "r10", 10, 8, r10);
    gpr!(list, "r11", 11, 8, r11);
    gpr!(list, "r12", 12, 8, r12);
    gpr!(list, "r13", 13, 8, r13);
    gpr!(list, "r14", 14, 8, r14);
    gpr!(list, "r15", 15, 8, r15);
    gpr!(list, "rip", 16, 8, rip);
    gpr!(list, "eflags", 49, 8, eflags);
    gpr!(list, "es", 50, 8, es);
    gpr!(list, "cs", 51, 8, cs);
    gpr!(list, "ss", 52, 8, ss);
    gpr!(list, "ds", 53, 8, ds);
    gpr!(list, "fs", 54, 8, fs);
    gpr!(list, "gs", 55, 8, gs);
    gpr!(list, "fs_base", 58, 8, fs_base);
    gpr!(list, "gs_base", 59, 8, gs_base);
    // ptrace's view of the syscall number; no DWARF id.
    gpr!(list, "orig_rax", -1, 8, orig_rax);

    // 32/16/8-bit aliases of the GPR slots.
    sub_gprs!(list, rax, "eax", "ax", "al");
    sub_gprs!(list, rdx, "edx", "dx", "dl");
    sub_gprs!(list, rcx, "ecx", "cx", "cl");
    sub_gprs!(list, rbx, "ebx", "bx", "bl");
    sub_gprs!(list, rsi, "esi", "si", "sil");
    sub_gprs!(list, rdi, "edi", "di", "dil");
    sub_gprs!(list, rbp, "ebp", "bp", "bpl");
    sub_gprs!(list, rsp, "esp", "sp", "spl");
    sub_gprs!(list, r8, "r8d", "r8w", "r8b");
    sub_gprs!(list, r9, "r9d", "r9w", "r9b");
    sub_gprs!(list, r10, "r10d", "r10w", "r10b");
    sub_gprs!(list, r11, "r11d", "r11w", "r11b");
    sub_gprs!(list, r12, "r12d", "r12w", "r12b");
    sub_gprs!(list, r13, "r13d", "r13w", "r13b");
    sub_gprs!(list, r14, "r14d", "r14w", "r14b");
    sub_gprs!(list, r15, "r15d", "r15w", "r15b");

    // 8-bit high views of the four legacy slots.
    gpr!(list, "ah", -1, 1, rax, true);
    gpr!(list, "dh", -1, 1, rdx, true);
    gpr!(list, "ch", -1, 1, rcx, true);
    gpr!(list, "bh", -1, 1, rbx, true);

    // SSE registers, 16 bytes each, DWARF 17..32.
    for i in 0..16usize {
        list.push(RegisterSpec {
            name: XMM_NAMES[i],
            dwarf_id: 17 + i as i16,
            size: 16,
            class: RegisterClass::Fpr,
            storage: RegisterStorage::Fpr { index: i },
            high_byte: false,
            index: 0,
        });
    }

    // Debug registers.
    for i in 0..8usize {
        list.push(RegisterSpec {
            name: DR_NAMES[i],
            dwarf_id: -1,
            size: 8,
            class: RegisterClass::Debug,
            storage: RegisterStorage::Debug { index: i },
            high_byte: false,
            index: 0,
        });
    }

    for (i, spec) in list.iter_mut().enumerate() {
        spec.index = i;
    }
    list
}

static XMM_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

static DR_NAMES: [&str; 8] = ["dr0", "dr1", "dr2", "dr3", "dr4", "dr5", "dr6", "dr7"];

lazy_static! {
    static ref REGISTRY: Vec<RegisterSpec> = build_registry();
    static ref BY_NAME: HashMap<&'static str, usize> = REGISTRY
        .iter()
        .map(|spec| (spec.name, spec.index))
        .collect();
    static ref BY_DWARF: HashMap<i16, usize> = REGISTRY
        .iter()
        .filter(|spec| spec.dwarf_id >= 0)
        .map(|spec| (spec.dwarf_id, spec.index))
        .collect();
}

pub fn all_registers() -> &'static [RegisterSpec] {
    &REGISTRY
}

pub fn register_by_name(name: &str) -> Option<&'static RegisterSpec> {
    BY_NAME.get(name).map(|&i| &REGISTRY[i])
}

pub fn register_by_dwarf_id(id: i16) -> Option<&'static RegisterSpec> {
    BY_DWARF.get(&id).map(|&i| &REGISTRY[i])
}

pub fn register_by_index(index: usize) -> &'static RegisterSpec {
    &REGISTRY[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookups() {
        let rax = register_by_name("rax").unwrap();
        assert_eq!(rax.dwarf_id, 0);
        assert_eq!(rax.size, 8);
        assert_eq!(register_by_dwarf_id(16).unwrap().name, "rip");
        assert_eq!(register_by_dwarf_id(7).unwrap().name, "rsp");
        assert!(register_by_name("xyzzy").is_none());
    }

    #[test]
    fn sub_registers_share_slots() {
        let rax = register_by_name("rax").unwrap();
        let eax = register_by_name("eax").unwrap();
        let ah = register_by_name("ah").unwrap();
        let (a, b, c) = match (rax.storage, eax.storage, ah.storage) {
            (
                RegisterStorage::Gpr { slot_offset: a },
                RegisterStorage::Gpr { slot_offset: b },
                RegisterStorage::Gpr { slot_offset: c },
            ) => (a, b, c),
            _ => panic!("gpr storage expected"),
        };
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(ah.high_byte);
        assert_eq!(eax.size, 4);
    }

    #[test]
    fn dr4_and_dr5_are_read_only() {
        assert!(register_by_name("dr4").unwrap().is_read_only());
        assert!(register_by_name("dr5").unwrap().is_read_only());
        assert!(!register_by_name("dr7").unwrap().is_read_only());
    }
}
