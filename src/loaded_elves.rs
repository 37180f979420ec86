//! Registry of the ELF images mapped into the tracee: the executable, the
//! shared libraries the dynamic linker reports, and the vDSO.
//!
//! The dynamic-linker rendezvous protocol drives membership: the
//! executable's DT_DEBUG slot points at `r_debug`, whose `link_map` chain
//! is re-read at every notify trap.

use crate::address::{FileAddress, VirtualAddress};
use crate::dwarf::DwarfData;
use crate::elf::ElfImage;
use crate::error::{Error, Result};
use crate::memory::{read_c_string, Memory};
use log::{debug, warn};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::convert::TryInto;
use std::path::Path;

const AT_PHDR: u64 = 3;
const AT_ENTRY: u64 = 9;
const AT_SYSINFO_EHDR: u64 = 33;

const VDSO_MARKER: &str = "vdso";
const LINK_MAP_WALK_LIMIT: usize = 512;

/// One mapped image with its runtime placement and debug info.
pub struct LoadedElf {
    pub name: String,
    pub image: ElfImage,
    pub load_bias: u64,
    pub dwarf: Option<DwarfData>,
    pub is_executable: bool,
    pub is_vdso: bool,
    /// Virtual-space span of the image's allocated sections.
    span: Option<(u64, u64)>,
}

impl LoadedElf {
    pub fn new(
        name: String,
        image: ElfImage,
        load_bias: u64,
        is_executable: bool,
        is_vdso: bool,
    ) -> LoadedElf {
        let dwarf = match DwarfData::load(&image) {
            Ok(dwarf) => Some(dwarf),
            Err(e) => {
                warn!("no usable debug info for {}: {}", name, e);
                None
            }
        };
        let span = image
            .allocated_span()
            .map(|(low, high)| (low + load_bias, high + load_bias));
        LoadedElf {
            name,
            image,
            load_bias,
            dwarf,
            is_executable,
            is_vdso,
            span,
        }
    }

    /// An image registered without touching its debug sections. Useful
    /// when the caller knows the image is stripped.
    pub fn without_debug_info(
        name: String,
        image: ElfImage,
        load_bias: u64,
        is_executable: bool,
    ) -> LoadedElf {
        let span = image
            .allocated_span()
            .map(|(low, high)| (low + load_bias, high + load_bias));
        LoadedElf {
            name,
            image,
            load_bias,
            dwarf: None,
            is_executable,
            is_vdso: false,
            span,
        }
    }

    pub fn to_virtual(&self, fa: FileAddress) -> VirtualAddress {
        fa.to_virtual(self.load_bias)
    }

    pub fn to_file_address(&self, va: VirtualAddress) -> FileAddress {
        va.to_file_address(self.load_bias)
    }

    pub fn contains(&self, va: VirtualAddress) -> bool {
        match self.span {
            Some((low, high)) => low <= va.as_u64() && va.as_u64() < high,
            None => false,
        }
    }

    pub fn entry_point(&self) -> VirtualAddress {
        self.to_virtual(self.image.entry_point())
    }
}

/// Raw `r_debug` contents.
#[derive(Copy, Clone, Debug)]
pub struct RDebug {
    pub version: i32,
    pub map_head: VirtualAddress,
    pub notify_address: VirtualAddress,
    pub state: i32,
    pub linker_base: u64,
}

/// One decoded `link_map` entry.
#[derive(Clone, Debug)]
pub struct LinkMapEntry {
    pub load_address: u64,
    pub name: String,
    pub dynamic_address: VirtualAddress,
}

/// Reads of the rendezvous structures, independent of registry state.
pub struct Rendezvous {
    /// Virtual address of the DT_DEBUG value slot in the executable's
    /// `.dynamic` section.
    debug_slot: VirtualAddress,
}

impl Rendezvous {
    pub fn new(executable: &LoadedElf) -> Result<Rendezvous> {
        let slot = executable
            .image
            .debug_slot()
            .ok_or_else(|| Error::not_found("executable has no DT_DEBUG entry"))?;
        Ok(Rendezvous {
            debug_slot: executable.to_virtual(slot),
        })
    }

    /// Read `r_debug`, failing with the transient error while the linker
    /// has not stored the pointer yet.
    pub fn read_r_debug(&self, memory: &dyn Memory) -> Result<RDebug> {
        let r_debug_addr = memory.read_u64(self.debug_slot)?;
        if r_debug_addr == 0 {
            return Err(Error::RendezvousAddressNotFound);
        }
        let base = VirtualAddress::new(r_debug_addr);
        let version = memory.read_u64(base)? as u32 as i32;
        let map_head = memory.read_u64(base + 8)?;
        let notify = memory.read_u64(base + 16)?;
        let state = memory.read_u64(base + 24)? as u32 as i32;
        let linker_base = memory.read_u64(base + 32)?;
        if version != 1 && version != 2 {
            return Err(Error::decode(format!(
                "unsupported r_debug version {}",
                version
            )));
        }
        Ok(RDebug {
            version,
            map_head: VirtualAddress::new(map_head),
            notify_address: VirtualAddress::new(notify),
            state,
            linker_base,
        })
    }

    /// Walk the `link_map` chain.
    pub fn read_link_map(&self, memory: &dyn Memory) -> Result<Vec<LinkMapEntry>> {
        let r_debug = self.read_r_debug(memory)?;
        let mut entries = Vec::new();
        let mut cursor = r_debug.map_head;
        let mut walked = 0;
        while !cursor.is_null() {
            if walked >= LINK_MAP_WALK_LIMIT {
                return Err(Error::decode("link_map chain does not terminate"));
            }
            walked += 1;

            let load_address = memory.read_u64(cursor)?;
            let name_ptr = memory.read_u64(cursor + 8)?;
            let dynamic_address = memory.read_u64(cursor + 16)?;
            let next = memory.read_u64(cursor + 24)?;

            let name = if name_ptr == 0 {
                String::new()
            } else {
                read_c_string(memory, VirtualAddress::new(name_ptr))?
            };
            entries.push(LinkMapEntry {
                load_address,
                name,
                dynamic_address: VirtualAddress::new(dynamic_address),
            });
            cursor = VirtualAddress::new(next);
        }
        Ok(entries)
    }
}

/// The set of currently mapped images. Always contains the executable.
pub struct LoadedElves {
    elves: Vec<LoadedElf>,
}

impl LoadedElves {
    pub fn new(executable: LoadedElf) -> LoadedElves {
        LoadedElves {
            elves: vec![executable],
        }
    }

    pub fn executable(&self) -> &LoadedElf {
        &self.elves[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedElf> {
        self.elves.iter()
    }

    pub fn len(&self) -> usize {
        self.elves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elves.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<&LoadedElf> {
        self.elves.iter().find(|e| e.name == name)
    }

    /// Image containing a virtual address, with the file-space equivalent.
    pub fn find_by_virtual_address(
        &self,
        va: VirtualAddress,
    ) -> Option<(&LoadedElf, FileAddress)> {
        self.elves
            .iter()
            .find(|e| e.contains(va))
            .map(|e| (e, e.to_file_address(va)))
    }

    /// Reconcile with the linker's current chain. Returns true when any
    /// image was added or removed.
    pub fn sync_with_link_map(
        &mut self,
        memory: &dyn Memory,
        entries: &[LinkMapEntry],
    ) -> Result<bool> {
        let mut changed = false;

        let mut wanted: HashMap<&str, &LinkMapEntry> = HashMap::new();
        for entry in entries {
            // The empty-name entry is the executable itself, already
            // pinned at index 0.
            if entry.name.is_empty() {
                continue;
            }
            wanted.insert(entry.name.as_str(), entry);
        }

        let before = self.elves.len();
        self.elves
            .retain(|e| e.is_executable || wanted.contains_key(e.name.as_str()));
        changed |= self.elves.len() != before;

        for (name, entry) in wanted {
            if self.by_name(name).is_some() {
                continue;
            }
            match self.materialize(memory, entry) {
                Ok(elf) => {
                    debug!("shared library loaded: {} @ {:#x}", name, entry.load_address);
                    self.elves.push(elf);
                    changed = true;
                }
                Err(e) => {
                    warn!("cannot load image for {}: {}", name, e);
                }
            }
        }
        Ok(changed)
    }

    fn materialize(&self, memory: &dyn Memory, entry: &LinkMapEntry) -> Result<LoadedElf> {
        if entry.name.contains(VDSO_MARKER) {
            // The vDSO has no on-disk file; pull its bytes out of the
            // tracee's mapping.
            let bytes =
                read_elf_bytes_from_memory(memory, VirtualAddress::new(entry.load_address))?;
            let image = ElfImage::from_bytes(bytes, None)?;
            return Ok(LoadedElf::new(
                entry.name.clone(),
                image,
                entry.load_address,
                false,
                true,
            ));
        }
        let image = ElfImage::from_file(Path::new(&entry.name))?;
        Ok(LoadedElf::new(
            entry.name.clone(),
            image,
            entry.load_address,
            false,
            false,
        ))
    }
}

/// Parse `/proc/<pid>/auxv` into tag → value.
pub fn read_auxv(pid: Pid) -> Result<HashMap<u64, u64>> {
    let bytes = std::fs::read(format!("/proc/{}/auxv", pid))
        .map_err(|e| Error::io(format!("read /proc/{}/auxv", pid), e))?;
    let mut map = HashMap::new();
    for pair in bytes.chunks_exact(16) {
        let tag = u64::from_le_bytes(pair[..8].try_into().unwrap());
        let value = u64::from_le_bytes(pair[8..].try_into().unwrap());
        if tag == 0 {
            break;
        }
        map.insert(tag, value);
    }
    Ok(map)
}

/// Runtime entry point from the auxiliary vector; with the ELF's own entry
/// this yields the executable's load bias.
pub fn executable_load_bias(pid: Pid, image: &ElfImage) -> Result<u64> {
    let auxv = read_auxv(pid)?;
    let runtime_entry = auxv
        .get(&AT_ENTRY)
        .copied()
        .or_else(|| auxv.get(&AT_PHDR).copied())
        .ok_or_else(|| Error::decode("auxv carries no AT_ENTRY"))?;
    Ok(runtime_entry.wrapping_sub(image.entry_point().as_u64()))
}

pub fn vdso_base(pid: Pid) -> Result<Option<VirtualAddress>> {
    let auxv = read_auxv(pid)?;
    Ok(auxv
        .get(&AT_SYSINFO_EHDR)
        .map(|&addr| VirtualAddress::new(addr)))
}

/// Read a whole ELF image out of tracee memory, sized from its own
/// header tables.
pub fn read_elf_bytes_from_memory(
    memory: &dyn Memory,
    base: VirtualAddress,
) -> Result<Vec<u8>> {
    let header = memory.read_vec(base, 64)?;
    if header[..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(Error::decode(format!("no ELF magic at {}", base)));
    }
    let e_shoff = u64::from_le_bytes(header[0x28..0x30].try_into().unwrap());
    let e_shentsize = u16::from_le_bytes(header[0x3a..0x3c].try_into().unwrap()) as u64;
    let e_shnum = u16::from_le_bytes(header[0x3c..0x3e].try_into().unwrap()) as u64;
    let e_phoff = u64::from_le_bytes(header[0x20..0x28].try_into().unwrap());
    let e_phentsize = u16::from_le_bytes(header[0x36..0x38].try_into().unwrap()) as u64;
    let e_phnum = u16::from_le_bytes(header[0x38..0x3a].try_into().unwrap()) as u64;

    let mut total = 64u64;
    total = total.max(e_shoff + e_shentsize * e_shnum);
    total = total.max(e_phoff + e_phentsize * e_phnum);

    // Section payloads normally precede the section header table, but be
    // generous and scan the program headers for the real file extent.
    let phdrs = memory.read_vec(base + e_phoff, (e_phentsize * e_phnum) as usize)?;
    for ph in phdrs.chunks_exact(e_phentsize as usize) {
        let p_offset = u64::from_le_bytes(ph[0x08..0x10].try_into().unwrap());
        let p_filesz = u64::from_le_bytes(ph[0x20..0x28].try_into().unwrap());
        total = total.max(p_offset + p_filesz);
    }

    if total > 16 * 1024 * 1024 {
        return Err(Error::decode(format!(
            "in-memory ELF at {} is implausibly large ({} bytes)",
            base, total
        )));
    }
    memory.read_vec(base, total as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;

    fn image() -> ElfImage {
        ElfImage::from_file(Path::new("/proc/self/exe")).unwrap()
    }

    #[test]
    fn registry_always_keeps_the_executable() {
        let exe = LoadedElf::without_debug_info("main".into(), image(), 0, true);
        let mut elves = LoadedElves::new(exe);
        let memory = FakeMemory::new();
        // A link map that names nothing still leaves the executable.
        let changed = elves.sync_with_link_map(&memory, &[]).unwrap();
        assert!(!changed);
        assert_eq!(elves.len(), 1);
        assert!(elves.executable().is_executable);
    }

    #[test]
    fn r_debug_rejects_unpopulated_slot() {
        let exe = LoadedElf::without_debug_info("main".into(), image(), 0, true);
        if exe.image.debug_slot().is_none() {
            // Statically linked test runner; the protocol does not apply.
            return;
        }
        let rendezvous = Rendezvous::new(&exe).unwrap();
        let memory = FakeMemory::new();
        let err = rendezvous.read_r_debug(&memory).unwrap_err();
        assert!(err.is_transient_rendezvous());
    }

    #[test]
    fn link_map_walk_decodes_entries() {
        let exe = LoadedElf::without_debug_info("main".into(), image(), 0, true);
        let slot = match exe.image.debug_slot() {
            Some(slot) => exe.to_virtual(slot),
            None => return,
        };
        let rendezvous = Rendezvous::new(&exe).unwrap();

        let memory = FakeMemory::new();
        // r_debug at 0x10000, one link_map node at 0x20000 naming a lib.
        memory.write_u64(slot, 0x10000).unwrap();
        memory.write_u64(VirtualAddress::new(0x10000), 1).unwrap();
        memory
            .write_u64(VirtualAddress::new(0x10008), 0x20000)
            .unwrap();
        memory
            .write_u64(VirtualAddress::new(0x10010), 0xdead)
            .unwrap();
        memory.write_u64(VirtualAddress::new(0x10018), 0).unwrap();
        memory.write_u64(VirtualAddress::new(0x10020), 0).unwrap();

        memory
            .write_u64(VirtualAddress::new(0x20000), 0x7f00_0000)
            .unwrap();
        memory
            .write_u64(VirtualAddress::new(0x20008), 0x30000)
            .unwrap();
        memory
            .write_u64(VirtualAddress::new(0x20010), 0x7f00_1000)
            .unwrap();
        memory.write_u64(VirtualAddress::new(0x20018), 0).unwrap();
        memory.write(VirtualAddress::new(0x30000), b"libdemo.so\0").unwrap();

        let r_debug = rendezvous.read_r_debug(&memory).unwrap();
        assert_eq!(r_debug.notify_address, VirtualAddress::new(0xdead));
        let entries = rendezvous.read_link_map(&memory).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "libdemo.so");
        assert_eq!(entries[0].load_address, 0x7f00_0000);
    }
}
