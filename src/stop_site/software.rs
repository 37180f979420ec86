//! Software stop sites: one INT3 patch per virtual address.

use crate::address::VirtualAddress;
use crate::error::Result;
use crate::memory::Memory;
use std::collections::HashMap;

pub const INT3: u8 = 0xcc;

struct SoftwareSite {
    enabled: bool,
    /// The instruction byte the INT3 replaced; only meaningful while
    /// enabled.
    saved_byte: u8,
}

/// INT3 patching sub-pool. Refcounting lives in the dispatching pool; this
/// layer only owns the byte swaps.
#[derive(Default)]
pub(super) struct SoftwareSitePool {
    sites: HashMap<VirtualAddress, SoftwareSite>,
}

impl SoftwareSitePool {
    pub fn insert(&mut self, addr: VirtualAddress) {
        self.sites.entry(addr).or_insert(SoftwareSite {
            enabled: false,
            saved_byte: 0,
        });
    }

    pub fn remove(&mut self, memory: &dyn Memory, addr: VirtualAddress) -> Result<()> {
        self.disable(memory, addr)?;
        self.sites.remove(&addr);
        Ok(())
    }

    pub fn enable(&mut self, memory: &dyn Memory, addr: VirtualAddress) -> Result<()> {
        let site = match self.sites.get_mut(&addr) {
            Some(site) => site,
            None => return Ok(()),
        };
        if site.enabled {
            return Ok(());
        }
        let original = memory.read_u8(addr)?;
        memory.write(addr, &[INT3])?;
        site.saved_byte = original;
        site.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self, memory: &dyn Memory, addr: VirtualAddress) -> Result<()> {
        let site = match self.sites.get_mut(&addr) {
            Some(site) => site,
            None => return Ok(()),
        };
        if !site.enabled {
            return Ok(());
        }
        memory.write(addr, &[site.saved_byte])?;
        site.enabled = false;
        Ok(())
    }

    pub fn is_enabled(&self, addr: VirtualAddress) -> bool {
        self.sites.get(&addr).map(|s| s.enabled).unwrap_or(false)
    }

    pub fn saved_byte(&self, addr: VirtualAddress) -> Option<u8> {
        self.sites
            .get(&addr)
            .filter(|s| s.enabled)
            .map(|s| s.saved_byte)
    }

    /// Overlay the original instruction bytes over `slice`, which mirrors
    /// tracee memory starting at `start`. Lets the disassembler show real
    /// instructions instead of INT3 patches.
    pub fn replace_stop_site_bytes(&self, start: VirtualAddress, slice: &mut [u8]) {
        for (addr, site) in &self.sites {
            if !site.enabled {
                continue;
            }
            let offset = addr.as_u64().wrapping_sub(start.as_u64());
            if (offset as usize) < slice.len() {
                slice[offset as usize] = site.saved_byte;
            }
        }
    }
}
