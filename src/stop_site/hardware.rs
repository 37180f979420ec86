//! Hardware stop sites: dr0–dr3 scheduling plus the dr7 control word.

use crate::address::VirtualAddress;
use crate::error::{Error, Result};
use crate::memory::Memory;
use bit_field::BitField;

use super::{StopSiteMode, StopSiteType};

pub const HARDWARE_SLOTS: usize = 4;

/// The values every thread's debug registers must hold.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DebugRegisterSchedule {
    pub dr: [u64; HARDWARE_SLOTS],
    pub dr7: u64,
}

/// Writes a schedule into the kernel's per-thread debug registers. The
/// process engine implements this over its thread set; tests record the
/// applied values.
pub trait DebugRegisterSink {
    fn apply(&self, schedule: &DebugRegisterSchedule) -> Result<()>;
}

struct HardwareSite {
    addr: VirtualAddress,
    mode: StopSiteMode,
    watch_size: usize,
    enabled: bool,
    /// Last two observed values of the watched bytes.
    previous_data: u64,
    current_data: u64,
}

#[derive(Default)]
pub(super) struct HardwareSitePool {
    slots: [Option<HardwareSite>; HARDWARE_SLOTS],
}

impl HardwareSitePool {
    /// Claim a free debug-register slot. All four in use is an argument
    /// error surfaced to the user.
    pub fn insert(
        &mut self,
        memory: &dyn Memory,
        addr: VirtualAddress,
        site_type: &StopSiteType,
    ) -> Result<usize> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| Error::invalid("all four hardware stop-site slots are in use"))?;
        let snapshot = if site_type.mode == StopSiteMode::Execute {
            0
        } else {
            read_watched(memory, addr, site_type.watch_size)?
        };
        self.slots[slot] = Some(HardwareSite {
            addr,
            mode: site_type.mode,
            watch_size: site_type.watch_size,
            enabled: false,
            previous_data: snapshot,
            current_data: snapshot,
        });
        Ok(slot)
    }

    pub fn remove(&mut self, slot: usize) {
        self.slots[slot] = None;
    }

    pub fn set_enabled(&mut self, slot: usize, enabled: bool) -> bool {
        match &mut self.slots[slot] {
            Some(site) if site.enabled != enabled => {
                site.enabled = enabled;
                true
            }
            _ => false,
        }
    }

    pub fn is_enabled(&self, slot: usize) -> bool {
        self.slots[slot].as_ref().map(|s| s.enabled).unwrap_or(false)
    }

    pub fn address_of(&self, slot: usize) -> Option<VirtualAddress> {
        self.slots[slot].as_ref().map(|s| s.addr)
    }

    /// dr0–dr3 plus the dr7 control word for the current slot contents.
    ///
    /// dr7 layout per the SDM: bit 2i = local enable for slot i, bits
    /// 16+4i..=17+4i = condition (00 execute, 01 write, 11 read/write),
    /// bits 18+4i..=19+4i = length (00 1B, 01 2B, 11 4B, 10 8B).
    pub fn schedule(&self) -> DebugRegisterSchedule {
        let mut schedule = DebugRegisterSchedule::default();
        for (i, slot) in self.slots.iter().enumerate() {
            let site = match slot {
                Some(site) if site.enabled => site,
                _ => continue,
            };
            schedule.dr[i] = site.addr.as_u64();
            schedule.dr7.set_bit(2 * i, true);
            let condition: u64 = match site.mode {
                StopSiteMode::Execute => 0b00,
                StopSiteMode::Write => 0b01,
                StopSiteMode::ReadWrite => 0b11,
            };
            let length: u64 = match site.watch_size {
                1 => 0b00,
                2 => 0b01,
                4 => 0b11,
                8 => 0b10,
                _ => unreachable!("watch sizes are validated at allocation"),
            };
            schedule.dr7.set_bits(16 + 4 * i..=17 + 4 * i, condition);
            schedule.dr7.set_bits(18 + 4 * i..=19 + 4 * i, length);
        }
        schedule
    }

    /// Slots named responsible by the dr6 status word's low bits.
    pub fn triggered(&self, dr6: u64) -> Vec<usize> {
        (0..HARDWARE_SLOTS)
            .filter(|&i| dr6.get_bit(i))
            .filter(|&i| self.slots[i].is_some())
            .collect()
    }

    /// Roll the data snapshot of a watch site forward after a hit.
    pub fn refresh_watch_data(&mut self, memory: &dyn Memory, slot: usize) -> Result<()> {
        if let Some(site) = &mut self.slots[slot] {
            if site.mode != StopSiteMode::Execute {
                site.previous_data = site.current_data;
                site.current_data = read_watched(memory, site.addr, site.watch_size)?;
            }
        }
        Ok(())
    }

    pub fn watch_data(&self, slot: usize) -> Option<(u64, u64)> {
        self.slots[slot]
            .as_ref()
            .map(|s| (s.previous_data, s.current_data))
    }
}

fn read_watched(memory: &dyn Memory, addr: VirtualAddress, size: usize) -> Result<u64> {
    let mut buf = [0u8; 8];
    memory.read(addr, &mut buf[..size])?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;

    fn watch_type(mode: StopSiteMode, size: usize) -> StopSiteType {
        StopSiteType {
            hardware: true,
            mode,
            watch_size: size,
        }
    }

    #[test]
    fn dr7_encoding_matches_the_sdm_layout() {
        let memory = FakeMemory::new();
        let mut pool = HardwareSitePool::default();
        let slot = pool
            .insert(
                &memory,
                VirtualAddress::new(0x1000),
                &watch_type(StopSiteMode::ReadWrite, 8),
            )
            .unwrap();
        assert_eq!(slot, 0);
        pool.set_enabled(slot, true);
        let schedule = pool.schedule();
        assert_eq!(schedule.dr[0], 0x1000);
        // local enable
        assert!(schedule.dr7.get_bit(0));
        // condition read/write
        assert_eq!(schedule.dr7.get_bits(16..=17), 0b11);
        // length 8 bytes
        assert_eq!(schedule.dr7.get_bits(18..=19), 0b10);
    }

    #[test]
    fn disabled_slots_vanish_from_the_schedule() {
        let memory = FakeMemory::new();
        let mut pool = HardwareSitePool::default();
        let slot = pool
            .insert(
                &memory,
                VirtualAddress::new(0x2000),
                &watch_type(StopSiteMode::Execute, 1),
            )
            .unwrap();
        pool.set_enabled(slot, true);
        assert_ne!(pool.schedule().dr7, 0);
        pool.set_enabled(slot, false);
        assert_eq!(pool.schedule(), DebugRegisterSchedule::default());
    }

    #[test]
    fn four_slots_then_exhaustion() {
        let memory = FakeMemory::new();
        let mut pool = HardwareSitePool::default();
        for i in 0..4 {
            pool.insert(
                &memory,
                VirtualAddress::new(0x1000 + i * 8),
                &watch_type(StopSiteMode::Write, 1),
            )
            .unwrap();
        }
        let err = pool
            .insert(
                &memory,
                VirtualAddress::new(0x5000),
                &watch_type(StopSiteMode::Write, 1),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn dr6_low_bits_identify_slots() {
        let memory = FakeMemory::new();
        let mut pool = HardwareSitePool::default();
        let a = pool
            .insert(
                &memory,
                VirtualAddress::new(0x1000),
                &watch_type(StopSiteMode::Write, 1),
            )
            .unwrap();
        let b = pool
            .insert(
                &memory,
                VirtualAddress::new(0x2000),
                &watch_type(StopSiteMode::Write, 1),
            )
            .unwrap();
        pool.set_enabled(a, true);
        pool.set_enabled(b, true);
        assert_eq!(pool.triggered(0b01), vec![0]);
        assert_eq!(pool.triggered(0b10), vec![1]);
        assert_eq!(pool.triggered(0b11), vec![0, 1]);
    }

    #[test]
    fn watch_data_rolls_forward() {
        let memory = FakeMemory::new();
        memory.preload(0x1000, &[0x11]);
        let mut pool = HardwareSitePool::default();
        let slot = pool
            .insert(
                &memory,
                VirtualAddress::new(0x1000),
                &watch_type(StopSiteMode::ReadWrite, 1),
            )
            .unwrap();
        assert_eq!(pool.watch_data(slot), Some((0x11, 0x11)));
        memory.preload(0x1000, &[0x22]);
        pool.refresh_watch_data(&memory, slot).unwrap();
        assert_eq!(pool.watch_data(slot), Some((0x11, 0x22)));
    }
}
