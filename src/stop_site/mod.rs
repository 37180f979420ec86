//! Ref-counted stop-site pool: software INT3 patches and hardware debug
//! registers behind one allocation surface.
//!
//! A *site* is one concrete placement in the tracee. The pool guarantees at
//! most one site per (address, type) key and keeps each site alive while
//! any user stop point or engine-internal operation still references it.

mod hardware;
mod software;

pub use hardware::{DebugRegisterSchedule, DebugRegisterSink, HARDWARE_SLOTS};
pub use software::INT3;

use crate::address::VirtualAddress;
use crate::error::{Error, Result};
use crate::memory::Memory;
use log::debug;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::cell::RefCell;

pub type StopSitePoolSharedPtr = Rc<RefCell<StopSitePool>>;

/// What kind of ptrace stop the engine decoded for a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrapKind {
    SingleStep,
    Software,
    Hardware,
    Syscall,
    Clone,
    Unknown,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StopSiteMode {
    Execute,
    Write,
    ReadWrite,
}

/// Full description of a site's mechanism: software sites are always
/// (Execute, 1); hardware sites may watch 1/2/4/8 bytes in any mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct StopSiteType {
    pub hardware: bool,
    pub mode: StopSiteMode,
    pub watch_size: usize,
}

impl StopSiteType {
    pub fn software_breakpoint() -> StopSiteType {
        StopSiteType {
            hardware: false,
            mode: StopSiteMode::Execute,
            watch_size: 1,
        }
    }

    pub fn hardware_breakpoint() -> StopSiteType {
        StopSiteType {
            hardware: true,
            mode: StopSiteMode::Execute,
            watch_size: 1,
        }
    }

    pub fn watchpoint(mode: StopSiteMode, watch_size: usize) -> StopSiteType {
        StopSiteType {
            hardware: true,
            mode,
            watch_size,
        }
    }

    fn validate(&self, addr: VirtualAddress) -> Result<()> {
        if !self.hardware {
            if self.mode != StopSiteMode::Execute || self.watch_size != 1 {
                return Err(Error::invalid(
                    "software stop sites must be execute mode with size 1",
                ));
            }
            return Ok(());
        }
        match self.watch_size {
            1 | 2 | 4 | 8 => {}
            other => {
                return Err(Error::invalid(format!(
                    "unsupported watch size {}",
                    other
                )))
            }
        }
        if self.mode == StopSiteMode::Execute && self.watch_size != 1 {
            return Err(Error::invalid("execute sites must have size 1"));
        }
        if addr.as_u64() % self.watch_size as u64 != 0 {
            return Err(Error::invalid(format!(
                "address {} is not aligned to watch size {}",
                addr, self.watch_size
            )));
        }
        Ok(())
    }
}

/// Unique identity of a site within the pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct StopSiteKey {
    pub address: VirtualAddress,
    pub site_type: StopSiteType,
}

enum SiteLocation {
    Software,
    Hardware { slot: usize },
}

struct SiteRecord {
    location: SiteLocation,
    refcount: usize,
}

/// Refcounted handle to a pooled site. Clones bump the count via
/// `StopSitePool::share`; `deallocate` gives the reference back.
#[derive(Debug)]
pub struct StopSiteHandle {
    key: StopSiteKey,
    pool: Weak<RefCell<StopSitePool>>,
}

impl StopSiteHandle {
    pub fn key(&self) -> StopSiteKey {
        self.key
    }

    pub fn address(&self) -> VirtualAddress {
        self.key.address
    }

    pub fn site_type(&self) -> StopSiteType {
        self.key.site_type
    }

    fn pool(&self) -> StopSitePoolSharedPtr {
        self.pool.upgrade().expect("stop-site pool outlives handles")
    }

    pub fn enable(&self) -> Result<()> {
        self.pool().borrow_mut().enable(&self.key)
    }

    pub fn disable(&self) -> Result<()> {
        self.pool().borrow_mut().disable(&self.key)
    }

    pub fn is_enabled(&self) -> bool {
        self.pool().borrow().is_enabled(&self.key)
    }

    /// Drop this reference; the last one disables and removes the site.
    pub fn deallocate(self) -> Result<()> {
        self.pool().borrow_mut().deallocate(&self.key)
    }
}

pub struct StopSitePool {
    memory: Rc<dyn Memory>,
    debug_sink: Rc<dyn DebugRegisterSink>,
    records: HashMap<StopSiteKey, SiteRecord>,
    software: software::SoftwareSitePool,
    hardware: hardware::HardwareSitePool,
    weak_self: Weak<RefCell<StopSitePool>>,
}

impl StopSitePool {
    pub fn new(
        memory: Rc<dyn Memory>,
        debug_sink: Rc<dyn DebugRegisterSink>,
    ) -> StopSitePoolSharedPtr {
        let pool = Rc::new(RefCell::new(StopSitePool {
            memory,
            debug_sink,
            records: HashMap::new(),
            software: Default::default(),
            hardware: Default::default(),
            weak_self: Weak::new(),
        }));
        pool.borrow_mut().weak_self = Rc::downgrade(&pool);
        pool
    }

    /// Allocate (or share) the site for (addr, type). The new site starts
    /// disabled.
    pub fn allocate(
        &mut self,
        addr: VirtualAddress,
        site_type: StopSiteType,
    ) -> Result<StopSiteHandle> {
        site_type.validate(addr)?;
        let key = StopSiteKey { address: addr, site_type };

        if let Some(record) = self.records.get_mut(&key) {
            record.refcount += 1;
            return Ok(self.handle(key));
        }

        let location = if site_type.hardware {
            let slot = self.hardware.insert(&*self.memory, addr, &site_type)?;
            SiteLocation::Hardware { slot }
        } else {
            self.software.insert(addr);
            SiteLocation::Software
        };
        debug!("allocated stop site {:?} at {}", site_type, addr);
        self.records.insert(key, SiteRecord {
            location,
            refcount: 1,
        });
        Ok(self.handle(key))
    }

    /// Bump the refcount of an existing site.
    pub fn share(&mut self, key: &StopSiteKey) -> Option<StopSiteHandle> {
        let record = self.records.get_mut(key)?;
        record.refcount += 1;
        Some(self.handle(*key))
    }

    fn handle(&self, key: StopSiteKey) -> StopSiteHandle {
        StopSiteHandle {
            key,
            pool: self.weak_self.clone(),
        }
    }

    pub fn enable(&mut self, key: &StopSiteKey) -> Result<()> {
        match self.location(key)? {
            SiteLocation::Software => self.software.enable(&*self.memory, key.address),
            SiteLocation::Hardware { slot } => {
                if self.hardware.set_enabled(slot, true) {
                    self.apply_schedule()?;
                }
                Ok(())
            }
        }
    }

    pub fn disable(&mut self, key: &StopSiteKey) -> Result<()> {
        match self.location(key)? {
            SiteLocation::Software => self.software.disable(&*self.memory, key.address),
            SiteLocation::Hardware { slot } => {
                if self.hardware.set_enabled(slot, false) {
                    self.apply_schedule()?;
                }
                Ok(())
            }
        }
    }

    pub fn is_enabled(&self, key: &StopSiteKey) -> bool {
        match self.records.get(key) {
            Some(SiteRecord {
                location: SiteLocation::Software,
                ..
            }) => self.software.is_enabled(key.address),
            Some(SiteRecord {
                location: SiteLocation::Hardware { slot },
                ..
            }) => self.hardware.is_enabled(*slot),
            None => false,
        }
    }

    pub fn contains(&self, key: &StopSiteKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn refcount(&self, key: &StopSiteKey) -> usize {
        self.records.get(key).map(|r| r.refcount).unwrap_or(0)
    }

    pub fn deallocate(&mut self, key: &StopSiteKey) -> Result<()> {
        let record = self
            .records
            .get_mut(key)
            .unwrap_or_else(|| panic!("deallocate of unknown stop site {:?}", key));
        // A count below zero cannot be represented; hitting zero twice is
        // the same logic error.
        record.refcount = record
            .refcount
            .checked_sub(1)
            .expect("stop-site refcount went negative");
        if record.refcount > 0 {
            return Ok(());
        }
        let location = self.records.remove(key).unwrap().location;
        match location {
            SiteLocation::Software => self.software.remove(&*self.memory, key.address)?,
            SiteLocation::Hardware { slot } => {
                let was_enabled = self.hardware.is_enabled(slot);
                self.hardware.remove(slot);
                if was_enabled {
                    self.apply_schedule()?;
                }
            }
        }
        debug!("released stop site at {}", key.address);
        Ok(())
    }

    /// All enabled sites placed exactly at `addr`.
    pub fn enabled_sites_at(&self, addr: VirtualAddress) -> Vec<StopSiteKey> {
        self.records
            .keys()
            .filter(|key| key.address == addr)
            .filter(|key| self.is_enabled(key))
            .copied()
            .collect()
    }

    /// Overlay enabled software sites' original bytes over a memory
    /// mirror; see the disassembler contract.
    pub fn replace_stop_site_bytes(&self, start: VirtualAddress, slice: &mut [u8]) {
        self.software.replace_stop_site_bytes(start, slice);
    }

    pub fn saved_software_byte(&self, addr: VirtualAddress) -> Option<u8> {
        self.software.saved_byte(addr)
    }

    /// Resolve which sites caused a trap.
    ///
    /// - Software traps leave the PC one byte past the INT3; the real PC is
    ///   pc−1 and the caller must reset the tracee PC to it.
    /// - Hardware traps name their slots in dr6's low bits and leave the PC
    ///   unchanged.
    pub fn list_triggered(
        &self,
        pc: VirtualAddress,
        trap_kind: TrapKind,
        dr6: u64,
    ) -> (VirtualAddress, Vec<StopSiteKey>) {
        match trap_kind {
            TrapKind::Software => {
                let real_pc = pc - 1;
                let sites: Vec<StopSiteKey> = self
                    .records
                    .keys()
                    .filter(|key| !key.site_type.hardware && key.address == real_pc)
                    .filter(|key| self.is_enabled(key))
                    .copied()
                    .collect();
                if sites.is_empty() {
                    (pc, sites)
                } else {
                    (real_pc, sites)
                }
            }
            TrapKind::Hardware => {
                let mut sites = Vec::new();
                for slot in self.hardware.triggered(dr6) {
                    if let Some(addr) = self.hardware.address_of(slot) {
                        sites.extend(
                            self.records
                                .keys()
                                .filter(|key| {
                                    key.site_type.hardware && key.address == addr
                                })
                                .copied(),
                        );
                    }
                }
                (pc, sites)
            }
            _ => (pc, Vec::new()),
        }
    }

    /// Refresh watch-data snapshots for the hardware slots named by dr6.
    pub fn refresh_triggered_watch_data(&mut self, dr6: u64) -> Result<()> {
        for slot in self.hardware.triggered(dr6) {
            self.hardware.refresh_watch_data(&*self.memory, slot)?;
        }
        Ok(())
    }

    /// Disable every site without touching refcounts. Used at shutdown so
    /// a detached process keeps its original bytes and debug registers.
    pub fn disable_all(&mut self) -> Result<()> {
        let keys: Vec<StopSiteKey> = self.records.keys().copied().collect();
        let mut first_error: Option<Error> = None;
        for key in keys {
            if let Err(e) = self.disable(&key) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The debug-register values every thread must carry right now. Used
    /// when a new thread appears and needs the current schedule mirrored.
    pub fn debug_register_schedule(&self) -> DebugRegisterSchedule {
        self.hardware.schedule()
    }

    fn apply_schedule(&self) -> Result<()> {
        self.debug_sink.apply(&self.hardware.schedule())
    }

    fn location(&self, key: &StopSiteKey) -> Result<SiteLocation> {
        match self.records.get(key) {
            Some(SiteRecord {
                location: SiteLocation::Software,
                ..
            }) => Ok(SiteLocation::Software),
            Some(SiteRecord {
                location: SiteLocation::Hardware { slot },
                ..
            }) => Ok(SiteLocation::Hardware { slot: *slot }),
            None => Err(Error::not_found(format!(
                "no stop site at {}",
                key.address
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;
    use std::cell::Cell;

    struct RecordingSink {
        applied: Cell<usize>,
        last: Cell<DebugRegisterSchedule>,
    }

    impl RecordingSink {
        fn new() -> Rc<RecordingSink> {
            Rc::new(RecordingSink {
                applied: Cell::new(0),
                last: Cell::new(DebugRegisterSchedule::default()),
            })
        }
    }

    impl DebugRegisterSink for RecordingSink {
        fn apply(&self, schedule: &DebugRegisterSchedule) -> Result<()> {
            self.applied.set(self.applied.get() + 1);
            self.last.set(*schedule);
            Ok(())
        }
    }

    fn pool_with_memory() -> (StopSitePoolSharedPtr, Rc<FakeMemory>, Rc<RecordingSink>) {
        let memory = Rc::new(FakeMemory::new());
        let sink = RecordingSink::new();
        let pool = StopSitePool::new(memory.clone(), sink.clone());
        (pool, memory, sink)
    }

    #[test]
    fn refcount_tracks_allocate_and_deallocate() {
        let (pool, _memory, _sink) = pool_with_memory();
        let key = {
            let mut p = pool.borrow_mut();
            let a = p
                .allocate(VirtualAddress::new(0x1000), StopSiteType::software_breakpoint())
                .unwrap();
            let key = a.key();
            assert_eq!(p.refcount(&key), 1);
            let b = p
                .allocate(VirtualAddress::new(0x1000), StopSiteType::software_breakpoint())
                .unwrap();
            assert_eq!(p.refcount(&key), 2);
            drop(a);
            drop(b);
            key
        };
        pool.borrow_mut().deallocate(&key).unwrap();
        assert!(pool.borrow().contains(&key));
        pool.borrow_mut().deallocate(&key).unwrap();
        assert!(!pool.borrow().contains(&key));
    }

    #[test]
    fn software_enable_swaps_int3_and_disable_restores() {
        let (pool, memory, _sink) = pool_with_memory();
        memory.preload(0x1000, &[0x55]);
        let mut p = pool.borrow_mut();
        let site = p
            .allocate(VirtualAddress::new(0x1000), StopSiteType::software_breakpoint())
            .unwrap();
        let key = site.key();
        drop(site);

        assert_eq!(memory.read_u8(VirtualAddress::new(0x1000)).unwrap(), 0x55);
        p.enable(&key).unwrap();
        assert_eq!(memory.read_u8(VirtualAddress::new(0x1000)).unwrap(), INT3);
        // Idempotent: a second enable must not capture the INT3 as the
        // original byte.
        p.enable(&key).unwrap();
        p.disable(&key).unwrap();
        assert_eq!(memory.read_u8(VirtualAddress::new(0x1000)).unwrap(), 0x55);
        p.disable(&key).unwrap();
        assert_eq!(memory.read_u8(VirtualAddress::new(0x1000)).unwrap(), 0x55);
    }

    #[test]
    fn overlay_restores_original_bytes() {
        let (pool, memory, _sink) = pool_with_memory();
        memory.preload(0x1000, &[0x90, 0x90, 0x90, 0x90]);
        let mut p = pool.borrow_mut();
        let key = p
            .allocate(VirtualAddress::new(0x1002), StopSiteType::software_breakpoint())
            .unwrap()
            .key();
        p.enable(&key).unwrap();

        let mut mirror = [0u8; 4];
        memory
            .read(VirtualAddress::new(0x1000), &mut mirror)
            .unwrap();
        assert_eq!(mirror, [0x90, 0x90, INT3, 0x90]);
        p.replace_stop_site_bytes(VirtualAddress::new(0x1000), &mut mirror);
        assert_eq!(mirror, [0x90, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn software_trap_resolves_at_pc_minus_one() {
        let (pool, memory, _sink) = pool_with_memory();
        memory.preload(0x1000, &[0x90]);
        let mut p = pool.borrow_mut();
        let key = p
            .allocate(VirtualAddress::new(0x1000), StopSiteType::software_breakpoint())
            .unwrap()
            .key();
        p.enable(&key).unwrap();

        let (pc, sites) = p.list_triggered(VirtualAddress::new(0x1001), TrapKind::Software, 0);
        assert_eq!(pc, VirtualAddress::new(0x1000));
        assert_eq!(sites, vec![key]);

        // No site behind the pc: report the pc untouched.
        let (pc, sites) = p.list_triggered(VirtualAddress::new(0x2001), TrapKind::Software, 0);
        assert_eq!(pc, VirtualAddress::new(0x2001));
        assert!(sites.is_empty());
    }

    #[test]
    fn hardware_allocation_reprograms_every_enable_transition() {
        let (pool, _memory, sink) = pool_with_memory();
        let mut p = pool.borrow_mut();
        let key = p
            .allocate(
                VirtualAddress::new(0x4000),
                StopSiteType::watchpoint(StopSiteMode::Write, 8),
            )
            .unwrap()
            .key();
        assert_eq!(sink.applied.get(), 0);
        p.enable(&key).unwrap();
        assert_eq!(sink.applied.get(), 1);
        assert_eq!(sink.last.get().dr[0], 0x4000);
        p.enable(&key).unwrap();
        assert_eq!(sink.applied.get(), 1);
        p.disable(&key).unwrap();
        assert_eq!(sink.applied.get(), 2);
        assert_eq!(sink.last.get(), DebugRegisterSchedule::default());
    }

    #[test]
    fn hardware_trap_resolution_uses_dr6() {
        let (pool, _memory, _sink) = pool_with_memory();
        let mut p = pool.borrow_mut();
        let key = p
            .allocate(
                VirtualAddress::new(0x4000),
                StopSiteType::watchpoint(StopSiteMode::ReadWrite, 4),
            )
            .unwrap()
            .key();
        p.enable(&key).unwrap();
        let (pc, sites) = p.list_triggered(VirtualAddress::new(0x7777), TrapKind::Hardware, 0b1);
        assert_eq!(pc, VirtualAddress::new(0x7777));
        assert_eq!(sites, vec![key]);
    }

    #[test]
    fn misaligned_watchpoints_are_rejected() {
        let (pool, _memory, _sink) = pool_with_memory();
        let err = pool
            .borrow_mut()
            .allocate(
                VirtualAddress::new(0x4001),
                StopSiteType::watchpoint(StopSiteMode::Write, 4),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn software_sites_must_be_execute_size_one() {
        let (pool, _memory, _sink) = pool_with_memory();
        let err = pool
            .borrow_mut()
            .allocate(
                VirtualAddress::new(0x4000),
                StopSiteType {
                    hardware: false,
                    mode: StopSiteMode::Write,
                    watch_size: 1,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
