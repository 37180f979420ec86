//! User-facing stop points: breakpoints and watchpoints.
//!
//! A *point* owns a resolver and a site type; resolution turns it into a
//! set of pooled stop sites. Points are re-resolved whenever the loaded
//! image set changes.

use crate::address::VirtualAddress;
use crate::dwarf::DwarfData;
use crate::error::{Error, Result};
use crate::loaded_elves::LoadedElves;
use crate::stop_site::{
    StopSiteHandle, StopSiteKey, StopSiteMode, StopSitePoolSharedPtr, StopSiteType,
};
use log::debug;
use std::path::PathBuf;

/// Turns a symbolic target into the current list of virtual addresses.
#[derive(Clone, Debug)]
pub enum Resolver {
    /// Fixed addresses, kept sorted and de-duplicated.
    Address(Vec<VirtualAddress>),
    /// Body-start of every function definition with this name.
    FunctionName(String),
    /// Every line-table entry matching (path, line).
    Line { path: PathBuf, line: u64 },
}

impl Resolver {
    pub fn addresses(mut addrs: Vec<VirtualAddress>) -> Resolver {
        addrs.sort();
        addrs.dedup();
        Resolver::Address(addrs)
    }

    pub fn resolve_addresses(&self, elves: &LoadedElves) -> Result<Vec<VirtualAddress>> {
        let mut out = match self {
            Resolver::Address(addrs) => addrs.clone(),
            Resolver::FunctionName(name) => resolve_function(elves, name)?,
            Resolver::Line { path, line } => resolve_line(elves, path, *line)?,
        };
        out.sort();
        out.dedup();
        Ok(out)
    }
}

/// Body-start addresses for `name`: skip each definition's prologue via
/// the line table, resolve inlined copies to their entry, and fall back to
/// ELF symbols for images without DWARF.
fn resolve_function(elves: &LoadedElves, name: &str) -> Result<Vec<VirtualAddress>> {
    let mut out = Vec::new();
    for elf in elves.iter() {
        match &elf.dwarf {
            Some(dwarf) if dwarf.has_units() => {
                for die_ref in dwarf.function_definitions_named(name) {
                    let die = dwarf.die(die_ref);
                    if let Some(low) = die.ranges.low() {
                        out.push(elf.to_virtual(function_body_address(dwarf, low)));
                    }
                }
                for die_ref in dwarf.inlined_subroutines_named(name) {
                    // Inlined bodies have no prologue; the entry point is
                    // the stop address.
                    if let Some(low) = dwarf.die(die_ref).ranges.low() {
                        out.push(elf.to_virtual(low));
                    }
                }
            }
            _ => {
                for sym in elf.image.symbols_named(name) {
                    if let Some(range) = sym.address_range() {
                        out.push(elf.to_virtual(range.low));
                    }
                }
            }
        }
    }
    if out.is_empty() {
        return Err(Error::not_found(format!("no function named {:?}", name)));
    }
    Ok(out)
}

/// The address right past a function's prologue: the line entry at the
/// function's low pc is the prologue marker; its successor starts the
/// body.
fn function_body_address(
    dwarf: &DwarfData,
    low: crate::address::FileAddress,
) -> crate::address::FileAddress {
    dwarf
        .line_entry_at(low)
        .and_then(|entry| dwarf.next_line_entry(entry))
        .map(|next| dwarf.line_entry(next).address)
        .unwrap_or(low)
}

fn resolve_line(elves: &LoadedElves, path: &PathBuf, line: u64) -> Result<Vec<VirtualAddress>> {
    let mut out = Vec::new();
    for elf in elves.iter() {
        let dwarf = match &elf.dwarf {
            Some(dwarf) if dwarf.has_units() => dwarf,
            _ => continue,
        };
        for entry_ref in dwarf.line_entries_by_line(path, line) {
            let mut addr = dwarf.line_entry(entry_ref).address;
            // A match on the prologue marker moves to the function body.
            if let Some(function) = dwarf.function_definition_containing(addr) {
                if dwarf.die(function).ranges.low() == Some(addr) {
                    addr = function_body_address(dwarf, addr);
                }
            }
            out.push(elf.to_virtual(addr));
        }
    }
    if out.is_empty() {
        return Err(Error::not_found(format!(
            "no line entry for {}:{}",
            path.display(),
            line
        )));
    }
    Ok(out)
}

/// Whether a point traps execution or data access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopPointKind {
    Breakpoint,
    Watchpoint,
}

pub type StopPointId = u32;

pub struct StopPoint {
    pub id: StopPointId,
    pub kind: StopPointKind,
    resolver: Resolver,
    site_type: StopSiteType,
    enabled: bool,
    sites: Vec<StopSiteHandle>,
}

impl StopPoint {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn site_type(&self) -> StopSiteType {
        self.site_type
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn addresses(&self) -> Vec<VirtualAddress> {
        self.sites.iter().map(|s| s.address()).collect()
    }

    pub fn references_site(&self, key: &StopSiteKey) -> bool {
        self.sites.iter().any(|s| s.key() == *key)
    }

    /// Reconcile the resolver's current address set with the held sites:
    /// keep the intersection, release removed ones, allocate new ones
    /// (enabled iff the point is enabled).
    pub fn resolve_stop_sites(
        &mut self,
        elves: &LoadedElves,
        pool: &StopSitePoolSharedPtr,
    ) -> Result<()> {
        let resolved = self.resolver.resolve_addresses(elves)?;

        let mut kept = Vec::new();
        for site in self.sites.drain(..) {
            if resolved.contains(&site.address()) {
                kept.push(site);
            } else {
                site.deallocate()?;
            }
        }

        for addr in resolved {
            if kept.iter().any(|s| s.address() == addr) {
                continue;
            }
            let handle = pool.borrow_mut().allocate(addr, self.site_type)?;
            if self.enabled {
                handle.enable()?;
            }
            kept.push(handle);
        }
        kept.sort_by_key(|s| s.address());
        self.sites = kept;
        Ok(())
    }

    pub fn enable(&mut self) -> Result<()> {
        self.enabled = true;
        for site in &self.sites {
            site.enable()?;
        }
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        self.enabled = false;
        for site in &self.sites {
            site.disable()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        for site in self.sites.drain(..) {
            site.deallocate()?;
        }
        Ok(())
    }
}

/// All user stop points, split into breakpoints (execute, size 1) and
/// watchpoints (hardware, any mode).
pub struct StopPointSet {
    pool: StopSitePoolSharedPtr,
    points: Vec<StopPoint>,
    next_id: StopPointId,
}

impl StopPointSet {
    pub fn new(pool: StopSitePoolSharedPtr) -> StopPointSet {
        StopPointSet {
            pool,
            points: Vec::new(),
            next_id: 1,
        }
    }

    /// Install a breakpoint; software by default, hardware on request.
    pub fn add_breakpoint(
        &mut self,
        resolver: Resolver,
        hardware: bool,
        elves: &LoadedElves,
    ) -> Result<StopPointId> {
        let site_type = if hardware {
            StopSiteType::hardware_breakpoint()
        } else {
            StopSiteType::software_breakpoint()
        };
        self.add_point(StopPointKind::Breakpoint, resolver, site_type, elves)
    }

    /// Install a data watchpoint. Watchpoints are hardware-only.
    pub fn add_watchpoint(
        &mut self,
        addr: VirtualAddress,
        mode: StopSiteMode,
        watch_size: usize,
        elves: &LoadedElves,
    ) -> Result<StopPointId> {
        if mode == StopSiteMode::Execute && watch_size != 1 {
            return Err(Error::invalid("execute watchpoints must have size 1"));
        }
        self.add_point(
            StopPointKind::Watchpoint,
            Resolver::addresses(vec![addr]),
            StopSiteType::watchpoint(mode, watch_size),
            elves,
        )
    }

    fn add_point(
        &mut self,
        kind: StopPointKind,
        resolver: Resolver,
        site_type: StopSiteType,
        elves: &LoadedElves,
    ) -> Result<StopPointId> {
        let id = self.next_id;
        let mut point = StopPoint {
            id,
            kind,
            resolver,
            site_type,
            enabled: true,
            sites: Vec::new(),
        };
        point.resolve_stop_sites(elves, &self.pool)?;
        debug!(
            "stop point {} resolved to {} site(s)",
            id,
            point.sites.len()
        );
        self.next_id += 1;
        self.points.push(point);
        Ok(id)
    }

    pub fn remove(&mut self, id: StopPointId) -> Result<()> {
        let index = self
            .points
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::not_found(format!("no stop point {}", id)))?;
        let mut point = self.points.remove(index);
        point.clear()
    }

    pub fn enable(&mut self, id: StopPointId) -> Result<()> {
        self.point_mut(id)?.enable()
    }

    pub fn disable(&mut self, id: StopPointId) -> Result<()> {
        self.point_mut(id)?.disable()
    }

    pub fn get(&self, id: StopPointId) -> Option<&StopPoint> {
        self.points.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StopPoint> {
        self.points.iter()
    }

    /// Re-resolve every point; called after shared-library changes.
    /// Resolution failures on individual points are tolerated (a library
    /// owning the symbol may have been unloaded).
    pub fn resolve_all(&mut self, elves: &LoadedElves) {
        for point in &mut self.points {
            if let Err(e) = point.resolve_stop_sites(elves, &self.pool) {
                debug!("stop point {} currently unresolvable: {}", point.id, e);
            }
        }
    }

    /// Points referencing any of the triggered sites.
    pub fn points_for_sites(&self, sites: &[StopSiteKey]) -> Vec<StopPointId> {
        self.points
            .iter()
            .filter(|p| sites.iter().any(|key| p.references_site(key)))
            .map(|p| p.id)
            .collect()
    }

    fn point_mut(&mut self, id: StopPointId) -> Result<&mut StopPoint> {
        self.points
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::not_found(format!("no stop point {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::ElfImage;
    use crate::memory::testing::FakeMemory;
    use crate::memory::Memory;
    use crate::stop_site::{DebugRegisterSchedule, DebugRegisterSink, StopSitePool};
    use std::path::Path;
    use std::rc::Rc;

    struct NullSink;

    impl DebugRegisterSink for NullSink {
        fn apply(&self, _schedule: &DebugRegisterSchedule) -> Result<()> {
            Ok(())
        }
    }

    fn fixture() -> (StopPointSet, LoadedElves, Rc<FakeMemory>) {
        let memory = Rc::new(FakeMemory::new());
        let pool = StopSitePool::new(memory.clone(), Rc::new(NullSink));
        let image = ElfImage::from_file(Path::new("/proc/self/exe")).unwrap();
        let elves = LoadedElves::new(crate::loaded_elves::LoadedElf::without_debug_info(
            "self".into(),
            image,
            0,
            true,
        ));
        (StopPointSet::new(pool), elves, memory)
    }

    #[test]
    fn address_breakpoints_resolve_and_patch() {
        let (mut set, elves, memory) = fixture();
        memory.preload(0x5000, &[0x90]);
        let id = set
            .add_breakpoint(
                Resolver::addresses(vec![VirtualAddress::new(0x5000)]),
                false,
                &elves,
            )
            .unwrap();
        assert_eq!(
            memory.read_u8(VirtualAddress::new(0x5000)).unwrap(),
            crate::stop_site::INT3
        );
        let point = set.get(id).unwrap();
        assert_eq!(point.addresses(), vec![VirtualAddress::new(0x5000)]);
        set.remove(id).unwrap();
        assert_eq!(memory.read_u8(VirtualAddress::new(0x5000)).unwrap(), 0x90);
    }

    #[test]
    fn disabled_points_leave_memory_untouched() {
        let (mut set, elves, memory) = fixture();
        memory.preload(0x5000, &[0x90]);
        let id = set
            .add_breakpoint(
                Resolver::addresses(vec![VirtualAddress::new(0x5000)]),
                false,
                &elves,
            )
            .unwrap();
        set.disable(id).unwrap();
        assert_eq!(memory.read_u8(VirtualAddress::new(0x5000)).unwrap(), 0x90);
        set.enable(id).unwrap();
        assert_eq!(
            memory.read_u8(VirtualAddress::new(0x5000)).unwrap(),
            crate::stop_site::INT3
        );
    }

    #[test]
    fn points_share_pooled_sites() {
        let (mut set, elves, memory) = fixture();
        memory.preload(0x5000, &[0x90]);
        let a = set
            .add_breakpoint(
                Resolver::addresses(vec![VirtualAddress::new(0x5000)]),
                false,
                &elves,
            )
            .unwrap();
        let b = set
            .add_breakpoint(
                Resolver::addresses(vec![VirtualAddress::new(0x5000)]),
                false,
                &elves,
            )
            .unwrap();
        set.remove(a).unwrap();
        // The site survives while the second point references it.
        assert_eq!(
            memory.read_u8(VirtualAddress::new(0x5000)).unwrap(),
            crate::stop_site::INT3
        );
        set.remove(b).unwrap();
        assert_eq!(memory.read_u8(VirtualAddress::new(0x5000)).unwrap(), 0x90);
    }

    #[test]
    fn unknown_function_is_not_found() {
        let (mut set, elves, _memory) = fixture();
        let err = set
            .add_breakpoint(
                Resolver::FunctionName("surely_not_a_real_function_name".into()),
                false,
                &elves,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn watchpoints_reject_bad_shapes() {
        let (mut set, elves, _memory) = fixture();
        let err = set
            .add_watchpoint(VirtualAddress::new(0x5000), StopSiteMode::Execute, 4, &elves)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn triggered_sites_map_back_to_points() {
        let (mut set, elves, memory) = fixture();
        memory.preload(0x5000, &[0x90]);
        let id = set
            .add_breakpoint(
                Resolver::addresses(vec![VirtualAddress::new(0x5000)]),
                false,
                &elves,
            )
            .unwrap();
        let key = StopSiteKey {
            address: VirtualAddress::new(0x5000),
            site_type: StopSiteType::software_breakpoint(),
        };
        assert_eq!(set.points_for_sites(&[key]), vec![id]);
        assert!(set.points_for_sites(&[]).is_empty());
    }
}
