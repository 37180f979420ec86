use std::fmt;
use std::ops::{Add, Sub};

/// An address in the tracee's virtual address space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

/// A file-space address inside an ELF image, before the load bias is
/// applied. Never dereferenced directly.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FileAddress(u64);

impl VirtualAddress {
    pub fn new(addr: u64) -> VirtualAddress {
        VirtualAddress(addr)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Remove an image's load bias, going back to file space.
    pub fn to_file_address(self, load_bias: u64) -> FileAddress {
        FileAddress(self.0.wrapping_sub(load_bias))
    }
}

impl FileAddress {
    pub fn new(addr: u64) -> FileAddress {
        FileAddress(addr)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn to_virtual(self, load_bias: u64) -> VirtualAddress {
        VirtualAddress(self.0.wrapping_add(load_bias))
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Display for FileAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = VirtualAddress;

    fn add(self, rhs: u64) -> VirtualAddress {
        VirtualAddress(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = VirtualAddress;

    fn sub(self, rhs: u64) -> VirtualAddress {
        VirtualAddress(self.0.wrapping_sub(rhs))
    }
}

impl Add<u64> for FileAddress {
    type Output = FileAddress;

    fn add(self, rhs: u64) -> FileAddress {
        FileAddress(self.0.wrapping_add(rhs))
    }
}

impl From<u64> for VirtualAddress {
    fn from(addr: u64) -> VirtualAddress {
        VirtualAddress(addr)
    }
}

impl From<u64> for FileAddress {
    fn from(addr: u64) -> FileAddress {
        FileAddress(addr)
    }
}

/// Half-open [low, high) address range.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AddressRange {
    pub low: FileAddress,
    pub high: FileAddress,
}

impl AddressRange {
    pub fn new(low: FileAddress, high: FileAddress) -> AddressRange {
        AddressRange { low, high }
    }

    pub fn contains(&self, addr: FileAddress) -> bool {
        self.low <= addr && addr < self.high
    }

    pub fn len(&self) -> u64 {
        self.high.as_u64().saturating_sub(self.low.as_u64())
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }
}

/// Ordered sequence of ranges, tested by containment.
#[derive(Clone, Debug, Default)]
pub struct AddressRanges {
    ranges: Vec<AddressRange>,
}

impl AddressRanges {
    pub fn new(mut ranges: Vec<AddressRange>) -> AddressRanges {
        ranges.sort_by_key(|r| r.low);
        AddressRanges { ranges }
    }

    pub fn contains(&self, addr: FileAddress) -> bool {
        self.ranges.iter().any(|r| r.contains(addr))
    }

    pub fn first(&self) -> Option<&AddressRange> {
        self.ranges.first()
    }

    pub fn last(&self) -> Option<&AddressRange> {
        self.ranges.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressRange> {
        self.ranges.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Lowest mapped address, if any range exists.
    pub fn low(&self) -> Option<FileAddress> {
        self.ranges.first().map(|r| r.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_containment_is_half_open() {
        let r = AddressRange::new(FileAddress::new(0x1000), FileAddress::new(0x1010));
        assert!(r.contains(FileAddress::new(0x1000)));
        assert!(r.contains(FileAddress::new(0x100f)));
        assert!(!r.contains(FileAddress::new(0x1010)));
        assert!(!r.contains(FileAddress::new(0xfff)));
    }

    #[test]
    fn ranges_are_ordered_and_searched() {
        let rs = AddressRanges::new(vec![
            AddressRange::new(FileAddress::new(0x2000), FileAddress::new(0x2008)),
            AddressRange::new(FileAddress::new(0x1000), FileAddress::new(0x1004)),
        ]);
        assert_eq!(rs.low(), Some(FileAddress::new(0x1000)));
        assert!(rs.contains(FileAddress::new(0x2007)));
        assert!(!rs.contains(FileAddress::new(0x1800)));
    }

    #[test]
    fn bias_round_trip() {
        let fa = FileAddress::new(0x1234);
        let va = fa.to_virtual(0x555500000000);
        assert_eq!(va.as_u64(), 0x555500001234);
        assert_eq!(va.to_file_address(0x555500000000), fa);
    }
}
