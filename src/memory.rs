//! Byte-level access to the tracee's virtual address space.

use crate::address::VirtualAddress;
use crate::error::{Error, Result};
use crate::tracer::Tracer;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

/// Read/write seam between the engine and tracee memory. The production
/// implementation is [`VirtualMemory`]; tests substitute an in-memory fake.
pub trait Memory {
    fn read(&self, addr: VirtualAddress, buf: &mut [u8]) -> Result<()>;
    fn write(&self, addr: VirtualAddress, bytes: &[u8]) -> Result<()>;

    fn read_u64(&self, addr: VirtualAddress) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, addr: VirtualAddress, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn read_u8(&self, addr: VirtualAddress) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_vec(&self, addr: VirtualAddress, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }
}

const C_STRING_CHUNK: usize = 64;
const C_STRING_LIMIT: usize = 4096;

/// Read a zero-terminated string out of tracee memory. Missing terminators
/// within the limit are decode errors (the rendezvous link_map contract
/// requires one).
pub fn read_c_string(memory: &dyn Memory, addr: VirtualAddress) -> Result<String> {
    let mut collected: Vec<u8> = Vec::new();
    let mut cursor = addr;
    while collected.len() < C_STRING_LIMIT {
        let mut chunk = [0u8; C_STRING_CHUNK];
        memory.read(cursor, &mut chunk)?;
        match memchr::memchr(0, &chunk) {
            Some(nul) => {
                collected.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&collected).into_owned());
            }
            None => {
                collected.extend_from_slice(&chunk);
                cursor = cursor + C_STRING_CHUNK as u64;
            }
        }
    }
    Err(Error::decode(format!(
        "C string at {} has no terminator within {} bytes",
        addr, C_STRING_LIMIT
    )))
}

/// `/proc/<pid>/mem`-backed memory access, with a ptrace word fallback for
/// kernels that reject writes through procfs.
pub struct VirtualMemory {
    pid: Pid,
    mem: RefCell<Option<File>>,
}

impl VirtualMemory {
    pub fn new(pid: Pid) -> VirtualMemory {
        VirtualMemory {
            pid,
            mem: RefCell::new(None),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> std::io::Result<T>) -> Result<T> {
        let mut slot = self.mem.borrow_mut();
        if slot.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(format!("/proc/{}/mem", self.pid))
                .map_err(|e| Error::io(format!("open /proc/{}/mem", self.pid), e))?;
            *slot = Some(file);
        }
        f(slot.as_ref().unwrap()).map_err(|e| {
            if e.raw_os_error() == Some(libc::ESRCH) {
                Error::ProcessExited {
                    pid: self.pid.as_raw(),
                }
            } else {
                Error::io(format!("/proc/{}/mem access", self.pid), e)
            }
        })
    }

    fn write_words_fallback(&self, addr: VirtualAddress, bytes: &[u8]) -> Result<()> {
        let tracer = Tracer::new(self.pid);
        let word = std::mem::size_of::<u64>() as u64;
        let mut start = addr.as_u64() & !(word - 1);
        let end = addr.as_u64() + bytes.len() as u64;
        while start < end {
            let mut buf = tracer.peek_data(VirtualAddress::new(start))?.to_le_bytes();
            for (i, slot) in buf.iter_mut().enumerate() {
                let va = start + i as u64;
                if va >= addr.as_u64() && va < end {
                    *slot = bytes[(va - addr.as_u64()) as usize];
                }
            }
            tracer.poke_data(VirtualAddress::new(start), u64::from_le_bytes(buf))?;
            start += word;
        }
        Ok(())
    }
}

impl Memory for VirtualMemory {
    fn read(&self, addr: VirtualAddress, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.with_file(|file| file.read_exact_at(buf, addr.as_u64()))
    }

    fn write(&self, addr: VirtualAddress, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let direct = self.with_file(|file| file.write_all_at(bytes, addr.as_u64()));
        match direct {
            Ok(()) => Ok(()),
            Err(Error::ProcessExited { pid }) => Err(Error::ProcessExited { pid }),
            Err(_) => self.write_words_fallback(addr, bytes),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Sparse in-memory address space for unit tests.
    #[derive(Default)]
    pub struct FakeMemory {
        bytes: RefCell<HashMap<u64, u8>>,
    }

    impl FakeMemory {
        pub fn new() -> FakeMemory {
            FakeMemory::default()
        }

        pub fn preload(&self, addr: u64, bytes: &[u8]) {
            let mut map = self.bytes.borrow_mut();
            for (i, b) in bytes.iter().enumerate() {
                map.insert(addr + i as u64, *b);
            }
        }
    }

    impl Memory for FakeMemory {
        fn read(&self, addr: VirtualAddress, buf: &mut [u8]) -> Result<()> {
            let map = self.bytes.borrow();
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = *map.get(&(addr.as_u64() + i as u64)).unwrap_or(&0);
            }
            Ok(())
        }

        fn write(&self, addr: VirtualAddress, bytes: &[u8]) -> Result<()> {
            let mut map = self.bytes.borrow_mut();
            for (i, b) in bytes.iter().enumerate() {
                map.insert(addr.as_u64() + i as u64, *b);
            }
            Ok(())
        }
    }

    #[test]
    fn c_string_reads_stop_at_nul() {
        let mem = FakeMemory::new();
        mem.preload(0x1000, b"libmeow.so\0garbage");
        let s = read_c_string(&mem, VirtualAddress::new(0x1000)).unwrap();
        assert_eq!(s, "libmeow.so");
    }
}
