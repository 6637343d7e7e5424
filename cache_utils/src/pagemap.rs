//! Virtual to physical translation through `/proc/self/pagemap`.

use crate::{PAGE_OFFSET_MASK, PAGE_SHIFT};
use core::hint::black_box;
use core::mem::size_of;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use thiserror::Error;

pub const PAGEMAP_PATH: &str = "/proc/self/pagemap";

#[derive(Debug, Error)]
pub enum PageMapError {
    #[error("failed to open {PAGEMAP_PATH}, are you running as root ? ({0})")]
    Open(#[source] io::Error),
    #[error("failed to read pagemap entry for {vaddr:#x}: {source}")]
    Read {
        vaddr: usize,
        #[source]
        source: io::Error,
    },
    #[error("short pagemap read for {vaddr:#x}: got {got} bytes")]
    ShortRead { vaddr: usize, got: usize },
    #[error("page at {vaddr:#x} is not present")]
    NotPresent { vaddr: usize },
    #[error("got PFN 0 from the pagemap for {vaddr:#x}, do you have CAP_SYS_ADMIN ?")]
    NoPermission { vaddr: usize },
}

/// An entry of the pagemap, one per virtual page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageMapEntry(pub u64);

impl PageMapEntry {
    const PFN_MASK: u64 = (1 << 54) - 1;

    pub fn present(&self) -> bool {
        self.0 & (1 << 63) != 0
    }

    pub fn frame_number(&self) -> u64 {
        self.0 & Self::PFN_MASK
    }

    /// Physical address of `vaddr` according to this entry.
    ///
    /// Without CAP_SYS_ADMIN the kernel reports present pages with a zero
    /// frame number, which is refused rather than translated.
    pub fn physical_address(&self, vaddr: usize) -> Result<usize, PageMapError> {
        if !self.present() {
            return Err(PageMapError::NotPresent { vaddr });
        }
        match self.frame_number() {
            0 => Err(PageMapError::NoPermission { vaddr }),
            pfn => Ok(((pfn as usize) << PAGE_SHIFT) | (vaddr & PAGE_OFFSET_MASK)),
        }
    }
}

pub trait VirtToPhys {
    fn translate(&self, vaddr: usize) -> Result<usize, PageMapError>;
}

#[derive(Debug)]
pub struct LinuxPageMap {
    file: File,
}

impl LinuxPageMap {
    /// Opens the pagemap and checks that frame numbers are readable, by
    /// translating a stack address.
    pub fn open() -> Result<Self, PageMapError> {
        let file = OpenOptions::new()
            .read(true)
            .open(PAGEMAP_PATH)
            .map_err(PageMapError::Open)?;
        let map = Self::from_file(file);
        let local = 0u64;
        map.translate(black_box(&local as *const u64 as usize))?;
        Ok(map)
    }

    pub fn from_file(file: File) -> Self {
        LinuxPageMap { file }
    }

    pub fn entry(&self, vaddr: usize) -> Result<PageMapEntry, PageMapError> {
        let offset = ((vaddr >> PAGE_SHIFT) * size_of::<u64>()) as u64;
        let mut data = [0u8; size_of::<u64>()];
        match self.file.read_at(&mut data, offset) {
            Ok(got) if got == size_of::<u64>() => Ok(PageMapEntry(u64::from_ne_bytes(data))),
            Ok(got) => Err(PageMapError::ShortRead { vaddr, got }),
            Err(source) => Err(PageMapError::Read { vaddr, source }),
        }
    }
}

impl VirtToPhys for LinuxPageMap {
    fn translate(&self, vaddr: usize) -> Result<usize, PageMapError> {
        let entry = self.entry(vaddr)?;
        entry.physical_address(vaddr)
    }
}
