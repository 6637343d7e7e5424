use crate::Error;
use cache_utils::mmap::MMappedMemory;
use cache_utils::pagemap::{LinuxPageMap, PageMapEntry, PageMapError, VirtToPhys};
use cache_utils::{
    page_align_down, physical_memory_size, PAGE_LEN, PAGE_OFFSET_MASK, PAGE_SHIFT,
};
use core::fmt;
use core::mem::size_of;
use core::ptr;
use log::info;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPage {
    pub virtual_address: usize,
    pub physical_address: usize,
}

/// A large populated mapping and the physical address of each of its pages,
/// captured once when the space is built.
pub struct AddressSpace {
    memory: MMappedMemory,
    translator: Box<dyn VirtToPhys>,
    pages: Vec<PhysicalPage>,
}

impl AddressSpace {
    /// Maps `fraction` of the physical memory and translates every page through
    /// the pagemap. Fails if the pagemap does not expose frame numbers.
    pub fn setup(fraction: f64) -> Result<AddressSpace, Error> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(Error::InvalidFraction(fraction));
        }
        let total = physical_memory_size().map_err(Error::MemorySize)?;
        let size = page_align_down((total as f64 * fraction) as usize);
        info!("mem_size (MB): {}", size >> 20);

        let translator = LinuxPageMap::open()?;
        let memory = MMappedMemory::try_new(size, true)
            .map_err(|source| Error::Allocation { size, source })?;
        AddressSpace::new(memory, Box::new(translator))
    }

    /// Touches every page of `memory` so it is backed, then records its translation.
    pub fn new(
        memory: MMappedMemory,
        translator: Box<dyn VirtToPhys>,
    ) -> Result<AddressSpace, Error> {
        let base = memory.as_ptr() as usize;
        let num_pages = memory.len() / PAGE_LEN;
        let mut pages = Vec::with_capacity(num_pages);
        for i in 0..num_pages {
            let vaddr = base + i * PAGE_LEN;
            unsafe { ptr::write_volatile(vaddr as *mut usize, 0) };
            let paddr = translator.translate(vaddr)?;
            pages.push(PhysicalPage {
                virtual_address: vaddr,
                physical_address: paddr,
            });
        }
        info!("allocation complete.");
        Ok(AddressSpace {
            memory,
            translator,
            pages,
        })
    }

    /// A space of `frames.len()` pages whose physical frame numbers are made up.
    pub fn synthetic(frames: Vec<u64>) -> Result<(AddressSpace, SyntheticPageMap), Error> {
        let size = frames.len() * PAGE_LEN;
        let memory = MMappedMemory::try_new(size, true)
            .map_err(|source| Error::Allocation { size, source })?;
        let map = SyntheticPageMap::new(memory.as_ptr() as usize, frames);
        let space = AddressSpace::new(memory, Box::new(map.clone()))?;
        Ok((space, map))
    }

    pub fn pages(&self) -> &[PhysicalPage] {
        &self.pages
    }

    /// Number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }

    pub fn contains(&self, vaddr: usize) -> bool {
        self.memory.contains(vaddr)
    }

    pub fn page_index(&self, vaddr: usize) -> Option<usize> {
        if self.contains(vaddr) {
            Some((vaddr - self.memory.as_ptr() as usize) >> PAGE_SHIFT)
        } else {
            None
        }
    }

    /// Physical address from the table captured at setup.
    pub fn physical_address(&self, vaddr: usize) -> Option<usize> {
        self.page_index(vaddr)
            .map(|i| self.pages[i].physical_address | (vaddr & PAGE_OFFSET_MASK))
    }

    /// Physical address as the translator reports it now.
    pub fn translate(&self, vaddr: usize) -> Result<usize, Error> {
        Ok(self.translator.translate(vaddr)?)
    }

    /// Checks that `vaddr` is still backed by the frame captured at setup.
    pub fn verify(&self, vaddr: usize) -> Result<(), Error> {
        let expected = self
            .physical_address(vaddr)
            .ok_or(Error::InvalidMember(vaddr))?;
        let found = self.translate(vaddr)?;
        if found != expected {
            return Err(Error::Relocated {
                vaddr,
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Pointer to the word at `vaddr`, if it is aligned and the whole word lies in
    /// one page of the space.
    pub(crate) fn word_ptr(&self, vaddr: usize) -> Option<*mut usize> {
        let aligned = vaddr % size_of::<usize>() == 0;
        let in_page = (vaddr & PAGE_OFFSET_MASK) <= PAGE_LEN - size_of::<usize>();
        if aligned && in_page && self.contains(vaddr) {
            Some(vaddr as *mut usize)
        } else {
            None
        }
    }

    pub fn read_word(&self, vaddr: usize) -> Option<usize> {
        self.word_ptr(vaddr)
            .map(|p| unsafe { ptr::read_volatile(p as *const usize) })
    }

    /// A non zero word means a live chain owns this location.
    pub fn is_claimed(&self, vaddr: usize) -> bool {
        self.read_word(vaddr).is_some_and(|w| w != 0)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("base", &self.memory.as_ptr())
            .field("size", &self.size())
            .field("pages", &self.pages.len())
            .finish()
    }
}

/// Fabricated pagemap over a mapping starting at `base`, for tests and dry runs.
///
/// Clones share the same table, so a test can keep one to revoke or move pages
/// after the space has taken ownership of the other.
#[derive(Debug, Clone)]
pub struct SyntheticPageMap {
    base: usize,
    entries: Rc<RefCell<Vec<PageMapEntry>>>,
}

const PRESENT: u64 = 1 << 63;

impl SyntheticPageMap {
    pub fn new(base: usize, frames: Vec<u64>) -> Self {
        let entries = frames.into_iter().map(|f| PageMapEntry(PRESENT | f)).collect();
        SyntheticPageMap {
            base,
            entries: Rc::new(RefCell::new(entries)),
        }
    }

    fn index(&self, vaddr: usize) -> Option<usize> {
        let i = vaddr.checked_sub(self.base)? >> PAGE_SHIFT;
        if i < self.entries.borrow().len() {
            Some(i)
        } else {
            None
        }
    }

    /// Clears the present bit, as if the page had been reclaimed.
    pub fn clear_present(&self, vaddr: usize) {
        if let Some(i) = self.index(vaddr) {
            let mut entries = self.entries.borrow_mut();
            entries[i] = PageMapEntry(entries[i].0 & !PRESENT);
        }
    }

    /// Moves the page to another frame, as if it had been migrated.
    pub fn relocate(&self, vaddr: usize, frame: u64) {
        if let Some(i) = self.index(vaddr) {
            self.entries.borrow_mut()[i] = PageMapEntry(PRESENT | frame);
        }
    }
}

impl VirtToPhys for SyntheticPageMap {
    fn translate(&self, vaddr: usize) -> Result<usize, PageMapError> {
        let entry = self
            .index(vaddr)
            .map(|i| self.entries.borrow()[i])
            .ok_or(PageMapError::NotPresent { vaddr })?;
        entry.physical_address(vaddr)
    }
}
