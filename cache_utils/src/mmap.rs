use core::num::NonZeroUsize;
use core::ptr::NonNull;
use nix::errno::Errno;
use nix::sys::mman;

/// An anonymous private mapping, unmapped on drop.
#[derive(Debug)]
pub struct MMappedMemory {
    pointer: NonNull<u8>,
    size: usize,
}

impl MMappedMemory {
    /// Maps `size` bytes. `populate` pre-faults every page so that no page fault
    /// happens later during a measurement.
    pub fn try_new(size: usize, populate: bool) -> Result<MMappedMemory, nix::Error> {
        let length = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
        let mut flags = mman::MapFlags::MAP_PRIVATE;
        if populate {
            flags |= mman::MapFlags::MAP_POPULATE;
        }
        let p = unsafe {
            mman::mmap_anonymous(
                None,
                length,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                flags,
            )
        }?;
        Ok(MMappedMemory {
            pointer: p.cast(),
            size,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.pointer.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.as_ptr() as usize;
        addr >= base && addr < base + self.size
    }
}

impl Drop for MMappedMemory {
    fn drop(&mut self) {
        unsafe {
            // Nothing sensible to do if this fails, the mapping leaks.
            let _ = mman::munmap(self.pointer.cast(), self.size);
        }
    }
}

// The mapping is exclusively owned, moving it across threads is fine.
unsafe impl Send for MMappedMemory {}
