#![deny(unsafe_op_in_unsafe_fn)]

use static_assertions::const_assert_eq;

pub mod cache_info;
pub mod mmap;
pub mod pagemap;
pub mod sched;

use core::arch::x86_64 as arch_x86;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_LEN: usize = 4096;
pub const PAGE_OFFSET_MASK: usize = PAGE_LEN - 1;
pub const CACHE_LINE_LEN: usize = 64;

const_assert_eq!(PAGE_LEN, 1 << PAGE_SHIFT);
const_assert_eq!(PAGE_LEN % CACHE_LINE_LEN, 0);

/// Start of a timed window: cpuid drains the pipeline before the counter is read,
/// so nothing issued earlier can leak into the measurement.
pub unsafe fn rdtsc_serialized_begin() -> u64 {
    let mut aux = 0u32;
    unsafe { arch_x86::__cpuid(0) };
    unsafe { arch_x86::__rdtscp(&mut aux) }
}

/// End of a timed window: rdtscp waits for every prior instruction, cpuid keeps
/// later ones from starting before the counter is read.
pub unsafe fn rdtsc_serialized_end() -> u64 {
    let mut aux = 0u32;
    let tsc = unsafe { arch_x86::__rdtscp(&mut aux) };
    unsafe { arch_x86::__cpuid(0) };
    tsc
}

/// Total physical RAM in bytes, as reported by sysinfo(2).
pub fn physical_memory_size() -> Result<usize, nix::Error> {
    let info = nix::sys::sysinfo::sysinfo()?;
    Ok(info.ram_total() as usize)
}

pub fn page_align_down(size: usize) -> usize {
    size & !PAGE_OFFSET_MASK
}
