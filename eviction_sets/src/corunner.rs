//! Background memory traffic for the bank sweep.
//!
//! Each corunner owns its own buffer and walks a randomly ordered chain over its
//! cache lines until told to stop. Nothing is shared with the measuring thread
//! except the stop flag.

use crate::Error;
use cache_utils::mmap::MMappedMemory;
use cache_utils::sched::set_affinity;
use cache_utils::CACHE_LINE_LEN;
use core::ptr;
use log::{debug, warn};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Hops between two checks of the stop flag.
const BATCH: u64 = 1024;

/// Links every cache line of `memory` into one cycle, in random order.
/// Returns the head of the chain.
fn build_random_chain(memory: &mut MMappedMemory) -> usize {
    let base = memory.as_ptr() as usize;
    let mut lines: Vec<usize> = (0..memory.len() / CACHE_LINE_LEN)
        .map(|i| base + i * CACHE_LINE_LEN)
        .collect();
    lines.shuffle(&mut rand::thread_rng());
    for (i, &line) in lines.iter().enumerate() {
        let next = lines[(i + 1) % lines.len()];
        unsafe { ptr::write_volatile(line as *mut usize, next) };
    }
    lines[0]
}

fn run(memory: MMappedMemory, head: usize, stop: Arc<AtomicBool>) -> u64 {
    let mut p = head as *const usize;
    let mut hops = 0;
    loop {
        for _ in 0..BATCH {
            p = unsafe { ptr::read_volatile(p) } as *const usize;
        }
        hops += BATCH;
        if stop.load(Ordering::Relaxed) {
            break;
        }
    }
    drop(memory);
    hops
}

pub struct CorunnerGroup {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<u64>>,
}

impl CorunnerGroup {
    /// Starts `count` threads, each walking a private `buffer_size` byte buffer.
    pub fn spawn(count: usize, buffer_size: usize) -> Result<Self, Error> {
        Self::spawn_on(count, buffer_size, &[])
    }

    /// Like `spawn`, pinning corunner `i` to `cpus[i % cpus.len()]` when `cpus` is not empty.
    pub fn spawn_on(count: usize, buffer_size: usize, cpus: &[usize]) -> Result<Self, Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut group = CorunnerGroup {
            stop: stop.clone(),
            handles: Vec::with_capacity(count),
        };
        for i in 0..count {
            let size = buffer_size.max(CACHE_LINE_LEN);
            let mut memory = MMappedMemory::try_new(size, true)
                .map_err(|source| Error::Allocation { size, source })?;
            let head = build_random_chain(&mut memory);
            let cpu = if cpus.is_empty() {
                None
            } else {
                Some(cpus[i % cpus.len()])
            };
            let stop = stop.clone();
            group.handles.push(thread::spawn(move || {
                if let Some(cpu) = cpu {
                    if let Err(e) = set_affinity(cpu) {
                        warn!("corunner {}: could not pin to cpu {}: {}", i, cpu, e);
                    }
                }
                run(memory, head, stop)
            }));
            debug!("corunner {} started, {} bytes", i, size);
        }
        Ok(group)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stops and joins every corunner, returns the hops each one performed.
    pub fn stop(mut self) -> Vec<u64> {
        self.stop.store(true, Ordering::Relaxed);
        self.handles
            .drain(..)
            .map(|h| h.join().unwrap_or(0))
            .collect()
    }
}

impl Drop for CorunnerGroup {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn random_chain_covers_every_line() {
        let mut memory = MMappedMemory::try_new(4 * 4096, true).unwrap();
        let head = build_random_chain(&mut memory);
        let n = memory.len() / CACHE_LINE_LEN;
        let mut seen = HashSet::new();
        let mut p = head;
        for _ in 0..n {
            assert!(memory.contains(p));
            assert_eq!(p % CACHE_LINE_LEN, 0);
            seen.insert(p);
            p = unsafe { ptr::read_volatile(p as *const usize) };
        }
        assert_eq!(seen.len(), n);
        assert_eq!(p, head);
    }

    #[test]
    fn corunners_run_until_stopped() {
        let group = CorunnerGroup::spawn(2, 64 * 1024).unwrap();
        assert_eq!(group.len(), 2);
        thread::sleep(Duration::from_millis(20));
        let hops = group.stop();
        assert_eq!(hops.len(), 2);
        assert!(hops.iter().all(|&h| h > 0));
    }

    #[test]
    fn empty_group() {
        let group = CorunnerGroup::spawn(0, 4096).unwrap();
        assert!(group.is_empty());
        assert!(group.stop().is_empty());
    }
}
