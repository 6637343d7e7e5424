#![deny(unsafe_op_in_unsafe_fn)]

use cache_utils::{rdtsc_serialized_begin, rdtsc_serialized_end};

pub mod mock;
pub mod table_side_channel;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CacheStatus {
    /// The access stream stayed in the cache.
    Hit,
    /// The access stream missed to a slower level.
    Miss,
}

/// Raw result of one timed run.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct TimingSample {
    pub cycles: u64,
    pub iterations: u64,
}

impl TimingSample {
    pub fn cycles_per_iteration(&self) -> u64 {
        if self.iterations == 0 {
            0
        } else {
            self.cycles / self.iterations
        }
    }
}

/// Values at the threshold count as cached, so a tie never over-claims an eviction.
pub fn classify(cycles_per_iteration: u64, threshold: u64) -> CacheStatus {
    if cycles_per_iteration > threshold {
        CacheStatus::Miss
    } else {
        CacheStatus::Hit
    }
}

/// A sequence of serialized, data dependent accesses, such as a pointer chain.
pub trait AccessSequence {
    /// Addresses touched by one lap of the sequence.
    fn members(&self) -> &[usize];
    /// Performs `steps` accesses, returns how many were actually performed.
    fn run(&self, steps: usize) -> usize;
}

pub trait TimingOracle {
    fn threshold(&self) -> u64;

    fn measure(&mut self, sequence: &dyn AccessSequence, steps: usize) -> TimingSample;

    fn classify(&self, sample: &TimingSample) -> CacheStatus {
        classify(sample.cycles_per_iteration(), self.threshold())
    }
}

impl<T: TimingOracle + ?Sized> TimingOracle for &mut T {
    fn threshold(&self) -> u64 {
        (**self).threshold()
    }

    fn measure(&mut self, sequence: &dyn AccessSequence, steps: usize) -> TimingSample {
        (**self).measure(sequence, steps)
    }
}

/// Times the sequence with the serializing time stamp counter.
///
/// Frequency scaling and preemption are not handled here, the caller is
/// expected to pin the CPU and raise the scheduling priority first.
#[derive(Debug, Clone, Copy)]
pub struct HardwareOracle {
    threshold: u64,
}

impl HardwareOracle {
    pub fn new(threshold: u64) -> Self {
        HardwareOracle { threshold }
    }
}

impl TimingOracle for HardwareOracle {
    fn threshold(&self) -> u64 {
        self.threshold
    }

    fn measure(&mut self, sequence: &dyn AccessSequence, steps: usize) -> TimingSample {
        let t0 = unsafe { rdtsc_serialized_begin() };
        let visited = sequence.run(steps);
        let t1 = unsafe { rdtsc_serialized_end() };
        TimingSample {
            cycles: t1.saturating_sub(t0),
            iterations: visited as u64,
        }
    }
}
