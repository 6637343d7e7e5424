use crate::{AccessSequence, CacheStatus, TimingOracle, TimingSample};
use log::debug;

/// Hit / miss counts over repeated measurements of the same sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableAttackResult {
    hit: u32,
    miss: u32,
    /// Sum of the per iteration latencies, to report an average.
    total_cycles_per_iteration: u64,
}

impl TableAttackResult {
    pub fn get(&self, cache_status: CacheStatus) -> u32 {
        match cache_status {
            CacheStatus::Hit => self.hit,
            CacheStatus::Miss => self.miss,
        }
    }

    pub fn record(&mut self, status: CacheStatus, sample: &TimingSample) {
        match status {
            CacheStatus::Hit => self.hit += 1,
            CacheStatus::Miss => self.miss += 1,
        }
        self.total_cycles_per_iteration += sample.cycles_per_iteration();
    }

    pub fn total(&self) -> u32 {
        self.hit + self.miss
    }

    pub fn average_cycles_per_iteration(&self) -> u64 {
        match self.total() {
            0 => 0,
            n => self.total_cycles_per_iteration / n as u64,
        }
    }

    /// Majority vote, an even split counts as cached.
    pub fn status(&self) -> CacheStatus {
        if self.miss > self.hit {
            CacheStatus::Miss
        } else {
            CacheStatus::Hit
        }
    }
}

/// Measures `sequence` `repetitions` times and tallies the classifications.
pub fn attack<O: TimingOracle + ?Sized>(
    oracle: &mut O,
    sequence: &dyn AccessSequence,
    steps: usize,
    repetitions: u32,
) -> (TableAttackResult, Option<TimingSample>) {
    let mut result = TableAttackResult::default();
    let mut short = None;
    for _ in 0..repetitions {
        let sample = oracle.measure(sequence, steps);
        if sample.iterations != steps as u64 {
            short = Some(sample);
            break;
        }
        let status = oracle.classify(&sample);
        debug!(
            "took: {} cycles/iteration over {} members ({:?})",
            sample.cycles_per_iteration(),
            sequence.members().len(),
            status
        );
        result.record(status, &sample);
    }
    (result, short)
}
