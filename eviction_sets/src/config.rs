use cache_utils::cache_info::last_level_cache;
use core::ops::RangeInclusive;
use log::debug;

// These are per machine calibrations, check them against
// /sys/devices/system/cpu/cpu0/cache/index3/ before trusting the results.
pub const FRACTION_OF_PHYSICAL_MEMORY: f64 = 0.2;
pub const L3_NUM_WAYS: usize = 16;
pub const L3_THRESH_CYCLES: u64 = 200;
pub const NUM_READS: usize = 500;
/// Physical address bits compared when selecting eviction set candidates.
pub const MAX_BIT: u32 = 22;

pub const SWEEP_NUM_WAYS: usize = 20;
/// [27:23] bits are used for iterations.
pub const ENTRY_SHIFT: u32 = 24;
pub const SWEEP_ITERATIONS: usize = 10000;
pub const SWEEP_BITS: RangeInclusive<u32> = 6..=23;
pub const REALTIME_PRIORITY: i32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub fraction_of_physical_memory: f64,
    pub threshold_cycles: u64,
    /// Chain hops per measurement.
    pub num_reads: usize,
    /// Measurements per eviction test, majority vote.
    pub repetitions: u32,
    pub max_bit: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            fraction_of_physical_memory: FRACTION_OF_PHYSICAL_MEMORY,
            threshold_cycles: L3_THRESH_CYCLES,
            num_reads: NUM_READS,
            repetitions: 1,
            max_bit: MAX_BIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    pub bits: RangeInclusive<u32>,
    pub bit_width: u32,
    /// Pages per conflict set, one more than the associativity.
    pub set_size: usize,
    pub iterations: usize,
}

impl SweepConfig {
    pub fn with_ways(ways: usize) -> Self {
        SweepConfig {
            set_size: ways + 1,
            ..Default::default()
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            bits: SWEEP_BITS,
            bit_width: ENTRY_SHIFT,
            set_size: SWEEP_NUM_WAYS + 1,
            iterations: SWEEP_ITERATIONS,
        }
    }
}

/// Associativity of the last level cache, if cpuid reports it.
pub fn detected_cache_ways() -> Option<usize> {
    let llc = last_level_cache()?;
    debug!(
        "LLC: L{} {} ways, {} sets, {} KB",
        llc.level,
        llc.ways,
        llc.sets,
        llc.size() >> 10
    );
    Some(llc.ways)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_set_size_covers_associativity() {
        assert_eq!(SweepConfig::with_ways(16).set_size, 17);
        assert_eq!(SweepConfig::default().set_size, SWEEP_NUM_WAYS + 1);
        assert_eq!(SweepConfig::with_ways(16).bit_width, ENTRY_SHIFT);
    }

    #[test]
    fn defaults() {
        let c = ProbeConfig::default();
        assert_eq!(c.threshold_cycles, 200);
        assert_eq!(c.num_reads, 500);
        assert_eq!(c.max_bit, 22);
    }
}
