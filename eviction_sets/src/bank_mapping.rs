//! DRAM bank bit sweep.
//!
//! For a physical address mask, a chain is built over `set_size` pages that all
//! match the mask and walked many times. Bits that select the bank make the
//! whole chain land in one bank, which shows up as a higher latency than the
//! all zero baseline.

use crate::address_space::AddressSpace;
use crate::candidates::low_bits;
use crate::config::SweepConfig;
use crate::traversal::PageChain;
use crate::Error;
use cache_side_channel::TimingOracle;
use cache_utils::CACHE_LINE_LEN;
use core::fmt;
use core::mem::size_of;
use itertools::Itertools;
use log::info;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankMappingSample {
    /// Physical address bits set in `mask`, empty for the baseline.
    pub bits: Vec<u32>,
    pub mask: usize,
    pub accesses: u64,
    pub cycles_per_access: u64,
    pub elapsed: Duration,
}

impl BankMappingSample {
    pub fn average_latency_ns(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        self.elapsed.as_nanos() as f64 / self.accesses as f64
    }

    /// One cache line moved per access.
    pub fn bandwidth_mb_s(&self) -> f64 {
        let ns = self.elapsed.as_nanos();
        if ns == 0 {
            return 0.0;
        }
        (CACHE_LINE_LEN as f64) * 1000.0 * self.accesses as f64 / ns as f64
    }
}

impl fmt::Display for BankMappingSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = if self.bits.is_empty() {
            String::from("-")
        } else {
            self.bits.iter().join("^")
        };
        write!(
            f,
            "bits {:>5} mask {:#010x}: duration {}ns, #access {}, ",
            bits,
            self.mask,
            self.elapsed.as_nanos(),
            self.accesses
        )?;
        write!(
            f,
            "average latency: {:.2} ns ({} cycles), bandwidth {:.2} MB/s",
            self.average_latency_ns(),
            self.cycles_per_access,
            self.bandwidth_mb_s()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankMappingTable {
    pub baseline: BankMappingSample,
    pub samples: Vec<BankMappingSample>,
}

impl BankMappingTable {
    /// Samples whose cycles per access differ from the baseline by more than
    /// `tolerance`, relative to the baseline.
    pub fn deviating(&self, tolerance: f64) -> Vec<&BankMappingSample> {
        let base = self.baseline.cycles_per_access as f64;
        self.samples
            .iter()
            .filter(|s| {
                let cpa = s.cycles_per_access as f64;
                if base == 0.0 {
                    cpa > 0.0
                } else {
                    ((cpa - base) / base).abs() > tolerance
                }
            })
            .collect()
    }

    /// Bits of the deviating samples, sorted.
    pub fn deviating_bits(&self, tolerance: f64) -> Vec<u32> {
        self.deviating(tolerance)
            .into_iter()
            .flat_map(|s| s.bits.iter().copied())
            .sorted()
            .dedup()
            .collect()
    }
}

impl fmt::Display for BankMappingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.baseline)?;
        for s in &self.samples {
            writeln!(f, "{}", s)?;
        }
        Ok(())
    }
}

pub struct BankMappingSweeper<'a, O: TimingOracle> {
    space: &'a AddressSpace,
    oracle: O,
    config: SweepConfig,
}

impl<'a, O: TimingOracle> BankMappingSweeper<'a, O> {
    pub fn new(space: &'a AddressSpace, oracle: O, config: SweepConfig) -> Result<Self, Error> {
        low_bits(config.bit_width)?;
        for bit in config.bits.clone() {
            Self::check_bit(bit, config.bit_width)?;
        }
        Ok(BankMappingSweeper {
            space,
            oracle,
            config,
        })
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    fn check_bit(bit: u32, bit_width: u32) -> Result<(), Error> {
        if bit >= bit_width {
            return Err(Error::BitOutOfRange { bit, bit_width });
        }
        if bit < size_of::<usize>().trailing_zeros() {
            return Err(Error::MisalignedOffset(1 << bit));
        }
        Ok(())
    }

    /// Walks a chain over `set_size` pages matching `mask`, timed by the oracle
    /// and by the wall clock.
    pub fn measure_mask(&mut self, mask: usize) -> Result<BankMappingSample, Error> {
        let set = self
            .space
            .find_candidates(mask, self.config.bit_width, Some(self.config.set_size))?;
        let chain = PageChain::over(self.space, &set)?;

        let start = Instant::now();
        let sample = self.oracle.measure(&chain, self.config.iterations);
        let elapsed = start.elapsed();
        drop(chain);

        if sample.iterations != self.config.iterations as u64 {
            return Err(Error::CorruptedChain {
                visited: sample.iterations,
                expected: self.config.iterations as u64,
            });
        }
        let bits = (0..usize::BITS).filter(|b| mask & (1 << b) != 0).collect();
        Ok(BankMappingSample {
            bits,
            mask,
            accesses: sample.iterations,
            cycles_per_access: sample.cycles_per_iteration(),
            elapsed,
        })
    }

    pub fn measure_bit(&mut self, bit: u32) -> Result<BankMappingSample, Error> {
        Self::check_bit(bit, self.config.bit_width)?;
        self.measure_mask(1 << bit)
    }

    /// Both bits set, to probe XOR combined bank functions.
    pub fn measure_pair(&mut self, bit: u32, xor_bit: u32) -> Result<BankMappingSample, Error> {
        Self::check_bit(bit, self.config.bit_width)?;
        Self::check_bit(xor_bit, self.config.bit_width)?;
        self.measure_mask((1 << bit) | (1 << xor_bit))
    }

    /// Baseline, then one sample per configured bit.
    pub fn sweep(&mut self) -> Result<BankMappingTable, Error> {
        let baseline = self.measure_mask(0)?;
        info!("baseline: {} cycles/access", baseline.cycles_per_access);
        let mut samples = Vec::new();
        for bit in self.config.bits.clone() {
            let s = self.measure_bit(bit)?;
            info!("bit {}: {} cycles/access", bit, s.cycles_per_access);
            samples.push(s);
        }
        Ok(BankMappingTable { baseline, samples })
    }

    /// Baseline, then one sample per unordered pair of `bits`.
    pub fn sweep_pairs(&mut self, bits: &[u32]) -> Result<BankMappingTable, Error> {
        let baseline = self.measure_mask(0)?;
        info!("baseline: {} cycles/access", baseline.cycles_per_access);
        let mut samples = Vec::new();
        for (a, b) in bits.iter().copied().unique().tuple_combinations() {
            let s = self.measure_pair(a, b)?;
            info!("bits {}^{}: {} cycles/access", a, b, s.cycles_per_access);
            samples.push(s);
        }
        Ok(BankMappingTable { baseline, samples })
    }
}
