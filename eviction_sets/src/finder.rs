//! Reduction of a candidate superset to a minimal eviction set.
//!
//! The first candidate is the victim. The remaining candidates are checked to
//! evict it as a whole, then every candidate is tried out of the set in turn:
//! if the set still evicts without it, it is dropped, otherwise it is kept.
//! A last pass puts back candidates while the kept set fails to evict, to
//! recover from misclassified measurements during the reduction.

use crate::address_space::AddressSpace;
use crate::candidates::{AddressSet, CandidateSet};
use crate::config::ProbeConfig;
use crate::traversal::PageChain;
use crate::Error;
use cache_side_channel::table_side_channel::attack;
use cache_side_channel::{CacheStatus, TimingOracle};
use log::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionSet {
    pub test_address: usize,
    pub members: AddressSet,
}

impl EvictionSet {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub struct EvictionSetFinder<'a, O: TimingOracle> {
    space: &'a AddressSpace,
    oracle: O,
    num_reads: usize,
    repetitions: u32,
}

impl<'a, O: TimingOracle> EvictionSetFinder<'a, O> {
    pub fn new(space: &'a AddressSpace, oracle: O, config: &ProbeConfig) -> Self {
        EvictionSetFinder {
            space,
            oracle,
            num_reads: config.num_reads,
            repetitions: config.repetitions.max(1),
        }
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Whether walking `set` as a chain is measured as evicted.
    /// An empty set never evicts.
    pub fn evicts(&mut self, set: &AddressSet) -> Result<bool, Error> {
        if set.is_empty() {
            return Ok(false);
        }
        let chain = PageChain::over(self.space, set)?;
        let (result, short) = attack(&mut self.oracle, &chain, self.num_reads, self.repetitions);
        if let Some(sample) = short {
            return Err(Error::CorruptedChain {
                visited: sample.iterations,
                expected: self.num_reads as u64,
            });
        }
        Ok(result.status() == CacheStatus::Miss)
    }

    /// Whether `set`, without `test` itself, evicts `test`.
    pub fn check_conflict(&mut self, test: usize, set: &AddressSet) -> Result<bool, Error> {
        let evicted = self.evicts(&set.without(test))?;
        debug!(
            "{:#x} against {} addresses: {}",
            test,
            set.len(),
            if evicted { "evicted" } else { "cached" }
        );
        Ok(evicted)
    }

    /// Returns `None` when the candidates as a whole do not evict the first one.
    pub fn find(&mut self, candidates: &CandidateSet) -> Result<Option<EvictionSet>, Error> {
        let test = match candidates.first() {
            Some(t) if candidates.len() >= 2 => t,
            _ => {
                info!("need at least 2 candidates, got {}", candidates.len());
                return Ok(None);
            }
        };
        let rest = candidates.without(test);

        info!("pass 1: {} candidates against {:#x}", rest.len(), test);
        if !self.check_conflict(test, &rest)? {
            info!("no eviction set found");
            return Ok(None);
        }

        let mut working = rest.clone();
        let mut ev = AddressSet::new();
        for a in rest.iter() {
            let reduced = working.without(a);
            if self.check_conflict(test, &reduced)? {
                working = reduced;
            } else {
                ev.insert(a);
            }
        }
        info!("pass 2: EV ({})", ev.len());

        for a in candidates.iter() {
            if a == test || ev.contains(a) {
                continue;
            }
            if !self.check_conflict(test, &ev)? {
                ev.insert(a);
            }
        }
        info!("pass 3: EV ({})", ev.len());

        Ok(Some(EvictionSet {
            test_address: test,
            members: ev,
        }))
    }

    /// The set evicts, and stops evicting when any single member is removed.
    pub fn is_minimal(&mut self, ev: &EvictionSet) -> Result<bool, Error> {
        if !self.check_conflict(ev.test_address, &ev.members)? {
            return Ok(false);
        }
        for m in ev.members.iter() {
            if self.check_conflict(ev.test_address, &ev.members.without(m))? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_side_channel::mock::{ModelOracle, ScriptedOracle};

    fn config() -> ProbeConfig {
        ProbeConfig {
            num_reads: 50,
            ..Default::default()
        }
    }

    fn candidates(space: &AddressSpace) -> CandidateSet {
        space.pages().iter().map(|p| p.virtual_address).collect()
    }

    #[test]
    fn empty_set_does_not_evict() {
        let (space, _) = AddressSpace::synthetic(vec![1, 2]).unwrap();
        let oracle = ScriptedOracle::new(200, vec![1000]);
        let mut finder = EvictionSetFinder::new(&space, oracle, &config());
        assert!(!finder.evicts(&AddressSet::new()).unwrap());
        assert_eq!(finder.oracle().measurements(), 0);
    }

    #[test]
    fn too_few_candidates() {
        let (space, _) = AddressSpace::synthetic(vec![1]).unwrap();
        let oracle = ScriptedOracle::new(200, vec![1000]);
        let mut finder = EvictionSetFinder::new(&space, oracle, &config());
        assert!(finder.find(&candidates(&space)).unwrap().is_none());
        assert!(finder.find(&CandidateSet::new()).unwrap().is_none());
    }

    #[test]
    fn not_viable() {
        let (space, _) = AddressSpace::synthetic((1..=8).collect()).unwrap();
        let oracle = ScriptedOracle::new(200, vec![150]);
        let mut finder = EvictionSetFinder::new(&space, oracle, &config());
        assert!(finder.find(&candidates(&space)).unwrap().is_none());
        assert_eq!(finder.oracle().measurements(), 1);
    }

    #[test]
    fn threshold_tie_is_not_an_eviction() {
        let (space, _) = AddressSpace::synthetic((1..=4).collect()).unwrap();
        let oracle = ScriptedOracle::new(200, vec![200]);
        let mut finder = EvictionSetFinder::new(&space, oracle, &config());
        assert!(finder.find(&candidates(&space)).unwrap().is_none());
    }

    #[test]
    fn reduces_to_associativity() {
        let (space, _) = AddressSpace::synthetic((1..=10).collect()).unwrap();
        let oracle = ModelOracle::new(200, |m: &[usize]| if m.len() >= 4 { 300 } else { 100 });
        let mut finder = EvictionSetFinder::new(&space, oracle, &config());
        let cs = candidates(&space);
        let ev = finder.find(&cs).unwrap().unwrap();
        assert_eq!(ev.test_address, cs.first().unwrap());
        assert_eq!(ev.len(), 4);
        assert!(!ev.members.contains(ev.test_address));
        assert!(finder.is_minimal(&ev).unwrap());
        // Chains are released after every measurement.
        assert!(cs.iter().all(|a| !space.is_claimed(a)));
    }
}
