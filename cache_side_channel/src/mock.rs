//! Deterministic oracles, for exercising the search algorithms without real timing.
//!
//! Both still run the sequence, so a broken chain is observed exactly as it
//! would be with the hardware oracle.

use crate::{AccessSequence, TimingOracle, TimingSample};
use std::collections::VecDeque;
use std::fmt;

/// Cycles per iteration computed from the members of the measured sequence.
pub struct ModelOracle<F: FnMut(&[usize]) -> u64> {
    threshold: u64,
    model: F,
    measurements: usize,
}

impl<F: FnMut(&[usize]) -> u64> ModelOracle<F> {
    pub fn new(threshold: u64, model: F) -> Self {
        ModelOracle {
            threshold,
            model,
            measurements: 0,
        }
    }

    pub fn measurements(&self) -> usize {
        self.measurements
    }
}

impl<F: FnMut(&[usize]) -> u64> fmt::Debug for ModelOracle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelOracle")
            .field("threshold", &self.threshold)
            .field("measurements", &self.measurements)
            .finish()
    }
}

impl<F: FnMut(&[usize]) -> u64> TimingOracle for ModelOracle<F> {
    fn threshold(&self) -> u64 {
        self.threshold
    }

    fn measure(&mut self, sequence: &dyn AccessSequence, steps: usize) -> TimingSample {
        self.measurements += 1;
        let visited = sequence.run(steps) as u64;
        let per_iteration = (self.model)(sequence.members());
        TimingSample {
            cycles: per_iteration * visited,
            iterations: visited,
        }
    }
}

/// Returns a fixed script of cycles per iteration, one value per measurement.
/// The last value repeats once the script is exhausted.
#[derive(Debug, Clone)]
pub struct ScriptedOracle {
    threshold: u64,
    script: VecDeque<u64>,
    last: u64,
    measurements: usize,
}

impl ScriptedOracle {
    pub fn new(threshold: u64, script: Vec<u64>) -> Self {
        ScriptedOracle {
            threshold,
            script: script.into(),
            last: 0,
            measurements: 0,
        }
    }

    pub fn measurements(&self) -> usize {
        self.measurements
    }
}

impl TimingOracle for ScriptedOracle {
    fn threshold(&self) -> u64 {
        self.threshold
    }

    fn measure(&mut self, sequence: &dyn AccessSequence, steps: usize) -> TimingSample {
        self.measurements += 1;
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        let visited = sequence.run(steps) as u64;
        TimingSample {
            cycles: self.last * visited,
            iterations: visited,
        }
    }
}
