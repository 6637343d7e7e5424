#![deny(unsafe_op_in_unsafe_fn)]

//! Physical address probing, pointer-chase traversal chains and the timing based
//! searches built on top of them: minimal eviction sets and DRAM bank bit sweeps.

use cache_utils::pagemap::PageMapError;
use thiserror::Error;

pub mod address_space;
pub mod bank_mapping;
pub mod candidates;
pub mod config;
pub mod corunner;
pub mod finder;
pub mod traversal;

pub use address_space::{AddressSpace, PhysicalPage, SyntheticPageMap};
pub use bank_mapping::{BankMappingSample, BankMappingSweeper, BankMappingTable};
pub use candidates::{AddressSet, CandidateSet};
pub use config::{ProbeConfig, SweepConfig};
pub use corunner::CorunnerGroup;
pub use finder::{EvictionSet, EvictionSetFinder};
pub use traversal::{PageChain, TraversalOrder};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Translation(#[from] PageMapError),
    #[error("could not determine the physical memory size: {0}")]
    MemorySize(#[source] nix::Error),
    #[error("invalid fraction of physical memory {0}")]
    InvalidFraction(f64),
    #[error("failed to map {size} bytes: {source}")]
    Allocation {
        size: usize,
        #[source]
        source: nix::Error,
    },
    #[error("failed: found ({found}) / requested ({requested}) pages")]
    InsufficientCandidates { found: usize, requested: usize },
    #[error("bit width {0} is out of range")]
    InvalidBitWidth(u32),
    #[error("bit {bit} is not covered by a {bit_width} bit match")]
    BitOutOfRange { bit: u32, bit_width: u32 },
    #[error("in-page offset {0:#x} is not word aligned")]
    MisalignedOffset(usize),
    #[error("{0:#x} cannot hold a chain link")]
    InvalidMember(usize),
    #[error("{0:#x} appears twice in the chain")]
    DuplicateMember(usize),
    #[error("{0:#x} is already claimed by another chain")]
    AlreadyClaimed(usize),
    #[error("a chain needs at least one member")]
    EmptyChain,
    #[error("chain traversal stopped after {visited} of {expected} hops")]
    CorruptedChain { visited: u64, expected: u64 },
    #[error("page at {vaddr:#x} moved from {expected:#x} to {found:#x}")]
    Relocated {
        vaddr: usize,
        expected: usize,
        found: usize,
    },
}

impl Error {
    /// Errors after which the probing addresses can no longer be trusted.
    /// The others are configuration problems the operator can fix and retry.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::InsufficientCandidates { .. }
                | Error::InvalidFraction(_)
                | Error::InvalidBitWidth(_)
                | Error::BitOutOfRange { .. }
                | Error::MisalignedOffset(_)
        )
    }
}
