use crate::address_space::AddressSpace;
use crate::Error;
use cache_utils::PAGE_OFFSET_MASK;
use core::fmt;
use core::mem::size_of;
use log::debug;
use std::collections::HashSet;

/// Unique virtual addresses, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    order: Vec<usize>,
    index: HashSet<usize>,
}

/// Pages selected for sharing the same physical address bits.
pub type CandidateSet = AddressSet;

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `addr` was already present.
    pub fn insert(&mut self, addr: usize) -> bool {
        if self.index.insert(addr) {
            self.order.push(addr);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, addr: usize) -> bool {
        if self.index.remove(&addr) {
            self.order.retain(|&a| a != addr);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.index.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn first(&self) -> Option<usize> {
        self.order.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().copied()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.order
    }

    /// A copy of the set without `addr`.
    pub fn without(&self, addr: usize) -> AddressSet {
        self.iter().filter(|&a| a != addr).collect()
    }
}

impl FromIterator<usize> for AddressSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = AddressSet::new();
        for addr in iter {
            set.insert(addr);
        }
        set
    }
}

impl Extend<usize> for AddressSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for addr in iter {
            self.insert(addr);
        }
    }
}

impl fmt::Display for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for addr in self.iter() {
            write!(f, "{:#x},", addr)?;
        }
        Ok(())
    }
}

pub(crate) fn low_bits(bit_width: u32) -> Result<usize, Error> {
    if bit_width > 63 {
        return Err(Error::InvalidBitWidth(bit_width));
    }
    Ok(((1u64 << bit_width) - 1) as usize)
}

impl AddressSpace {
    /// Pages whose physical address, taken at in-page offset `match_mask & 0xfff`,
    /// agrees with `match_mask` on the low `bit_width` bits.
    ///
    /// Pages whose word at that offset is already claimed by a chain are skipped.
    /// With `min_count`, the scan stops after that many matches and fails if
    /// fewer exist.
    pub fn find_candidates(
        &self,
        match_mask: usize,
        bit_width: u32,
        min_count: Option<usize>,
    ) -> Result<CandidateSet, Error> {
        let mut set = CandidateSet::new();
        if min_count == Some(0) {
            return Ok(set);
        }
        let bits = low_bits(bit_width)?;
        let offset = match_mask & PAGE_OFFSET_MASK;
        if offset % size_of::<usize>() != 0 {
            return Err(Error::MisalignedOffset(offset));
        }
        let target = match_mask & bits;

        for page in self.pages() {
            let paddr = page.physical_address + offset;
            if paddr & bits != target {
                continue;
            }
            let vaddr = page.virtual_address + offset;
            if self.is_claimed(vaddr) {
                continue;
            }
            set.insert(vaddr);
            if min_count == Some(set.len()) {
                break;
            }
        }
        debug!(
            "{} candidates for mask {:#x} over {} bits",
            set.len(),
            match_mask,
            bit_width
        );

        match min_count {
            Some(requested) if set.len() < requested => Err(Error::InsufficientCandidates {
                found: set.len(),
                requested,
            }),
            _ => Ok(set),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::PAGE_SHIFT;

    #[test]
    fn insertion_order_and_uniqueness() {
        let mut s: AddressSet = [3, 1, 2].into_iter().collect();
        assert!(!s.insert(1));
        assert!(s.insert(7));
        assert_eq!(s.as_slice(), &[3, 1, 2, 7]);
        assert!(s.remove(1));
        assert!(!s.remove(1));
        assert_eq!(s.as_slice(), &[3, 2, 7]);
        assert_eq!(s.without(2).as_slice(), &[3, 7]);
        assert_eq!(s.first(), Some(3));
        assert_eq!(s.to_string(), "0x3,0x2,0x7,");
    }

    // Consecutive frames from 0x400, so bit k < 22 of the physical address is
    // bit k - 12 of the page index.
    fn identity(n: u64) -> AddressSpace {
        AddressSpace::synthetic((0..n).map(|i| 0x400 + i).collect())
            .unwrap()
            .0
    }

    #[test]
    fn only_matching_pages_are_selected() {
        let space = identity(64);
        let mask = 1 << (PAGE_SHIFT + 1);
        let set = space.find_candidates(mask, 14, None).unwrap();
        assert_eq!(set.len(), 16);
        for v in set.iter() {
            let p = space.physical_address(v).unwrap();
            assert_eq!(p & 0x3fff, mask);
        }
    }

    #[test]
    fn stops_at_min_count() {
        let space = identity(64);
        let set = space.find_candidates(0, 14, Some(5)).unwrap();
        assert_eq!(set.len(), 5);
        let again = space.find_candidates(0, 14, Some(5)).unwrap();
        assert_eq!(set, again);
    }

    #[test]
    fn zero_count_is_empty() {
        let space = identity(4);
        assert!(space.find_candidates(0, 14, Some(0)).unwrap().is_empty());
    }

    #[test]
    fn insufficient_candidates() {
        let space = identity(16);
        match space.find_candidates(0, 14, Some(10)) {
            Err(Error::InsufficientCandidates { found, requested }) => {
                assert_eq!(found, 4);
                assert_eq!(requested, 10);
            }
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn offset_is_carried_into_addresses() {
        let space = identity(8);
        let set = space.find_candidates(0x40, 12, None).unwrap();
        assert_eq!(set.len(), 8);
        assert!(set.iter().all(|v| v & PAGE_OFFSET_MASK == 0x40));
    }

    #[test]
    fn rejects_bad_parameters() {
        let space = identity(4);
        assert!(matches!(
            space.find_candidates(0, 64, None),
            Err(Error::InvalidBitWidth(64))
        ));
        assert!(matches!(
            space.find_candidates(0x44, 12, None),
            Err(Error::MisalignedOffset(0x44))
        ));
    }
}
