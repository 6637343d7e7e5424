use crate::address_space::AddressSpace;
use crate::candidates::AddressSet;
use crate::Error;
use cache_side_channel::AccessSequence;
use core::ptr;
use std::collections::HashSet;

/// Circular visiting order over a set of addresses, kept out of band.
/// Member `i` is followed by member `(i + 1) % n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalOrder {
    members: Vec<usize>,
}

impl TraversalOrder {
    pub fn new(members: Vec<usize>) -> Result<Self, Error> {
        if members.is_empty() {
            return Err(Error::EmptyChain);
        }
        let mut seen = HashSet::with_capacity(members.len());
        for &m in &members {
            if !seen.insert(m) {
                return Err(Error::DuplicateMember(m));
            }
        }
        Ok(TraversalOrder { members })
    }

    pub fn from_set(set: &AddressSet) -> Result<Self, Error> {
        Self::new(set.as_slice().to_vec())
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn head(&self) -> usize {
        self.members[0]
    }

    pub fn cycle_length(&self) -> usize {
        self.members.len()
    }

    pub fn successor(&self, index: usize) -> usize {
        (index + 1) % self.members.len()
    }

    /// Member indices visited by `steps` hops starting at the head.
    pub fn traverse(&self, steps: usize) -> Vec<usize> {
        let mut visited = Vec::with_capacity(steps);
        let mut i = 0;
        for _ in 0..steps {
            visited.push(i);
            i = self.successor(i);
        }
        visited
    }
}

/// A pointer chase written into the pages of an `AddressSpace`: the word at each
/// member holds the address of the next one. The member words are zeroed again
/// when the chain is dropped, which releases them for other chains.
#[derive(Debug)]
pub struct PageChain<'a> {
    space: &'a AddressSpace,
    order: TraversalOrder,
}

impl<'a> PageChain<'a> {
    pub fn build(space: &'a AddressSpace, order: TraversalOrder) -> Result<Self, Error> {
        let mut links = Vec::with_capacity(order.cycle_length());
        for &m in order.members() {
            let p = space.word_ptr(m).ok_or(Error::InvalidMember(m))?;
            space.verify(m)?;
            if space.is_claimed(m) {
                return Err(Error::AlreadyClaimed(m));
            }
            links.push(p);
        }
        for (i, &p) in links.iter().enumerate() {
            let next = order.members()[order.successor(i)];
            unsafe { ptr::write_volatile(p, next) };
        }
        Ok(PageChain { space, order })
    }

    pub fn over(space: &'a AddressSpace, set: &AddressSet) -> Result<Self, Error> {
        Self::build(space, TraversalOrder::from_set(set)?)
    }

    pub fn order(&self) -> &TraversalOrder {
        &self.order
    }

    pub fn head(&self) -> usize {
        self.order.head()
    }

    /// Follows the chain for `steps` hops, stopping early on a null link.
    /// Returns the number of hops performed.
    pub fn traverse(&self, steps: usize) -> usize {
        let mut p = self.head() as *const usize;
        for i in 0..steps {
            if p.is_null() {
                return i;
            }
            // Members were validated against the space, which outlives the chain.
            p = unsafe { ptr::read_volatile(p) } as *const usize;
        }
        steps
    }

    /// Addresses in the order the chain visits them, for `steps` hops.
    pub fn walk(&self, steps: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(steps);
        let mut p = self.head();
        for _ in 0..steps {
            if p == 0 {
                break;
            }
            out.push(p);
            p = self.space.read_word(p).unwrap_or(0);
        }
        out
    }
}

impl AccessSequence for PageChain<'_> {
    fn members(&self) -> &[usize] {
        self.order.members()
    }

    fn run(&self, steps: usize) -> usize {
        self.traverse(steps)
    }
}

impl Drop for PageChain<'_> {
    fn drop(&mut self) {
        for &m in self.order.members() {
            if let Some(p) = self.space.word_ptr(m) {
                unsafe { ptr::write_volatile(p, 0) };
            }
        }
    }
}
