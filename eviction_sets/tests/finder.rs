use cache_side_channel::mock::{ModelOracle, ScriptedOracle};
use cache_side_channel::{AccessSequence, TimingOracle, TimingSample};
use cache_utils::pagemap::PageMapError;
use eviction_sets::{
    AddressSpace, CandidateSet, Error, EvictionSetFinder, PageChain, ProbeConfig, SyntheticPageMap,
    TraversalOrder,
};
use std::cell::Cell;
use std::ptr;

const WAYS: usize = 16;

fn config() -> ProbeConfig {
    ProbeConfig {
        num_reads: 64,
        max_bit: 14,
        ..Default::default()
    }
}

/// 80 consecutive frames from 0x400, so every fourth page matches mask 0 over 14 bits.
fn space() -> (AddressSpace, SyntheticPageMap) {
    AddressSpace::synthetic((0..80).map(|i| 0x400 + i).collect()).unwrap()
}

fn associativity(ways: usize) -> impl FnMut(&[usize]) -> u64 {
    move |members: &[usize]| if members.len() >= ways { 300 } else { 80 }
}

#[test]
fn twenty_candidates_sixteen_ways() {
    let (space, _) = space();
    let cs = space.find_candidates(0, 14, Some(20)).unwrap();
    assert_eq!(cs.len(), 20);

    let oracle = ModelOracle::new(200, associativity(WAYS));
    let mut finder = EvictionSetFinder::new(&space, oracle, &config());
    let ev = finder.find(&cs).unwrap().unwrap();
    assert_eq!(ev.len(), WAYS);
    assert_eq!(Some(ev.test_address), cs.first());
    assert!(ev.members.iter().all(|a| cs.contains(a) && a != ev.test_address));

    // The set evicts, and no member can be removed.
    assert!(finder.check_conflict(ev.test_address, &ev.members).unwrap());
    for m in ev.members.iter() {
        assert!(!finder.check_conflict(ev.test_address, &ev.members.without(m)).unwrap());
    }
    assert!(finder.is_minimal(&ev).unwrap());
}

#[test]
fn too_small_superset_is_not_viable() {
    let (space, _) = space();
    let cs = space.find_candidates(0, 14, Some(WAYS)).unwrap();
    let oracle = ModelOracle::new(200, associativity(WAYS));
    let mut finder = EvictionSetFinder::new(&space, oracle, &config());
    assert!(finder.find(&cs).unwrap().is_none());
    assert_eq!(finder.oracle().measurements(), 1);
}

#[test]
fn closure_pass_restores_dropped_member() {
    let (space, _) = space();
    let cs = space.find_candidates(0, 14, Some(6)).unwrap();
    let a: Vec<usize> = cs.iter().collect();
    // Pass 1 evicts, pass 2 wrongly drops a[3], pass 3 sees the set failing once.
    let script = vec![300, 300, 300, 300, 100, 100, 100, 300, 300];
    let mut finder = EvictionSetFinder::new(&space, ScriptedOracle::new(200, script), &config());
    let ev = finder.find(&cs).unwrap().unwrap();
    assert_eq!(ev.members.as_slice(), &[a[4], a[5], a[1]]);
    assert_eq!(finder.oracle().measurements(), 9);
}

#[test]
fn candidate_selection_is_idempotent() {
    let (space, _) = space();
    let first = space.find_candidates(0, 14, Some(20)).unwrap();
    let second = space.find_candidates(0, 14, Some(20)).unwrap();
    assert_eq!(first, second);
    assert!(space.find_candidates(0, 14, Some(0)).unwrap().is_empty());
    for v in first.iter() {
        assert_eq!(space.physical_address(v).unwrap() & 0x3fff, 0);
    }
}

#[test]
fn claimed_pages_are_skipped() {
    let (space, _) = space();
    let all = space.find_candidates(0, 14, None).unwrap();
    let held: CandidateSet = all.iter().take(3).collect();
    let chain = PageChain::over(&space, &held).unwrap();

    let free = space.find_candidates(0, 14, None).unwrap();
    assert_eq!(free.len(), all.len() - 3);
    assert!(held.iter().all(|a| !free.contains(a)));

    drop(chain);
    assert_eq!(space.find_candidates(0, 14, None).unwrap(), all);
}

#[test]
fn page_lost_mid_run_is_fatal() {
    let (space, map) = space();
    let cs = space.find_candidates(0, 14, Some(20)).unwrap();
    let victim = cs.iter().last().unwrap();
    let calls = Cell::new(0);
    let model = |members: &[usize]| {
        calls.set(calls.get() + 1);
        if calls.get() == 3 {
            assert!(space.is_claimed(victim));
            map.clear_present(victim);
        }
        if members.len() >= WAYS {
            300
        } else {
            80
        }
    };
    let mut finder = EvictionSetFinder::new(&space, ModelOracle::new(200, model), &config());
    match finder.find(&cs) {
        Err(e @ Error::Translation(PageMapError::NotPresent { vaddr })) => {
            assert_eq!(vaddr, victim);
            assert!(e.is_fatal());
        }
        r => panic!("unexpected {:?}", r),
    }
}

#[test]
fn relocated_page_is_fatal() {
    let (space, map) = space();
    let cs = space.find_candidates(0, 14, Some(20)).unwrap();
    let moved = cs.iter().nth(5).unwrap();
    map.relocate(moved, 0x4242);
    let oracle = ModelOracle::new(200, associativity(WAYS));
    let mut finder = EvictionSetFinder::new(&space, oracle, &config());
    assert!(matches!(finder.find(&cs), Err(Error::Relocated { vaddr, .. }) if vaddr == moved));
}

/// Cuts the chain after its second member before walking it.
struct Saboteur;

impl TimingOracle for Saboteur {
    fn threshold(&self) -> u64 {
        200
    }

    fn measure(&mut self, sequence: &dyn AccessSequence, steps: usize) -> TimingSample {
        let second = sequence.members()[1];
        unsafe { ptr::write_volatile(second as *mut usize, 0) };
        let visited = sequence.run(steps) as u64;
        TimingSample {
            cycles: 300 * visited,
            iterations: visited,
        }
    }
}

#[test]
fn corrupted_chain_is_fatal() {
    let (space, _) = space();
    let cs = space.find_candidates(0, 14, Some(20)).unwrap();
    let mut finder = EvictionSetFinder::new(&space, Saboteur, &config());
    match finder.find(&cs) {
        Err(Error::CorruptedChain { visited, expected }) => {
            assert_eq!(visited, 2);
            assert_eq!(expected, 64);
        }
        r => panic!("unexpected {:?}", r),
    }
    // The aborted chain still released its pages.
    assert!(cs.iter().all(|a| !space.is_claimed(a)));
}

#[test]
fn chain_and_order_share_the_cycle() {
    let (space, _) = space();
    let cs = space.find_candidates(0, 14, Some(7)).unwrap();
    let order = TraversalOrder::from_set(&cs).unwrap();
    let expected: Vec<usize> = order.traverse(30).into_iter().map(|i| order.members()[i]).collect();
    let chain = PageChain::build(&space, order).unwrap();
    assert_eq!(chain.walk(30), expected);
    assert_eq!(chain.traverse(30), 30);
    // First revisit of the head happens after exactly |members| hops.
    let walk = chain.walk(30);
    assert_eq!(walk.iter().skip(1).position(|&a| a == walk[0]), Some(cs.len() - 1));
}
