//! Property tests: the allocator's reservations always match the ports held
//! by live sites, across starts, stops and crashes followed by reconciliation.

use std::collections::{BTreeMap, HashSet};

use previewgate::ports::PortAllocator;
use proptest::prelude::*;

const LOW: u16 = 3010;
const HIGH: u16 = 3017;

#[derive(Debug, Clone)]
enum Op {
    /// Start a new site
    Start,
    /// Stop the nth live site
    Stop(usize),
    /// The nth live site dies, then a reconciliation pass runs
    Crash(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Start),
        2 => any::<usize>().prop_map(Op::Stop),
        1 => any::<usize>().prop_map(Op::Crash),
    ]
}

fn nth_key(live: &BTreeMap<u32, u16>, n: usize) -> Option<u32> {
    if live.is_empty() {
        return None;
    }
    live.keys().nth(n % live.len()).copied()
}

proptest! {
    #[test]
    fn reservations_match_live_sites(ops in prop::collection::vec(op(), 1..64)) {
        let ports = PortAllocator::new(LOW, HIGH);
        let mut live: BTreeMap<u32, u16> = BTreeMap::new();
        let mut next_id = 0u32;

        for op in ops {
            match op {
                Op::Start => match ports.allocate() {
                    Ok(port) => {
                        prop_assert!((LOW..=HIGH).contains(&port));
                        prop_assert!(!live.values().any(|p| *p == port));
                        live.insert(next_id, port);
                        next_id += 1;
                    }
                    Err(exhausted) => {
                        prop_assert_eq!(live.len(), (HIGH - LOW + 1) as usize);
                        prop_assert_eq!(exhausted.low, LOW);
                        prop_assert_eq!(exhausted.high, HIGH);
                    }
                },
                Op::Stop(n) => {
                    if let Some(id) = nth_key(&live, n) {
                        let port = live.remove(&id).unwrap();
                        ports.release(port);
                        // Releasing twice is harmless
                        ports.release(port);
                    }
                }
                Op::Crash(n) => {
                    if let Some(id) = nth_key(&live, n) {
                        let port = live.remove(&id).unwrap();
                        prop_assert!(ports.is_reserved(port));

                        let held: HashSet<u16> = live.values().copied().collect();
                        let released = ports.retain(&held);
                        prop_assert_eq!(released, vec![port]);
                    }
                }
            }

            let mut expected: Vec<u16> = live.values().copied().collect();
            expected.sort_unstable();
            prop_assert_eq!(ports.in_use(), expected);
            prop_assert_eq!(ports.free_count(), (HIGH - LOW + 1) as usize - live.len());
        }
    }

    #[test]
    fn allocation_is_lowest_free(released in prop::collection::btree_set(LOW..=HIGH, 0..8)) {
        let ports = PortAllocator::new(LOW, HIGH);
        for _ in LOW..=HIGH {
            ports.allocate().unwrap();
        }
        for port in &released {
            ports.release(*port);
        }

        match released.iter().next() {
            Some(lowest) => prop_assert_eq!(ports.allocate().unwrap(), *lowest),
            None => prop_assert!(ports.allocate().is_err()),
        }
    }
}
