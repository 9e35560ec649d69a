use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use strata::{MemoryStorage, PoolPolicy, Schema, Strata, WritePolicy};

type Record = (u16, u32);
type Tree = Strata<u16, Record, MemoryStorage<u16, Record>>;

fn schema(inner: usize, leaf: usize) -> Schema<u16, Record> {
    Schema::new(|v: &Record| v.0)
        .inner_capacity(inner)
        .leaf_capacity(leaf)
}

fn contents(tree: &Tree) -> Vec<Record> {
    tree.first()
        .unwrap()
        .collect::<strata::Result<Vec<_>>>()
        .unwrap()
}

fn flatten(model: &BTreeMap<u16, Vec<u32>>) -> Vec<Record> {
    model
        .iter()
        .flat_map(|(k, vs)| vs.iter().map(move |v| (*k, *v)))
        .collect()
}

#[derive(Debug, Clone)]
enum Op {
    Add(u16),
    Remove(u16),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u16..48).prop_map(Op::Add),
        2 => (0u16..48).prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn strata_matches_btreemap(
        ops in proptest::collection::vec(op(), 1..400),
        inner in 3usize..6,
        leaf in 2usize..6,
    ) {
        let tree = schema(inner, leaf).create(MemoryStorage::new()).unwrap();
        let mut model: BTreeMap<u16, Vec<u32>> = BTreeMap::new();

        for (serial, op) in ops.into_iter().enumerate() {
            let serial = serial as u32;
            match op {
                Op::Add(k) => {
                    tree.add((k, serial)).unwrap();
                    model.entry(k).or_default().push(serial);
                }
                Op::Remove(k) => {
                    let expected = match model.get_mut(&k) {
                        Some(vs) if !vs.is_empty() => Some((k, vs.remove(0))),
                        _ => None,
                    };
                    if model.get(&k).map(|vs| vs.is_empty()).unwrap_or(false) {
                        model.remove(&k);
                    }
                    prop_assert_eq!(tree.remove(&k).unwrap(), expected);
                }
            }
            tree.copacetic().unwrap();
        }

        prop_assert_eq!(contents(&tree), flatten(&model));
        for (k, vs) in model.iter() {
            let found: Vec<u32> = tree.find(k).unwrap().map(|r| r.unwrap().1).collect();
            prop_assert_eq!(&found, vs);
        }
    }

    #[test]
    fn strata_seek_lower_bound(keys in proptest::collection::btree_set(0u16..500, 0..120), probe in 0u16..520) {
        let tree = schema(4, 3).create(MemoryStorage::new()).unwrap();
        for k in keys.iter() {
            tree.add((*k, 0)).unwrap();
        }
        let expected: Vec<u16> = keys.range(probe..).cloned().collect();
        let seen: Vec<u16> = tree.seek(&probe).unwrap().map(|r| r.unwrap().0).collect();
        prop_assert_eq!(seen, expected);
    }
}

#[test]
fn strata_duplicates_span_chains() {
    let _ = tracing_subscriber::fmt::try_init();
    let tree = schema(3, 2).create(MemoryStorage::new()).unwrap();
    for k in [5u16, 1, 9] {
        tree.add((k, 0)).unwrap();
    }
    for serial in 1..=25 {
        tree.add((5, serial)).unwrap();
        tree.copacetic().unwrap();
    }

    let fives: Vec<u32> = tree.find(&5).unwrap().map(|r| r.unwrap().1).collect();
    assert_eq!(fives, (0..=25).collect::<Vec<u32>>());

    // Remove from the middle of the run, then drain it in order.
    assert_eq!(tree.remove_if(&5, |v| v.1 == 13).unwrap(), Some((5, 13)));
    assert_eq!(tree.remove_if(&5, |v| v.1 == 13).unwrap(), None);
    tree.copacetic().unwrap();
    for serial in (0..=25).filter(|s| *s != 13) {
        assert_eq!(tree.remove(&5).unwrap(), Some((5, serial)));
        tree.copacetic().unwrap();
    }
    assert_eq!(tree.remove(&5).unwrap(), None);
    assert_eq!(contents(&tree), vec![(1, 0), (9, 0)]);
}

#[test]
fn strata_random_order_drains_to_empty() {
    let _ = tracing_subscriber::fmt::try_init();
    let tree = schema(4, 3).create(MemoryStorage::new()).unwrap();
    let mut rng = rand::rng();
    let mut keys: Vec<u16> = (0..600).collect();
    keys.shuffle(&mut rng);
    for k in keys.iter() {
        tree.add((*k, rng.random_range(0..1000))).unwrap();
    }
    tree.copacetic().unwrap();
    assert!(tree.depth().unwrap() > 2);

    keys.shuffle(&mut rng);
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(tree.remove(k).unwrap().map(|r| r.0), Some(*k));
        if i % 50 == 0 {
            tree.copacetic().unwrap();
        }
    }
    tree.copacetic().unwrap();
    assert!(contents(&tree).is_empty());
}

#[test]
fn strata_concurrent_writers_and_readers() {
    let _ = tracing_subscriber::fmt::try_init();
    let tree = schema(4, 4)
        .pool_policy(PoolPolicy::Lru(NonZeroUsize::new(16).unwrap()))
        .create(MemoryStorage::new())
        .unwrap();

    const THREADS: u16 = 4;
    const PER_THREAD: u16 = 300;

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let tree = &tree;
            s.spawn(move || {
                let mut rng = rand::rng();
                let mut mine: Vec<u16> = (0..PER_THREAD).map(|i| i * THREADS + t).collect();
                mine.shuffle(&mut rng);
                for k in mine.iter() {
                    tree.add((*k, t as u32)).unwrap();
                }
                // Take back the odd ones.
                for k in mine.iter().filter(|k| *k % 2 == 1) {
                    assert_eq!(tree.remove(k).unwrap(), Some((*k, t as u32)));
                }
            });
        }
        s.spawn(|| {
            for _ in 0..50 {
                let seen: Vec<u16> = tree.first().unwrap().map(|r| r.unwrap().0).collect();
                assert!(seen.windows(2).all(|w| w[0] <= w[1]));
            }
        });
    });

    tree.copacetic().unwrap();
    let keys: Vec<u16> = contents(&tree).into_iter().map(|r| r.0).collect();
    let expected: Vec<u16> = (0..PER_THREAD * THREADS).filter(|k| k % 2 == 0).collect();
    assert_eq!(keys, expected);
}

#[test]
fn strata_concurrent_duplicates() {
    let tree = schema(3, 3).create(MemoryStorage::new()).unwrap();
    std::thread::scope(|s| {
        for t in 0..4u32 {
            let tree = &tree;
            s.spawn(move || {
                for i in 0..100u32 {
                    tree.add(((i % 3) as u16, t * 1000 + i)).unwrap();
                }
                for i in 0..50u32 {
                    let serial = t * 1000 + i;
                    let removed = tree
                        .remove_if(&((i % 3) as u16), |v| v.1 == serial)
                        .unwrap();
                    assert_eq!(removed, Some(((i % 3) as u16, serial)));
                }
            });
        }
    });
    tree.copacetic().unwrap();
    assert_eq!(contents(&tree).len(), 200);
    for k in 0..3u16 {
        let mut serials: Vec<u32> = tree.find(&k).unwrap().map(|r| r.unwrap().1).collect();
        serials.sort_unstable();
        let mut expected: Vec<u32> = (0..4u32)
            .flat_map(|t| (50..100u32).filter(move |i| i % 3 == k as u32).map(move |i| t * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(serials, expected);
    }
}

#[test]
fn strata_remove_waits_for_cursor_inside_chain() {
    let _ = tracing_subscriber::fmt::try_init();
    let tree = schema(5, 2).create(MemoryStorage::new()).unwrap();
    tree.add((1, 0)).unwrap();
    tree.add((9, 0)).unwrap();
    for serial in 0..4 {
        tree.add((5, serial)).unwrap();
    }
    tree.copacetic().unwrap();

    let (parked_tx, parked_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (read_tx, read_rx) = mpsc::channel();
    let reader = tree.clone();
    std::thread::spawn(move || {
        let mut cursor = reader.seek(&5).unwrap();
        // The first two values fill the head leaf, which leaves the cursor
        // in the chain leaf behind it.
        let head: Vec<Record> = (0..2).map(|_| cursor.next_value().unwrap()).collect();
        parked_tx.send(head).unwrap();
        go_rx.recv().unwrap();
        let rest: Vec<Record> = cursor.map(|r| r.unwrap()).collect();
        read_tx.send(rest).unwrap();
    });
    let head = parked_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cursor did not reach the chain");
    assert_eq!(head, vec![(5, 0), (5, 1)]);

    let (removed_tx, removed_rx) = mpsc::channel();
    let writer = tree.clone();
    std::thread::spawn(move || {
        removed_tx.send(writer.remove_if(&5, |v| v.1 == 3)).unwrap();
    });
    // Let the removal block on the chain leaf before the cursor moves on.
    std::thread::sleep(Duration::from_millis(100));
    go_tx.send(()).unwrap();

    let rest = read_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cursor blocked by the removal");
    assert_eq!(rest, vec![(5, 2), (5, 3), (9, 0)]);
    let removed = removed_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("removal blocked by the cursor");
    assert_eq!(removed.unwrap(), Some((5, 3)));
    tree.copacetic().unwrap();
    assert_eq!(contents(&tree), vec![(1, 0), (5, 0), (5, 1), (5, 2), (9, 0)]);
}

/// Writers add and remove their own values at random over a small key
/// space, so duplicate chains come and go, while a reader keeps scanning.
fn mixed_stress(policy: WritePolicy, pool: PoolPolicy, seed: u64) {
    const WRITERS: u64 = 6;
    const STEPS: u32 = 1500;

    let tree = schema(3, 2)
        .write_policy(policy)
        .pool_policy(pool)
        .create(MemoryStorage::new())
        .unwrap();
    let done = AtomicBool::new(false);

    let kept: Vec<Record> = std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut scans = 0;
            while !done.load(Ordering::Acquire) || scans == 0 {
                let seen: Vec<u16> = tree.first().unwrap().map(|r| r.unwrap().0).collect();
                assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
                if let Some(k) = seen.get(seen.len() / 2) {
                    assert!(tree.find(k).unwrap().all(|r| r.unwrap().0 == *k));
                }
                scans += 1;
            }
        });
        let writers: Vec<_> = (0..WRITERS)
            .map(|t| {
                let tree = &tree;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed * 31 + t);
                    let mut mine: Vec<Record> = Vec::new();
                    for step in 0..STEPS {
                        if mine.is_empty() || rng.random_range(0..5) < 3 {
                            let record = (rng.random_range(0..24u16), t as u32 * 100_000 + step);
                            tree.add(record).unwrap();
                            mine.push(record);
                        } else {
                            let (key, serial) = mine.swap_remove(rng.random_range(0..mine.len()));
                            let removed = tree.remove_if(&key, |v| v.1 == serial).unwrap();
                            assert_eq!(removed, Some((key, serial)));
                        }
                    }
                    mine
                })
            })
            .collect();
        let kept = writers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        done.store(true, Ordering::Release);
        reader.join().unwrap();
        kept
    });

    tree.flush().unwrap();
    tree.copacetic().unwrap();
    let mut expected = kept;
    expected.sort_unstable();
    let mut found = contents(&tree);
    assert!(found.windows(2).all(|w| w[0].0 <= w[1].0));
    found.sort_unstable();
    assert_eq!(found, expected);
}

#[test]
fn strata_mixed_stress_write_through() {
    let _ = tracing_subscriber::fmt::try_init();
    mixed_stress(WritePolicy::Through, PoolPolicy::Weak, 1);
    mixed_stress(WritePolicy::Through, PoolPolicy::Pinned, 2);
}

#[test]
fn strata_mixed_stress_per_query() {
    mixed_stress(WritePolicy::PerQuery, PoolPolicy::Weak, 3);
}

#[test]
fn strata_mixed_stress_per_tree() {
    mixed_stress(
        WritePolicy::PerTree { max_dirty: 16 },
        PoolPolicy::Lru(NonZeroUsize::new(8).unwrap()),
        4,
    );
}

fn exercise(tree: &Tree) {
    for k in (0..200u16).rev() {
        tree.add((k, k as u32)).unwrap();
    }
    for k in (0..200u16).step_by(3) {
        assert_eq!(tree.remove(&k).unwrap(), Some((k, k as u32)));
    }
    tree.copacetic().unwrap();
}

fn expected_after_exercise() -> Vec<Record> {
    (0..200u16)
        .filter(|k| k % 3 != 0)
        .map(|k| (k, k as u32))
        .collect()
}

#[test]
fn strata_write_policies_persist_on_reopen() {
    let _ = tracing_subscriber::fmt::try_init();
    for policy in [
        WritePolicy::Through,
        WritePolicy::PerQuery,
        WritePolicy::PerTree { max_dirty: 7 },
    ] {
        let tree = schema(5, 4)
            .write_policy(policy)
            .create(MemoryStorage::new())
            .unwrap();
        exercise(&tree);
        tree.flush().unwrap();

        let reopened = schema(5, 4)
            .open(tree.storage().snapshot(), tree.root())
            .unwrap();
        reopened.copacetic().unwrap();
        assert_eq!(contents(&reopened), expected_after_exercise(), "{:?}", policy);
    }
}

#[test]
fn strata_pool_policies() {
    for policy in [
        PoolPolicy::Weak,
        PoolPolicy::Lru(NonZeroUsize::new(2).unwrap()),
        PoolPolicy::Pinned,
    ] {
        let tree = schema(4, 3)
            .pool_policy(policy)
            .create(MemoryStorage::new())
            .unwrap();
        exercise(&tree);
        assert_eq!(contents(&tree), expected_after_exercise(), "{:?}", policy);
    }
}

#[test]
fn strata_uncached_fields() {
    let tree = schema(4, 3)
        .cache_fields(false)
        .create(MemoryStorage::new())
        .unwrap();
    exercise(&tree);
    assert_eq!(contents(&tree), expected_after_exercise());
    let found: Vec<Record> = tree.find(&4).unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(found, vec![(4, 4)]);
}

#[test]
fn strata_composite_keys() {
    let tree = Schema::new(|v: &(String, u32)| (v.0.clone(), v.1))
        .inner_capacity(3)
        .leaf_capacity(2)
        .create(MemoryStorage::new())
        .unwrap();
    for (name, n) in [("b", 2), ("a", 9), ("b", 1), ("a", 1), ("c", 0)] {
        tree.add((name.to_string(), n)).unwrap();
    }
    let order: Vec<(String, u32)> = tree.first().unwrap().map(|r| r.unwrap()).collect();
    let names: Vec<(&str, u32)> = order.iter().map(|(s, n)| (s.as_str(), *n)).collect();
    assert_eq!(names, vec![("a", 1), ("a", 9), ("b", 1), ("b", 2), ("c", 0)]);
    tree.copacetic().unwrap();
}

#[test]
fn strata_invalid_schemas() {
    assert!(schema(2, 4).create(MemoryStorage::new()).is_err());
    assert!(schema(4, 1).create(MemoryStorage::new()).is_err());
    assert!(schema(4, 4)
        .write_policy(WritePolicy::PerTree { max_dirty: 0 })
        .create(MemoryStorage::new())
        .is_err());
}
