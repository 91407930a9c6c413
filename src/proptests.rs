use super::*;

use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
enum Op {
    Insert(u64, u64),
    Remove(u64),
    Get(u64),
    Update(u64, u64),
    Scan(u64, usize),
}

fn key_strategy() -> impl Strategy<Value = u64> + Clone {
    prop_oneof![
        // evenly spread over the first shard
        (0u64..4096).prop_map(|k| k << 43),
        // dense clusters that force models and deep directories
        (0u64..64, 0u64..1 << 16).prop_map(|(c, off)| (c << 48) | (off << 20)),
        // runs of consecutive keys at the bottom of two otherwise quiet shards
        (prop::sample::select(vec![37u64, 300]), 0u64..2048).prop_map(|(s, k)| (s << 55) | k),
        // anywhere, the reserved key excluded
        (0..u64::MAX),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let key = key_strategy();
    let op = prop_oneof![
        50 => (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        20 => key.clone().prop_map(Op::Remove),
        15 => key.clone().prop_map(Op::Get),
        10 => (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Update(k, v)),
        5 => (key, 0usize..300).prop_map(|(k, n)| Op::Scan(k, n)),
    ];
    prop::collection::vec(op, 0..=3000)
}

fn run_equivalence(config: IndexConfig, ops: Vec<Op>) -> std::result::Result<(), TestCaseError> {
    let mut t = CdfHash::with_config(config).unwrap();
    let mut m: BTreeMap<u64, u64> = BTreeMap::new();

    for op in ops {
        match op {
            Op::Insert(key, value) => {
                let old_t = t.insert(key, value).unwrap();
                let old_m = m.insert(key, value);
                prop_assert_eq!(old_t, old_m);
            }
            Op::Remove(key) => {
                prop_assert_eq!(t.remove(key), m.remove(&key));
            }
            Op::Get(key) => {
                prop_assert_eq!(t.get(key), m.get(&key).copied());
            }
            Op::Update(key, value) => {
                let updated = match m.get_mut(&key) {
                    Some(v) => {
                        *v = value;
                        true
                    }
                    None => false,
                };
                prop_assert_eq!(t.update(key, value), updated);
            }
            Op::Scan(start, n) => {
                let got = t.scan(start, n);
                let expected: Vec<u64> = m.range(start..).take(n).map(|(_, v)| *v).collect();
                prop_assert_eq!(got, expected);
            }
        }

        prop_assert_eq!(t.len(), m.len());
    }

    if let Err(e) = t.validate() {
        return Err(TestCaseError::fail(e));
    }
    let got: Vec<(u64, u64)> = t.iter().collect();
    let expected: Vec<(u64, u64)> = m.into_iter().collect();
    prop_assert_eq!(got, expected);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 10_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence_default(ops in ops_strategy()) {
        run_equivalence(IndexConfig::default(), ops)?;
    }

    #[test]
    fn prop_equivalence_eager_adaptation(ops in ops_strategy()) {
        // remap and expand from the first levels, classify early
        let config = IndexConfig::new().remap_depth(1).classify_depth(3).range_bits_limit(4);
        run_equivalence(config, ops)?;
    }

    #[test]
    fn prop_equivalence_without_models(ops in ops_strategy()) {
        run_equivalence(IndexConfig::new().learned_cdf(false).remap_depth(2), ops)?;
    }
}

#[test]
fn descending_inserts_then_drain() {
    let mut t = CdfHash::with_config(IndexConfig::new().remap_depth(2)).unwrap();
    let keys: Vec<u64> = (0..5_000u64).map(|i| i << 42).collect();

    for &k in keys.iter().rev() {
        assert_eq!(t.insert(k, !k).unwrap(), None);
    }
    t.validate().unwrap();
    assert!(t.keys().eq(keys.iter().copied()));

    for &k in keys.iter().step_by(2) {
        assert_eq!(t.remove(k), Some(!k));
    }
    t.validate().unwrap();
    assert!(t.keys().eq(keys.iter().copied().skip(1).step_by(2)));
}
