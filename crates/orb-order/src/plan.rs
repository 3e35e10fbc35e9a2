//! Planning key changes between a persisted list and its desired state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use crate::error::{OrderError, OrderResult};
use crate::SENTINEL;

/// Re-key one surviving row: the row at `from` moves to `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyMove {
    pub from: i64,
    pub to: i64,
}

/// Row operations turning a persisted list into a desired one.
///
/// Apply `removals`, then `moves` in order, then `insertions`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderPlan<V> {
    /// Keys of rows to delete.
    pub removals: Vec<i64>,
    /// Cyclic rotations of surviving rows, each cycle parked on the sentinel.
    pub moves: Vec<KeyMove>,
    /// New rows.
    pub insertions: Vec<(i64, V)>,
    /// Final key of every element of the desired list, in list order.
    pub result_keys: Vec<i64>,
    cycles: usize,
}

impl<V> OrderPlan<V> {
    /// Total row statements the plan issues.
    pub fn mutation_count(&self) -> usize {
        self.removals.len() + self.moves.len() + self.insertions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutation_count() == 0
    }

    /// Number of rotation cycles.
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// Number of surviving elements whose key changes.
    pub fn moved_elements(&self) -> usize {
        self.moves.len() - self.cycles
    }
}

/// Keys for a freshly written list of `len` elements.
pub fn initial_keys(len: usize, increment: i64) -> OrderResult<Vec<i64>> {
    if increment <= 0 {
        return Err(OrderError::InvalidIncrement(increment));
    }
    fill(SENTINEL, None, len, increment)
}

/// Compute the row operations that turn `old` into `new`.
///
/// `old` holds the persisted `(key, value)` pairs in key order. Elements are
/// matched by value; the k-th occurrence of a value in `new` matches the
/// k-th occurrence in `old`. Unmatched old rows are removed, matched rows
/// keep the same key set but are rotated into their new relative order,
/// and unmatched new elements get keys between their final neighbors.
pub fn plan<V>(old: &[(i64, V)], new: &[V], increment: i64) -> OrderResult<OrderPlan<V>>
where
    V: Eq + Hash + Clone,
{
    if increment <= 0 {
        return Err(OrderError::InvalidIncrement(increment));
    }
    check_keys(old)?;

    let mut pending: HashMap<&V, VecDeque<usize>> = HashMap::new();
    for (index, (_, value)) in old.iter().enumerate() {
        pending.entry(value).or_default().push_back(index);
    }
    let matched: Vec<Option<usize>> = new
        .iter()
        .map(|value| pending.get_mut(value).and_then(VecDeque::pop_front))
        .collect();

    let mut survives = vec![false; old.len()];
    for &index in matched.iter().flatten() {
        survives[index] = true;
    }
    let mut removals = Vec::new();
    let mut kept = Vec::new();
    for ((key, _), &keep) in old.iter().zip(&survives) {
        if keep {
            kept.push(*key);
        } else {
            removals.push(*key);
        }
    }

    // The t-th surviving element in new order takes the t-th smallest kept key.
    let target_of: HashMap<i64, i64> = matched
        .iter()
        .flatten()
        .zip(&kept)
        .map(|(&index, &target)| (old[index].0, target))
        .collect();
    let (moves, cycles) = rotations(&kept, &target_of);

    let mut result_keys = Vec::with_capacity(new.len());
    let mut insertions = Vec::new();
    let mut run: Vec<usize> = Vec::new();
    let mut lower = SENTINEL;
    let mut next_kept = kept.iter();
    for (position, slot) in matched.iter().enumerate() {
        if slot.is_none() {
            run.push(position);
            continue;
        }
        let upper = next_kept.next().copied().unwrap_or(lower);
        place(&mut run, new, lower, Some(upper), increment, &mut insertions, &mut result_keys)?;
        result_keys.push(upper);
        lower = upper;
    }
    place(&mut run, new, lower, None, increment, &mut insertions, &mut result_keys)?;

    Ok(OrderPlan {
        removals,
        moves,
        insertions,
        result_keys,
        cycles,
    })
}

fn check_keys<V>(old: &[(i64, V)]) -> OrderResult<()> {
    let mut previous = SENTINEL;
    for (key, _) in old {
        if *key <= SENTINEL {
            return Err(OrderError::NonPositiveKey(*key));
        }
        if *key <= previous {
            return Err(OrderError::UnsortedKeys(*key));
        }
        previous = *key;
    }
    Ok(())
}

/// Decompose the key permutation into cycles and emit each as a rotation
/// parked on the sentinel: `s_n -> 0, s_(n-1) -> s_n, .., s_1 -> s_2, 0 -> s_1`.
fn rotations(kept: &[i64], target_of: &HashMap<i64, i64>) -> (Vec<KeyMove>, usize) {
    let mut moves = Vec::new();
    let mut cycles = 0;
    let mut visited = HashSet::new();
    for &start in kept {
        if visited.contains(&start) || target_of.get(&start) == Some(&start) {
            continue;
        }
        let mut cycle = vec![start];
        visited.insert(start);
        let mut cursor = target_of.get(&start).copied();
        while let Some(key) = cursor {
            if key == start || !visited.insert(key) {
                break;
            }
            cycle.push(key);
            cursor = target_of.get(&key).copied();
        }
        if cycle.len() < 2 {
            continue;
        }
        cycles += 1;
        let last = cycle[cycle.len() - 1];
        moves.push(KeyMove {
            from: last,
            to: SENTINEL,
        });
        for pair in cycle.windows(2).rev() {
            moves.push(KeyMove {
                from: pair[0],
                to: pair[1],
            });
        }
        moves.push(KeyMove {
            from: SENTINEL,
            to: start,
        });
    }
    (moves, cycles)
}

fn place<V: Clone>(
    run: &mut Vec<usize>,
    new: &[V],
    lower: i64,
    upper: Option<i64>,
    increment: i64,
    insertions: &mut Vec<(i64, V)>,
    result_keys: &mut Vec<i64>,
) -> OrderResult<()> {
    let keys = fill(lower, upper, run.len(), increment)?;
    for (key, position) in keys.into_iter().zip(run.drain(..)) {
        insertions.push((key, new[position].clone()));
        result_keys.push(key);
    }
    Ok(())
}

/// `count` increasing keys strictly between `lower` and `upper`, or stepping
/// by `increment` past `lower` when there is no upper neighbor.
fn fill(lower: i64, upper: Option<i64>, count: usize, increment: i64) -> OrderResult<Vec<i64>> {
    match upper {
        None => (1..=count)
            .map(|step| {
                i64::try_from(step)
                    .ok()
                    .and_then(|step| increment.checked_mul(step))
                    .and_then(|offset| lower.checked_add(offset))
                    .ok_or(OrderError::Overflow(lower))
            })
            .collect(),
        Some(upper) => {
            if count == 0 {
                return Ok(Vec::new());
            }
            let gap = i128::from(upper) - i128::from(lower);
            let slots = count as i128 + 1;
            if gap < slots {
                return Err(OrderError::DenseKeys {
                    lower,
                    upper,
                    needed: count,
                });
            }
            Ok((1..=count)
                .map(|step| lower + (gap * step as i128 / slots) as i64)
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_INCREMENT;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::fmt::Debug;

    const I: i64 = DEFAULT_INCREMENT;

    fn persisted<V: Clone>(values: &[V]) -> Vec<(i64, V)> {
        initial_keys(values.len(), I)
            .unwrap()
            .into_iter()
            .zip(values.iter().cloned())
            .collect()
    }

    /// Apply a plan to a key-ordered row map, failing on any key collision.
    fn apply<V: Clone + Debug>(old: &[(i64, V)], plan: &OrderPlan<V>) -> BTreeMap<i64, V> {
        let mut rows: BTreeMap<i64, V> = old.iter().cloned().collect();
        for key in &plan.removals {
            assert!(rows.remove(key).is_some(), "removed missing key {key}");
        }
        for step in &plan.moves {
            let value = rows.remove(&step.from).expect("move source exists");
            assert!(rows.insert(step.to, value).is_none(), "move target taken");
        }
        for (key, value) in &plan.insertions {
            assert!(rows.insert(*key, value.clone()).is_none(), "insert key taken");
        }
        rows
    }

    // ---- Key assignment ----

    #[test]
    fn fresh_list_is_evenly_spaced() {
        let p = plan::<&str>(&[], &["a", "b", "c"], I).unwrap();
        assert_eq!(p.result_keys, vec![I, 2 * I, 3 * I]);
        assert_eq!(p.insertions.len(), 3);
        assert!(p.removals.is_empty() && p.moves.is_empty());
    }

    #[test]
    fn unchanged_list_needs_nothing() {
        let old = persisted(&["a", "b", "a"]);
        let p = plan(&old, &["a", "b", "a"], I).unwrap();
        assert!(p.is_empty());
        assert_eq!(p.result_keys, vec![I, 2 * I, 3 * I]);
    }

    #[test]
    fn insertion_takes_midpoint() {
        let old = persisted(&["a", "b"]);
        let p = plan(&old, &["a", "x", "b"], I).unwrap();
        assert_eq!(p.insertions, vec![(I + I / 2, "x")]);
        assert_eq!(p.mutation_count(), 1);
    }

    #[test]
    fn prepend_takes_half_of_first_key() {
        let old = persisted(&["a"]);
        let p = plan(&old, &["x", "a"], I).unwrap();
        assert_eq!(p.insertions, vec![(I / 2, "x")]);
    }

    #[test]
    fn removal_deletes_by_key() {
        let old = persisted(&["a", "b", "c"]);
        let p = plan(&old, &["a", "c"], I).unwrap();
        assert_eq!(p.removals, vec![2 * I]);
        assert!(p.moves.is_empty());
        assert!(p.insertions.is_empty());
    }

    // ---- Rotations ----

    #[test]
    fn rotate_and_append() {
        let old = persisted(&["a", "b", "c"]);
        let p = plan(&old, &["c", "a", "b", "d"], I).unwrap();
        assert_eq!(p.insertions, vec![(4 * I, "d")]);
        assert!(p.removals.is_empty());
        assert_eq!(p.cycles(), 1);
        assert_eq!(p.moved_elements(), 3);
        assert_eq!(
            p.moves,
            vec![
                KeyMove { from: 3 * I, to: SENTINEL },
                KeyMove { from: 2 * I, to: 3 * I },
                KeyMove { from: I, to: 2 * I },
                KeyMove { from: SENTINEL, to: I },
            ]
        );
        let rows = apply(&old, &p);
        assert_eq!(rows.values().copied().collect::<Vec<_>>(), ["c", "a", "b", "d"]);
    }

    #[test]
    fn swap_is_one_two_cycle() {
        let old = persisted(&["a", "b"]);
        let p = plan(&old, &["b", "a"], I).unwrap();
        assert_eq!(p.cycles(), 1);
        assert_eq!(p.moves.len(), 3);
    }

    #[test]
    fn duplicates_match_in_order() {
        let old = persisted(&["a", "a", "b"]);
        let p = plan(&old, &["a", "b", "a"], I).unwrap();
        // Only the second "a" and "b" trade places.
        assert_eq!(p.moved_elements(), 2);
        let rows = apply(&old, &p);
        assert_eq!(rows.values().copied().collect::<Vec<_>>(), ["a", "b", "a"]);
    }

    #[test]
    fn independent_cycles() {
        let old = persisted(&[1, 2, 3, 4]);
        let p = plan(&old, &[2, 1, 4, 3], I).unwrap();
        assert_eq!(p.cycles(), 2);
        assert_eq!(p.moves.len(), 6);
    }

    // ---- Failures ----

    #[test]
    fn dense_keys_are_reported() {
        let old = vec![(1, "a"), (2, "b")];
        let err = plan(&old, &["a", "x", "b"], I).unwrap_err();
        assert_eq!(
            err,
            OrderError::DenseKeys {
                lower: 1,
                upper: 2,
                needed: 1
            }
        );
        assert!(err.requires_rewrite());
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            plan(&[(2, "a"), (1, "b")], &["a"], I).unwrap_err(),
            OrderError::UnsortedKeys(1)
        );
        assert_eq!(
            plan(&[(0, "a")], &["a"], I).unwrap_err(),
            OrderError::NonPositiveKey(0)
        );
        assert_eq!(
            initial_keys(1, 0).unwrap_err(),
            OrderError::InvalidIncrement(0)
        );
    }

    #[test]
    fn append_overflow_is_reported() {
        let old = vec![(i64::MAX - 1, "a")];
        let err = plan(&old, &["a", "b"], I).unwrap_err();
        assert!(matches!(err, OrderError::Overflow(_)));
        assert!(err.requires_rewrite());
    }

    proptest! {
        #[test]
        fn applying_a_plan_yields_the_new_order(
            old in prop::collection::vec(0u8..6, 0..10),
            new in prop::collection::vec(0u8..6, 0..10),
            increment in prop_oneof![Just(DEFAULT_INCREMENT), 1i64..8],
        ) {
            let persisted: Vec<(i64, u8)> = initial_keys(old.len(), increment)
                .unwrap()
                .into_iter()
                .zip(old.iter().copied())
                .collect();
            match plan(&persisted, &new, increment) {
                Ok(p) => {
                    let rows = apply(&persisted, &p);
                    let values: Vec<u8> = rows.values().copied().collect();
                    prop_assert_eq!(&values, &new);
                    let keys: Vec<i64> = rows.keys().copied().collect();
                    prop_assert_eq!(&keys, &p.result_keys);

                    let common = new.len() - p.insertions.len();
                    prop_assert_eq!(p.removals.len(), old.len() - common);
                    prop_assert!(p.moved_elements() <= common);
                    prop_assert!(p.moves.len() <= p.moved_elements() + p.moved_elements() / 2);
                }
                Err(err) => {
                    prop_assert!(err.requires_rewrite());
                    prop_assert!(increment != DEFAULT_INCREMENT);
                }
            }
        }
    }
}
