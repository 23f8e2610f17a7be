use serde::{Deserialize, Serialize};

use crate::device::ShortId;

/// One device's counter within a version vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: u64,
    pub value: u64,
}

/// Result of comparing two version vectors. `Concurrent` means neither
/// vector dominates the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    Equal,
    Greater,
    Lesser,
    Concurrent,
}

/// A version vector: a set of per-device monotonic counters. Missing
/// entries count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vector(Vec<Counter>);

impl Vector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn counters(&self) -> &[Counter] {
        &self.0
    }

    /// The counter value for the given device, zero if absent.
    pub fn counter(&self, id: ShortId) -> u64 {
        self.0
            .iter()
            .find(|c| c.id == id.0)
            .map(|c| c.value)
            .unwrap_or(0)
    }

    /// Bump the counter for `id`, inserting it if absent. Keeps the
    /// entries sorted by device id.
    pub fn update(&mut self, id: ShortId) {
        match self.0.binary_search_by_key(&id.0, |c| c.id) {
            Ok(i) => self.0[i].value += 1,
            Err(i) => self.0.insert(i, Counter { id: id.0, value: 1 }),
        }
    }

    pub fn updated(mut self, id: ShortId) -> Self {
        self.update(id);
        self
    }

    /// The element-wise maximum of the two vectors.
    pub fn merge(&self, other: &Vector) -> Vector {
        let mut out = self.0.clone();
        for c in &other.0 {
            match out.binary_search_by_key(&c.id, |o| o.id) {
                Ok(i) => out[i].value = out[i].value.max(c.value),
                Err(i) => out.insert(i, *c),
            }
        }
        Vector(out)
    }

    pub fn compare(&self, other: &Vector) -> VectorOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        let mut ids: Vec<u64> = self.0.iter().chain(other.0.iter()).map(|c| c.id).collect();
        ids.sort_unstable();
        ids.dedup();

        for id in ids {
            let a = self.counter(ShortId(id));
            let b = other.counter(ShortId(id));
            if a > b {
                self_greater = true;
            } else if a < b {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Greater,
            (false, true) => VectorOrdering::Lesser,
            (true, true) => VectorOrdering::Concurrent,
        }
    }

    pub fn concurrent(&self, other: &Vector) -> bool {
        self.compare(other) == VectorOrdering::Concurrent
    }

    pub fn greater_equal(&self, other: &Vector) -> bool {
        matches!(
            self.compare(other),
            VectorOrdering::Equal | VectorOrdering::Greater
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(counters: &[(u64, u64)]) -> Vector {
        let mut out = Vector::new();
        out.0 = counters
            .iter()
            .map(|&(id, value)| Counter { id, value })
            .collect();
        out
    }

    #[test]
    fn missing_entries_count_as_zero() {
        let a = v(&[(1, 2)]);
        assert_eq!(a.counter(ShortId(1)), 2);
        assert_eq!(a.counter(ShortId(9)), 0);
    }

    #[test]
    fn update_inserts_and_bumps() {
        let mut a = Vector::new();
        a.update(ShortId(7));
        a.update(ShortId(7));
        a.update(ShortId(3));
        assert_eq!(a.counter(ShortId(7)), 2);
        assert_eq!(a.counter(ShortId(3)), 1);
        // Sorted by id.
        assert_eq!(a.counters()[0].id, 3);
    }

    #[test]
    fn compare_covers_all_orderings() {
        let base = v(&[(1, 1), (2, 1)]);
        assert_eq!(base.compare(&base.clone()), VectorOrdering::Equal);
        assert_eq!(
            v(&[(1, 2), (2, 1)]).compare(&base),
            VectorOrdering::Greater
        );
        assert_eq!(base.compare(&v(&[(1, 2), (2, 1)])), VectorOrdering::Lesser);
        assert_eq!(
            v(&[(1, 2)]).compare(&v(&[(2, 2)])),
            VectorOrdering::Concurrent
        );
    }

    #[test]
    fn merge_takes_elementwise_max() {
        let a = v(&[(1, 3), (2, 1)]);
        let b = v(&[(2, 4), (3, 1)]);
        let m = a.merge(&b);
        assert_eq!(m.counter(ShortId(1)), 3);
        assert_eq!(m.counter(ShortId(2)), 4);
        assert_eq!(m.counter(ShortId(3)), 1);
    }

    #[test]
    fn merged_vector_dominates_both_inputs() {
        let a = v(&[(1, 2)]);
        let b = v(&[(2, 2)]);
        let m = a.merge(&b);
        assert!(m.greater_equal(&a));
        assert!(m.greater_equal(&b));
        assert!(!a.greater_equal(&b));
    }
}
