//! Counted multiset.
//!
//! A [`Bag`] records how many times each element was added. Validator samples
//! are `Bag<NodeId>` (a validator drawn twice carries weight two) and poll
//! tallies are `Bag<Id>` (candidate -> responding weight).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Multiset with per-element counts and a cached total size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bag<T: Eq + Hash> {
    counts: HashMap<T, u64>,
    size: u64,
}

impl<T: Eq + Hash> Default for Bag<T> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            size: 0,
        }
    }
}

impl<T: Eq + Hash + Clone> Bag<T> {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one occurrence of `element`
    pub fn add(&mut self, element: T) {
        self.add_count(element, 1);
    }

    /// Add `count` occurrences of `element`. Zero counts are ignored.
    pub fn add_count(&mut self, element: T, count: u64) {
        if count == 0 {
            return;
        }
        *self.counts.entry(element).or_default() += count;
        self.size += count;
    }

    /// Number of occurrences of `element`
    pub fn count(&self, element: &T) -> u64 {
        self.counts.get(element).copied().unwrap_or(0)
    }

    /// Remove every occurrence of `element`, returning how many there were
    pub fn remove(&mut self, element: &T) -> u64 {
        let removed = self.counts.remove(element).unwrap_or(0);
        self.size -= removed;
        removed
    }

    /// Total number of occurrences across all elements
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Returns true if nothing has been added
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of distinct elements
    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if `element` occurs at least once
    pub fn contains(&self, element: &T) -> bool {
        self.counts.contains_key(element)
    }

    /// Distinct elements, in arbitrary order
    pub fn list(&self) -> Vec<T> {
        self.counts.keys().cloned().collect()
    }

    /// Iterate over `(element, count)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&T, u64)> {
        self.counts.iter().map(|(k, v)| (k, *v))
    }

    /// The element with the highest count, if any.
    ///
    /// Ties are broken arbitrarily.
    pub fn mode(&self) -> Option<(T, u64)> {
        self.counts
            .iter()
            .max_by_key(|(_, c)| **c)
            .map(|(k, c)| (k.clone(), *c))
    }

    /// Elements whose count is at least `threshold`
    pub fn threshold(&self, threshold: u64) -> Vec<T> {
        self.counts
            .iter()
            .filter(|(_, c)| **c >= threshold)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// A new bag holding only the elements accepted by `keep`
    pub fn filter<F>(&self, mut keep: F) -> Bag<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut out = Bag::new();
        for (k, c) in &self.counts {
            if keep(k) {
                out.add_count(k.clone(), *c);
            }
        }
        out
    }
}

impl<T: Eq + Hash + Clone> FromIterator<T> for Bag<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut bag = Bag::new();
        for element in iter {
            bag.add(element);
        }
        bag
    }
}

impl<T: Eq + Hash + Clone> Extend<(T, u64)> for Bag<T> {
    fn extend<I: IntoIterator<Item = (T, u64)>>(&mut self, iter: I) {
        for (element, count) in iter {
            self.add_count(element, count);
        }
    }
}

impl<T: Eq + Hash + Clone + fmt::Display> fmt::Display for Bag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bag(size = {})", self.size)?;
        for (element, count) in &self.counts {
            write!(f, "\n    {}: {}", element, count)?;
        }
        Ok(())
    }
}
