//! SortedArray - 挿入時に二分探索で順序を保つコンテナ
//!
//! Queue の backlog はこれで保持します。
//!
//! # 計算量
//! - `insert`: O(log n) 回の比較 + O(n) のシフト
//! - `find` / `count` / 走査: O(n)

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::SchedulerError;

/// A shareable two-argument ordering function.
pub struct Comparator<T> {
    cmp: Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>,
}

impl<T> Comparator<T> {
    /// Two-argument comparator.
    pub fn by<F>(cmp: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self { cmp: Arc::new(cmp) }
    }

    /// One-argument key extractor, converted to a comparator over the keys.
    pub fn by_key<K, F>(key: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self::by(move |a, b| key(a).cmp(&key(b)))
    }

    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.cmp)(a, b)
    }
}

impl<T: Ord> Comparator<T> {
    pub fn natural() -> Self {
        Self::by(|a: &T, b: &T| a.cmp(b))
    }
}

impl<T> Clone for Comparator<T> {
    fn clone(&self) -> Self {
        Self {
            cmp: Arc::clone(&self.cmp),
        }
    }
}

impl<T> fmt::Debug for Comparator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Comparator(..)")
    }
}

/// Vec kept sorted by a fixed comparator after every mutation.
pub struct SortedArray<T> {
    items: Vec<T>,
    cmp: Comparator<T>,
}

impl<T: Ord> SortedArray<T> {
    pub fn new() -> Self {
        Self::with_comparator(Comparator::natural())
    }
}

impl<T: Ord> Default for SortedArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SortedArray<T> {
    pub fn with_comparator(cmp: Comparator<T>) -> Self {
        Self {
            items: Vec::new(),
            cmp,
        }
    }

    /// Fails with `InvalidComparator` when no ordering is supplied.
    pub fn try_new(cmp: Option<Comparator<T>>) -> Result<Self, SchedulerError> {
        cmp.map(Self::with_comparator)
            .ok_or(SchedulerError::InvalidComparator)
    }

    pub fn comparator(&self) -> &Comparator<T> {
        &self.cmp
    }

    /// Insert at the lower bound: before the first element `value` does not
    /// strictly exceed. Returns the index used.
    pub fn insert(&mut self, value: T) -> usize {
        let index = self.lower_bound(&value);
        self.items.insert(index, value);
        index
    }

    fn lower_bound(&self, value: &T) -> usize {
        let mut low = 0;
        let mut high = self.items.len();

        while low < high {
            let mid = low + (high - low) / 2;
            if self.cmp.compare(value, &self.items[mid]) == Ordering::Greater {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Index of `value` itself, found by binary search over the run of
    /// elements comparing equal to it.
    pub fn index_of(&self, value: &T) -> Option<usize>
    where
        T: PartialEq,
    {
        let start = self.lower_bound(value);
        self.items[start..]
            .iter()
            .take_while(|item| self.cmp.compare(value, item) == Ordering::Equal)
            .position(|item| item == value)
            .map(|offset| start + offset)
    }

    /// Concatenate `other` onto this container and re-sort the result.
    pub fn merge<I>(mut self, other: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        self.items.extend(other);
        let cmp = self.cmp.clone();
        self.items.sort_by(|a, b| cmp.compare(a, b));
        self
    }

    /// Swap the comparator and rebuild the order.
    pub fn resort(&mut self, cmp: Comparator<T>) {
        self.cmp = cmp;
        let cmp = self.cmp.clone();
        self.items.sort_by(|a, b| cmp.compare(a, b));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<&T>
    where
        P: FnMut(&T) -> bool,
    {
        self.items.iter().find(|item| predicate(item))
    }

    pub fn position<P>(&self, predicate: P) -> Option<usize>
    where
        P: FnMut(&T) -> bool,
    {
        self.items.iter().position(predicate)
    }

    pub fn count<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&T) -> bool,
    {
        self.items.iter().filter(|item| predicate(item)).count()
    }

    pub fn remove(&mut self, index: usize) -> T {
        self.items.remove(index)
    }

    /// Remove and return every element matching `predicate`, in order.
    pub fn extract<P>(&mut self, mut predicate: P) -> Vec<T>
    where
        P: FnMut(&T) -> bool,
    {
        let (taken, kept): (Vec<T>, Vec<T>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| predicate(item));
        self.items = kept;
        taken
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T: Clone> SortedArray<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

impl<T: Clone> Clone for SortedArray<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            cmp: self.cmp.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SortedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl<T> Extend<T> for SortedArray<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.insert(item);
        }
    }
}

impl<'a, T> IntoIterator for &'a SortedArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
