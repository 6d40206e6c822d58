//! Backlog - Queue のロック内部の状態
//!
//! # 実装詳細
//! - `tasks`: 比較関数でソート済みの可視タスク
//! - `next`: フィルタ名 → 次のタスクのキャッシュ
//!   - キーなし = 未計算
//!   - `Some(None)` = 計算済みで該当なし
//!   - `Some(Some(t))` = `t` は backlog 中にあり、そのフィルタで最初に来る
//! - `claimable`: push の observer フェーズ中のタスク（backlog にはまだ無い）

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::selector::{DEFAULT_FILTER, Predicate, Selector};
use crate::domain::TaskId;
use crate::sorted_array::{Comparator, SortedArray};
use crate::task::Task;

pub(super) struct Backlog {
    pub(super) tasks: SortedArray<Task>,
    /// Registration order; `default` is always first.
    filters: Vec<(String, Predicate)>,
    next: HashMap<String, Option<Task>>,
    claimable: HashSet<TaskId>,
}

impl Backlog {
    pub(super) fn new(tasks: SortedArray<Task>, accept_all: Predicate) -> Self {
        Self {
            tasks,
            filters: vec![(DEFAULT_FILTER.to_string(), accept_all)],
            next: HashMap::new(),
            claimable: HashSet::new(),
        }
    }

    fn predicate(&self, name: &str) -> Option<&Predicate> {
        self.filters
            .iter()
            .find(|(filter, _)| filter == name)
            .map(|(_, predicate)| predicate)
    }

    pub(super) fn filter_names(&self) -> Vec<String> {
        self.filters.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Names of the filters `task` passes, in registration order.
    pub(super) fn matching_filters(&self, task: &Task) -> Vec<String> {
        self.filters
            .iter()
            .filter(|(_, predicate)| predicate(task))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub(super) fn define_filter(&mut self, name: String, predicate: Predicate) {
        let next = self.tasks.find(|task| predicate(task)).cloned();
        match self.filters.iter_mut().find(|(filter, _)| *filter == name) {
            Some((_, existing)) => *existing = predicate,
            None => self.filters.push((name.clone(), predicate)),
        }
        self.next.insert(name, next);
    }

    pub(super) fn set_comparator(&mut self, cmp: Comparator<Task>) {
        self.tasks.resort(cmp);
        self.next.clear();
    }

    pub(super) fn is_tracked(&self, task: &Task) -> bool {
        self.claimable.contains(&task.id()) || self.tasks.index_of(task).is_some()
    }

    pub(super) fn mark_claimable(&mut self, task: &Task) {
        self.claimable.insert(task.id());
    }

    pub(super) fn is_claimable(&self, task: &Task) -> bool {
        self.claimable.contains(&task.id())
    }

    /// Clear the claimable flag. Returns whether it was set.
    pub(super) fn take_claimable(&mut self, task: &Task) -> bool {
        self.claimable.remove(&task.id())
    }

    /// Insert a task nobody claimed and refine the computed caches.
    pub(super) fn insert(&mut self, task: Task) {
        for (name, predicate) in &self.filters {
            if !predicate(&task) {
                continue;
            }
            // 未計算のエントリは peek 時に計算されるので触らない
            if let Some(cached) = self.next.get_mut(name) {
                let earlier = match cached {
                    None => true,
                    Some(current) => self.tasks.comparator().compare(&task, current) != Ordering::Greater,
                };
                if earlier {
                    *cached = Some(task.clone());
                }
            }
        }
        self.tasks.insert(task);
    }

    /// Index of the next task for `selector`, computing caches on the way.
    pub(super) fn position(&mut self, selector: &Selector) -> Option<usize> {
        match selector {
            Selector::All => (!self.tasks.is_empty()).then_some(0),
            Selector::Matching(predicate) => self.tasks.position(|task| predicate(task)),
            Selector::Filter(name) => {
                let cached = self.next_for(name)?;
                self.tasks.index_of(&cached)
            }
        }
    }

    /// Cached next task for a named filter; `None` for unknown filters.
    pub(super) fn next_for(&mut self, name: &str) -> Option<Task> {
        if let Some(cached) = self.next.get(name) {
            return cached.clone();
        }
        let predicate = self.predicate(name)?.clone();
        let next = self.tasks.find(|task| predicate(task)).cloned();
        self.next.insert(name.to_string(), next.clone());
        next
    }

    pub(super) fn peek(&mut self, selector: &Selector) -> Option<Task> {
        match selector {
            Selector::Filter(name) => self.next_for(name),
            _ => {
                let index = self.position(selector)?;
                self.tasks.get(index).cloned()
            }
        }
    }

    /// Remove the task at `index`, dropping any cache entry that points at it.
    pub(super) fn remove(&mut self, index: usize) -> Task {
        let task = self.tasks.remove(index);
        self.forget(&task);
        task
    }

    fn forget(&mut self, task: &Task) {
        self.next
            .retain(|_, cached| cached.as_ref().is_none_or(|current| current != task));
    }

    pub(super) fn pull(&mut self, selector: &Selector) -> Vec<Task> {
        let taken = match selector {
            Selector::All => {
                self.next.clear();
                let empty = SortedArray::with_comparator(self.tasks.comparator().clone());
                return std::mem::replace(&mut self.tasks, empty).into_vec();
            }
            Selector::Matching(predicate) => self.tasks.extract(|task| predicate(task)),
            Selector::Filter(name) => match self.predicate(name).cloned() {
                Some(predicate) => self.tasks.extract(|task| predicate(task)),
                None => Vec::new(),
            },
        };
        for task in &taken {
            self.forget(task);
        }
        taken
    }

    pub(super) fn len(&self, selector: &Selector) -> usize {
        match selector {
            Selector::All => self.tasks.len(),
            Selector::Matching(predicate) => self.tasks.count(|task| predicate(task)),
            Selector::Filter(name) => self
                .predicate(name)
                .map_or(0, |predicate| self.tasks.count(|task| predicate(task))),
        }
    }
}
