//! Selector - peek / pop / pull の対象指定

use std::fmt;
use std::sync::Arc;

use crate::task::Task;

/// Name of the always-present filter that accepts every task.
pub const DEFAULT_FILTER: &str = "default";

/// Task predicate used by filters and ad-hoc selections.
///
/// Predicates run under the queue's backlog lock and must not call back into
/// the queue.
pub type Predicate = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

/// Which tasks a queue read or removal applies to.
#[derive(Clone, Default)]
pub enum Selector {
    /// Every task (the `default` filter).
    #[default]
    All,
    /// A filter registered with `Queue::define_filter`; its next task is cached.
    Filter(String),
    /// An ad-hoc predicate. Never cached.
    Matching(Predicate),
}

impl Selector {
    pub fn filter(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == DEFAULT_FILTER {
            Selector::All
        } else {
            Selector::Filter(name)
        }
    }

    pub fn matching<F>(predicate: F) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        Selector::Matching(Arc::new(predicate))
    }
}

impl From<&str> for Selector {
    fn from(name: &str) -> Self {
        Selector::filter(name)
    }
}

impl From<String> for Selector {
    fn from(name: String) -> Self {
        Selector::filter(name)
    }
}

impl From<Predicate> for Selector {
    fn from(predicate: Predicate) -> Self {
        Selector::Matching(predicate)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => f.write_str("All"),
            Selector::Filter(name) => f.debug_tuple("Filter").field(name).finish(),
            Selector::Matching(_) => f.write_str("Matching(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("default", "All")]
    #[case("over_7", "Filter(\"over_7\")")]
    fn names_map_to_selectors(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(format!("{:?}", Selector::from(name)), expected);
    }

    #[test]
    fn ad_hoc_predicates_are_opaque_in_debug_output() {
        let selector = Selector::matching(|_| true);
        assert_eq!(format!("{selector:?}"), "Matching(..)");
        assert!(matches!(Selector::default(), Selector::All));
    }
}
