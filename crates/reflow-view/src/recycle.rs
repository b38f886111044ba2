//! Pools of frozen views awaiting reuse.
//!
//! Views are pooled by a caller-supplied type name so a list that recycles
//! row views never hands a row back to a header slot. Within one type the
//! pool is a stack: the most recently recycled view is reused first.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fmt;

use ahash::AHashMap;

use crate::scheduler::ViewScheduler;

#[derive(Default)]
pub struct RecyclePool {
    pools: RefCell<AHashMap<String, Vec<ViewScheduler>>>,
}

impl RecyclePool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, type_name: &str, view: ViewScheduler) {
        self.pools
            .borrow_mut()
            .entry(type_name.to_owned())
            .or_default()
            .push(view);
    }

    pub fn take(&self, type_name: &str) -> Option<ViewScheduler> {
        self.pools.borrow_mut().get_mut(type_name)?.pop()
    }

    /// Total pooled views across every type name.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.borrow().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.pools.borrow_mut().clear();
    }
}

impl fmt::Debug for RecyclePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecyclePool")
            .field("pooled", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use reflow_reactive::RecordingHost;

    #[test]
    fn pools_are_segregated_by_type_name() {
        let host = Rc::new(RecordingHost::new());
        let root = ViewScheduler::root(host);
        let pool = RecyclePool::new();
        pool.store("Row", root.child());
        pool.store("Header", root.child());
        assert_eq!(pool.len(), 2);
        assert!(pool.take("Footer").is_none());
        assert!(pool.take("Row").is_some());
        assert!(pool.take("Row").is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn take_is_last_in_first_out() {
        let host = Rc::new(RecordingHost::new());
        let root = ViewScheduler::root(host);
        let pool = RecyclePool::new();
        let first = root.child();
        let second = root.child();
        pool.store("Row", first.clone());
        pool.store("Row", second.clone());
        let taken = pool.take("Row").unwrap();
        assert!(taken.same_view(&second));
        assert!(pool.take("Row").unwrap().same_view(&first));
    }
}
