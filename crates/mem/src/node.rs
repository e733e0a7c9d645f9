// CallbackNode
//
// A node is one unit of deferred work: the closure to run and the intrusive link that chains it into whichever
// CallbackList currently owns it. Outside of a list a node is always a Box<CallbackNode>, so whoever holds the box
// owns the work. Inside a list the box is turned into a raw link and the list becomes the owner.
//
//   submit ──► worker list ──► previous list ──► pending list ──► invoke() (node consumed)
//
// The node is never in two lists at once: every move between lists takes the box (or the whole chain) by value.

use std::fmt;
use std::ptr::NonNull;

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

pub struct CallbackNode {
    pub(crate) next: Option<NonNull<CallbackNode>>,
    func: Callback,
}

// SAFETY: `next` is only ever read or written by the list which owns the node, and the list is moved between
// threads as a whole. The closure itself is Send.
unsafe impl Send for CallbackNode {}

impl CallbackNode {
    /// Allocates a node for `f`. Building nodes up front lets a worker append without touching the allocator.
    pub fn new<F>(f: F) -> Box<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_callback(Box::new(f))
    }

    pub fn from_callback(func: Callback) -> Box<Self> {
        Box::new(Self { next: None, func })
    }

    /// Runs the callback, consuming the node. The node's memory is released before the callback returns control
    /// to the caller, so a callback is free to drop anything the node pointed at.
    #[inline]
    pub fn invoke(self: Box<Self>) {
        debug_assert!(self.next.is_none(), "invoking a node which is still linked");
        let CallbackNode { func, .. } = *self;
        func();
    }
}

impl fmt::Debug for CallbackNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackNode")
            .field("linked", &self.next.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn invoke_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let node = CallbackNode::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });

        println!("node {:?}", node);
        node.invoke();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dropping_a_node_does_not_run_it() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let node = CallbackNode::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        drop(node);

        // The closure (and its Arc clone) went away without running
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(Arc::strong_count(&hits), 1);
    }
}
