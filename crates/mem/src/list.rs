// CallbackList
//
// A singly linked, intrusive FIFO of CallbackNodes. The nodes only carry a `next` link; the list head keeps both
// the first and the last node so a push onto the tail is O(1).
//
// ┌──────────────┐
// │ head ────────┼──► node ──► node ──► node ──► None
// │ tail ────────┼──────────────────────▲
// │ len          │
// └──────────────┘
//
// Invariants:
// - head is None  <=>  tail is None  <=>  len == 0
// - tail, when set, is the last node reachable from head and its `next` is None
// - every node reachable from head was produced by Box::leak and is owned by exactly this list
//
// Joining (append) moves the whole chain of another list onto our tail and leaves the other list empty, so there
// is no "corrupted source which must be re-initialised" state to get wrong.
//
// NOTE: nodes are held as raw NonNull links rather than Option<Box<_>> chains. Keeping a raw tail pointer into a
// Box chain would be invalidated every time the owning Box is moved (Box asserts uniqueness), which is exactly
// what std's LinkedList avoids by going through Box::into_raw / Box::from_raw.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::node::CallbackNode;

pub struct CallbackList {
    head: Option<NonNull<CallbackNode>>,
    tail: Option<NonNull<CallbackNode>>,
    len: usize,
    // The list owns boxed nodes
    _owns: PhantomData<Box<CallbackNode>>,
}

// SAFETY: the list uniquely owns its nodes and nodes are Send.
unsafe impl Send for CallbackList {}

impl CallbackList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _owns: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Adds a node to the tail. Takes ownership of the node.
    #[inline]
    pub fn push_back(&mut self, mut node: Box<CallbackNode>) {
        node.next = None;
        let node = NonNull::from(Box::leak(node));

        match self.tail {
            // SAFETY: tail is a live node owned by this list.
            Some(mut tail) => unsafe { tail.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    /// Removes the node at the head, handing ownership back to the caller.
    #[inline]
    pub fn pop_front(&mut self) -> Option<Box<CallbackNode>> {
        let head = self.head?;

        // SAFETY: head came from Box::leak in push_back and is owned by this list. Once unlinked we are the only
        // holder of the pointer, so rebuilding the box is sound.
        let mut node = unsafe { Box::from_raw(head.as_ptr()) };
        self.head = node.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(node)
    }

    /// Moves every node of `other` onto the tail of `self`, preserving order. `other` is left empty.
    pub fn append(&mut self, other: &mut CallbackList) {
        let Some(other_head) = other.head.take() else {
            return;
        };

        match self.tail {
            // SAFETY: tail is a live node owned by this list.
            Some(mut tail) => unsafe { tail.as_mut().next = Some(other_head) },
            None => self.head = Some(other_head),
        }
        self.tail = other.tail.take();
        self.len += std::mem::take(&mut other.len);
    }
}

impl Default for CallbackList {
    fn default() -> Self {
        Self::new()
    }
}

// Dropping a list drops the nodes (and their closures) without running them. Done iteratively so a long chain
// can't blow the stack.
impl Drop for CallbackList {
    fn drop(&mut self) {
        while let Some(node) = self.pop_front() {
            drop(node);
        }
    }
}

impl Iterator for CallbackList {
    type Item = Box<CallbackNode>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl Extend<Box<CallbackNode>> for CallbackList {
    fn extend<I: IntoIterator<Item = Box<CallbackNode>>>(&mut self, iter: I) {
        for node in iter {
            self.push_back(node);
        }
    }
}

impl fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackList").field("len", &self.len).finish()
    }
}
