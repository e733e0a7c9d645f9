// Fields which are hammered by different threads (the epoch selector, every worker slot) get their own cache line
// so a worker appending to its slot doesn't keep invalidating the line its neighbour is writing to.
//
// A great explanation and gathering of sources is in crossbeam ->
// https://github.com/crossbeam-rs/crossbeam/blob/master/crossbeam-utils/src/cache_padded.rs#L150
//
// For now, we default to aligning to 64 bytes. Some arm64 and x86 parts prefetch in pairs of lines (128 bytes)
// and may want more over time.

use std::ops::Deref;

#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
#[repr(align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}
