// Memory-level building blocks for tickrcu: the callback node and the intrusive list that carries it between
// queues, cache-line padding for shared slots, and the std/loom sync shim.

pub mod list;
pub mod node;
pub mod padded;
pub mod sync;

pub use list::CallbackList;
pub use node::{Callback, CallbackNode};
pub use padded::CachePadded;
