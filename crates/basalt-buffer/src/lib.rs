//! BasaltDB buffer pool.
//!
//! A fixed array of page frames cached in memory, with LRU replacement and
//! pin-counted, dirty-tracked write-back through the disk manager.

pub mod frame;
pub mod pool;
pub mod replacer;

pub use frame::{Frame, FrameId};
pub use pool::BufferPoolManager;
pub use replacer::LruReplacer;
