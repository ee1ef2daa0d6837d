//! BasaltDB storage engines.
//!
//! Two on-disk structures share the buffer pool: slotted heap files holding
//! fixed-size records behind a free-page chain, and B+-tree indexes mapping
//! keys to record identifiers through an ordered leaf chain.

pub mod bitmap;
pub mod index;
pub mod record;

pub use index::{index_name, BTreeHandle, IndexManager, IndexScan, KeyComparator};
pub use record::{Record, RecordFileHandle, RecordFileManager, RecordScan};
