//! The block index: per-block metadata, the binary pack-index format, the in-memory
//! pack-index builder, the merged multi-index read view, and the committed index that ties
//! a cache to the currently-active set of index blobs.

pub mod builder;
pub mod committed;
pub mod format;
pub mod merged;
pub mod record;

pub use builder::PackIndexBuilder;
pub use committed::{CommittedIndex, CommittedIndexCache, DiskIndexCache, MemoryIndexCache};
pub use format::PackIndex;
pub use merged::{MergedIndex, ReadIndex};
pub use record::BlockInfo;
