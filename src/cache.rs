//! Local caching layers that sit in front of the Blob Store: the authenticated pack-data cache
//! (§4.6) and the pack-index listing cache (§4.7).

pub mod block_cache;
pub mod list_cache;

pub use block_cache::BlockCache;
pub use list_cache::ListCache;
