//! S4 (§8): crossing `max_pack_size` finalizes a pack automatically, independent of any
//! explicit `Flush`; a final `Flush` still finalizes whatever partial pack is left plus the
//! index.

use std::sync::Arc;

use blockstore_core::backend::testing::MemoryBlobStore;
use blockstore_core::{
    BlobStore, BlockManager, CachingOptions, CancellationToken, Clock, FormattingOptions,
    FrozenClock, NoProgress,
};

fn count_blobs(store: &MemoryBlobStore, prefix: &str, cancel: &CancellationToken) -> usize {
    let mut count = 0;
    store
        .list_blobs(prefix, cancel, &mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
    count
}

fn block_of(seed: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (seed.wrapping_mul(2_654_435_761).wrapping_add(i as u64) % 256) as u8)
        .collect()
}

#[test]
fn crossing_max_pack_size_finalizes_packs_as_it_goes() {
    let store = Arc::new(MemoryBlobStore::new());
    let blob_store: Arc<dyn BlobStore> = store.clone();
    let clock: Arc<dyn Clock> = Arc::new(FrozenClock::new(1_483_228_800));
    let cancel = CancellationToken::new();
    let formatting = FormattingOptions {
        version: 1,
        hash: "HMAC-SHA256".to_owned(),
        encryption: "NONE".to_owned(),
        hmac_secret: vec![1, 2, 3],
        master_key: Vec::new(),
        max_pack_size: 2000,
    };
    let caching = CachingOptions::default();

    let manager = BlockManager::new(
        blob_store,
        &formatting,
        &caching,
        b"fmt".to_vec(),
        clock,
        true,
        &NoProgress,
        &cancel,
    )
    .unwrap();

    for seed in 0..100u64 {
        manager.write_block(&block_of(seed, 25), None, &cancel).unwrap();
    }
    assert_eq!(count_blobs(&store, "p", &cancel), 1);
    assert_eq!(count_blobs(&store, "n", &cancel), 0);

    for seed in 100..200u64 {
        manager.write_block(&block_of(seed, 25), None, &cancel).unwrap();
    }
    assert_eq!(count_blobs(&store, "p", &cancel), 2);
    assert_eq!(count_blobs(&store, "n", &cancel), 0);

    manager.flush(&cancel).unwrap();
    assert_eq!(count_blobs(&store, "p", &cancel), 3);
    assert_eq!(count_blobs(&store, "n", &cancel), 1);
    assert_eq!(count_blobs(&store, "", &cancel), 4);
}
