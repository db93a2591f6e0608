//! S3 (§8): writing identical content repeatedly while still pending is a no-op past the
//! first call, and only ever materializes as a single block once flushed.

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

#[test]
fn identical_writes_dedup_to_a_single_block() {
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
        max_pack_size: 1 << 20,
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

    let data_x = vec![7u8; 999];
    let mut ids = Vec::new();
    for _ in 0..100 {
        ids.push(manager.write_block(&data_x, None, &cancel).unwrap());
    }
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));

    assert_eq!(count_blobs(&store, "", &cancel), 0);

    manager.flush(&cancel).unwrap();

    assert_eq!(count_blobs(&store, "p", &cancel), 1);
    assert_eq!(count_blobs(&store, "n", &cancel), 1);
}
