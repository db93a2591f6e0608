//! S1 (§8): a fresh manager that has never written anything leaves the Blob Store untouched
//! even after an explicit `Flush`.

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
fn empty_flush_writes_nothing() {
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

    manager.flush(&cancel).unwrap();

    assert_eq!(count_blobs(&store, "", &cancel), 0);
}
