//! S6 (§8): if every index blob is lost, the pack blobs themselves still carry enough to
//! reconstruct the index via `RecoverIndexFromPackBlob`.

use std::sync::Arc;

use blockstore_core::backend::testing::MemoryBlobStore;
use blockstore_core::{
    BlobStore, BlockManager, CachingOptions, CancellationToken, Clock, FormattingOptions,
    FrozenClock, NoProgress,
};

fn list_ids(store: &MemoryBlobStore, prefix: &str, cancel: &CancellationToken) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    store
        .list_blobs(prefix, cancel, &mut |meta| {
            out.push((meta.id, meta.length));
            Ok(())
        })
        .unwrap();
    out
}

#[test]
fn lost_index_blobs_are_recoverable_from_pack_postambles() {
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

    let id1 = manager.write_block(b"one", None, &cancel).unwrap();
    let id2 = manager.write_block(b"two", None, &cancel).unwrap();
    let id3 = manager.write_block(b"three", None, &cancel).unwrap();
    manager.flush(&cancel).unwrap();

    for (id, _) in list_ids(&store, "n", &cancel) {
        store.delete_blob(&id, &cancel).unwrap();
    }
    assert_eq!(list_ids(&store, "n", &cancel).len(), 0);

    let clock2: Arc<dyn Clock> = Arc::new(FrozenClock::new(1_483_228_900));
    let recovering: Arc<dyn BlobStore> = store.clone();
    let manager2 = BlockManager::new(
        recovering,
        &formatting,
        &caching,
        b"fmt".to_vec(),
        clock2,
        true,
        &NoProgress,
        &cancel,
    )
    .unwrap();

    assert!(manager2.get_block(&id1, &cancel).is_err());
    assert!(manager2.get_block(&id2, &cancel).is_err());
    assert!(manager2.get_block(&id3, &cancel).is_err());

    for (pack_id, length) in list_ids(&store, "p", &cancel) {
        manager2
            .recover_index_from_pack_blob(&pack_id, length, true, &cancel)
            .unwrap();
    }
    manager2.flush(&cancel).unwrap();

    assert_eq!(manager2.get_block(&id1, &cancel).unwrap(), b"one");
    assert_eq!(manager2.get_block(&id2, &cancel).unwrap(), b"two");
    assert_eq!(manager2.get_block(&id3, &cancel).unwrap(), b"three");
}
