/*!
A content-addressable, encrypted, deduplicating block storage engine for backup and snapshot
workloads, inspired by [`restic`](https://restic.net/)'s repository format.

# Overview

This crate implements the storage core only: content-addressed, globally deduplicated blocks
are written into encrypted pack blobs and tracked by a binary pack-index format, queried
through a merged, newest-wins view over whichever index blobs are currently committed. It does
not manage manifests, snapshots, retention policy, or any concrete object-store driver; host
applications build those on top of [`manager::BlockManager`] and [`backend::BlobStore`].

# Entry points

* [`manager::BlockManager`] - the single synchronous orchestrator: `write_block`, `get_block`,
  `delete_block`, `rewrite_block`, `flush`, the listing operations, and maintenance
  (`compact_indexes`, `recover_index_from_pack_blob`).
* [`backend::BlobStore`] - the object-store trait a host application implements or selects
  ([`backend::local::LocalBlobStore`] is the one concrete driver carried here).
* [`options::FormattingOptions`] / [`options::CachingOptions`] - the configuration surface fed
  into [`manager::BlockManager::new`].

# Crate features

This crate carries no optional features of its own; every dependency below is required.
*/

#![forbid(unsafe_code)]
#![warn(
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications,
    clippy::nursery,
    bad_style,
    dead_code,
    improper_ctypes,
    missing_copy_implementations,
    missing_debug_implementations,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    clippy::cast_lossless,
    clippy::default_trait_access,
    clippy::doc_markdown,
    clippy::manual_string_new,
    clippy::match_same_arms,
    clippy::semicolon_if_nothing_returned,
    clippy::trivially_copy_pass_by_ref
)]
#![allow(clippy::module_name_repetitions, clippy::redundant_pub_crate)]
#![allow(clippy::missing_const_for_fn)]

pub mod backend;
pub mod cache;
pub mod cancel;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod id;
pub mod index;
pub mod manager;
pub mod options;
pub mod pack;
pub mod progress;
pub mod stats;

pub use crate::{
    backend::{local::LocalBlobStore, BlobMetadata, BlobStore},
    cache::{BlockCache, ListCache},
    cancel::CancellationToken,
    clock::{Clock, FrozenClock, SystemClock},
    crypto::Formatter,
    error::{CoreError, CoreErrorKind, CoreResult},
    id::ContentId,
    index::{BlockInfo, CommittedIndex, MergedIndex, PackIndex, PackIndexBuilder, ReadIndex},
    manager::{BlockManager, CompactOptions},
    options::{CachingOptions, FormattingOptions},
    pack::{AssembledPack, PackLayout},
    progress::{NoProgress, Progress},
    stats::{Stats, StatsSnapshot},
};
