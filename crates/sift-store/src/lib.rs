//! Embedded document store for siftd.
//!
//! Two layers live here:
//!
//! - [`Store`]: a thin facade over rocksdb that the replication layer can
//!   open, close and checkpoint as a unit.
//! - [`CollectionManager`]: the search-domain layer (collections and their
//!   documents) persisted through the store.

pub mod collections;
pub mod store;

pub use collections::{CollectionManager, CollectionMeta, ImportReport};
pub use store::{Store, StoreError};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
