//! Cache subsystem: fingerprinting, lookup, durable metadata, eviction.
//!
//! The flow is leaves-first: [`normalizer`] produces canonical text,
//! [`hot`] answers in-memory lookups over it, [`catalog`] is the durable
//! source of truth, [`store`] keeps artifact files, index, and catalog in
//! lockstep, [`evictor`] trims cold entries, and [`integrity`] reconciles
//! catalog and filesystem at startup.

pub mod catalog;
pub mod evictor;
pub mod hot;
pub mod integrity;
pub mod matcher;
pub mod normalizer;
pub mod store;

pub use catalog::{Catalog, CatalogError};
pub use evictor::Evictor;
pub use hot::HotIndex;
pub use matcher::{CacheMatch, MatchType, Matcher};
pub use store::{CacheStore, StoreError};
