//! Build cache.
//!
//! `LayerCache` maps chained step keys to the layers those steps produced,
//! so an unchanged step prefix is replayed without re-executing anything.

pub mod layer_cache;

pub use layer_cache::{chain_key, CacheMeta, CachedLayer, LayerCache};
