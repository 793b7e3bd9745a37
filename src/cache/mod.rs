//! Shared cache layer: pooled client and the type-preserving codec.

pub mod client;
pub mod codec;

pub use client::CacheClient;
pub use codec::{CacheCodec, CacheValue, Cacheable};
