//! Peer-to-peer hash verification and cross-node trust.
//!
//! Lets any node prove a message blob was authored by another node, even when
//! that node is offline, its signing key has rotated, or it is actively
//! lying: direct signature verification first, a trusted-node consensus vote
//! when that fails. All federated traffic is authenticated through this
//! layer.

pub mod cache;
pub mod cache_memory;
pub mod cache_redis;
pub mod cache_sqlite;
pub mod client;
pub mod cross_node;
pub mod inform;
pub mod signing;

pub use {
    cache::{HashCache, NopCache},
    cache_memory::MemoryCache,
    cache_redis::RedisCache,
    cache_sqlite::SqliteCache,
    client::VerifierClient,
    cross_node::CrossNodeMessage,
    signing::SigningIdentity,
};
