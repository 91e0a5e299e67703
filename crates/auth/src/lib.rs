//! User identity as it crosses node boundaries, session queries, and the
//! short-lived cross-node/half token stores.

pub mod sessions;
pub mod tokens;
pub mod user;

pub use {
    tokens::TokenStore,
    user::{UserContext, flags},
};
