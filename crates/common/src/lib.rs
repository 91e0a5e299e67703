//! Shared error taxonomy and utilities used across all spherical crates.

pub mod error;
pub mod tlru;

pub use {
    error::{Error, Result},
    tlru::Tlru,
};
