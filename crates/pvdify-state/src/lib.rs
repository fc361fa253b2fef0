//! pvdify-state: the authoritative record of what should run.
//!
//! Backed by [redb](https://docs.rs/redb). Holds apps and their port
//! bindings, the append-only release ledger, versioned config snapshots,
//! process definitions, domains, and the observed state the background
//! worker reports back.
//!
//! # Concurrency
//!
//! redb admits one write transaction at a time. Every read-modify-write
//! that hands out a unique value (ports, release and config versions) runs
//! inside a single write transaction together with the insert that depends
//! on it, so concurrent callers can never observe the same value.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod config;
pub mod error;
pub mod releases;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
