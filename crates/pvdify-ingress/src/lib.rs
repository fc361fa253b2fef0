//! pvdify-ingress: the hostname → upstream rule file read by the tunnel daemon.
//!
//! The file is an ordered list of rules that always ends in a catch-all.
//! Pvdify owns its contents only; reloading the tunnel daemon is left to it.

pub mod error;
pub mod rules;
pub mod store;
pub mod sync;

pub use error::{IngressError, IngressResult};
pub use rules::{CATCH_ALL_SERVICE, IngressRule, TunnelConfig};
pub use store::{FileIngressStore, IngressStore, MemoryIngressStore};
pub use sync::{IngressSynchronizer, SyncStats, local_service};
