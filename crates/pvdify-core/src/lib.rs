pub mod config;
pub mod locks;
pub mod naming;
pub mod validate;

pub use config::DaemonConfig;
pub use locks::KeyedLocks;
pub use naming::UnitNaming;
pub use validate::ValidationError;
