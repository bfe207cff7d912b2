//! Cache providers.
//!
//! - [`memory::EphemeralProvider`]: in-process maps
//! - [`sql::PersistentProvider`]: one SQLite file per cache identity

pub mod traits;
pub mod memory;
pub mod sql;
