//! Database module for runtrail.
//!
//! Provides SQLite storage with an embedded migration, plus the storage
//! contracts the engine and coordinator are written against.

mod models;
mod store;
mod traits;

pub use models::*;
pub use store::*;
pub use traits::*;
