//! Database module for idlewatch.
//!
//! Provides SQLite storage of the event history with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
