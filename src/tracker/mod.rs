//! Activity tracking and inactivity classification.

mod classifier;
mod ledger;
mod models;

pub use classifier::*;
pub use ledger::*;
pub use models::*;
