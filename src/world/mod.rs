//! World presence module
//!
//! - `store` - authoritative identity -> position mapping
//! - `sweeper` - periodic eviction of participants that went quiet

pub mod store;
pub mod sweeper;

pub use store::{PresenceStore, UpsertOutcome};
pub use sweeper::PresenceSweeper;
