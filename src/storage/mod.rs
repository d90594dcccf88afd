//! SQLite-backed persistence: schema management, the record store and the
//! debounced change notifier.

pub mod migrations;
pub mod notifier;
pub mod store;

pub use store::RecordStore;
