pub mod backup;
pub mod config;
pub mod error;
pub mod rules;
pub mod storage;
pub mod types;

pub use config::Config;
pub use error::{Result, StoreError};
pub use rules::engine::{AppProvider, EngineControl, RuleEngine};
pub use rules::Rule;
pub use storage::notifier::{ChangeNotifier, Family, ListenerHandle};
pub use storage::RecordStore;

/// Package version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
