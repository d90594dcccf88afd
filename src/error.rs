use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Schema migration stopped at version {reached}, required {required}")]
    Schema { reached: u32, required: u32 },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Preference store error: {0}")]
    Prefs(String),

    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Import failed: {0}")]
    Import(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
