//! Typed error kinds for the paths that need to distinguish failure modes
//! (§7 error-handling policy table). Everything that merely needs context
//! at a task boundary still goes through `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("symbol table failed to load: {0}")]
    SymbolIndexLoad(String),

    #[error("staging tables could not be created: {0}")]
    StagingTableInit(String),

    #[error("rollup store error: {0}")]
    RollupStore(#[from] rusqlite::Error),

    #[error("historical store error: {0}")]
    HistoricalStore(String),
}
