//! Symbol Index (§4.1) — ticker -> security id, loaded once, read-mostly.
//!
//! Guarded with `parking_lot::RwLock`, the same choice this codebase makes
//! for every other read-mostly map (faster than `tokio::sync::RwLock` for
//! critical sections that never cross an `.await`).

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::ServiceError;

pub struct SymbolIndex {
    by_ticker: RwLock<HashMap<String, i64>>,
}

impl SymbolIndex {
    /// Loads from an external `(ticker, id)` table for currently-active
    /// securities. A malformed or unreadable source is fatal at startup
    /// (§7 error kind 5) since ingest cannot safely begin without it.
    pub fn load(rows: impl IntoIterator<Item = (String, i64)>) -> Result<Self, ServiceError> {
        let mut by_ticker = HashMap::new();
        for (ticker, id) in rows {
            if ticker.trim().is_empty() {
                return Err(ServiceError::SymbolIndexLoad(
                    "encountered blank ticker in symbol table".to_string(),
                ));
            }
            by_ticker.insert(ticker.to_ascii_uppercase(), id);
        }
        Ok(Self {
            by_ticker: RwLock::new(by_ticker),
        })
    }

    pub fn load_from_csv(path: &str) -> Result<Self, ServiceError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::SymbolIndexLoad(format!("{path}: {e}")))?;
        let rows = contents.lines().filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut parts = line.splitn(2, ',');
            let ticker = parts.next()?.trim().to_string();
            let id: i64 = parts.next()?.trim().parse().ok()?;
            Some((ticker, id))
        });
        Self::load(rows)
    }

    /// `resolve(ticker) -> (id, found)`. A miss is not an error: the feed
    /// may carry symbols for which this deployment keeps no books.
    pub fn resolve(&self, ticker: &str) -> (i64, bool) {
        match self.by_ticker.read().get(ticker).copied() {
            Some(id) => (id, true),
            None => (0, false),
        }
    }

    pub fn len(&self) -> usize {
        self.by_ticker.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
