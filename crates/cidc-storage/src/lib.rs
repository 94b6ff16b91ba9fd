//! Storage abstraction for the cidc permission ledger.
//!
//! Backend crates (e.g., cidc-store-sqlite) implement [`Ledger`] so that `cidc-access`
//! doesn't depend on any specific database engine or schema details.

use thiserror::Error;

mod store;
mod types;

pub use store::*;
pub use types::*;

/// Uniform error type for all storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("conflict")]
    Conflict,
    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        assert_eq!(StoreError::NotFound.to_string(), "not found");
        assert_eq!(StoreError::Conflict.to_string(), "conflict");
        assert!(StoreError::Backend("disk full".to_string())
            .to_string()
            .contains("disk full"));
    }
}
