//! FieldOps Common Library
//!
//! Value types, the production naming convention and the SQLite scratch
//! store shared by the FieldOps E2E harness.

pub mod db;
pub mod error;
pub mod naming;
pub mod types;

pub use db::Database;
pub use error::{Error, Result};
pub use naming::{NamingConvention, NamingViolation, DEFAULT_MARKER};
pub use types::*;

/// Harness version, recorded in every context's metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hex SHA-256 digest of a byte slice
pub fn digest_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
