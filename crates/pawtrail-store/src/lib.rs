//! pawtrail-store — Durable identity persistence.
//!
//! SQLite-backed [`IdentityStore`](pawtrail_core::IdentityStore)
//! implementation. Canonical embeddings are biometric templates, so
//! they are AES-256-GCM encrypted before they touch disk.

pub mod crypt;
pub mod sqlite;

pub use crypt::EmbeddingCipher;
pub use sqlite::SqliteStore;
