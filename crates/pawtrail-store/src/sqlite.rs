//! SQLite-backed identity store.
//!
//! One row per enrolled identity, keyed by the derived identity key.
//! The PRIMARY KEY constraint is the atomic duplicate guard: a
//! colliding insert fails without touching the existing row.

use crate::crypt::EmbeddingCipher;
use chrono::{DateTime, Utc};
use pawtrail_core::types::{Embedding, IdentityRecord};
use pawtrail_core::{IdentityStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_key  TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    dim           INTEGER NOT NULL,
    model_version TEXT,
    version       INTEGER NOT NULL DEFAULT 1,
    session_id    TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    cipher: EmbeddingCipher,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. Embedding blobs are
    /// encrypted with a key derived from `passphrase`.
    pub fn open(path: &Path, passphrase: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        tracing::info!(path = %path.display(), "identity store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            cipher: EmbeddingCipher::from_passphrase(passphrase),
        })
    }

    /// In-memory database, for tests and ephemeral runs.
    pub fn open_in_memory(passphrase: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher: EmbeddingCipher::from_passphrase(passphrase),
        })
    }

    fn decode_row(&self, row: RawRow) -> Result<IdentityRecord, StoreError> {
        let plaintext = self
            .cipher
            .open(&row.embedding)
            .map_err(|e| StoreError::Corrupt(row.identity_key.clone(), e.to_string()))?;
        let values = bytes_to_vector(&plaintext)
            .ok_or_else(|| StoreError::Corrupt(row.identity_key.clone(), "blob length".into()))?;
        if values.len() != row.dim {
            return Err(StoreError::Corrupt(
                row.identity_key.clone(),
                format!("dimension {} does not match stored {}", values.len(), row.dim),
            ));
        }
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| StoreError::Corrupt(row.identity_key.clone(), e.to_string()))?
            .with_timezone(&Utc);

        Ok(IdentityRecord {
            identity_key: row.identity_key,
            display_name: row.display_name,
            embedding: Embedding {
                values,
                model_version: row.model_version,
            },
            version: row.version,
            created_at,
            session_id: row.session_id,
        })
    }
}

struct RawRow {
    identity_key: String,
    display_name: String,
    embedding: Vec<u8>,
    dim: usize,
    model_version: Option<String>,
    version: u32,
    session_id: String,
    created_at: String,
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        identity_key: row.get(0)?,
        display_name: row.get(1)?,
        embedding: row.get(2)?,
        dim: row.get::<_, i64>(3)? as usize,
        model_version: row.get(4)?,
        version: row.get::<_, i64>(5)? as u32,
        session_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const SELECT_COLUMNS: &str =
    "identity_key, display_name, embedding, dim, model_version, version, session_id, created_at";

impl IdentityStore for SqliteStore {
    fn persist(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let blob = self
            .cipher
            .seal(&vector_to_bytes(&record.embedding.values))
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let conn = self.conn.lock().expect("store lock poisoned");
        let result = conn.execute(
            "INSERT INTO identities (identity_key, display_name, embedding, dim, model_version, version, session_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.identity_key,
                record.display_name,
                blob,
                record.embedding.dim() as i64,
                record.embedding.model_version,
                record.version as i64,
                record.session_id,
                record.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(record.identity_key.clone()))
            }
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let rows = {
            let conn = self.conn.lock().expect("store lock poisoned");
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM identities ORDER BY identity_key"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map([], raw_row)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<RawRow>>>()
                .map_err(backend)?;
            rows
        };

        rows.into_iter().map(|r| self.decode_row(r)).collect()
    }

    fn get(&self, identity_key: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let row = {
            let conn = self.conn.lock().expect("store lock poisoned");
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM identities WHERE identity_key = ?1"),
                params![identity_key],
                raw_row,
            )
            .optional()
            .map_err(backend)?
        };

        row.map(|r| self.decode_row(r)).transpose()
    }

    fn remove(&self, identity_key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let affected = conn
            .execute(
                "DELETE FROM identities WHERE identity_key = ?1",
                params![identity_key],
            )
            .map_err(backend)?;
        Ok(affected > 0)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn vector_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
