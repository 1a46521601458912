//! Datastore connection and initialization

use crate::models::{QueryResult, Record, SqlValue};
use crate::{encryption::EncryptionKey, migrations, Error, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// Encrypted datastore connection
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a SQLCipher datastore with the given key
    pub fn open<P: AsRef<Path>>(path: P, key: &EncryptionKey) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let db_exists = path_buf.exists();

        if let Some(parent) = path_buf.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            &path_buf,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // PRAGMA key must be the first statement on the connection, otherwise
        // SQLCipher creates the file unencrypted.
        apply_pragma_key(&conn, "key", key)?;

        let cipher_version: std::result::Result<String, rusqlite::Error> =
            conn.query_row("PRAGMA cipher_version", [], |row| row.get(0));
        match cipher_version {
            Ok(version) if !version.is_empty() => {
                tracing::debug!("SQLCipher version: {}", version);
            }
            Ok(_) | Err(_) => {
                return Err(Error::Encryption(
                    "SQLCipher encryption verification failed. Datastore may not be encrypted."
                        .to_string(),
                ));
            }
        }

        if db_exists {
            let readable: std::result::Result<i64, rusqlite::Error> =
                conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0));

            if let Err(e) = readable {
                tracing::warn!("Datastore at {} rejected key: {}", path_buf.display(), e);
                return Err(Error::Security(
                    "Cannot read encrypted datastore: wrong key or corrupted file".to_string(),
                ));
            }
        }

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Get connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run one statement and collect its rows.
    ///
    /// SQL text is passed through untouched; statements without result
    /// columns report `rows_affected` instead of rows.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        if columns.is_empty() {
            let rows_affected = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
            return Ok(QueryResult {
                columns,
                rows: Vec::new(),
                rows_affected,
            });
        }

        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (idx, name) in columns.iter().enumerate() {
                record.insert(name.clone(), value_to_json(row.get_ref(idx)?));
            }
            records.push(record);
        }

        Ok(QueryResult {
            columns,
            rows: records,
            rows_affected: 0,
        })
    }
}

fn apply_pragma_key(conn: &Connection, pragma: &str, key: &EncryptionKey) -> Result<()> {
    let literal = key.pragma_literal();
    if let Err(e) = conn.execute(&format!("PRAGMA {} = {};", pragma, literal.as_str()), []) {
        // PRAGMA key can report a row, which rusqlite surfaces as an error
        if !e.to_string().contains("Execute returned results") {
            return Err(Error::Encryption(format!(
                "Failed to apply datastore {}: {}",
                pragma, e
            )));
        }
    }
    Ok(())
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(hex::encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(byte: u8) -> EncryptionKey {
        EncryptionKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_open_database() {
        let dir = tempdir().unwrap();
        let result = Database::open(dir.path().join("datastore.db"), &key(1));
        assert!(result.is_ok());
    }

    #[test]
    fn test_sqlcipher_verification() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("datastore.db"), &key(1)).unwrap();

        let version: String = db
            .conn()
            .query_row("PRAGMA cipher_version", [], |row| row.get(0))
            .unwrap();
        assert!(!version.is_empty(), "SQLCipher version should be non-empty");
    }

    #[test]
    fn test_execute_returns_records() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("datastore.db"), &key(2)).unwrap();

        db.execute(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, raw BLOB)",
            &[],
        )
        .unwrap();
        let inserted = db
            .execute(
                "INSERT INTO notes (body, raw) VALUES (?1, ?2)",
                &[SqlValue::Text("hello".into()), SqlValue::Blob(vec![0xde, 0xad])],
            )
            .unwrap();
        assert_eq!(inserted.rows_affected, 1);

        let result = db
            .execute(
                "SELECT id, body, raw FROM notes WHERE body = ?1",
                &[SqlValue::Text("hello".into())],
            )
            .unwrap();
        assert_eq!(result.columns, vec!["id", "body", "raw"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["id"], serde_json::json!(1));
        assert_eq!(result.rows[0]["body"], serde_json::json!("hello"));
        assert_eq!(result.rows[0]["raw"], serde_json::json!("dead"));
    }

    #[test]
    fn test_wrong_database_key_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("datastore.db");

        let db = Database::open(&path, &key(3)).unwrap();
        db.execute("CREATE TABLE test (id INTEGER)", &[]).unwrap();
        db.execute("INSERT INTO test (id) VALUES (1)", &[]).unwrap();
        drop(db);

        assert!(Database::open(&path, &key(4)).is_err());
        assert!(Database::open(&path, &key(3)).is_ok());
    }

    #[test]
    fn test_database_file_is_encrypted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("datastore.db");

        let db = Database::open(&path, &key(5)).unwrap();
        db.execute("CREATE TABLE test (data TEXT)", &[]).unwrap();
        db.execute("INSERT INTO test (data) VALUES ('sensitive data')", &[])
            .unwrap();
        drop(db);

        let file_contents = std::fs::read(&path).unwrap();
        let file_string = String::from_utf8_lossy(&file_contents);
        assert!(
            !file_string.contains("sensitive data"),
            "Datastore file should not contain plaintext data"
        );
    }
}
