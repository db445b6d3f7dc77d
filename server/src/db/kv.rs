//! Transactional keyed store on top of SQLite.
//!
//! Every key maps to a JSON value plus the version of the commit that last
//! wrote it. Writers build an [`AtomicOp`]: a list of version checks and a list
//! of mutations. The op is applied inside one SQLite transaction only if every
//! check still holds, which gives callers compare-and-set semantics across any
//! number of keys.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use super::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database lock poisoned")]
    Lock,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("migration: {0}")]
    Migration(String),
    #[error("io: {0}")]
    Io(String),
}

/// A stored value together with the version of the commit that wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: Value,
    pub version: i64,
}

impl Entry {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub reverse: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
enum Mutation {
    Set { key: String, value: String },
    Delete { key: String },
    DeletePrefix { prefix: String },
}

/// A multi-key write that commits entirely or not at all.
#[derive(Debug, Clone, Default)]
pub struct AtomicOp {
    checks: Vec<(String, Option<i64>)>,
    mutations: Vec<Mutation>,
}

impl AtomicOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to still be at `version` (`None`: key must be absent).
    pub fn check(&mut self, key: impl Into<String>, version: Option<i64>) -> &mut Self {
        self.checks.push((key.into(), version));
        self
    }

    /// Check against the version observed in a previous read.
    pub fn check_read(&mut self, key: impl Into<String>, entry: Option<&Entry>) -> &mut Self {
        self.check(key, entry.map(|e| e.version))
    }

    pub fn set<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self, StoreError> {
        self.mutations.push(Mutation::Set {
            key: key.into(),
            value: serde_json::to_string(value)?,
        });
        Ok(self)
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.mutations.push(Mutation::Delete { key: key.into() });
        self
    }

    /// Delete every key starting with `prefix`, evaluated at commit time.
    pub fn delete_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.mutations.push(Mutation::DeletePrefix {
            prefix: prefix.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Applied { version: i64 },
    /// A check failed; nothing was written.
    Conflict,
}

/// Minimal interface the friend graph and conversation store are written against.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Entry>, StoreError>;

    /// Entries whose key starts with `prefix`, in key order.
    fn list_prefix(&self, prefix: &str, options: ListOptions) -> Result<Vec<Entry>, StoreError>;

    fn commit(&self, op: AtomicOp) -> Result<Commit, StoreError>;
}

/// Typed read helpers shared by every store user.
pub trait KvStoreExt: KvStore {
    /// Read a JSON string list, treating a missing key as empty.
    fn get_list(&self, key: &str) -> Result<(Vec<String>, Option<Entry>), StoreError> {
        match self.get(key)? {
            Some(entry) => Ok((entry.decode()?, Some(entry))),
            None => Ok((Vec::new(), None)),
        }
    }
}

impl<T: KvStore + ?Sized> KvStoreExt for T {}

#[derive(Clone)]
pub struct SqliteKv {
    db: DbPool,
}

impl SqliteKv {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

/// Smallest string greater than every string starting with `prefix`.
/// UTF-8 byte order matches code point order, so bumping the last char works.
fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(c) = char::from_u32(next) {
            chars.push(c);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn read_entry(key: String, raw: String, version: i64) -> Result<Entry, StoreError> {
    Ok(Entry {
        key,
        value: serde_json::from_str(&raw)?,
        version,
    })
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::Lock)?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, version FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(raw, version)| read_entry(key.to_string(), raw, version))
            .transpose()
    }

    fn list_prefix(&self, prefix: &str, options: ListOptions) -> Result<Vec<Entry>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::Lock)?;
        let order = if options.reverse { "DESC" } else { "ASC" };
        // SQLite treats a negative LIMIT as unbounded
        let limit = options.limit.map(|l| l as i64).unwrap_or(-1);
        let end = prefix_end(prefix);

        let sql = match end {
            Some(_) => format!(
                "SELECT key, value, version FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key {} LIMIT ?3",
                order
            ),
            None => format!(
                "SELECT key, value, version FROM kv WHERE key >= ?1 ORDER BY key {} LIMIT ?2",
                order
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, i64)> {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        };
        let rows: Vec<(String, String, i64)> = match &end {
            Some(end) => stmt
                .query_map(params![prefix, end, limit], map_row)?
                .collect::<Result<_, _>>()?,
            None => stmt
                .query_map(params![prefix, limit], map_row)?
                .collect::<Result<_, _>>()?,
        };

        rows.into_iter()
            .map(|(key, raw, version)| read_entry(key, raw, version))
            .collect()
    }

    fn commit(&self, op: AtomicOp) -> Result<Commit, StoreError> {
        let mut conn = self.db.lock().map_err(|_| StoreError::Lock)?;
        let tx = conn.transaction()?;

        for (key, expected) in &op.checks {
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM kv WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if current != *expected {
                // Dropping the transaction rolls it back
                return Ok(Commit::Conflict);
            }
        }

        let version: i64 = tx.query_row(
            "UPDATE kv_sequence SET value = value + 1 WHERE id = 1 RETURNING value",
            [],
            |row| row.get(0),
        )?;

        for mutation in &op.mutations {
            match mutation {
                Mutation::Set { key, value } => {
                    tx.execute(
                        "INSERT INTO kv (key, value, version) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version",
                        params![key, value, version],
                    )?;
                }
                Mutation::Delete { key } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
                Mutation::DeletePrefix { prefix } => match prefix_end(prefix) {
                    Some(end) => {
                        tx.execute(
                            "DELETE FROM kv WHERE key >= ?1 AND key < ?2",
                            params![prefix, end],
                        )?;
                    }
                    None => {
                        tx.execute("DELETE FROM kv WHERE key >= ?1", params![prefix])?;
                    }
                },
            }
        }

        tx.commit()?;
        Ok(Commit::Applied { version })
    }
}
