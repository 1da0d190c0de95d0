use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior, params};

use super::{Swap, SwapState, Transition};
use crate::error::StorageError;

/// Append-only swap log in SQLite.
///
/// `swaps` is an index (one row per swap, current state and log length);
/// `swap_transitions` holds the log itself. A swap's state is whatever
/// replaying its transitions yields; the index only serves lookups and the
/// one-active-swap-per-hash constraint.
///
/// Writes go through one connection, reads through another, so readers see
/// the last committed state without waiting on an in-progress append.
#[derive(Debug)]
pub struct SqliteSwapStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteSwapStore {
    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let writer = open_connection(&path)?;
        migrate(&writer)?;
        let reader = open_connection(&path)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a new swap. Fails with [`StorageError::DuplicateSwap`] while
    /// another non-terminal swap holds the same payment hash.
    pub fn create(&self, swap: &Swap) -> Result<(), StorageError> {
        let entry = serde_json::to_string(&Transition::Created {
            terms: swap.terms.clone(),
        })?;

        let mut conn = self.writer.lock().expect("store writer mutex poisoned");
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::db("begin create"))?;

        let existing: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT swap_id FROM swaps WHERE payment_hash = ?1 AND state NOT IN ({})",
                    terminal_list()
                ),
                params![&swap.terms.payment_hash],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::db("look up active swap by hash"))?;
        if let Some(existing) = existing {
            return Err(StorageError::DuplicateSwap {
                payment_hash: swap.terms.payment_hash.clone(),
                existing,
            });
        }

        let known: Option<String> = tx
            .query_row(
                "SELECT state FROM swaps WHERE swap_id = ?1",
                params![&swap.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::db("look up swap id"))?;
        if known.is_some() {
            return Err(StorageError::DuplicateSwap {
                payment_hash: swap.terms.payment_hash.clone(),
                existing: swap.id.clone(),
            });
        }

        tx.execute(
            r#"
INSERT INTO swaps (swap_id, payment_hash, direction, state, log_len, created_at)
VALUES (?1, ?2, ?3, ?4, 1, ?5)
"#,
            params![
                &swap.id,
                &swap.terms.payment_hash,
                swap.terms.direction.as_str(),
                SwapState::Created.as_str(),
                swap.terms.created_at as i64,
            ],
        )
        .map_err(StorageError::db(format!("insert swap {}", swap.id)))?;
        tx.execute(
            "INSERT INTO swap_transitions (swap_id, seq, transition) VALUES (?1, 0, ?2)",
            params![&swap.id, &entry],
        )
        .map_err(StorageError::db(format!("insert first transition {}", swap.id)))?;

        tx.commit()
            .map_err(StorageError::db(format!("commit create {}", swap.id)))
    }

    /// Appends `transition` at position `expected_len`. Durable once this returns.
    ///
    /// Fails with [`StorageError::Conflict`] if the log has moved on since the
    /// caller loaded the swap.
    pub fn append(
        &self,
        swap_id: &str,
        expected_len: u32,
        transition: &Transition,
    ) -> Result<(), StorageError> {
        let entry = serde_json::to_string(transition)?;
        let state = transition.target_state();

        let mut conn = self.writer.lock().expect("store writer mutex poisoned");
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::db("begin append"))?;

        let actual: Option<i64> = tx
            .query_row(
                "SELECT log_len FROM swaps WHERE swap_id = ?1",
                params![swap_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::db(format!("read log length {swap_id}")))?;
        let actual = actual.ok_or_else(|| StorageError::NotFound(swap_id.to_string()))?;
        if actual != i64::from(expected_len) {
            return Err(StorageError::Conflict {
                swap_id: swap_id.to_string(),
                expected: expected_len,
                actual: u32::try_from(actual).unwrap_or(u32::MAX),
            });
        }

        tx.execute(
            "INSERT INTO swap_transitions (swap_id, seq, transition) VALUES (?1, ?2, ?3)",
            params![swap_id, expected_len, &entry],
        )
        .map_err(StorageError::db(format!("insert transition {swap_id}")))?;
        tx.execute(
            "UPDATE swaps SET state = ?2, log_len = ?3 WHERE swap_id = ?1",
            params![swap_id, state.as_str(), expected_len + 1],
        )
        .map_err(StorageError::db(format!("update swap index {swap_id}")))?;

        tx.commit()
            .map_err(StorageError::db(format!("commit append {swap_id}")))
    }

    pub fn load(&self, swap_id: &str) -> Result<Swap, StorageError> {
        let conn = self.reader.lock().expect("store reader mutex poisoned");
        load_with(&conn, swap_id)
    }

    /// Every non-terminal swap. A swap whose log does not replay is returned
    /// as an error next to its id; the others are unaffected.
    pub fn list_active(&self) -> Result<Vec<(String, Result<Swap, StorageError>)>, StorageError> {
        let conn = self.reader.lock().expect("store reader mutex poisoned");
        let ids = select_ids(
            &conn,
            &format!(
                "SELECT swap_id FROM swaps WHERE state NOT IN ({}) ORDER BY created_at, swap_id",
                terminal_list()
            ),
        )?;
        Ok(ids
            .into_iter()
            .map(|id| {
                let swap = load_with(&conn, &id);
                (id, swap)
            })
            .collect())
    }

    pub fn list_all(&self) -> Result<Vec<(String, Result<Swap, StorageError>)>, StorageError> {
        let conn = self.reader.lock().expect("store reader mutex poisoned");
        let ids = select_ids(
            &conn,
            "SELECT swap_id FROM swaps ORDER BY created_at, swap_id",
        )?;
        Ok(ids
            .into_iter()
            .map(|id| {
                let swap = load_with(&conn, &id);
                (id, swap)
            })
            .collect())
    }

    /// Number of swaps ever created; the next swap key index.
    pub fn swap_count(&self) -> Result<u32, StorageError> {
        let conn = self.reader.lock().expect("store reader mutex poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM swaps", [], |row| row.get(0))
            .map_err(StorageError::db("count swaps"))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub fn active_swap_for_hash(&self, payment_hash: &str) -> Result<Option<String>, StorageError> {
        let conn = self.reader.lock().expect("store reader mutex poisoned");
        conn.query_row(
            &format!(
                "SELECT swap_id FROM swaps WHERE payment_hash = ?1 AND state NOT IN ({})",
                terminal_list()
            ),
            params![payment_hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::db("look up active swap by hash"))
    }
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)
        .map_err(StorageError::db(format!("open sqlite {}", path.display())))?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(StorageError::db("set sqlite busy_timeout"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;",
    )
    .map_err(StorageError::db("configure sqlite pragmas"))?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(&format!(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  swap_id TEXT PRIMARY KEY,
  payment_hash TEXT NOT NULL,
  direction TEXT NOT NULL,
  state TEXT NOT NULL,
  log_len INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS swaps_active_hash_idx
  ON swaps(payment_hash) WHERE state NOT IN ({terminal});
CREATE INDEX IF NOT EXISTS swaps_state_idx ON swaps(state);
CREATE TABLE IF NOT EXISTS swap_transitions (
  swap_id TEXT NOT NULL REFERENCES swaps(swap_id),
  seq INTEGER NOT NULL,
  transition TEXT NOT NULL,
  PRIMARY KEY (swap_id, seq)
);
"#,
        terminal = terminal_list()
    ))
    .map_err(StorageError::db("migrate sqlite schema"))
}

fn terminal_list() -> String {
    SwapState::TERMINAL
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_ids(conn: &Connection, sql: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(sql).map_err(StorageError::db("prepare list swaps"))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(StorageError::db("query list swaps"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(StorageError::db("read swap row"))?);
    }
    Ok(out)
}

fn load_with(conn: &Connection, swap_id: &str) -> Result<Swap, StorageError> {
    let index: Option<(String, i64)> = conn
        .query_row(
            "SELECT state, log_len FROM swaps WHERE swap_id = ?1",
            params![swap_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(StorageError::db(format!("read swap {swap_id}")))?;
    let (indexed_state, indexed_len) =
        index.ok_or_else(|| StorageError::NotFound(swap_id.to_string()))?;

    let corrupt = |reason: String| StorageError::CorruptLog {
        swap_id: swap_id.to_string(),
        reason,
    };

    let mut stmt = conn
        .prepare("SELECT seq, transition FROM swap_transitions WHERE swap_id = ?1 ORDER BY seq")
        .map_err(StorageError::db("prepare load transitions"))?;
    let rows = stmt
        .query_map(params![swap_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(StorageError::db(format!("query transitions {swap_id}")))?;

    let mut log = Vec::new();
    for (expected_seq, row) in rows.enumerate() {
        let (seq, raw) = row.map_err(StorageError::db(format!("read transition {swap_id}")))?;
        if seq != expected_seq as i64 {
            return Err(corrupt(format!("expected seq {expected_seq}, found {seq}")));
        }
        let transition: Transition = serde_json::from_str(&raw)
            .map_err(|e| corrupt(format!("entry {seq} does not parse: {e}")))?;
        log.push(transition);
    }

    if log.len() as i64 != indexed_len {
        return Err(corrupt(format!(
            "index says {indexed_len} entries, log has {}",
            log.len()
        )));
    }

    let swap = Swap::replay(swap_id, &log).map_err(corrupt)?;
    if swap.state.as_str() != indexed_state {
        return Err(corrupt(format!(
            "index state {indexed_state} disagrees with replayed state {}",
            swap.state
        )));
    }
    Ok(swap)
}
