//! SQLite Backing Store
//!
//! Durable session records in SQLite. Each procedure runs as one statement or
//! one `BEGIN IMMEDIATE` transaction, so several processes may share the same
//! database file.

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use super::{BackingStore, ExpiredRecord, RecordRead};
use crate::error::{SessionResult, SessionStateError};
use crate::session::{ActionFlags, LockToken};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS applications (
        name TEXT PRIMARY KEY,
        id TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS sessions (
        application TEXT NOT NULL,
        id TEXT NOT NULL,
        item BLOB NOT NULL,
        timeout INTEGER NOT NULL,
        flags INTEGER NOT NULL DEFAULT 0,
        locked INTEGER NOT NULL DEFAULT 0,
        lock_id TEXT,
        lock_timestamp INTEGER, -- epoch nanoseconds
        created INTEGER NOT NULL,
        expires INTEGER NOT NULL,
        PRIMARY KEY (application, id)
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(application, locked, expires);
";

/// rusqlite-backed [`BackingStore`]
pub struct SqliteBackingStore {
    conn: Mutex<Connection>,
}

impl SqliteBackingStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("Opened session database at {}", path.display());
        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> SessionResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> SessionResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create the session tables if missing
    pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        debug!("Session tables initialized");
        Ok(())
    }

    /// Count records of one application
    pub fn count(&self, application: Uuid) -> SessionResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE application = ?1",
            params![application.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lock timestamps keep full precision so a locked read returns the acquiring token
fn lock_nanos(lock: &LockToken) -> SessionResult<i64> {
    lock.timestamp().timestamp_nanos_opt().ok_or_else(|| {
        SessionStateError::InvalidArgument(format!("lock timestamp {} out of range", lock.timestamp()))
    })
}

fn from_nanos(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

/// Row fields needed to answer a read
struct ReadRow {
    item: Vec<u8>,
    flags: i32,
    locked: bool,
    lock_id: Option<String>,
    lock_timestamp: Option<i64>,
}

impl ReadRow {
    fn into_read(self) -> RecordRead {
        let flags = ActionFlags::from_bits(self.flags);
        if self.locked {
            let lock = LockToken::new(
                self.lock_id.unwrap_or_default(),
                from_nanos(self.lock_timestamp.unwrap_or_default()),
            );
            RecordRead::Locked { lock, flags }
        } else {
            RecordRead::Available {
                data: self.item,
                flags,
            }
        }
    }
}

fn select_read_row(conn: &Connection, application: &str, id: &str) -> Result<Option<ReadRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT item, flags, locked, lock_id, lock_timestamp
         FROM sessions WHERE application = ?1 AND id = ?2",
        params![application, id],
        |row| {
            Ok(ReadRow {
                item: row.get(0)?,
                flags: row.get(1)?,
                locked: row.get(2)?,
                lock_id: row.get(3)?,
                lock_timestamp: row.get(4)?,
            })
        },
    )
    .optional()
}

fn slide(conn: &Connection, application: &str, id: &str, now: i64) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE sessions SET expires = ?3 + timeout * 60000
         WHERE application = ?1 AND id = ?2",
        params![application, id, now],
    )
}

impl BackingStore for SqliteBackingStore {
    fn resolve_application_id(&self, name: &str) -> SessionResult<Uuid> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM applications WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(text) => Uuid::parse_str(&text)
                .map_err(|e| SessionStateError::BackingStore(format!("invalid application id {}: {}", text, e)))?,
            None => {
                let id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO applications (name, id) VALUES (?1, ?2)",
                    params![name, id.to_string()],
                )?;
                info!("Registered application '{}' as {}", name, id);
                id
            }
        };

        tx.commit()?;
        Ok(id)
    }

    fn insert(
        &self,
        application: Uuid,
        id: &str,
        flags: ActionFlags,
        data: &[u8],
        timeout_minutes: i32,
    ) -> SessionResult<()> {
        let conn = self.conn.lock();
        let now = now_millis();
        let inserted = conn.execute(
            "INSERT INTO sessions (application, id, item, timeout, flags, locked, created, expires)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6 + ?4 * 60000)
             ON CONFLICT(application, id) DO NOTHING",
            params![application.to_string(), id, data, timeout_minutes, flags.bits(), now],
        )?;

        if inserted == 0 {
            return Err(SessionStateError::DuplicateKey(id.to_string()));
        }
        Ok(())
    }

    fn get(&self, application: Uuid, id: &str) -> SessionResult<RecordRead> {
        let mut conn = self.conn.lock();
        let application = application.to_string();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        slide(&tx, &application, id, now_millis())?;
        let row = select_read_row(&tx, &application, id)?;
        tx.commit()?;

        Ok(row.map(ReadRow::into_read).unwrap_or(RecordRead::NotFound))
    }

    fn get_exclusive(&self, application: Uuid, id: &str, lock: &LockToken) -> SessionResult<RecordRead> {
        let mut conn = self.conn.lock();
        let application = application.to_string();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(row) = select_read_row(&tx, &application, id)? else {
            return Ok(RecordRead::NotFound);
        };

        let now = now_millis();
        let acquired = lock_nanos(lock)?;
        if row.locked {
            slide(&tx, &application, id, now)?;
            tx.commit()?;
            return Ok(row.into_read());
        }

        tx.execute(
            "UPDATE sessions
             SET locked = 1, lock_id = ?3, lock_timestamp = ?4,
                 flags = flags & ~?5, expires = ?6 + timeout * 60000
             WHERE application = ?1 AND id = ?2 AND locked = 0",
            params![
                application,
                id,
                lock.id(),
                acquired,
                ActionFlags::INITIALIZE_ITEM.bits(),
                now
            ],
        )?;
        tx.commit()?;

        Ok(RecordRead::Available {
            data: row.item,
            flags: ActionFlags::from_bits(row.flags),
        })
    }

    fn set_and_release(
        &self,
        application: Uuid,
        id: &str,
        lock_id: &str,
        flags: ActionFlags,
        data: &[u8],
        timeout_minutes: i32,
    ) -> SessionResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sessions
             SET item = ?4, timeout = ?5, flags = ?6,
                 locked = 0, lock_id = NULL, lock_timestamp = NULL,
                 expires = ?7 + ?5 * 60000
             WHERE application = ?1 AND id = ?2 AND locked = 1 AND lock_id = ?3",
            params![
                application.to_string(),
                id,
                lock_id,
                data,
                timeout_minutes,
                flags.bits(),
                now_millis()
            ],
        )?;
        Ok(updated > 0)
    }

    fn release(&self, application: Uuid, id: &str, lock_id: &str) -> SessionResult<bool> {
        let conn = self.conn.lock();
        let released = conn.execute(
            "UPDATE sessions
             SET locked = 0, lock_id = NULL, lock_timestamp = NULL,
                 expires = ?4 + timeout * 60000
             WHERE application = ?1 AND id = ?2 AND locked = 1 AND lock_id = ?3",
            params![application.to_string(), id, lock_id, now_millis()],
        )?;
        Ok(released > 0)
    }

    fn remove(&self, application: Uuid, id: &str, lock_id: &str) -> SessionResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM sessions
             WHERE application = ?1 AND id = ?2 AND locked = 1 AND lock_id = ?3",
            params![application.to_string(), id, lock_id],
        )?;
        Ok(removed > 0)
    }

    fn reap_expired(&self, application: Uuid, lock: &LockToken) -> SessionResult<Option<ExpiredRecord>> {
        let mut conn = self.conn.lock();
        let application = application.to_string();
        let now = lock.timestamp().timestamp_millis();
        let acquired = lock_nanos(lock)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<(String, Vec<u8>)> = tx
            .query_row(
                "SELECT id, item FROM sessions
                 WHERE application = ?1 AND locked = 0 AND expires <= ?2
                 ORDER BY expires LIMIT 1",
                params![application, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, data)) = candidate else {
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE sessions SET locked = 1, lock_id = ?3, lock_timestamp = ?4
             WHERE application = ?1 AND id = ?2 AND locked = 0",
            params![application, id, lock.id(), acquired],
        )?;
        tx.commit()?;

        if claimed == 0 {
            return Ok(None);
        }
        debug!("Claimed expired session {}", id);
        Ok(Some(ExpiredRecord { id, data }))
    }

    fn refresh_expiration(&self, application: Uuid, id: &str) -> SessionResult<()> {
        let conn = self.conn.lock();
        slide(&conn, &application.to_string(), id, now_millis())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{codec, SessionPayload};
    use crate::store::{conformance, SessionStore};
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_sqlite_backing_store_conformance() {
        conformance::run_all(|| Arc::new(SqliteBackingStore::open_in_memory().unwrap()));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let application = {
            let store = SqliteBackingStore::open(&path).unwrap();
            let app = store.resolve_application_id("app").unwrap();
            let data = codec::encode(&SessionPayload::new(20), false).unwrap();
            store.insert(app, "durable", ActionFlags::NONE, &data, 20).unwrap();
            app
        };

        let reopened = SqliteBackingStore::open(&path).unwrap();
        assert_eq!(reopened.resolve_application_id("app").unwrap(), application);
        assert_eq!(reopened.count(application).unwrap(), 1);
        assert!(matches!(
            reopened.get(application, "durable").unwrap(),
            RecordRead::Available { .. }
        ));
    }

    #[test]
    fn test_two_connections_share_one_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let first: Arc<dyn BackingStore> = Arc::new(SqliteBackingStore::open(&path).unwrap());
        let second: Arc<dyn BackingStore> = Arc::new(SqliteBackingStore::open(&path).unwrap());
        let a = SessionStore::open(first, "app", false).unwrap();
        let b = SessionStore::open(second, "app", false).unwrap();
        assert_eq!(a.application_id(), b.application_id());

        a.insert("shared", ActionFlags::NONE, &SessionPayload::new(20)).unwrap();

        let t1 = LockToken::generate(Utc::now());
        let t2 = LockToken::generate(Utc::now());
        assert!(a.get_exclusive("shared", &t1).unwrap().payload.is_some());

        let blocked = b.get_exclusive("shared", &t2).unwrap();
        assert!(blocked.payload.is_none());
        assert_eq!(blocked.lock.as_ref().map(LockToken::id), Some(t1.id()));
    }

    #[test]
    fn test_reapers_on_separate_connections_never_double_claim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let seed = SessionStore::open(Arc::new(SqliteBackingStore::open(&path).unwrap()), "app", false).unwrap();
        for i in 0..20 {
            seed.insert(&format!("exp-{}", i), ActionFlags::NONE, &SessionPayload::new(0))
                .unwrap();
        }

        let barrier = Arc::new(Barrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let backend = Arc::new(SqliteBackingStore::open(&path).unwrap());
                    let store = SessionStore::open(backend, "app", false).unwrap();
                    barrier.wait();

                    let mut claimed = Vec::new();
                    loop {
                        let token = LockToken::generate(Utc::now() + chrono::Duration::minutes(1));
                        match store.reap_expired(&token).unwrap() {
                            Some(expired) => claimed.push(expired.id),
                            None => break,
                        }
                    }
                    claimed
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[test]
    fn test_locked_read_reports_lock_timestamp() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        let app = store.resolve_application_id("app").unwrap();
        let data = codec::encode(&SessionPayload::new(20), false).unwrap();
        store.insert(app, "s", ActionFlags::NONE, &data, 20).unwrap();

        let acquired = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let token = LockToken::new("0123456789abcdef0123456789abcdef", acquired);
        store.get_exclusive(app, "s", &token).unwrap();

        match store.get(app, "s").unwrap() {
            RecordRead::Locked { lock, .. } => {
                assert_eq!(lock, token);
                assert_eq!(lock.timestamp(), acquired);
            }
            other => panic!("expected locked read, got {:?}", other),
        }
    }

    #[test]
    fn test_locked_read_returns_acquiring_token_exactly() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        let app = store.resolve_application_id("app").unwrap();
        let data = codec::encode(&SessionPayload::new(20), false).unwrap();
        store.insert(app, "s", ActionFlags::NONE, &data, 20).unwrap();

        let acquired = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 44).unwrap()
            + chrono::Duration::nanoseconds(385_136_002);
        let token = LockToken::new("fedcba9876543210fedcba9876543210", acquired);
        store.get_exclusive(app, "s", &token).unwrap();

        let contender = LockToken::generate(Utc::now());
        match store.get_exclusive(app, "s", &contender).unwrap() {
            RecordRead::Locked { lock, .. } => assert_eq!(lock, token),
            other => panic!("expected locked read, got {:?}", other),
        }
    }
}
