//! Session Store
//!
//! Application-scoped access layer over a [`BackingStore`]. Every call maps to
//! exactly one atomic backing-store procedure; lock state is never read,
//! modified and written back client-side.

pub mod memory;
pub mod sqlite;

use log::{debug, error, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{SessionResult, SessionStateError};
use crate::session::{codec, ActionFlags, LockToken, SessionPayload, MAX_LOCK_ID_LEN};

pub use memory::MemoryBackingStore;
pub use sqlite::SqliteBackingStore;

/// Maximum length of a session id
pub const MAX_SESSION_ID_LEN: usize = 88;
/// Maximum length of an application name
pub const MAX_APPLICATION_NAME_LEN: usize = 280;

/// Raw outcome of a read against the backing store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRead {
    /// No record with that key
    NotFound,
    /// Record is held by another lock; payload withheld
    Locked { lock: LockToken, flags: ActionFlags },
    /// Record payload (for exclusive reads: the lock was just acquired)
    Available { data: Vec<u8>, flags: ActionFlags },
}

/// Raw expired record claimed by a reap call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredRecord {
    pub id: String,
    pub data: Vec<u8>,
}

/// The atomic procedures a durable session backend must offer.
///
/// Each method is one round trip and one atomic unit. Implementations decide
/// expiry against the candidate lock timestamp passed to
/// [`BackingStore::reap_expired`], and slide expiration on every read.
pub trait BackingStore: Send + Sync {
    /// Look up or create the identifier for an application name
    fn resolve_application_id(&self, name: &str) -> SessionResult<Uuid>;

    /// Create an unlocked record.
    ///
    /// Fails with [`SessionStateError::DuplicateKey`] without touching the
    /// existing record when the key is taken.
    fn insert(
        &self,
        application: Uuid,
        id: &str,
        flags: ActionFlags,
        data: &[u8],
        timeout_minutes: i32,
    ) -> SessionResult<()>;

    /// Non-exclusive read
    fn get(&self, application: Uuid, id: &str) -> SessionResult<RecordRead>;

    /// Lock the record with `lock` if it exists and is unlocked
    fn get_exclusive(&self, application: Uuid, id: &str, lock: &LockToken) -> SessionResult<RecordRead>;

    /// Overwrite payload and timeout, then clear the lock. `false` if `lock_id` does not hold it.
    fn set_and_release(
        &self,
        application: Uuid,
        id: &str,
        lock_id: &str,
        flags: ActionFlags,
        data: &[u8],
        timeout_minutes: i32,
    ) -> SessionResult<bool>;

    /// Clear the lock. `false` if `lock_id` does not hold it.
    fn release(&self, application: Uuid, id: &str, lock_id: &str) -> SessionResult<bool>;

    /// Delete the record. `false` if `lock_id` does not match the record's lock.
    fn remove(&self, application: Uuid, id: &str, lock_id: &str) -> SessionResult<bool>;

    /// Claim one expired, unlocked record with `lock`
    fn reap_expired(&self, application: Uuid, lock: &LockToken) -> SessionResult<Option<ExpiredRecord>>;

    /// Reset the record's last-access time
    fn refresh_expiration(&self, application: Uuid, id: &str) -> SessionResult<()>;
}

/// Decoded outcome of a session read
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRead {
    /// Present only when the read was not blocked by a lock
    pub payload: Option<SessionPayload>,
    /// The lock currently held by someone else, if any
    pub lock: Option<LockToken>,
    pub flags: ActionFlags,
}

impl SessionRead {
    fn not_found() -> Self {
        Self {
            payload: None,
            lock: None,
            flags: ActionFlags::NONE,
        }
    }

    /// Neither payload nor lock: the record does not exist
    pub fn is_missing(&self) -> bool {
        self.payload.is_none() && self.lock.is_none()
    }
}

/// Expired session claimed by the reaper
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredSession {
    pub id: String,
    pub payload: SessionPayload,
}

/// Session store scoped to one application
pub struct SessionStore {
    backend: Arc<dyn BackingStore>,
    application_id: Uuid,
    compress: bool,
}

impl SessionStore {
    /// Resolve the application identifier once and scope the store to it
    pub fn open(backend: Arc<dyn BackingStore>, application_name: &str, compress: bool) -> SessionResult<Self> {
        let application_id = resolve_application_id(backend.as_ref(), application_name)?;
        debug!(
            "Session store opened for application '{}' ({})",
            application_name, application_id
        );

        Ok(Self {
            backend,
            application_id,
            compress,
        })
    }

    pub fn application_id(&self) -> Uuid {
        self.application_id
    }

    pub fn compression_enabled(&self) -> bool {
        self.compress
    }

    /// Idempotent lookup-or-create of an application identifier
    pub fn resolve_application_id(&self, name: &str) -> SessionResult<Uuid> {
        resolve_application_id(self.backend.as_ref(), name)
    }

    /// Create a new unlocked record. A duplicate key is logged and ignored.
    pub fn insert(&self, id: &str, flags: ActionFlags, payload: &SessionPayload) -> SessionResult<()> {
        check_session_id(id)?;
        let data = codec::encode(payload, self.compress)?;

        match self
            .backend
            .insert(self.application_id, id, flags, &data, payload.timeout_minutes)
        {
            Ok(()) => Ok(()),
            Err(SessionStateError::DuplicateKey(_)) => {
                debug!("Attempted to insert duplicate session {}. Entry skipped.", id);
                Ok(())
            }
            Err(e) => Err(logged("insert", id, e)),
        }
    }

    /// Non-exclusive read.
    ///
    /// A locked record yields its lock and no payload; a missing record
    /// yields neither.
    pub fn get(&self, id: &str) -> SessionResult<SessionRead> {
        check_session_id(id)?;
        let read = self
            .backend
            .get(self.application_id, id)
            .map_err(|e| logged("get", id, e))?;
        decode_read(id, read)
    }

    /// Try to lock the record with `candidate` and read it.
    ///
    /// On success the payload is returned with no lock. If someone else holds
    /// the lock it is returned untouched, with no payload.
    pub fn get_exclusive(&self, id: &str, candidate: &LockToken) -> SessionResult<SessionRead> {
        check_session_id(id)?;
        check_lock_id(candidate.id())?;
        let read = self
            .backend
            .get_exclusive(self.application_id, id, candidate)
            .map_err(|e| logged("get_exclusive", id, e))?;
        decode_read(id, read)
    }

    /// Store a new payload and clear the lock held by `lock_id`.
    ///
    /// Returns `false` when `lock_id` no longer holds the lock; nothing is
    /// written in that case.
    pub fn update_and_release(
        &self,
        id: &str,
        lock_id: &str,
        flags: ActionFlags,
        payload: &SessionPayload,
    ) -> SessionResult<bool> {
        check_session_id(id)?;
        check_lock_id(lock_id)?;
        let data = codec::encode(payload, self.compress)?;

        let updated = self
            .backend
            .set_and_release(self.application_id, id, lock_id, flags, &data, payload.timeout_minutes)
            .map_err(|e| logged("update_and_release", id, e))?;
        if !updated {
            warn!("Session {} is not held by lock {}; update skipped", id, lock_id);
        }
        Ok(updated)
    }

    /// Clear the lock held by `lock_id` without changing the payload
    pub fn release(&self, id: &str, lock_id: &str) -> SessionResult<bool> {
        check_session_id(id)?;
        check_lock_id(lock_id)?;

        let released = self
            .backend
            .release(self.application_id, id, lock_id)
            .map_err(|e| logged("release", id, e))?;
        if !released {
            warn!("Session {} is not held by lock {}; release skipped", id, lock_id);
        }
        Ok(released)
    }

    /// Delete the record
    pub fn remove(&self, id: &str, lock_id: &str) -> SessionResult<bool> {
        check_session_id(id)?;
        check_lock_id(lock_id)?;

        let removed = self
            .backend
            .remove(self.application_id, id, lock_id)
            .map_err(|e| logged("remove", id, e))?;
        if !removed {
            warn!("Session {} is not held by lock {}; remove skipped", id, lock_id);
        }
        Ok(removed)
    }

    /// Claim one expired, unlocked session with `candidate`.
    ///
    /// A claimed record whose payload does not decode is reported as
    /// [`SessionStateError::CorruptSession`] so the claim can still be removed.
    pub fn reap_expired(&self, candidate: &LockToken) -> SessionResult<Option<ExpiredSession>> {
        check_lock_id(candidate.id())?;

        let Some(record) = self.backend.reap_expired(self.application_id, candidate)? else {
            return Ok(None);
        };

        match codec::decode(&record.data) {
            Ok(payload) => Ok(Some(ExpiredSession {
                id: record.id,
                payload,
            })),
            Err(source) => Err(SessionStateError::CorruptSession { id: record.id, source }),
        }
    }

    /// Reset the sliding expiration without touching payload or lock
    pub fn refresh_expiration(&self, id: &str) -> SessionResult<()> {
        check_session_id(id)?;
        self.backend
            .refresh_expiration(self.application_id, id)
            .map_err(|e| logged("refresh_expiration", id, e))
    }
}

fn resolve_application_id(backend: &dyn BackingStore, name: &str) -> SessionResult<Uuid> {
    if name.chars().count() > MAX_APPLICATION_NAME_LEN {
        return Err(SessionStateError::InvalidArgument(format!(
            "application name exceeds {} characters",
            MAX_APPLICATION_NAME_LEN
        )));
    }
    backend.resolve_application_id(name).map_err(|e| {
        error!("Failed to resolve application id for '{}': {}", name, e);
        e
    })
}

fn decode_read(id: &str, read: RecordRead) -> SessionResult<SessionRead> {
    match read {
        RecordRead::NotFound => Ok(SessionRead::not_found()),
        RecordRead::Locked { lock, flags } => Ok(SessionRead {
            payload: None,
            lock: Some(lock),
            flags,
        }),
        RecordRead::Available { data, flags } => {
            let payload = codec::decode(&data).map_err(|e| {
                error!("Session {} has a malformed payload: {}", id, e);
                SessionStateError::Decode(e)
            })?;
            Ok(SessionRead {
                payload: Some(payload),
                lock: None,
                flags,
            })
        }
    }
}

fn logged(operation: &str, id: &str, err: SessionStateError) -> SessionStateError {
    error!("Session store {} failed for {}: {}", operation, id, err);
    err
}

pub(crate) fn check_session_id(id: &str) -> SessionResult<()> {
    if id.is_empty() {
        return Err(SessionStateError::InvalidArgument("session id is empty".into()));
    }
    if id.chars().count() > MAX_SESSION_ID_LEN {
        return Err(SessionStateError::InvalidArgument(format!(
            "session id exceeds {} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    Ok(())
}

pub(crate) fn check_lock_id(lock_id: &str) -> SessionResult<()> {
    if lock_id.is_empty() {
        return Err(SessionStateError::InvalidArgument("lock id is empty".into()));
    }
    if lock_id.chars().count() > MAX_LOCK_ID_LEN {
        return Err(SessionStateError::InvalidArgument(format!(
            "lock id exceeds {} characters",
            MAX_LOCK_ID_LEN
        )));
    }
    Ok(())
}

/// Behaviour every [`BackingStore`] must share, run against each implementation
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::session::SessionItems;
    use chrono::{Duration, Utc};
    use std::collections::HashSet;
    use std::sync::Barrier;

    fn store(backend: Arc<dyn BackingStore>) -> SessionStore {
        SessionStore::open(backend, "/LM/W3SVC/1/ROOT", false).unwrap()
    }

    fn payload_with(key: &str, value: &str, timeout: i32) -> SessionPayload {
        let items: SessionItems = [(key, value)].into_iter().collect();
        SessionPayload::with_items(items, timeout)
    }

    /// Far enough ahead that every record counts as expired
    fn future_token() -> LockToken {
        LockToken::generate(Utc::now() + Duration::days(1))
    }

    pub fn application_ids(backend: Arc<dyn BackingStore>) {
        let a = backend.resolve_application_id("shop").unwrap();
        let again = backend.resolve_application_id("shop").unwrap();
        let b = backend.resolve_application_id("admin").unwrap();

        assert_eq!(a, again);
        assert_ne!(a, b);
    }

    pub fn lock_lifecycle(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        store.insert("s1", ActionFlags::NONE, &payload_with("a", "1", 20)).unwrap();

        let read = store.get("s1").unwrap();
        assert_eq!(read.payload, Some(payload_with("a", "1", 20)));
        assert!(read.lock.is_none());

        let t1 = LockToken::generate(Utc::now());
        let first = store.get_exclusive("s1", &t1).unwrap();
        assert_eq!(first.payload, Some(payload_with("a", "1", 20)));
        assert!(first.lock.is_none());

        let t2 = LockToken::generate(Utc::now());
        let second = store.get_exclusive("s1", &t2).unwrap();
        assert!(second.payload.is_none());
        assert_eq!(second.lock.as_ref(), Some(&t1));

        let blocked = store.get("s1").unwrap();
        assert!(blocked.payload.is_none());
        assert_eq!(blocked.lock.as_ref(), Some(&t1));
        assert_eq!(blocked.lock.as_ref().map(LockToken::timestamp), Some(t1.timestamp()));

        assert!(store
            .update_and_release("s1", t1.id(), ActionFlags::NONE, &payload_with("a", "2", 20))
            .unwrap());

        let after = store.get("s1").unwrap();
        assert_eq!(after.payload, Some(payload_with("a", "2", 20)));
        assert!(after.lock.is_none());
    }

    pub fn missing_record(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        assert!(store.get("nope").unwrap().is_missing());
        assert!(store
            .get_exclusive("nope", &LockToken::generate(Utc::now()))
            .unwrap()
            .is_missing());
        assert!(!store.release("nope", "0123").unwrap());
        assert!(!store.remove("nope", "0123").unwrap());
        store.refresh_expiration("nope").unwrap();
    }

    pub fn duplicate_insert(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        store.insert("dup", ActionFlags::NONE, &payload_with("v", "first", 10)).unwrap();
        store.insert("dup", ActionFlags::INITIALIZE_ITEM, &payload_with("v", "second", 30)).unwrap();

        let read = store.get("dup").unwrap();
        assert_eq!(read.payload, Some(payload_with("v", "first", 10)));
        assert_eq!(read.flags, ActionFlags::NONE);
    }

    pub fn stale_lock_id_is_rejected(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        store.insert("s", ActionFlags::NONE, &payload_with("k", "v", 20)).unwrap();
        let owner = LockToken::generate(Utc::now());
        store.get_exclusive("s", &owner).unwrap();

        let stale = LockToken::generate(Utc::now());
        assert!(!store
            .update_and_release("s", stale.id(), ActionFlags::NONE, &payload_with("k", "clobbered", 20))
            .unwrap());
        assert!(!store.release("s", stale.id()).unwrap());
        assert!(!store.remove("s", stale.id()).unwrap());

        assert!(store.release("s", owner.id()).unwrap());
        assert_eq!(store.get("s").unwrap().payload, Some(payload_with("k", "v", 20)));
    }

    pub fn remove_unlocked_and_locked(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        store.insert("r", ActionFlags::NONE, &SessionPayload::new(20)).unwrap();
        let owner = LockToken::generate(Utc::now());
        store.get_exclusive("r", &owner).unwrap();

        assert!(store.remove("r", owner.id()).unwrap());
        assert!(store.get("r").unwrap().is_missing());
    }

    pub fn initialize_flag_reported_once(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        store
            .insert("fresh", ActionFlags::INITIALIZE_ITEM, &SessionPayload::new(20))
            .unwrap();

        assert_eq!(store.get("fresh").unwrap().flags, ActionFlags::INITIALIZE_ITEM);

        let owner = LockToken::generate(Utc::now());
        let read = store.get_exclusive("fresh", &owner).unwrap();
        assert_eq!(read.flags, ActionFlags::INITIALIZE_ITEM);
        store.release("fresh", owner.id()).unwrap();

        assert_eq!(store.get("fresh").unwrap().flags, ActionFlags::NONE);
    }

    pub fn exclusive_lock_is_exclusive(backend: Arc<dyn BackingStore>) {
        let store = Arc::new(store(backend));
        store.insert("race", ActionFlags::NONE, &payload_with("a", "1", 20)).unwrap();

        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));
        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let token = LockToken::generate(Utc::now());
                    barrier.wait();
                    let read = store.get_exclusive("race", &token).unwrap();
                    (token, read)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter(|(_, r)| r.payload.is_some()).collect();
        assert_eq!(winners.len(), 1);

        let winner = &winners[0].0;
        for (_, read) in results.iter().filter(|(_, r)| r.payload.is_none()) {
            assert_eq!(read.lock.as_ref(), Some(winner));
        }
    }

    pub fn reap_each_expired_record_once(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        for i in 0..5 {
            store
                .insert(&format!("old-{}", i), ActionFlags::NONE, &payload_with("i", &i.to_string(), 20))
                .unwrap();
        }
        let held = LockToken::generate(Utc::now());
        store.get_exclusive("old-4", &held).unwrap();

        let mut seen = HashSet::new();
        while let Some(expired) = store.reap_expired(&future_token()).unwrap() {
            assert!(seen.insert(expired.id.clone()), "{} claimed twice", expired.id);
            assert!(expired.payload.items.get("i").is_some());
        }

        let expected: HashSet<String> = (0..4).map(|i| format!("old-{}", i)).collect();
        assert_eq!(seen, expected);
        assert!(store.reap_expired(&future_token()).unwrap().is_none());
    }

    pub fn unexpired_records_are_not_reaped(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        store.insert("young", ActionFlags::NONE, &SessionPayload::new(20)).unwrap();

        let now = LockToken::generate(Utc::now());
        assert!(store.reap_expired(&now).unwrap().is_none());
    }

    pub fn concurrent_reapers_never_double_claim(backend: Arc<dyn BackingStore>) {
        let store = Arc::new(store(backend));
        let total = 40;
        for i in 0..total {
            store
                .insert(&format!("exp-{}", i), ActionFlags::NONE, &SessionPayload::new(1))
                .unwrap();
        }

        let reapers = 4;
        let barrier = Arc::new(Barrier::new(reapers));
        let handles: Vec<_> = (0..reapers)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let mut claimed = Vec::new();
                    while let Some(expired) = store.reap_expired(&future_token()).unwrap() {
                        claimed.push(expired.id);
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
        assert_eq!(all.len(), total);
        assert_eq!(unique.len(), total);
    }

    pub fn applications_are_partitioned(backend: Arc<dyn BackingStore>) {
        let shop = SessionStore::open(backend.clone(), "shop", false).unwrap();
        let admin = SessionStore::open(backend, "admin", true).unwrap();

        shop.insert("same-id", ActionFlags::NONE, &payload_with("app", "shop", 20)).unwrap();
        admin.insert("same-id", ActionFlags::NONE, &payload_with("app", "admin", 20)).unwrap();

        assert_eq!(shop.get("same-id").unwrap().payload, Some(payload_with("app", "shop", 20)));
        assert_eq!(admin.get("same-id").unwrap().payload, Some(payload_with("app", "admin", 20)));
    }

    pub fn refresh_keeps_payload_and_lock(backend: Arc<dyn BackingStore>) {
        let store = store(backend);
        store.insert("slide", ActionFlags::NONE, &payload_with("k", "v", 20)).unwrap();
        let owner = LockToken::generate(Utc::now());
        store.get_exclusive("slide", &owner).unwrap();

        store.refresh_expiration("slide").unwrap();

        let read = store.get("slide").unwrap();
        assert_eq!(read.lock.as_ref().map(LockToken::id), Some(owner.id()));
        store.release("slide", owner.id()).unwrap();
        assert_eq!(store.get("slide").unwrap().payload, Some(payload_with("k", "v", 20)));
    }

    pub fn run_all(make: impl Fn() -> Arc<dyn BackingStore>) {
        application_ids(make());
        lock_lifecycle(make());
        missing_record(make());
        duplicate_insert(make());
        stale_lock_id_is_rejected(make());
        remove_unlocked_and_locked(make());
        initialize_flag_reported_once(make());
        exclusive_lock_is_exclusive(make());
        reap_each_expired_record_once(make());
        unexpired_records_are_not_reaped(make());
        concurrent_reapers_never_double_claim(make());
        applications_are_partitioned(make());
        refresh_keeps_payload_and_lock(make());
    }
}
