//! In-Memory Backing Store
//!
//! Lock-free concurrent session records using DashMap. Each procedure mutates
//! a single record under its shard lock, which makes every claim atomic within
//! one process. Not durable: for tests and single-instance deployments.
//!
//! Reaping scans the whole map up to the first claimable record, so a sweep
//! costs O(records) per claim. Use the SQLite store for large session counts.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use uuid::Uuid;

use super::{BackingStore, ExpiredRecord, RecordRead};
use crate::error::{SessionResult, SessionStateError};
use crate::session::{ActionFlags, LockToken};

#[derive(Debug, Clone)]
struct Record {
    data: Vec<u8>,
    flags: ActionFlags,
    timeout_minutes: i32,
    expires_at: DateTime<Utc>,
    lock: Option<LockToken>,
}

impl Record {
    fn slide(&mut self, now: DateTime<Utc>) {
        self.expires_at = expiry(now, self.timeout_minutes);
    }

    fn is_held_by(&self, lock_id: &str) -> bool {
        self.lock.as_ref().map(|l| l.id() == lock_id).unwrap_or(false)
    }

    fn locked_read(&self) -> Option<RecordRead> {
        self.lock.as_ref().map(|lock| RecordRead::Locked {
            lock: lock.clone(),
            flags: self.flags,
        })
    }
}

fn expiry(now: DateTime<Utc>, timeout_minutes: i32) -> DateTime<Utc> {
    now + Duration::minutes(i64::from(timeout_minutes))
}

type RecordKey = (Uuid, String);

/// DashMap-backed [`BackingStore`]
pub struct MemoryBackingStore {
    /// Application name -> identifier
    applications: DashMap<String, Uuid>,
    /// (application, session id) -> record
    records: DashMap<RecordKey, Record>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self {
            applications: DashMap::new(),
            records: DashMap::new(),
        }
    }

    /// Number of records across all applications
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn key(application: Uuid, id: &str) -> RecordKey {
        (application, id.to_string())
    }
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemoryBackingStore {
    fn resolve_application_id(&self, name: &str) -> SessionResult<Uuid> {
        let id = *self
            .applications
            .entry(name.to_string())
            .or_insert_with(Uuid::new_v4);
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
        match self.records.entry(Self::key(application, id)) {
            Entry::Occupied(_) => Err(SessionStateError::DuplicateKey(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Record {
                    data: data.to_vec(),
                    flags,
                    timeout_minutes,
                    expires_at: expiry(Utc::now(), timeout_minutes),
                    lock: None,
                });
                Ok(())
            }
        }
    }

    fn get(&self, application: Uuid, id: &str) -> SessionResult<RecordRead> {
        let Some(mut record) = self.records.get_mut(&Self::key(application, id)) else {
            return Ok(RecordRead::NotFound);
        };

        record.slide(Utc::now());
        if let Some(locked) = record.locked_read() {
            return Ok(locked);
        }
        Ok(RecordRead::Available {
            data: record.data.clone(),
            flags: record.flags,
        })
    }

    fn get_exclusive(&self, application: Uuid, id: &str, lock: &LockToken) -> SessionResult<RecordRead> {
        let Some(mut record) = self.records.get_mut(&Self::key(application, id)) else {
            return Ok(RecordRead::NotFound);
        };

        record.slide(Utc::now());
        if let Some(locked) = record.locked_read() {
            return Ok(locked);
        }

        let flags = record.flags;
        record.lock = Some(lock.clone());
        record.flags = flags.without(ActionFlags::INITIALIZE_ITEM);

        Ok(RecordRead::Available {
            data: record.data.clone(),
            flags,
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
        let Some(mut record) = self.records.get_mut(&Self::key(application, id)) else {
            return Ok(false);
        };
        if !record.is_held_by(lock_id) {
            return Ok(false);
        }

        record.data = data.to_vec();
        record.flags = flags;
        record.timeout_minutes = timeout_minutes;
        record.lock = None;
        record.slide(Utc::now());
        Ok(true)
    }

    fn release(&self, application: Uuid, id: &str, lock_id: &str) -> SessionResult<bool> {
        let Some(mut record) = self.records.get_mut(&Self::key(application, id)) else {
            return Ok(false);
        };
        if !record.is_held_by(lock_id) {
            return Ok(false);
        }

        record.lock = None;
        record.slide(Utc::now());
        Ok(true)
    }

    fn remove(&self, application: Uuid, id: &str, lock_id: &str) -> SessionResult<bool> {
        let removed = self
            .records
            .remove_if(&Self::key(application, id), |_, record| record.is_held_by(lock_id));
        Ok(removed.is_some())
    }

    fn reap_expired(&self, application: Uuid, lock: &LockToken) -> SessionResult<Option<ExpiredRecord>> {
        let now = lock.timestamp();

        // iter_mut holds each shard's write lock, so the check and the claim are one step
        for mut entry in self.records.iter_mut() {
            if entry.key().0 != application || entry.lock.is_some() || entry.expires_at > now {
                continue;
            }

            entry.lock = Some(lock.clone());
            let id = entry.key().1.clone();
            debug!("Claimed expired session {}", id);
            return Ok(Some(ExpiredRecord {
                id,
                data: entry.data.clone(),
            }));
        }

        Ok(None)
    }

    fn refresh_expiration(&self, application: Uuid, id: &str) -> SessionResult<()> {
        if let Some(mut record) = self.records.get_mut(&Self::key(application, id)) {
            record.slide(Utc::now());
        }
        Ok(())
    }
}
