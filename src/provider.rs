//! Session State Provider
//!
//! Request-lifecycle facade for a hosting framework: one instance per
//! application, wrapping a [`SessionStore`] and its [`ExpirationReaper`].

use chrono::{Duration, Utc};
use log::{debug, info};
use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::error::SessionResult;
use crate::reaper::{ExpirationReaper, SessionEndCallback};
use crate::session::{ActionFlags, LockToken, SessionPayload};
use crate::store::{BackingStore, SessionRead, SessionStore, SqliteBackingStore};

/// Outcome of [`SessionStateProvider::get_item`] and
/// [`SessionStateProvider::get_item_exclusive`]
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    /// Absent when the session does not exist or is locked by someone else
    pub payload: Option<SessionPayload>,
    /// Another request holds the lock
    pub locked: bool,
    /// Age of the blocking lock; zero when not locked
    pub lock_age: Duration,
    /// Blocking lock id, or the lock just acquired by an exclusive read
    pub lock_id: Option<String>,
    pub actions: ActionFlags,
}

impl ItemResult {
    fn from_read(read: SessionRead, acquired: Option<&LockToken>) -> Self {
        match read.lock {
            Some(lock) => Self {
                payload: None,
                locked: true,
                lock_age: lock.age(Utc::now()),
                lock_id: Some(lock.id().to_string()),
                actions: read.flags,
            },
            None => {
                let lock_id = match (&read.payload, acquired) {
                    (Some(_), Some(token)) => Some(token.id().to_string()),
                    _ => None,
                };
                Self {
                    payload: read.payload,
                    locked: false,
                    lock_age: Duration::zero(),
                    lock_id,
                    actions: read.flags,
                }
            }
        }
    }
}

/// Session state provider for one application
pub struct SessionStateProvider {
    store: Arc<SessionStore>,
    reaper: ExpirationReaper,
}

impl SessionStateProvider {
    /// Open the SQLite database named by `config` and scope a provider to its application
    pub fn open(config: &ProviderConfig) -> SessionResult<Self> {
        config.validate()?;
        let backend = Arc::new(SqliteBackingStore::open(&config.database)?);
        Self::with_backend(backend, config)
    }

    /// Build over an existing backing store
    pub fn with_backend(backend: Arc<dyn BackingStore>, config: &ProviderConfig) -> SessionResult<Self> {
        config.validate()?;
        let store = Arc::new(SessionStore::open(
            backend,
            &config.application_name,
            config.compression,
        )?);
        let reaper = ExpirationReaper::new(store.clone(), config.polling_interval_secs)?;

        info!(
            "Session state provider ready for '{}' (compression: {}, polling every {}s)",
            config.application_name, config.compression, config.polling_interval_secs
        );
        Ok(Self::from_parts(store, reaper))
    }

    /// Assemble from a store and a reaper built over that same store
    pub fn from_parts(store: Arc<SessionStore>, reaper: ExpirationReaper) -> Self {
        Self { store, reaper }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn reaper(&self) -> &ExpirationReaper {
        &self.reaper
    }

    /// Empty payload for a session that has not been stored yet
    pub fn create_new_store_data(&self, timeout_minutes: i32) -> SessionPayload {
        SessionPayload::new(timeout_minutes)
    }

    /// Store an empty session flagged for initialization on first exclusive read
    pub fn create_uninitialized_item(&self, id: &str, timeout_minutes: i32) -> SessionResult<()> {
        self.store.insert(
            id,
            ActionFlags::INITIALIZE_ITEM,
            &self.create_new_store_data(timeout_minutes),
        )
    }

    pub fn get_item(&self, id: &str) -> SessionResult<ItemResult> {
        let read = self.store.get(id)?;
        Ok(ItemResult::from_read(read, None))
    }

    /// Lock and read a session.
    ///
    /// When the lock is acquired, `lock_id` carries the new lock's id, which
    /// must be passed back to release or update the session.
    pub fn get_item_exclusive(&self, id: &str) -> SessionResult<ItemResult> {
        let candidate = LockToken::generate(Utc::now());
        let read = self.store.get_exclusive(id, &candidate)?;
        Ok(ItemResult::from_read(read, Some(&candidate)))
    }

    /// Persist `payload` and release the lock.
    ///
    /// With `new_item` the session is inserted instead and `lock_id` is
    /// ignored. Returns `false` when `lock_id` no longer holds the lock.
    pub fn set_and_release_item_exclusive(
        &self,
        id: &str,
        payload: &SessionPayload,
        lock_id: &str,
        new_item: bool,
    ) -> SessionResult<bool> {
        if new_item {
            self.store.insert(id, ActionFlags::NONE, payload)?;
            return Ok(true);
        }
        self.store.update_and_release(id, lock_id, ActionFlags::NONE, payload)
    }

    pub fn release_item_exclusive(&self, id: &str, lock_id: &str) -> SessionResult<bool> {
        self.store.release(id, lock_id)
    }

    /// Abandon a session: notify the end-of-session callback, then delete it
    pub fn remove_item(&self, id: &str, lock_id: &str, payload: &SessionPayload) -> SessionResult<bool> {
        self.reaper.sweeper().execute_session_end(id, payload);
        self.store.remove(id, lock_id)
    }

    pub fn reset_item_timeout(&self, id: &str) -> SessionResult<()> {
        self.store.refresh_expiration(id)
    }

    /// Register (or with `None`, clear) the end-of-session callback.
    ///
    /// Returns whether expiration notifications are now supported.
    pub fn set_item_expire_callback(&self, callback: Option<SessionEndCallback>) -> bool {
        self.reaper.set_expire_callback(callback)
    }

    /// Stop the reaper for good
    pub fn dispose(&self) {
        debug!("Disposing session state provider for {}", self.store.application_id());
        self.reaper.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::{session_end_callback, ReaperState, TickOutcome};
    use crate::session::SessionItems;
    use crate::store::MemoryBackingStore;
    use parking_lot::Mutex;

    fn provider() -> SessionStateProvider {
        let config = ProviderConfig::new("/LM/W3SVC/1/ROOT", "unused.db");
        SessionStateProvider::with_backend(Arc::new(MemoryBackingStore::new()), &config).unwrap()
    }

    fn payload(value: &str) -> SessionPayload {
        let items: SessionItems = [("a", value)].into_iter().collect();
        SessionPayload::with_items(items, 20)
    }

    #[test]
    fn test_request_lifecycle() {
        let provider = provider();
        provider.set_and_release_item_exclusive("s1", &payload("1"), "", true).unwrap();

        let read = provider.get_item("s1").unwrap();
        assert_eq!(read.payload, Some(payload("1")));
        assert!(!read.locked);
        assert!(read.lock_id.is_none());

        let first = provider.get_item_exclusive("s1").unwrap();
        assert_eq!(first.payload, Some(payload("1")));
        assert!(!first.locked);
        let held = first.lock_id.clone().unwrap();

        let second = provider.get_item_exclusive("s1").unwrap();
        assert!(second.payload.is_none());
        assert!(second.locked);
        assert_eq!(second.lock_id.as_deref(), Some(held.as_str()));
        assert!(second.lock_age >= Duration::zero());

        assert!(provider
            .set_and_release_item_exclusive("s1", &payload("2"), &held, false)
            .unwrap());

        let after = provider.get_item("s1").unwrap();
        assert_eq!(after.payload, Some(payload("2")));
        assert!(!after.locked);
    }

    #[test]
    fn test_missing_item() {
        let provider = provider();
        let read = provider.get_item_exclusive("ghost").unwrap();
        assert!(read.payload.is_none());
        assert!(!read.locked);
        assert!(read.lock_id.is_none());
    }

    #[test]
    fn test_uninitialized_item_reports_initialize_once() {
        let provider = provider();
        provider.create_uninitialized_item("new", 15).unwrap();

        let first = provider.get_item_exclusive("new").unwrap();
        assert_eq!(first.actions, ActionFlags::INITIALIZE_ITEM);
        assert_eq!(first.payload, Some(provider.create_new_store_data(15)));
        provider
            .release_item_exclusive("new", first.lock_id.as_deref().unwrap())
            .unwrap();

        let second = provider.get_item_exclusive("new").unwrap();
        assert_eq!(second.actions, ActionFlags::NONE);
    }

    #[test]
    fn test_stale_lock_cannot_clobber() {
        let provider = provider();
        provider.set_and_release_item_exclusive("s", &payload("keep"), "", true).unwrap();
        let owner = provider.get_item_exclusive("s").unwrap().lock_id.unwrap();

        assert!(!provider
            .set_and_release_item_exclusive("s", &payload("lost"), "0000", false)
            .unwrap());
        assert!(!provider.release_item_exclusive("s", "0000").unwrap());

        assert!(provider.release_item_exclusive("s", &owner).unwrap());
        assert_eq!(provider.get_item("s").unwrap().payload, Some(payload("keep")));
    }

    #[test]
    fn test_remove_item_notifies_then_removes() {
        let provider = provider();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        provider.set_item_expire_callback(Some(session_end_callback(move |id: &str, _: &SessionPayload| {
            sink.lock().push(id.to_string());
            Err("handler failed".into())
        })));

        provider.set_and_release_item_exclusive("bye", &payload("x"), "", true).unwrap();
        let item = provider.get_item_exclusive("bye").unwrap();
        let lock_id = item.lock_id.unwrap();

        assert!(provider.remove_item("bye", &lock_id, &item.payload.unwrap()).unwrap());
        assert_eq!(*seen.lock(), vec!["bye".to_string()]);
        assert!(provider.get_item("bye").unwrap().payload.is_none());
    }

    #[test]
    fn test_reset_item_timeout_keeps_lock() {
        let provider = provider();
        provider.set_and_release_item_exclusive("t", &payload("v"), "", true).unwrap();
        let owner = provider.get_item_exclusive("t").unwrap().lock_id.unwrap();

        provider.reset_item_timeout("t").unwrap();
        assert_eq!(provider.get_item("t").unwrap().lock_id, Some(owner));
    }

    #[test]
    fn test_expire_callback_registration() {
        let provider = provider();
        let callback = session_end_callback(|_: &str, _: &SessionPayload| Ok(()));

        assert!(provider.set_item_expire_callback(Some(callback)));
        assert!(provider.reaper().tried_to_start_timer());
        assert!(!provider.set_item_expire_callback(None));
        assert!(!provider.reaper().has_expire_callback());
    }

    #[test]
    fn test_dispose_stops_reaper() {
        let provider = provider();
        provider.dispose();
        assert_eq!(provider.reaper().state(), ReaperState::Stopped);
        assert_eq!(provider.reaper().tick(), TickOutcome::Stopped);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ProviderConfig::new("app", "unused.db");
        config.polling_interval_secs = 0;
        assert!(SessionStateProvider::with_backend(Arc::new(MemoryBackingStore::new()), &config).is_err());
    }

    #[test]
    fn test_open_sqlite_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProviderConfig::new("shop", dir.path().join("sessions.db").to_string_lossy());
        config.compression = true;

        {
            let provider = SessionStateProvider::open(&config).unwrap();
            provider.set_and_release_item_exclusive("persist", &payload("disk"), "", true).unwrap();
            provider.dispose();
        }

        let provider = SessionStateProvider::open(&config).unwrap();
        assert_eq!(provider.get_item("persist").unwrap().payload, Some(payload("disk")));
    }
}
