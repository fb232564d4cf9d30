//! Server-side session state with exclusive per-session locking, a compact
//! payload codec and a background reaper for expired sessions.

// Declare modules
pub mod config;
pub mod error;
pub mod provider;
pub mod reaper;
pub mod session;
pub mod store;

pub use config::{ConfigReader, ProviderConfig};
pub use error::{SessionResult, SessionStateError};
pub use provider::{ItemResult, SessionStateProvider};
pub use reaper::{session_end_callback, ExpirationReaper, ReaperState, SessionEndCallback, TickOutcome};
pub use session::{ActionFlags, LockToken, SessionItems, SessionPayload, SessionValue, StaticObjects};
pub use store::{BackingStore, MemoryBackingStore, SessionStore, SqliteBackingStore};
