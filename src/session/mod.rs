//! Session Data Module
//!
//! Value types that flow through the store:
//! - Lock tokens identifying lock ownership
//! - Session payloads (items, fixed objects, timeout)
//! - The compact binary payload codec

pub mod codec;
pub mod lock;
pub mod payload;

pub use codec::{decode, encode, DecodeError, EncodeError};
pub use lock::{LockToken, MAX_LOCK_ID_LEN};
pub use payload::{ActionFlags, SessionItems, SessionPayload, SessionValue, StaticObjects};
