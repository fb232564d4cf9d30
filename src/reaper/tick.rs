//! Tick Handlers
//!
//! How a timer tick is turned into a sweep. Chosen when the reaper is built.

use parking_lot::Mutex;
use std::sync::Arc;

use super::Sweeper;

/// Called by the timer task on every tick with the reaper's sweeper
pub type TickHandler = Arc<dyn Fn(Arc<Sweeper>) + Send + Sync>;

/// Run each tick's sweep on the blocking pool without waiting for it.
///
/// Ticks that arrive while a sweep is still running are dropped by the
/// sweeper's guard.
pub fn offload() -> TickHandler {
    Arc::new(|sweeper: Arc<Sweeper>| {
        tokio::task::spawn_blocking(move || {
            sweeper.tick();
        });
    })
}

/// Queue ticks behind a lock shared by every reaper using this handler.
///
/// Clone the returned handler into several reapers to make their sweeps
/// mutually exclusive within the process.
pub fn serialized() -> TickHandler {
    let gate = Arc::new(Mutex::new(()));
    Arc::new(move |sweeper: Arc<Sweeper>| {
        let gate = gate.clone();
        tokio::task::spawn_blocking(move || {
            let _turn = gate.lock();
            sweeper.tick();
        });
    })
}
