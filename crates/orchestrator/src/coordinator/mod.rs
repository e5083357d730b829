//! Event-driven batch workers. Both coordinators subscribe at startup,
//! enforce single-flight dispatch and fan per-document work out through a
//! worker pool.

pub mod collection;
pub mod embedding;

pub use collection::CollectionCoordinator;
pub use embedding::EmbeddingCoordinator;

use std::sync::{Arc, Mutex};

/// Sticky single-flight flag. The guard resets the flag when dropped, so a
/// panicking pass cannot wedge the coordinator.
pub(crate) struct SingleFlight {
    busy: Arc<Mutex<bool>>,
}

pub(crate) struct SingleFlightGuard {
    busy: Arc<Mutex<bool>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            busy: Arc::new(Mutex::new(false)),
        }
    }

    /// Acquire the flag; `None` means another pass is already in flight.
    pub fn try_acquire(&self) -> Option<SingleFlightGuard> {
        let mut busy = self.busy.lock().unwrap();
        if *busy {
            return None;
        }
        *busy = true;
        Some(SingleFlightGuard {
            busy: Arc::clone(&self.busy),
        })
    }
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        *self.busy.lock().unwrap() = false;
    }
}
