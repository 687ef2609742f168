use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::RegisterBus;

/// Register bus shared between the acquisition loop and the status task.
///
/// Every transaction that spans more than one dispatch (I2C transfers, the
/// two-register timestamp, counter snapshots) must run under a single
/// [`lock`](SharedBus::lock) guard. The guard must not be held across an
/// `.await`.
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<Mutex<Box<dyn RegisterBus>>>,
}

impl SharedBus {
    /// Wrap a bus implementation.
    pub fn new(bus: impl RegisterBus + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(bus))),
        }
    }

    /// Acquire exclusive access to the bus.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn RegisterBus>> {
        self.inner.lock()
    }
}

impl std::fmt::Debug for SharedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBus")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}
