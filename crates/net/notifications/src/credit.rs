//! Send credit for outbound notifications.
//!
//! A sender must hold a [`CreditPermit`] for every notification it hands to the
//! writer. The permit travels with the notification and is dropped only after
//! the frame has been written and flushed, so at most `window` notifications are
//! ever in flight. Waiting for credit parks the task on a semaphore; nothing
//! polls.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Outbound credit of one substream.
#[derive(Debug, Clone)]
pub struct Credit {
    window: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

/// One unit of credit, returned on drop.
#[derive(Debug)]
pub struct CreditPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for CreditPermit {
    fn drop(&mut self) {
        // Runs before the semaphore permit is released.
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Why credit could not be taken without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditUnavailable {
    Exhausted,
    Closed,
}

impl Credit {
    /// Creates credit with `window` units. A zero window is raised to one.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            semaphore: Arc::new(Semaphore::new(window)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a unit of credit. Returns `None` once the credit is closed.
    pub async fn acquire(&self) -> Option<CreditPermit> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(self.track(permit))
    }

    pub fn try_acquire(&self) -> Result<CreditPermit, CreditUnavailable> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.track(permit)),
            Err(TryAcquireError::NoPermits) => Err(CreditUnavailable::Exhausted),
            Err(TryAcquireError::Closed) => Err(CreditUnavailable::Closed),
        }
    }

    /// Wakes every waiter with `None` and refuses further acquisitions.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Notifications accepted by the sender but not yet fully written.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> CreditPermit {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        CreditPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}
