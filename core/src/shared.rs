//! State shared between the ingestion threads and the periodic loops.
//!
//! [`Mailbox`] is a last-value-wins cell: writers overwrite the value and raise a freshness
//! flag, readers copy the value and clear the flag in one critical section. There is no
//! queue and no backpressure; a writer faster than its reader loses samples. Critical
//! sections only copy data.
//!
//! [`ReferenceFix`] holds the first valid GPS fix. It is written exactly once and read
//! lock-free afterwards.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::measurements::GpsFix;

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    fresh: bool,
}

/// Result of draining a [`Mailbox`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Snapshot<T> {
    /// Most recent value ever posted, `None` if nothing was posted yet.
    pub value: Option<T>,
    /// Whether `value` was posted after the previous drain.
    pub fresh: bool,
}

impl<T> Snapshot<T> {
    /// The value, only if it arrived since the previous drain.
    pub fn fresh_value(&self) -> Option<&T> {
        if self.fresh { self.value.as_ref() } else { None }
    }
}

/// Latest-value mailbox guarded by its own lock.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            slot: Mutex::new(Slot {
                value: None,
                fresh: false,
            }),
        }
    }

    /// A panicking holder cannot leave a half-written `Copy` value behind, so a poisoned
    /// lock is recovered rather than propagated.
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite the value and mark it fresh.
    pub fn post(&self, value: T) {
        let mut slot = self.lock();
        slot.value = Some(value);
        slot.fresh = true;
    }

    /// Whether a value arrived since the last drain.
    pub fn is_fresh(&self) -> bool {
        self.lock().fresh
    }
}

impl<T: Clone> Mailbox<T> {
    /// Copy the current value and clear the freshness flag atomically.
    pub fn take(&self) -> Snapshot<T> {
        let mut slot = self.lock();
        let fresh = std::mem::replace(&mut slot.fresh, false);
        Snapshot {
            value: slot.value.clone(),
            fresh,
        }
    }

    /// Copy the current value without touching the freshness flag.
    pub fn peek(&self) -> Option<T> {
        self.lock().value.clone()
    }
}

/// One-shot cell for the first valid GPS fix, the origin of the local frame.
#[derive(Debug, Default)]
pub struct ReferenceFix {
    cell: OnceLock<GpsFix>,
}

impl ReferenceFix {
    pub fn new() -> Self {
        ReferenceFix {
            cell: OnceLock::new(),
        }
    }

    /// Store `fix` if no reference exists yet. Returns `true` when this call set it.
    pub fn capture(&self, fix: GpsFix) -> bool {
        let mut captured = false;
        self.cell.get_or_init(|| {
            captured = true;
            fix
        });
        if captured {
            log::info!(
                "reference fix captured at lat {:.7}, lon {:.7}, alt {:.3}",
                fix.position.latitude,
                fix.position.longitude,
                fix.position.altitude
            );
        }
        captured
    }

    pub fn get(&self) -> Option<&GpsFix> {
        self.cell.get()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}
