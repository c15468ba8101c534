//! Worker progress-callback registry.
//!
//! Callbacks are held by identity and by weak reference. Registering the
//! same callback again bumps its registration count instead of adding a
//! second entry, so a callback runs at most once per [`ProgressRegistry::dispatch`].
//! The entry is removed when unregistrations match registrations.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Something the worker's progress loop drives forward.
pub trait Progress: Send + Sync {
    fn progress(&self);
}

struct Entry {
    callback: Weak<dyn Progress>,
    registrations: usize,
}

impl Entry {
    fn is(&self, callback: &Weak<dyn Progress>) -> bool {
        identity(&self.callback) == identity(callback)
    }
}

fn identity(callback: &Weak<dyn Progress>) -> *const () {
    callback.as_ptr() as *const ()
}

/// Registry of progress callbacks, in registration order.
#[derive(Default)]
pub struct ProgressRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one registration of `callback`.
    ///
    /// Returns the registration count after the call.
    pub fn register(&self, callback: &Weak<dyn Progress>) -> usize {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.is(callback)) {
            // Stale entry left by a dead callback at the same address.
            if entry.callback.strong_count() == 0 {
                entry.callback = callback.clone();
                entry.registrations = 0;
            }
            entry.registrations += 1;
            return entry.registrations;
        }
        entries.push(Entry {
            callback: callback.clone(),
            registrations: 1,
        });
        1
    }

    /// Drops one registration of `callback`.
    ///
    /// Returns the remaining count, or `None` if it was not registered.
    pub fn unregister(&self, callback: &Weak<dyn Progress>) -> Option<usize> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.is(callback))?;
        entries[pos].registrations -= 1;
        let remaining = entries[pos].registrations;
        if remaining == 0 {
            entries.remove(pos);
        }
        Some(remaining)
    }

    /// Current registration count of `callback`.
    pub fn registrations(&self, callback: &Weak<dyn Progress>) -> usize {
        self.entries
            .lock()
            .iter()
            .find(|e| e.is(callback))
            .map_or(0, |e| e.registrations)
    }

    /// Number of distinct registered callbacks.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Runs every live callback once.
    ///
    /// The registry lock is released before callbacks run, so a callback may
    /// register or unregister itself. Entries whose owner is gone are pruned.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self) -> usize {
        let live: Vec<Arc<dyn Progress>> = {
            let mut entries = self.entries.lock();
            entries.retain(|e| e.callback.strong_count() > 0);
            entries.iter().filter_map(|e| e.callback.upgrade()).collect()
        };
        for callback in &live {
            callback.progress();
        }
        live.len()
    }
}
