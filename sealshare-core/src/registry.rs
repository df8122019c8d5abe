//! Handle → session registry. A slot exists from the moment a download starts resolving;
//! it is `Active` once a session is attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

/// Lifecycle of a handle in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    Pending,
    Active,
}

/// One registry entry. Concurrent downloads of the same handle share the cell.
pub struct Slot<S> {
    cell: OnceCell<Arc<S>>,
    rescinded: AtomicBool,
}

impl<S> Slot<S> {
    fn pending() -> Self {
        Self {
            cell: OnceCell::new(),
            rescinded: AtomicBool::new(false),
        }
    }

    fn active(session: Arc<S>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(session)),
            rescinded: AtomicBool::new(false),
        }
    }

    pub fn cell(&self) -> &OnceCell<Arc<S>> {
        &self.cell
    }

    pub fn session(&self) -> Option<Arc<S>> {
        self.cell.get().cloned()
    }

    pub fn is_rescinded(&self) -> bool {
        self.rescinded.load(Ordering::SeqCst)
    }
}

/// The lock is only taken in short synchronous sections; never across an await.
pub struct SessionRegistry<S> {
    slots: Mutex<HashMap<String, Arc<Slot<S>>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot<S>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Slot for `handle`, created pending if absent.
    pub fn slot(&self, handle: &str) -> Arc<Slot<S>> {
        self.lock()
            .entry(handle.to_string())
            .or_insert_with(|| Arc::new(Slot::pending()))
            .clone()
    }

    /// Register an active session, returning the session it replaced (if any).
    pub fn insert(&self, handle: &str, session: Arc<S>) -> Option<Arc<S>> {
        let previous = self
            .lock()
            .insert(handle.to_string(), Arc::new(Slot::active(session)))?;
        previous.rescinded.store(true, Ordering::SeqCst);
        previous.session()
    }

    /// Active session for `handle`.
    pub fn get(&self, handle: &str) -> Option<Arc<S>> {
        self.lock().get(handle).and_then(|slot| slot.session())
    }

    /// Remove the entry for `handle` and mark it rescinded so an in-flight resolution
    /// can notice. Returns the removed slot.
    pub fn remove(&self, handle: &str) -> Option<Arc<Slot<S>>> {
        let slot = self.lock().remove(handle)?;
        slot.rescinded.store(true, Ordering::SeqCst);
        Some(slot)
    }

    /// Drop a slot whose resolution failed, unless it was replaced or others still wait on it.
    pub fn discard_failed(&self, handle: &str, slot: &Arc<Slot<S>>) {
        let mut slots = self.lock();
        let current = slots.get(handle).is_some_and(|s| Arc::ptr_eq(s, slot));
        // One reference in the map, one held by the caller.
        if current && slot.session().is_none() && Arc::strong_count(slot) == 2 {
            slots.remove(handle);
        }
    }

    /// Drop `slot` if it is still the entry for `handle`. Returns whether it was removed.
    pub fn discard(&self, handle: &str, slot: &Arc<Slot<S>>) -> bool {
        let mut slots = self.lock();
        if slots.get(handle).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(handle);
            return true;
        }
        false
    }

    pub fn state(&self, handle: &str) -> SessionState {
        match self.lock().get(handle) {
            None => SessionState::Absent,
            Some(slot) if slot.cell.initialized() => SessionState::Active,
            Some(_) => SessionState::Pending,
        }
    }

    /// Every registered handle, pending or active, sorted.
    pub fn handles(&self) -> Vec<String> {
        let mut out: Vec<String> = self.lock().keys().cloned().collect();
        out.sort();
        out
    }

    /// Remove every entry, returning the removed slots.
    pub fn drain(&self) -> Vec<(String, Arc<Slot<S>>)> {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, slot) in &drained {
            slot.rescinded.store(true, Ordering::SeqCst);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.state("h"), SessionState::Absent);
        assert!(reg.insert("h", Arc::new(1u32)).is_none());
        assert_eq!(reg.state("h"), SessionState::Active);
        assert_eq!(reg.get("h").as_deref(), Some(&1));

        let slot = reg.remove("h").unwrap();
        assert!(slot.is_rescinded());
        assert_eq!(reg.state("h"), SessionState::Absent);
        assert!(reg.remove("h").is_none());
    }

    #[test]
    fn insert_replaces_and_returns_previous() {
        let reg = SessionRegistry::new();
        reg.insert("h", Arc::new(1u32));
        let old = reg.insert("h", Arc::new(2u32));
        assert_eq!(old.as_deref(), Some(&1));
        assert_eq!(reg.get("h").as_deref(), Some(&2));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn pending_slot_becomes_active() {
        let reg: SessionRegistry<u32> = SessionRegistry::new();
        let slot = reg.slot("h");
        assert_eq!(reg.state("h"), SessionState::Pending);
        assert!(reg.get("h").is_none());
        // Same slot handed to a second caller.
        assert!(Arc::ptr_eq(&slot, &reg.slot("h")));

        slot.cell()
            .get_or_init(|| async { Arc::new(7) })
            .await;
        assert_eq!(reg.state("h"), SessionState::Active);
        assert_eq!(reg.get("h").as_deref(), Some(&7));
    }

    #[test]
    fn failed_slot_is_discarded_only_when_unshared() {
        let reg: SessionRegistry<u32> = SessionRegistry::new();
        let first = reg.slot("h");
        let second = reg.slot("h");
        reg.discard_failed("h", &first);
        assert_eq!(reg.state("h"), SessionState::Pending);
        drop(second);
        reg.discard_failed("h", &first);
        assert_eq!(reg.state("h"), SessionState::Absent);
    }

    #[test]
    fn discard_only_removes_the_current_slot() {
        let reg = SessionRegistry::new();
        reg.insert("h", Arc::new(1u32));
        let stale = reg.slot("h");
        reg.insert("h", Arc::new(2u32));
        assert!(!reg.discard("h", &stale));
        assert_eq!(reg.get("h").as_deref(), Some(&2));

        let current = reg.slot("h");
        assert!(reg.discard("h", &current));
        assert_eq!(reg.state("h"), SessionState::Absent);
        assert!(!reg.discard("h", &current));
    }

    #[test]
    fn drain_marks_everything_rescinded() {
        let reg = SessionRegistry::new();
        reg.insert("b", Arc::new(2u32));
        reg.insert("a", Arc::new(1u32));
        let pending = reg.slot("c");
        assert_eq!(reg.handles(), vec!["a", "b", "c"]);
        let drained = reg.drain();
        assert_eq!(drained.len(), 3);
        assert!(pending.is_rescinded());
        assert!(reg.is_empty());
    }
}
