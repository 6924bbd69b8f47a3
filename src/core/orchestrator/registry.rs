use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::core::agent::InvocationControl;

/// A claim on a session's single invocation slot.
#[derive(Clone)]
pub(crate) struct Reservation {
    pub generation: u64,
    pub cancel: CancellationToken,
    pub interrupted: Arc<AtomicBool>,
}

pub(crate) struct ActiveQuery {
    reservation: Reservation,
    control: Option<Arc<dyn InvocationControl>>,
}

impl ActiveQuery {
    fn new(reservation: Reservation) -> Self {
        Self {
            reservation,
            control: None,
        }
    }

    /// Force the invocation to end.
    pub fn stop(&self) {
        self.reservation.cancel.cancel();
        if let Some(control) = &self.control {
            control.close();
        }
    }
}

#[derive(Default)]
struct Slots {
    queries: HashMap<String, ActiveQuery>,
    /// Set once shutdown begins; no slot is handed out afterwards.
    sealed: bool,
}

/// In-process map of sessions to their running invocation. Every
/// check-and-set happens under one short lock that never spans an await.
#[derive(Default)]
pub(crate) struct ActiveRegistry {
    inner: Mutex<Slots>,
    next_generation: AtomicU64,
}

impl ActiveRegistry {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fresh(&self) -> Reservation {
        Reservation {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst) + 1,
            cancel: CancellationToken::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the slot only if the session is idle.
    pub fn reserve(&self, session_id: &str) -> Option<Reservation> {
        let mut slots = self.lock();
        if slots.sealed || slots.queries.contains_key(session_id) {
            return None;
        }
        let reservation = self.fresh();
        slots
            .queries
            .insert(session_id.to_string(), ActiveQuery::new(reservation.clone()));
        Some(reservation)
    }

    /// Claim the slot unconditionally, handing back whatever held it.
    /// None once the registry is sealed.
    pub fn replace(&self, session_id: &str) -> Option<(Reservation, Option<ActiveQuery>)> {
        let mut slots = self.lock();
        if slots.sealed {
            return None;
        }
        let reservation = self.fresh();
        let previous = slots
            .queries
            .insert(session_id.to_string(), ActiveQuery::new(reservation.clone()));
        Some((reservation, previous))
    }

    /// Move the slot from a finishing invocation straight to a new
    /// reservation, so the session is never seen idle in between. None when
    /// `generation` lost the slot or the registry is sealed.
    pub fn renew(&self, session_id: &str, generation: u64) -> Option<Reservation> {
        let mut slots = self.lock();
        if slots.sealed {
            return None;
        }
        let query = slots.queries.get_mut(session_id)?;
        if query.reservation.generation != generation {
            return None;
        }
        let reservation = self.fresh();
        *query = ActiveQuery::new(reservation.clone());
        Some(reservation)
    }

    /// Record the control handle of a started invocation. False when the
    /// reservation was superseded meanwhile.
    pub fn attach_control(
        &self,
        session_id: &str,
        generation: u64,
        control: Arc<dyn InvocationControl>,
    ) -> bool {
        match self.lock().queries.get_mut(session_id) {
            Some(query) if query.reservation.generation == generation => {
                query.control = Some(control);
                true
            }
            _ => false,
        }
    }

    pub fn owns(&self, session_id: &str, generation: u64) -> bool {
        self.lock()
            .queries
            .get(session_id)
            .is_some_and(|query| query.reservation.generation == generation)
    }

    /// Free the slot if `generation` still owns it.
    pub fn release(&self, session_id: &str, generation: u64) -> bool {
        let mut slots = self.lock();
        match slots.queries.get(session_id) {
            Some(query) if query.reservation.generation == generation => {
                slots.queries.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock().queries.contains_key(session_id)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.lock().queries.keys().cloned().collect()
    }

    /// Cooperative stop of the session's invocation. The control is
    /// signalled after the lock is dropped.
    pub fn interrupt(&self, session_id: &str) -> bool {
        let control = {
            let slots = self.lock();
            let Some(query) = slots.queries.get(session_id) else {
                return false;
            };
            query.reservation.interrupted.store(true, Ordering::SeqCst);
            match &query.control {
                Some(control) => control.clone(),
                None => {
                    // Still starting up; nothing to signal yet.
                    query.reservation.cancel.cancel();
                    return true;
                }
            }
        };
        control.interrupt()
    }

    /// Refuse every further reservation and list what is still running.
    pub fn seal(&self) -> Vec<String> {
        let mut slots = self.lock();
        slots.sealed = true;
        slots.queries.keys().cloned().collect()
    }

    /// Seal and empty the registry, returning everything that was running.
    pub fn drain_all(&self) -> Vec<(String, ActiveQuery)> {
        let mut slots = self.lock();
        slots.sealed = true;
        slots.queries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopControl;

    impl InvocationControl for NoopControl {
        fn interrupt(&self) -> bool {
            true
        }
        fn close(&self) {}
    }

    #[test]
    fn reserve_is_exclusive_until_release() {
        let registry = ActiveRegistry::default();
        let first = registry.reserve("s1").unwrap();
        assert!(registry.reserve("s1").is_none());
        assert!(registry.reserve("s2").is_some());

        assert!(registry.release("s1", first.generation));
        assert!(!registry.is_active("s1"));
        assert!(registry.reserve("s1").is_some());
    }

    #[test]
    fn replaced_generation_cannot_release_or_attach() {
        let registry = ActiveRegistry::default();
        let old = registry.reserve("s1").unwrap();
        let (new, previous) = registry.replace("s1").unwrap();
        let previous = previous.unwrap();
        previous.stop();
        assert!(old.cancel.is_cancelled());
        assert!(!new.cancel.is_cancelled());

        assert!(!registry.attach_control("s1", old.generation, Arc::new(NoopControl)));
        assert!(!registry.release("s1", old.generation));
        assert!(registry.is_active("s1"));
        assert!(registry.attach_control("s1", new.generation, Arc::new(NoopControl)));
        assert!(registry.release("s1", new.generation));
    }

    #[test]
    fn interrupt_marks_the_reservation() {
        let registry = ActiveRegistry::default();
        assert!(!registry.interrupt("s1"));
        let reservation = registry.reserve("s1").unwrap();
        registry.attach_control("s1", reservation.generation, Arc::new(NoopControl));
        assert!(registry.interrupt("s1"));
        assert!(reservation.interrupted.load(Ordering::SeqCst));
        assert_eq!(registry.drain_all().len(), 1);
        assert!(registry.active_sessions().is_empty());
    }

    /// Reports whether the registry lock was free while it was signalled.
    struct ReentrantControl {
        registry: Arc<ActiveRegistry>,
        saw_lock_free: AtomicBool,
    }

    impl InvocationControl for ReentrantControl {
        fn interrupt(&self) -> bool {
            let free = self.registry.inner.try_lock().is_ok();
            self.saw_lock_free.store(free, Ordering::SeqCst);
            true
        }
        fn close(&self) {}
    }

    #[test]
    fn interrupt_signals_outside_the_lock() {
        let registry = Arc::new(ActiveRegistry::default());
        let reservation = registry.reserve("s1").unwrap();
        let control = Arc::new(ReentrantControl {
            registry: registry.clone(),
            saw_lock_free: AtomicBool::new(false),
        });
        registry.attach_control("s1", reservation.generation, control.clone());

        assert!(registry.interrupt("s1"));
        assert!(control.saw_lock_free.load(Ordering::SeqCst));
    }

    #[test]
    fn renew_keeps_the_session_busy() {
        let registry = ActiveRegistry::default();
        let first = registry.reserve("s1").unwrap();
        let next = registry.renew("s1", first.generation).unwrap();
        assert_ne!(next.generation, first.generation);
        assert!(registry.is_active("s1"));
        assert!(!registry.owns("s1", first.generation));
        assert!(registry.owns("s1", next.generation));

        // A stale generation cannot renew.
        assert!(registry.renew("s1", first.generation).is_none());
        assert!(registry.renew("s2", 1).is_none());
    }

    #[test]
    fn sealed_registry_hands_out_nothing() {
        let registry = ActiveRegistry::default();
        let running = registry.reserve("s1").unwrap();
        assert_eq!(registry.seal(), vec!["s1".to_string()]);

        assert!(registry.reserve("s2").is_none());
        assert!(registry.replace("s2").is_none());
        assert!(registry.renew("s1", running.generation).is_none());
        // What was already running stays until drained.
        assert!(registry.is_active("s1"));
        assert_eq!(registry.drain_all().len(), 1);
    }
}
