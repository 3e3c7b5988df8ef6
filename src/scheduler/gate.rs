use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug)]
struct GateState {
    active: usize,
    limit: usize,
    peak: usize,
}

/// Counting gate whose limit can move at runtime.
///
/// Unlike a semaphore, lowering the limit never revokes permits already handed out; it
/// only holds back new ones until `active` drops below the new limit.
#[derive(Debug)]
pub(crate) struct ConcurrencyGate {
    state: Mutex<GateState>,
    closed: AtomicBool,
    notify: Notify,
}

impl ConcurrencyGate {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                active: 0,
                limit: limit.max(1),
                peak: 0,
            }),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        let raised = {
            let mut st = self.lock();
            let raised = limit > st.limit;
            st.limit = limit.max(1);
            raised
        };
        if raised {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.lock().limit
    }

    pub(crate) fn active(&self) -> usize {
        self.lock().active
    }

    pub(crate) fn peak(&self) -> usize {
        self.lock().peak
    }

    /// Refuse all future acquisitions and wake every waiter.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<GatePermit> {
        if self.is_closed() {
            return None;
        }
        let mut st = self.lock();
        if st.active >= st.limit {
            return None;
        }
        st.active += 1;
        st.peak = st.peak.max(st.active);
        Some(GatePermit {
            gate: Arc::clone(self),
        })
    }

    /// Wait for a slot. Returns `None` once the gate is closed.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Option<GatePermit> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a release between the check and the await is not lost
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(permit) = self.try_acquire() {
                return Some(permit);
            }
            notified.await;
        }
    }

    fn release(&self) {
        {
            let mut st = self.lock();
            st.active = st.active.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }
}

/// Slot held for the duration of one running job; released on drop, including when the
/// owning task is aborted.
#[derive(Debug)]
pub(crate) struct GatePermit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_respects_limit() {
        let gate = Arc::new(ConcurrencyGate::new(2));
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(a);
        assert!(gate.try_acquire().is_some());
        assert_eq!(gate.peak(), 2);
    }

    #[test]
    fn test_lowering_limit_keeps_existing_permits() {
        let gate = Arc::new(ConcurrencyGate::new(3));
        let permits: Vec<_> = (0..3).map(|_| gate.try_acquire().unwrap()).collect();
        gate.set_limit(1);
        assert_eq!(gate.active(), 3);
        assert!(gate.try_acquire().is_none());
        drop(permits);
        assert_eq!(gate.active(), 0);
        let _one = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_waiter_woken_on_release() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let held = gate.try_acquire().unwrap();
        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.acquire().await.is_some() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_woken_on_raise() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let _held = gate.try_acquire().unwrap();
        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.acquire().await.map(|_p| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.set_limit(2);
        assert!(waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_releases_waiters_empty_handed() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let _held = gate.try_acquire().unwrap();
        let g = gate.clone();
        let waiter = tokio::spawn(async move { g.acquire().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.close();
        assert!(waiter.await.unwrap());
        assert!(gate.try_acquire().is_none());
    }
}
