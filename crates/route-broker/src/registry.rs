//! Registry of in-flight requests, keyed by request id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::warn;

use route_core::{RequestId, RequestKind};

/// Cancellation state of one in-flight request, shared between the broker
/// and the worker serving it.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    kind: RequestKind,
    cancelled: AtomicBool,
    at_eos: AtomicBool,
    started_at: Instant,
}

impl RequestHandle {
    fn new(id: RequestId, kind: RequestKind) -> Self {
        Self {
            id,
            kind,
            cancelled: AtomicBool::new(false),
            at_eos: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Signal cancellation. Returns true only for the first signal.
    /// `at_eos` means the client already closed its side, so no terminal
    /// answer is owed.
    pub fn cancel(&self, at_eos: bool) -> bool {
        if at_eos {
            self.at_eos.store(true, Ordering::SeqCst);
        }
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn at_eos(&self) -> bool {
        self.at_eos.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct ActiveRequests {
    requests: DashMap<RequestId, Arc<RequestHandle>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. A request already registered under the same id is
    /// replaced and cancelled.
    pub fn register(&self, id: RequestId, kind: RequestKind) -> Arc<RequestHandle> {
        let handle = Arc::new(RequestHandle::new(id.clone(), kind));
        if let Some(previous) = self.requests.insert(id, handle.clone()) {
            warn!(request_id = %previous.id, "duplicate request id, cancelling previous worker");
            previous.cancel(false);
        }
        handle
    }

    pub fn get(&self, id: &RequestId) -> Option<Arc<RequestHandle>> {
        self.requests.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.contains_key(id)
    }

    /// Signal the worker serving `id`. False when no such request is
    /// registered or it was already cancelled.
    pub fn cancel(&self, id: &RequestId, at_eos: bool) -> bool {
        match self.requests.get(id) {
            Some(entry) => entry.value().cancel(at_eos),
            None => false,
        }
    }

    /// Remove `handle`, but only if it is still the registered entry for its id.
    pub fn remove(&self, handle: &Arc<RequestHandle>) -> bool {
        self.requests
            .remove_if(&handle.id, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    /// Cancel and drop every registered request. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        self.requests.retain(|_, handle| {
            handle.cancel(false);
            count += 1;
            false
        });
        count
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RequestId {
        RequestId::from_raw(s)
    }

    #[test]
    fn register_and_remove() {
        let reg = ActiveRequests::new();
        let h = reg.register(id("A"), RequestKind::OneShot);
        assert!(reg.contains(&id("A")));
        assert!(reg.remove(&h));
        assert!(reg.is_empty());
        assert!(!reg.remove(&h));
    }

    #[test]
    fn cancellation_fires_once() {
        let reg = ActiveRequests::new();
        let h = reg.register(id("S"), RequestKind::Subscribe);
        assert!(reg.cancel(&id("S"), true));
        assert!(!reg.cancel(&id("S"), true));
        assert!(h.is_cancelled());
        assert!(h.at_eos());
    }

    #[test]
    fn cancel_unknown_is_false() {
        let reg = ActiveRequests::new();
        assert!(!reg.cancel(&id("nope"), true));
    }

    #[test]
    fn duplicate_id_replaces_and_cancels_previous() {
        let reg = ActiveRequests::new();
        let first = reg.register(id("A"), RequestKind::Subscribe);
        let second = reg.register(id("A"), RequestKind::Subscribe);
        assert_eq!(reg.len(), 1);
        assert!(first.is_cancelled());
        assert!(!first.at_eos());
        assert!(!second.is_cancelled());

        // Late removal by the replaced worker must not drop the new entry.
        assert!(!reg.remove(&first));
        assert!(Arc::ptr_eq(&reg.get(&id("A")).unwrap(), &second));
    }

    #[test]
    fn cancel_all_clears_registry() {
        let reg = ActiveRequests::new();
        let handles: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|s| reg.register(id(s), RequestKind::OneShot))
            .collect();
        assert_eq!(reg.cancel_all(), 3);
        assert!(reg.is_empty());
        assert!(handles.iter().all(|h| h.is_cancelled() && !h.at_eos()));
        assert_eq!(reg.cancel_all(), 0);
    }

    #[test]
    fn concurrent_register_and_remove() {
        let reg = Arc::new(ActiveRequests::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let h = reg.register(id(&format!("{t}-{i}")), RequestKind::OneShot);
                        assert!(reg.remove(&h));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(reg.is_empty());
    }
}
