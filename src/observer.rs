//! Observer trait for scan lifecycle and progress events.
//!
//! Subscribe an [`Arc<dyn ScanObserver>`] via
//! [`crate::ScanOrchestrator::subscribe`] (or the closure shorthands
//! [`crate::ScanOrchestrator::on_state_change`] /
//! [`crate::ScanOrchestrator::on_progress`]) to receive events as the
//! session advances.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers
//! can forward events to a Tokio broadcast channel, a WebSocket, a database
//! record, or a terminal progress bar without the library knowing how the
//! host application communicates. Observers are invoked synchronously after
//! each state mutation, in subscription order; a panicking observer is
//! caught and logged so it can never corrupt the session.
//!
//! # Example
//!
//! ```rust
//! use qrsweep::{ScanConfig, ScanObserver, ScanOrchestrator, ScanProgress};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! struct PageCounter {
//!     pages: AtomicUsize,
//! }
//!
//! impl ScanObserver for PageCounter {
//!     fn on_progress(&self, progress: &ScanProgress) {
//!         self.pages.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {}/{} done", progress.page_number, progress.total_pages);
//!     }
//! }
//!
//! let orchestrator = ScanOrchestrator::new(ScanConfig::default());
//! let id = orchestrator.subscribe(Arc::new(PageCounter {
//!     pages: AtomicUsize::new(0),
//! }));
//! orchestrator.unsubscribe(id);
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::state::ScanState;

/// Incremental progress for one completed page attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanProgress {
    /// 1-based page the event describes.
    pub page_number: u32,
    pub total_pages: u32,
    /// Accepted detections on this page (0 for a failed page).
    pub detections_on_page: usize,
    /// Session totals after this page.
    pub found_count: usize,
    pub generated_count: usize,
}

/// Receives scan events. All methods default to no-ops so implementations
/// only override what they care about.
///
/// Implementations must be `Send + Sync`; events arrive from the
/// orchestrator's task, never concurrently with themselves.
pub trait ScanObserver: Send + Sync {
    /// Called after every session-state mutation (phase changes, page
    /// transitions, recorded outcomes) with a read-only snapshot.
    fn on_state_change(&self, state: &ScanState) {
        let _ = state;
    }

    /// Called once per completed page attempt, after the matching
    /// state-change event.
    fn on_progress(&self, progress: &ScanProgress) {
        let _ = progress;
    }
}

/// A no-op implementation for callers that only want return values.
pub struct NoopObserver;

impl ScanObserver for NoopObserver {}

/// Handle returned by `subscribe`; pass to `unsubscribe` to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Adapts a state-change closure to the trait.
pub(crate) struct StateChangeFn<F>(pub F)
where
    F: Fn(&ScanState) + Send + Sync;

impl<F> ScanObserver for StateChangeFn<F>
where
    F: Fn(&ScanState) + Send + Sync,
{
    fn on_state_change(&self, state: &ScanState) {
        (self.0)(state)
    }
}

/// Adapts a progress closure to the trait.
pub(crate) struct ProgressFn<F>(pub F)
where
    F: Fn(&ScanProgress) + Send + Sync;

impl<F> ScanObserver for ProgressFn<F>
where
    F: Fn(&ScanProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &ScanProgress) {
        (self.0)(progress)
    }
}

/// Subscription book-keeping. Held behind the orchestrator's mutex; event
/// delivery works on a cloned snapshot so observer code never runs under
/// the lock.
pub(crate) struct ObserverRegistry {
    next_id: u64,
    entries: Vec<(ObserverId, Arc<dyn ScanObserver>)>,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub(crate) fn subscribe(&mut self, observer: Arc<dyn ScanObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    /// Detach a subscription. Returns `false` when the id was already gone.
    pub(crate) fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Cloned delivery list in subscription order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn ScanObserver>> {
        self.entries.iter().map(|(_, obs)| Arc::clone(obs)).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Deliver a state snapshot to every observer, containing panics.
pub(crate) fn notify_state_change(observers: &[Arc<dyn ScanObserver>], state: &ScanState) {
    for observer in observers {
        if catch_unwind(AssertUnwindSafe(|| observer.on_state_change(state))).is_err() {
            warn!("state-change observer panicked; continuing with remaining observers");
        }
    }
}

/// Deliver a progress event to every observer, containing panics.
pub(crate) fn notify_progress(observers: &[Arc<dyn ScanObserver>], progress: &ScanProgress) {
    for observer in observers {
        if catch_unwind(AssertUnwindSafe(|| observer.on_progress(progress))).is_err() {
            warn!("progress observer panicked; continuing with remaining observers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn progress(page: u32) -> ScanProgress {
        ScanProgress {
            page_number: page,
            total_pages: 10,
            detections_on_page: 0,
            found_count: 0,
            generated_count: 0,
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let observer = NoopObserver;
        observer.on_state_change(&ScanState::idle());
        observer.on_progress(&progress(1));
    }

    #[test]
    fn subscribe_and_unsubscribe() {
        let mut registry = ObserverRegistry::new();
        let a = registry.subscribe(Arc::new(NoopObserver));
        let b = registry.subscribe(Arc::new(NoopObserver));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.unsubscribe(a));
        assert_eq!(registry.len(), 1);
        // Second removal of the same id is a no-op.
        assert!(!registry.unsubscribe(a));
        assert!(registry.unsubscribe(b));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn delivery_follows_subscription_order() {
        struct Recorder {
            label: &'static str,
            seen: Arc<Mutex<Vec<&'static str>>>,
        }
        impl ScanObserver for Recorder {
            fn on_progress(&self, _progress: &ScanProgress) {
                self.seen.lock().unwrap().push(self.label);
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ObserverRegistry::new();
        registry.subscribe(Arc::new(Recorder {
            label: "first",
            seen: Arc::clone(&seen),
        }));
        registry.subscribe(Arc::new(Recorder {
            label: "second",
            seen: Arc::clone(&seen),
        }));

        notify_progress(&registry.snapshot(), &progress(1));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn panicking_observer_does_not_stop_delivery() {
        struct Panicking;
        impl ScanObserver for Panicking {
            fn on_progress(&self, _progress: &ScanProgress) {
                panic!("observer bug");
            }
        }

        let received = Arc::new(AtomicUsize::new(0));
        let counter = {
            let received = Arc::clone(&received);
            Arc::new(ProgressFn(move |_: &ScanProgress| {
                received.fetch_add(1, Ordering::SeqCst);
            }))
        };

        let mut registry = ObserverRegistry::new();
        registry.subscribe(Arc::new(Panicking));
        registry.subscribe(counter);

        notify_progress(&registry.snapshot(), &progress(3));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closure_adapters_forward_events() {
        let states = Arc::new(AtomicUsize::new(0));
        let adapter = {
            let states = Arc::clone(&states);
            StateChangeFn(move |_: &ScanState| {
                states.fetch_add(1, Ordering::SeqCst);
            })
        };
        adapter.on_state_change(&ScanState::idle());
        adapter.on_progress(&progress(1));
        assert_eq!(states.load(Ordering::SeqCst), 1);
    }
}
