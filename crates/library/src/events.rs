use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use common::Track;

#[derive(Clone, Debug)]
pub enum LibraryEvent {
    ScanStart,
    ScanProgress {
        files_scanned: usize,
        current_file: String,
    },
    ScanComplete {
        tracks_found: usize,
        aborted: bool,
    },
    ScanError {
        error: String,
    },
    TrackAdded {
        track: Track,
    },
    TrackRemoved {
        track: Track,
    },
    /// Coarse "re-read everything" signal for persistence and UI layers.
    LibraryUpdated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ScanStart,
    ScanProgress,
    ScanComplete,
    ScanError,
    TrackAdded,
    TrackRemoved,
    LibraryUpdated,
}

impl LibraryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LibraryEvent::ScanStart => EventKind::ScanStart,
            LibraryEvent::ScanProgress { .. } => EventKind::ScanProgress,
            LibraryEvent::ScanComplete { .. } => EventKind::ScanComplete,
            LibraryEvent::ScanError { .. } => EventKind::ScanError,
            LibraryEvent::TrackAdded { .. } => EventKind::TrackAdded,
            LibraryEvent::TrackRemoved { .. } => EventKind::TrackRemoved,
            LibraryEvent::LibraryUpdated => EventKind::LibraryUpdated,
        }
    }
}

type Handler = Arc<dyn Fn(&LibraryEvent) + Send + Sync>;

/// Handle returned by subscribe; pass it back to unsubscribe.
#[derive(Clone, Copy, Debug)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

/// Observer registry keyed by event kind. Handlers run isolated: one
/// panicking handler is logged and the rest still fire.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&LibraryEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(list) = self.handlers.lock().get_mut(&subscription.kind) {
            list.retain(|(id, _)| *id != subscription.id);
        }
    }

    pub fn emit(&self, event: &LibraryEvent) {
        // Handlers run outside the lock so they may subscribe/unsubscribe.
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("Event handler panicked for {:?}", event.kind());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribe_emit_unsubscribe() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let subscription = bus.subscribe(EventKind::ScanStart, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&LibraryEvent::ScanStart);
        bus.emit(&LibraryEvent::LibraryUpdated);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        bus.unsubscribe(&subscription);
        bus.emit(&LibraryEvent::ScanStart);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_handler_does_not_starve_the_rest() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::LibraryUpdated, |_| {
            panic!("handler bug");
        });
        let counter = Arc::clone(&seen);
        bus.subscribe(EventKind::LibraryUpdated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&LibraryEvent::LibraryUpdated);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_only_fire_for_their_kind() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.subscribe(EventKind::TrackAdded, move |event| {
            assert!(matches!(event, LibraryEvent::TrackAdded { .. }));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&LibraryEvent::ScanStart);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
