// src/events.rs

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub item_id: String,
    pub unit_id: u32,
    pub variant_id: String,
    pub progress_percent: u8,
    pub completed_segments: u32,
    pub total_segments: u32,
    pub downloaded_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub item_id: String,
    pub unit_id: u32,
    pub variant_id: String,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub item_id: String,
    pub unit_id: u32,
    pub variant_id: String,
    pub message: String,
}

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// One set of listeners for one kind of event.
pub struct Registry<E> {
    name: &'static str,
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Registry<E> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: ListenerId, listener: Listener<E>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every listener in registration order on the current task.
    ///
    /// A panicking listener is logged and skipped; it never unwinds into the
    /// caller.
    fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(kind = self.name, "event listener panicked");
            }
        }
    }
}

/// Fan-out of download notifications. Nothing is buffered: listeners only
/// see events emitted after they registered.
pub struct EventHub {
    next_id: AtomicU64,
    progress: Registry<ProgressEvent>,
    completion: Registry<CompletionEvent>,
    error: Registry<ErrorEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            progress: Registry::new("progress"),
            completion: Registry::new("completion"),
            error: Registry::new("error"),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_progress(&self, listener: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id();
        self.progress.add(id, Arc::new(listener));
        id
    }

    pub fn on_completion(&self, listener: impl Fn(&CompletionEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id();
        self.completion.add(id, Arc::new(listener));
        id
    }

    pub fn on_error(&self, listener: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id();
        self.error.add(id, Arc::new(listener));
        id
    }

    /// Removes a listener from whichever set holds it.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.progress.remove(id) || self.completion.remove(id) || self.error.remove(id)
    }

    pub fn progress_listeners(&self) -> &Registry<ProgressEvent> {
        &self.progress
    }

    pub fn completion_listeners(&self) -> &Registry<CompletionEvent> {
        &self.completion
    }

    pub fn error_listeners(&self) -> &Registry<ErrorEvent> {
        &self.error
    }

    pub(crate) fn emit_progress(&self, event: ProgressEvent) {
        self.progress.emit(&event);
    }

    pub(crate) fn emit_completion(&self, event: CompletionEvent) {
        self.completion.emit(&event);
    }

    pub(crate) fn emit_error(&self, event: ErrorEvent) {
        self.error.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(unit_id: u32) -> CompletionEvent {
        CompletionEvent {
            item_id: format!("alafasy:{unit_id:03}"),
            unit_id,
            variant_id: "alafasy".into(),
            total_bytes: 10,
        }
    }

    #[test]
    fn listeners_receive_in_order_and_can_be_removed() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = hub.on_completion(move |e| sink.lock().unwrap().push(e.unit_id));

        hub.emit_completion(completion(1));
        hub.emit_completion(completion(2));
        assert!(hub.remove(id));
        assert!(!hub.remove(id));
        hub.emit_completion(completion(3));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(hub.completion_listeners().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(0));

        hub.on_completion(|_| panic!("listener bug"));
        let sink = seen.clone();
        hub.on_completion(move |_| *sink.lock().unwrap() += 1);

        hub.emit_completion(completion(1));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn sets_are_independent() {
        let hub = EventHub::new();
        hub.on_error(|_| {});
        assert_eq!(hub.error_listeners().len(), 1);
        assert!(hub.progress_listeners().is_empty());
        assert!(hub.completion_listeners().is_empty());
    }
}
