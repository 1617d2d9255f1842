use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::kernel::KernelError;

/// Completion event recorded by asynchronous work once it has finished.
///
/// The failure slot is written before the done flag is released, so a reader
/// that observes `is_recorded() == true` also observes the failure and every
/// write the work performed.
#[derive(Debug, Default)]
pub struct CompletionEvent {
    done: AtomicBool,
    failure: Mutex<Option<KernelError>>,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: Result<(), KernelError>) {
        if let Err(err) = result {
            *self.failure.lock() = Some(err);
        }
        self.done.store(true, Ordering::Release);
    }

    /// Non-blocking.
    pub fn is_recorded(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<KernelError> {
        self.failure.lock().clone()
    }
}

/// Backend-specific contents of a status buffer.
#[derive(Debug)]
pub enum StatusPayload {
    /// Synchronous execution: set once compute returns.
    Host {
        done: bool,
        failure: Option<KernelError>,
    },
    /// Asynchronous execution tracked through an event the device records.
    Device(Arc<CompletionEvent>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusPhase {
    #[default]
    Uninitialized,
    Live,
    Deleted,
}

/// Per-instruction completion storage.
///
/// Only stream types construct, interpret and delete the payload. The buffer
/// itself enforces the lifecycle: it is initialized once, read only while
/// live, and deleted once. Anything else is a lifecycle violation.
#[derive(Debug, Default)]
pub struct StatusBuffer {
    phase: StatusPhase,
    payload: Option<StatusPayload>,
}

impl StatusBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> StatusPhase {
        self.phase
    }

    pub fn init(&mut self, payload: StatusPayload) {
        if self.phase != StatusPhase::Uninitialized {
            lifecycle_violation!("status buffer initialized while {:?}", self.phase);
        }
        self.payload = Some(payload);
        self.phase = StatusPhase::Live;
    }

    pub fn payload(&self) -> &StatusPayload {
        match (&self.phase, &self.payload) {
            (StatusPhase::Live, Some(payload)) => payload,
            _ => lifecycle_violation!("status buffer read while {:?}", self.phase),
        }
    }

    pub fn payload_mut(&mut self) -> &mut StatusPayload {
        let phase = self.phase;
        match (phase, self.payload.as_mut()) {
            (StatusPhase::Live, Some(payload)) => payload,
            _ => lifecycle_violation!("status buffer written while {phase:?}"),
        }
    }

    pub fn delete(&mut self) -> StatusPayload {
        if self.phase != StatusPhase::Live {
            lifecycle_violation!("status buffer deleted while {:?}", self.phase);
        }
        self.phase = StatusPhase::Deleted;
        match self.payload.take() {
            Some(payload) => payload,
            None => lifecycle_violation!("live status buffer without payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> StatusPayload {
        StatusPayload::Host {
            done: false,
            failure: None,
        }
    }

    #[test]
    fn lifecycle_runs_init_then_delete() {
        let mut status = StatusBuffer::new();
        assert_eq!(status.phase(), StatusPhase::Uninitialized);
        status.init(host());
        assert!(matches!(status.payload(), StatusPayload::Host { done: false, .. }));
        status.delete();
        assert_eq!(status.phase(), StatusPhase::Deleted);
    }

    #[test]
    #[should_panic(expected = "lifecycle violation")]
    fn double_init_fails_fast() {
        let mut status = StatusBuffer::new();
        status.init(host());
        status.init(host());
    }

    #[test]
    #[should_panic(expected = "lifecycle violation")]
    fn read_before_init_fails_fast() {
        let status = StatusBuffer::new();
        let _ = status.payload();
    }

    #[test]
    #[should_panic(expected = "lifecycle violation")]
    fn read_after_delete_fails_fast() {
        let mut status = StatusBuffer::new();
        status.init(host());
        status.delete();
        let _ = status.payload();
    }

    #[test]
    #[should_panic(expected = "lifecycle violation")]
    fn double_delete_fails_fast() {
        let mut status = StatusBuffer::new();
        status.init(host());
        status.delete();
        status.delete();
    }

    #[test]
    fn event_publishes_failure_with_completion() {
        let event = CompletionEvent::new();
        assert!(!event.is_recorded());
        event.record(Err(KernelError::new("op", "bad")));
        assert!(event.is_recorded());
        assert_eq!(event.failure().map(|err| err.message), Some("bad".into()));
    }
}
