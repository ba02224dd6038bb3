//! Run event delivery
//!
//! Callbacks are invoked on the engine worker thread. Callers that need the
//! events on another thread can use [`ChannelCallback`] and drain the
//! receiving end wherever they like.

use super::analyzer::TestResult;
use crossbeam_channel::{Receiver, Sender};

/// Receiver of progress and terminal events for one run
///
/// Exactly one of [`on_complete`](Self::on_complete) and
/// [`on_error`](Self::on_error) is called per accepted run.
pub trait EchoTestCallback: Send {
    /// Run progress, 0..=100
    fn on_progress(&self, percent: u8);

    /// Run finished (normally or after `stop`) and was analyzed
    fn on_complete(&self, result: TestResult);

    /// Run failed before producing a result
    fn on_error(&self, message: String);
}

/// Event forwarded by [`ChannelCallback`]
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    Progress(u8),
    Complete(TestResult),
    Error(String),
}

impl TestEvent {
    /// Whether this event ends the run
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TestEvent::Progress(_))
    }
}

/// Callback forwarding every event into an unbounded channel
///
/// # Example
/// ```
/// use echotester_core::{ChannelCallback, EchoTestCallback, TestEvent};
///
/// let (callback, events) = ChannelCallback::new();
/// callback.on_progress(42);
/// assert_eq!(events.try_recv().unwrap(), TestEvent::Progress(42));
/// ```
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    tx: Sender<TestEvent>,
}

impl ChannelCallback {
    /// Create a callback and the receiver for its events
    pub fn new() -> (Self, Receiver<TestEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: TestEvent) {
        // Receiver dropped: nobody is listening any more
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

impl EchoTestCallback for ChannelCallback {
    fn on_progress(&self, percent: u8) {
        self.send(TestEvent::Progress(percent));
    }

    fn on_complete(&self, result: TestResult) {
        self.send(TestEvent::Complete(result));
    }

    fn on_error(&self, message: String) {
        self.send(TestEvent::Error(message));
    }
}
