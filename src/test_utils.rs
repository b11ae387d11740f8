//! Test utilities and recording handlers.
//!
//! Available to unit tests and, with the `test-utils` feature, to
//! integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::bus::{BusError, BusMessage, MessageHandler};
use crate::envelope::{Envelope, Params};
use crate::node::{Lifecycle, NodeIdentity};
use crate::registry::{CallbackError, Continuation};

/// Handler that forwards every message it receives to a channel.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl RecordingHandler {
    /// Create a handler and the receiving end of its recording.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, message: Arc<BusMessage>) -> BoxFuture<'static, Result<(), BusError>> {
        let _ = self.tx.send((*message).clone());
        Box::pin(async { Ok(()) })
    }
}

/// Receive the next item, or `None` if nothing arrives within `timeout`.
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, timeout: Duration) -> Option<T> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Assert nothing arrives within `quiet`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, quiet: Duration) {
    if let Some(item) = recv_within(rx, quiet).await {
        panic!("expected no further messages, got {:?}", item);
    }
}

/// Lifecycle event as seen by [`RecordingLifecycle`].
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Ready(String),
    Data { path: String, payload: serde_json::Value },
    Error(BusError),
    Close(String),
}

/// Lifecycle that forwards every hook call to a channel.
pub struct RecordingLifecycle {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl RecordingLifecycle {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Lifecycle for RecordingLifecycle {
    fn on_ready(&self, node: &NodeIdentity) {
        let _ = self.tx.send(LifecycleEvent::Ready(node.id.clone()));
    }

    fn on_data(&self, path: &str, envelope: &Envelope) {
        let _ = self.tx.send(LifecycleEvent::Data {
            path: path.to_string(),
            payload: serde_json::Value::Object(envelope.payload.clone()),
        });
    }

    fn on_error(&self, error: &BusError) {
        let _ = self.tx.send(LifecycleEvent::Error(error.clone()));
    }

    fn on_close(&self, node: &NodeIdentity) {
        let _ = self.tx.send(LifecycleEvent::Close(node.id.clone()));
    }
}

/// A continuation that forwards its outcome to a channel.
pub fn recording_continuation() -> (
    Continuation,
    mpsc::UnboundedReceiver<Result<Params, CallbackError>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let continuation: Continuation = Box::new(move |outcome| {
        let _ = tx.send(outcome);
    });
    (continuation, rx)
}
