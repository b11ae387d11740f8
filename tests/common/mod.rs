//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use switchboard::bus::{Bus, ChannelBus};
use switchboard::registry::{CallbackError, CallbackRegistry, Continuation, RegistryConfig};
use switchboard::supervisor::{SupervisorContext, SupervisorError, SupervisorHooks, UnitExit};
use switchboard::Params;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(100);

/// A fresh in-memory bus and registry.
pub fn channel_context() -> SupervisorContext {
    let bus: Arc<dyn Bus> = Arc::new(ChannelBus::default());
    SupervisorContext::new(bus, CallbackRegistry::new(RegistryConfig::default()))
}

pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, timeout: Duration) -> Option<T> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Some(item) = recv_within(rx, QUIET).await {
        panic!("expected nothing, got {:?}", item);
    }
}

pub type Outcome = Result<Params, CallbackError>;

/// Continuation that forwards its outcome to a channel.
pub fn continuation() -> (Continuation, mpsc::UnboundedReceiver<Outcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let continuation: Continuation = Box::new(move |outcome| {
        let _ = tx.send(outcome);
    });
    (continuation, rx)
}

/// Supervision event as recorded by [`RecordingHooks`].
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    Ready(String),
    Close(String, UnitExit),
    Error(String, String),
}

pub struct RecordingHooks {
    tx: mpsc::UnboundedSender<HookEvent>,
}

impl RecordingHooks {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HookEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SupervisorHooks for RecordingHooks {
    fn on_ready(&self, tag: &str) {
        let _ = self.tx.send(HookEvent::Ready(tag.to_string()));
    }

    fn on_close(&self, tag: &str, exit: &UnitExit) {
        let _ = self.tx.send(HookEvent::Close(tag.to_string(), exit.clone()));
    }

    fn on_error(&self, tag: &str, error: &SupervisorError) {
        let _ = self.tx.send(HookEvent::Error(tag.to_string(), error.to_string()));
    }
}
