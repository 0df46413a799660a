//! In-process transport
//!
//! Loops frames through memory instead of a radio. Used by the test suite and
//! for running the pipeline on machines without Bluetooth. Sends can be
//! scripted to fail so retry behavior is observable.

use super::abstraction::{
    ConnectionState, DataCallback, EventCallback, TransportError, TransportEvent, TransportPort,
};
use crate::subscription::{Observers, SubscriptionId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// How the next `send` calls behave
#[derive(Debug, Clone, PartialEq, Eq)]
enum SendBehavior {
    Deliver,
    FailAlways(String),
    FailNext { remaining: u32, reason: String },
}

pub struct MemoryTransport {
    available: bool,
    state: RwLock<ConnectionState>,
    device: RwLock<Option<String>>,
    behavior: Mutex<SendBehavior>,
    sent: Mutex<Vec<Vec<u8>>>,
    send_attempts: Mutex<u32>,
    // While true, sends wait before resolving
    hold: watch::Sender<bool>,
    events: Observers<EventCallback>,
    data: Observers<DataCallback>,
}

impl MemoryTransport {
    /// A powered-on, disconnected link
    pub fn new() -> Self {
        Self::with_state(true, ConnectionState::PoweredOn)
    }

    /// A platform without any radio stack
    pub fn unavailable() -> Self {
        Self::with_state(false, ConnectionState::Unsupported)
    }

    fn with_state(available: bool, state: ConnectionState) -> Self {
        Self {
            available,
            state: RwLock::new(state),
            device: RwLock::new(None),
            behavior: Mutex::new(SendBehavior::Deliver),
            sent: Mutex::new(Vec::new()),
            send_attempts: Mutex::new(0),
            hold: watch::channel(false).0,
            events: Observers::new(),
            data: Observers::new(),
        }
    }

    fn emit(&self, event: TransportEvent) {
        debug!("MemoryTransport event: {}", event);
        for observer in self.events.snapshot() {
            observer(&event);
        }
    }

    /// Change the adapter state; leaving PoweredOn drops any link
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        self.emit(TransportEvent::StateChanged(state));
        if !state.is_usable() {
            self.drop_link();
        }
    }

    /// Simulate the remote end going away
    pub fn drop_link(&self) {
        let previous = self.device.write().take();
        if let Some(device_id) = previous {
            self.emit(TransportEvent::Disconnected { device_id });
        }
    }

    /// Every subsequent send fails with `reason`
    pub fn fail_sends(&self, reason: &str) {
        *self.behavior.lock() = SendBehavior::FailAlways(reason.to_string());
    }

    /// The next `count` sends fail with `reason`, later ones succeed
    pub fn fail_next_sends(&self, count: u32, reason: &str) {
        *self.behavior.lock() = SendBehavior::FailNext {
            remaining: count,
            reason: reason.to_string(),
        };
    }

    pub fn deliver_sends(&self) {
        *self.behavior.lock() = SendBehavior::Deliver;
    }

    /// Park subsequent sends after they are counted, until [`release_sends`]
    ///
    /// [`release_sends`]: MemoryTransport::release_sends
    pub fn hold_sends(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_sends(&self) {
        self.hold.send_replace(false);
    }

    /// Frames that were accepted, oldest first
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Accepted and failed sends together
    pub fn send_attempts(&self) -> u32 {
        *self.send_attempts.lock()
    }

    /// Feed bytes to data observers as if they came off the radio
    pub fn inject(&self, frame: &[u8]) {
        for observer in self.data.snapshot() {
            observer(frame);
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportPort for MemoryTransport {
    fn is_available(&self) -> bool {
        self.available
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn is_connected(&self) -> bool {
        self.device.read().is_some()
    }

    fn connected_device(&self) -> Option<String> {
        self.device.read().clone()
    }

    async fn connect(&self, device_id: &str) -> Result<(), TransportError> {
        if !self.available {
            return Err(TransportError::NotAvailable("no radio stack".into()));
        }
        let state = self.state();
        if !state.is_usable() {
            return Err(TransportError::ConnectionFailed(format!("adapter {}", state)));
        }

        // Single link: a new device replaces the old one
        if self.connected_device().as_deref() != Some(device_id) {
            self.drop_link();
            *self.device.write() = Some(device_id.to_string());
            self.emit(TransportEvent::Connected {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.drop_link();
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        *self.send_attempts.lock() += 1;

        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut gate = self.hold.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        {
            let mut behavior = self.behavior.lock();
            match &mut *behavior {
                SendBehavior::Deliver => {}
                SendBehavior::FailAlways(reason) => {
                    return Err(TransportError::SendFailed(reason.clone()));
                }
                SendBehavior::FailNext { remaining, reason } => {
                    let reason = reason.clone();
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        *behavior = SendBehavior::Deliver;
                    }
                    return Err(TransportError::SendFailed(reason));
                }
            }
        }

        self.sent.lock().push(frame.to_vec());
        Ok(())
    }

    fn on_state_change(&self, callback: Arc<EventCallback>) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    fn on_data_received(&self, callback: Arc<DataCallback>) -> SubscriptionId {
        self.data.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id) || self.data.unsubscribe(id)
    }
}
