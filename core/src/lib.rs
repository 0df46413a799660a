// MeshLink Core: packet codec and reliable delivery for MeshCore radios
//
// Outbound: send_text -> delivery queue -> codec -> transport.
// Inbound: transport bytes -> codec -> router -> node tracker / inbox.

pub mod config;
pub mod delivery;
pub mod logging;
pub mod protocol;
pub mod router;
pub mod store;
pub mod subscription;
pub mod transport;

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use thiserror::Error;

pub use config::{ConfigError, MeshLinkConfig};
pub use delivery::{DeliveryConfig, DeliveryError, DeliveryQueue, PassOutcome, QueueStatus};
pub use logging::{init_logging, LoggingConfig};
pub use protocol::{DecodeError, Packet, PacketCodec, PacketType, Payload, ProtocolError};
pub use router::{InboxRecorder, NodeConfig, NodeTracker, PacketRouter, PacketSubscriber};
pub use store::{StorageInfo, StoreError, StoredMessage, StoredNode, Stores};
pub use subscription::SubscriptionId;
pub use transport::{ConnectionState, MemoryTransport, TransportError, TransportEvent, TransportPort};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum MeshLinkError {
    #[error("Already running")]
    AlreadyRunning,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Wall-clock unix time in milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// MESHLINK
// ============================================================================

/// One radio link with its stores, router and delivery queue
pub struct MeshLink {
    config: MeshLinkConfig,
    codec: Arc<PacketCodec>,
    stores: Stores,
    transport: Arc<dyn TransportPort>,
    router: Arc<PacketRouter>,
    tracker: Arc<NodeTracker>,
    queue: Arc<DeliveryQueue>,
    transport_subscriptions: Mutex<Vec<SubscriptionId>>,
    running: RwLock<bool>,
}

impl MeshLink {
    /// Open storage per `config.storage_path` (in-memory when unset)
    pub fn new(
        config: MeshLinkConfig,
        transport: Arc<dyn TransportPort>,
    ) -> Result<Self, MeshLinkError> {
        config.validate()?;
        let stores = match &config.storage_path {
            Some(path) => Stores::open(path)?,
            None => Stores::in_memory(),
        };
        Self::with_stores(config, stores, transport)
    }

    pub fn with_stores(
        config: MeshLinkConfig,
        stores: Stores,
        transport: Arc<dyn TransportPort>,
    ) -> Result<Self, MeshLinkError> {
        config.validate()?;
        let codec = Arc::new(PacketCodec::new());
        let queue = Arc::new(DeliveryQueue::new(
            config.delivery.clone(),
            stores.messages.clone(),
            stores.queue.clone(),
            Arc::clone(&transport),
            Arc::clone(&codec),
        )?);

        let router = Arc::new(PacketRouter::new());
        let tracker = Arc::new(NodeTracker::new(
            stores.nodes.clone(),
            config.nodes.clone(),
        ));
        let inbox = Arc::new(InboxRecorder::new(
            stores.messages.clone(),
            config.local_node_id.clone(),
        ));
        router.subscribe(tracker.clone());
        router.subscribe(inbox);

        Ok(Self {
            config,
            codec,
            stores,
            transport,
            router,
            tracker,
            queue,
            transport_subscriptions: Mutex::new(Vec::new()),
            running: RwLock::new(false),
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Hook into the transport and start the delivery worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), MeshLinkError> {
        let mut running = self.running.write();
        if *running {
            return Err(MeshLinkError::AlreadyRunning);
        }

        tracing::info!("MeshLink starting as {}", self.config.local_node_id);

        let router = Arc::clone(&self.router);
        let data = self
            .transport
            .on_data_received(Arc::new(move |frame: &[u8]| {
                router.dispatch(frame);
            }));

        let queue: Weak<DeliveryQueue> = Arc::downgrade(&self.queue);
        let events = self
            .transport
            .on_state_change(Arc::new(move |event: &TransportEvent| {
                tracing::info!("Transport: {}", event);
                if let TransportEvent::Connected { .. } = event {
                    if let Some(queue) = queue.upgrade() {
                        queue.trigger();
                    }
                }
            }));

        self.transport_subscriptions.lock().extend([data, events]);
        self.queue.start();

        *running = true;
        tracing::info!("MeshLink started");
        Ok(())
    }

    /// Stop the worker and detach from the transport. Persisted state is kept.
    pub fn stop(&self) {
        let mut running = self.running.write();
        if !*running {
            return;
        }

        tracing::info!("MeshLink stopping...");
        self.queue.stop();
        for id in self.transport_subscriptions.lock().drain(..) {
            self.transport.unsubscribe(id);
        }
        *running = false;
        tracing::info!("MeshLink stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    // ------------------------------------------------------------------------
    // CONNECTION
    // ------------------------------------------------------------------------

    pub async fn connect(&self, device_id: &str) -> Result<(), MeshLinkError> {
        self.transport.connect(device_id).await?;
        self.queue.trigger();
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), MeshLinkError> {
        self.transport.disconnect().await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    // ------------------------------------------------------------------------
    // MESSAGING
    // ------------------------------------------------------------------------

    /// Store a pending outgoing text and queue it for delivery.
    ///
    /// Returns once the message is persisted; transmission happens on the
    /// next processing pass.
    pub fn send_text(
        &self,
        to: &str,
        text: &str,
        channel: u8,
    ) -> Result<StoredMessage, MeshLinkError> {
        let message = StoredMessage::outgoing_text(
            uuid::Uuid::new_v4().to_string(),
            &self.config.local_node_id,
            to,
            text,
            channel,
            self.queue.now_ms(),
        );
        self.queue.enqueue(&message)?;
        Ok(message)
    }

    /// Feed a frame received outside the transport observers (e.g. replayed
    /// from a log)
    pub fn receive_frame(&self, frame: &[u8]) -> Option<Packet> {
        self.router.dispatch(frame)
    }

    pub async fn process_queue(&self) -> Result<PassOutcome, MeshLinkError> {
        Ok(self.queue.process_queue().await?)
    }

    pub fn queue_status(&self) -> Result<QueueStatus, MeshLinkError> {
        Ok(self.queue.status()?)
    }

    pub fn retry_all(&self) -> Result<usize, MeshLinkError> {
        Ok(self.queue.retry_all()?)
    }

    pub fn clear_failed(&self) -> Result<usize, MeshLinkError> {
        Ok(self.queue.clear_failed()?)
    }

    pub fn storage_info(&self) -> Result<StorageInfo, MeshLinkError> {
        Ok(self.stores.info()?)
    }

    // ------------------------------------------------------------------------
    // ACCESSORS
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &MeshLinkConfig {
        &self.config
    }

    pub fn local_node_id(&self) -> &str {
        &self.config.local_node_id
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn router(&self) -> &PacketRouter {
        &self.router
    }

    pub fn nodes(&self) -> &NodeTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }
}

impl Drop for MeshLink {
    fn drop(&mut self) {
        self.stop();
    }
}
