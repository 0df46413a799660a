//! Delivery queue
//!
//! Every accepted outbound message is persisted as a [`QueuedMessage`] and
//! driven through the transport by processing passes. A pass walks the queue
//! in insertion order; each item is sent, rescheduled with backoff, or (after
//! the configured number of attempts) removed and marked failed. Every change
//! to an item is written back before the pass moves on, so a restart resumes
//! exactly where the previous process stopped.
//!
//! Passes are single-flight: a pass requested while another is running
//! returns [`PassOutcome::Busy`] without touching the queue.
//!
//! Multi-step changes (enqueue, retry, clear, and each step of a pass) run
//! under one state lock that is never held across a transport send. An item
//! changed by someone else while its send was in flight keeps that change.

use super::{DeliveryConfig, DeliveryError};
use crate::protocol::PacketCodec;
use crate::store::{MessageStatus, MessageStore, QueueStore, QueuedMessage, StoredMessage};
use crate::transport::TransportPort;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Point-in-time queue counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub total_count: usize,
    /// Never attempted
    pub pending_count: usize,
    /// Failed at least once and due again
    pub retrying_count: usize,
}

/// A message that left the queue without being sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub id: String,
    pub last_error: Option<String>,
}

/// What one processing pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub sent: Vec<String>,
    pub rescheduled: Vec<String>,
    pub failed: Vec<FailedDelivery>,
    /// Items not yet due
    pub skipped: usize,
    /// Earliest `next_retry_time` left in the queue
    pub next_due: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was already running
    Busy,
    /// Transport unavailable or without a link; nothing was touched
    Disconnected,
    Completed(PassReport),
}

/// Unix-millis clock anchored at construction and advanced by tokio's
/// monotonic clock, so paused-time tests see backoff elapse.
#[derive(Debug, Clone, Copy)]
struct QueueClock {
    origin_ms: u64,
    origin: Instant,
}

impl QueueClock {
    fn new() -> Self {
        Self {
            origin_ms: crate::current_timestamp_ms(),
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

struct QueueInner {
    config: DeliveryConfig,
    messages: MessageStore,
    queue: QueueStore,
    transport: Arc<dyn TransportPort>,
    codec: Arc<PacketCodec>,
    clock: QueueClock,
    pass_lock: Mutex<()>,
    // Serializes queue/message read-modify-write sequences
    state: parking_lot::Mutex<()>,
    wake: Notify,
}

pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryQueue {
    pub fn new(
        config: DeliveryConfig,
        messages: MessageStore,
        queue: QueueStore,
        transport: Arc<dyn TransportPort>,
        codec: Arc<PacketCodec>,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                messages,
                queue,
                transport,
                codec,
                clock: QueueClock::new(),
                pass_lock: Mutex::new(()),
                state: parking_lot::Mutex::new(()),
                wake: Notify::new(),
            }),
            worker: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    /// Current time on the queue's clock (unix millis)
    pub fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    /// Persist a fresh queue item plus `message` as pending, then wake the
    /// worker. Never sends inline.
    ///
    /// On a storage error nothing stays behind: the queue item is removed
    /// again if the message could not be saved.
    pub fn enqueue(&self, message: &StoredMessage) -> Result<QueuedMessage, DeliveryError> {
        self.enqueue_at(message, self.now_ms())
    }

    pub fn enqueue_at(
        &self,
        message: &StoredMessage,
        now: u64,
    ) -> Result<QueuedMessage, DeliveryError> {
        let state = self.inner.state.lock();
        let item = self.inner.queue.insert(QueuedMessage::new(
            &message.id,
            &message.sender,
            &message.recipient,
            &message.content,
            message.channel,
            now,
        ))?;

        let mut pending = message.clone();
        pending.status = MessageStatus::Pending;
        if let Err(e) = self.inner.messages.save(&pending) {
            if let Err(rollback) = self.inner.queue.remove(&item.id) {
                error!("Failed to roll back queue item {}: {}", item.id, rollback);
            }
            return Err(e.into());
        }
        drop(state);

        debug!("Queued message {} for {}", item.id, item.recipient);
        self.trigger();
        Ok(item)
    }

    /// Ask the worker for a pass as soon as possible
    pub fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    pub async fn process_queue(&self) -> Result<PassOutcome, DeliveryError> {
        self.inner.process(self.now_ms()).await
    }

    /// Run one pass as if the time were `now`
    pub async fn process_queue_at(&self, now: u64) -> Result<PassOutcome, DeliveryError> {
        self.inner.process(now).await
    }

    pub fn status(&self) -> Result<QueueStatus, DeliveryError> {
        self.status_at(self.now_ms())
    }

    pub fn status_at(&self, now: u64) -> Result<QueueStatus, DeliveryError> {
        let items = self.inner.queue.get_all()?;
        Ok(QueueStatus {
            total_count: items.len(),
            pending_count: items.iter().filter(|q| q.retry_count == 0).count(),
            retrying_count: items
                .iter()
                .filter(|q| q.retry_count > 0 && q.is_due(now))
                .count(),
        })
    }

    /// Queued items in processing order
    pub fn items(&self) -> Result<Vec<QueuedMessage>, DeliveryError> {
        Ok(self.inner.queue.get_all()?)
    }

    /// Remove items that used up their attempts and mark their messages
    /// failed. Returns how many were removed.
    pub fn clear_failed(&self) -> Result<usize, DeliveryError> {
        let max = self.inner.config.max_retry_attempts;
        let _state = self.inner.state.lock();
        let mut removed = 0;
        for item in self.inner.queue.get_all()? {
            if item.retry_count >= max {
                self.inner.finish_failed(&item)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cleared {} failed queue items", removed);
        }
        Ok(removed)
    }

    /// Drop every queued item. Stored message statuses are left alone.
    pub fn clear_all(&self) -> Result<usize, DeliveryError> {
        let removed = {
            let _state = self.inner.state.lock();
            self.inner.queue.clear()?
        };
        info!("Cleared delivery queue ({} items)", removed);
        Ok(removed)
    }

    /// Reset every item's backoff so it is due immediately, then wake the
    /// worker
    pub fn retry_all(&self) -> Result<usize, DeliveryError> {
        self.retry_all_at(self.now_ms())
    }

    pub fn retry_all_at(&self, now: u64) -> Result<usize, DeliveryError> {
        let reset = {
            let _state = self.inner.state.lock();
            self.inner.queue.update_all(|item| {
                item.retry_count = 0;
                item.next_retry_time = now;
                item.last_error = None;
            })?
        };
        info!("Reset backoff for {} queued items", reset);
        self.trigger();
        Ok(reset)
    }

    /// Spawn the background worker: a pass every `process_interval_ms`, on
    /// every trigger, and when the earliest backoff expires.
    ///
    /// Must be called from within a tokio runtime. Calling it while the
    /// worker is running is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(async move { inner.run().await }));
        info!(
            "Delivery queue started (interval {:?})",
            self.inner.config.process_interval()
        );
    }

    /// Cancel the worker. Queued items stay persisted.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
            info!("Delivery queue stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

async fn sleep_until_due(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}

impl QueueInner {
    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.process_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_due: Option<u64> = None;

        loop {
            let wait = next_due.map(|due| Duration::from_millis(due.saturating_sub(self.clock.now_ms())));
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = sleep_until_due(wait) => {}
            }

            next_due = match self.process(self.clock.now_ms()).await {
                Ok(PassOutcome::Completed(report)) => report.next_due,
                Ok(PassOutcome::Busy) | Ok(PassOutcome::Disconnected) => None,
                Err(e) => {
                    error!("Delivery pass failed: {}", e);
                    None
                }
            };
        }
    }

    async fn process(&self, now: u64) -> Result<PassOutcome, DeliveryError> {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("Delivery pass already running");
            return Ok(PassOutcome::Busy);
        };
        if !self.transport.is_available() || !self.transport.is_connected() {
            debug!("Delivery pass skipped: transport not connected");
            return Ok(PassOutcome::Disconnected);
        }

        let mut report = PassReport::default();
        let ids: Vec<String> = self.queue.get_all()?.into_iter().map(|q| q.id).collect();
        for id in ids {
            let (item, encoded) = {
                let _state = self.state.lock();
                // Re-read: the item may have been reset or removed since the
                // pass began
                let Some(item) = self.queue.get(&id)? else {
                    continue;
                };
                if !item.is_due(now) {
                    report.skipped += 1;
                    continue;
                }

                if item.retry_count >= self.config.max_retry_attempts {
                    warn!(
                        "Giving up on {} after {} attempts: {}",
                        item.id,
                        item.retry_count,
                        item.last_error.as_deref().unwrap_or("unknown error")
                    );
                    self.finish_failed(&item)?;
                    report.failed.push(FailedDelivery {
                        id: item.id,
                        last_error: item.last_error,
                    });
                    continue;
                }

                let encoded = self.codec.encode_text_message(
                    &item.sender,
                    &item.recipient,
                    &item.content,
                    item.channel,
                );
                match encoded {
                    Ok(encoded) => (item, encoded),
                    Err(e) => {
                        // Cannot succeed on retry
                        warn!("Cannot encode {}: {}", item.id, e);
                        let mut failed = item;
                        failed.last_error = Some(e.to_string());
                        self.finish_failed(&failed)?;
                        report.failed.push(FailedDelivery {
                            id: failed.id,
                            last_error: failed.last_error,
                        });
                        continue;
                    }
                }
            };

            let result = self.transport.send(&encoded.bytes).await;

            let _state = self.state.lock();
            match result {
                Ok(()) => {
                    self.queue.remove(&item.id)?;
                    self.messages.update_status(&item.id, MessageStatus::Sent)?;
                    debug!("Sent {} as packet {}", item.id, encoded.id());
                    report.sent.push(item.id);
                }
                Err(e) => {
                    let retry_count = item.retry_count + 1;
                    let next_retry_time = now + self.config.backoff_for(retry_count);
                    let reason = e.to_string();
                    warn!(
                        "Send of {} failed (attempt {}): {}",
                        item.id, retry_count, reason
                    );

                    // Only if nobody reset or removed the item mid-send
                    let mut rescheduled = false;
                    self.queue.update(&item.id, |q| {
                        if *q == item {
                            q.retry_count = retry_count;
                            q.next_retry_time = next_retry_time;
                            q.last_error = Some(reason);
                            rescheduled = true;
                        }
                    })?;
                    if rescheduled {
                        report.rescheduled.push(item.id);
                    } else {
                        debug!("{} changed during send, keeping its new state", item.id);
                    }
                }
            }
        }

        report.next_due = self
            .queue
            .get_all()?
            .iter()
            .map(|q| q.next_retry_time)
            .min();
        debug!(
            "Delivery pass: {} sent, {} rescheduled, {} failed, {} waiting",
            report.sent.len(),
            report.rescheduled.len(),
            report.failed.len(),
            report.skipped
        );
        Ok(PassOutcome::Completed(report))
    }

    fn finish_failed(&self, item: &QueuedMessage) -> Result<(), DeliveryError> {
        self.queue.remove(&item.id)?;
        self.messages.update_status(&item.id, MessageStatus::Failed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MAX_RETRY_ATTEMPTS;
    use crate::protocol::decode;
    use crate::store::{MemoryStorage, StorageBackend, StoreError, Stores};
    use crate::transport::MemoryTransport;

    const T0: u64 = 1_700_000_000_000;

    struct Harness {
        stores: Stores,
        transport: Arc<MemoryTransport>,
        queue: DeliveryQueue,
    }

    async fn harness(connected: bool) -> Harness {
        let stores = Stores::in_memory();
        let transport = Arc::new(MemoryTransport::new());
        if connected {
            transport.connect("radio").await.unwrap();
        }
        let queue = DeliveryQueue::new(
            DeliveryConfig::default(),
            stores.messages.clone(),
            stores.queue.clone(),
            transport.clone(),
            Arc::new(PacketCodec::new()),
        )
        .unwrap();
        Harness {
            stores,
            transport,
            queue,
        }
    }

    fn message(id: &str) -> StoredMessage {
        StoredMessage::outgoing_text(id, "local", "peer", "hello", 0, T0)
    }

    fn report(outcome: PassOutcome) -> PassReport {
        match outcome {
            PassOutcome::Completed(report) => report,
            other => panic!("expected completed pass, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_enqueue_persists_without_sending() {
        let h = harness(true).await;
        let item = h.queue.enqueue_at(&message("m1"), T0).unwrap();

        assert_eq!(item.retry_count, 0);
        assert_eq!(item.next_retry_time, T0);
        assert_eq!(h.transport.send_attempts(), 0);
        assert_eq!(
            h.stores.messages.get("m1").unwrap().unwrap().status,
            MessageStatus::Pending
        );
        assert_eq!(h.queue.status_at(T0).unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn test_successful_send_removes_item() {
        let h = harness(true).await;
        h.queue.enqueue_at(&message("m1"), T0).unwrap();

        let pass = report(h.queue.process_queue_at(T0).await.unwrap());
        assert_eq!(pass.sent, vec!["m1".to_string()]);
        assert_eq!(pass.next_due, None);
        assert!(h.queue.items().unwrap().is_empty());
        assert_eq!(
            h.stores.messages.get("m1").unwrap().unwrap().status,
            MessageStatus::Sent
        );

        let frames = h.transport.sent_frames();
        assert_eq!(frames.len(), 1);
        let packet = decode(&frames[0]).unwrap();
        assert_eq!(packet.from, "local");
        assert_eq!(packet.to, "peer");
        assert_eq!(packet.text_message().unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_disconnected_pass_is_noop() {
        let h = harness(false).await;
        h.queue.enqueue_at(&message("m1"), T0).unwrap();

        assert_eq!(
            h.queue.process_queue_at(T0).await.unwrap(),
            PassOutcome::Disconnected
        );
        assert_eq!(h.transport.send_attempts(), 0);
        let item = &h.queue.items().unwrap()[0];
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.next_retry_time, T0);
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let h = harness(true).await;
        h.transport.fail_sends("gatt busy");
        h.queue.enqueue_at(&message("m1"), T0).unwrap();

        let pass = report(h.queue.process_queue_at(T0).await.unwrap());
        assert_eq!(pass.rescheduled, vec!["m1".to_string()]);
        assert_eq!(pass.next_due, Some(T0 + 1_000));

        let item = &h.queue.items().unwrap()[0];
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.next_retry_time, T0 + 1_000);
        assert!(item.last_error.as_deref().unwrap().contains("gatt busy"));

        // Not due yet: skipped, nothing sent
        let pass = report(h.queue.process_queue_at(T0 + 999).await.unwrap());
        assert_eq!(pass.skipped, 1);
        assert_eq!(h.transport.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_failed() {
        let h = harness(true).await;
        h.transport.fail_sends("no ack");
        h.queue.enqueue_at(&message("m1"), T0).unwrap();

        let mut now = T0;
        let mut waits = Vec::new();
        for _ in 0..5 {
            report(h.queue.process_queue_at(now).await.unwrap());
            let next = h.queue.items().unwrap()[0].next_retry_time;
            waits.push(next - now);
            now = next;
        }
        assert_eq!(waits, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(h.transport.send_attempts(), 5);
        assert_eq!(
            h.stores.messages.get("m1").unwrap().unwrap().status,
            MessageStatus::Pending
        );

        let pass = report(h.queue.process_queue_at(now).await.unwrap());
        assert_eq!(h.transport.send_attempts(), 5);
        assert_eq!(pass.failed.len(), 1);
        assert_eq!(pass.failed[0].id, "m1");
        assert!(pass.failed[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("no ack"));
        assert!(h.queue.items().unwrap().is_empty());
        assert_eq!(
            h.stores.messages.get("m1").unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_fifo_order_within_pass() {
        let h = harness(true).await;
        for id in ["c", "a", "b"] {
            h.queue.enqueue_at(&message(id), T0).unwrap();
        }
        let pass = report(h.queue.process_queue_at(T0).await.unwrap());
        assert_eq!(pass.sent, vec!["c", "a", "b"]);

        let ids: Vec<_> = h
            .transport
            .sent_frames()
            .iter()
            .map(|f| decode(f).unwrap().id)
            .collect();
        assert!(ids.windows(2).all(|w| w[1] == w[0].wrapping_add(1)));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let h = harness(true).await;
        h.queue.enqueue_at(&message("fresh"), T0).unwrap();
        h.queue.enqueue_at(&message("retrying"), T0).unwrap();
        h.queue.enqueue_at(&message("waiting"), T0).unwrap();
        h.stores
            .queue
            .update("retrying", |q| {
                q.retry_count = 2;
                q.next_retry_time = T0;
            })
            .unwrap();
        h.stores
            .queue
            .update("waiting", |q| {
                q.retry_count = 1;
                q.next_retry_time = T0 + 5_000;
            })
            .unwrap();

        assert_eq!(
            h.queue.status_at(T0).unwrap(),
            QueueStatus {
                total_count: 3,
                pending_count: 1,
                retrying_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_retry_all_resets_backoff() {
        let h = harness(true).await;
        h.transport.fail_sends("down");
        h.queue.enqueue_at(&message("m1"), T0).unwrap();
        h.queue.process_queue_at(T0).await.unwrap();
        h.queue.process_queue_at(T0 + 1_000).await.unwrap();

        assert_eq!(h.queue.retry_all_at(T0 + 1_500).unwrap(), 1);
        let item = &h.queue.items().unwrap()[0];
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.next_retry_time, T0 + 1_500);
        assert!(item.last_error.is_none());

        h.transport.deliver_sends();
        let pass = report(h.queue.process_queue_at(T0 + 1_500).await.unwrap());
        assert_eq!(pass.sent, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_failed_only_removes_exhausted() {
        let h = harness(true).await;
        h.queue.enqueue_at(&message("spent"), T0).unwrap();
        h.queue.enqueue_at(&message("live"), T0).unwrap();
        h.stores
            .queue
            .update("spent", |q| q.retry_count = MAX_RETRY_ATTEMPTS)
            .unwrap();

        assert_eq!(h.queue.clear_failed().unwrap(), 1);
        assert_eq!(h.queue.clear_failed().unwrap(), 0);
        let ids: Vec<_> = h.queue.items().unwrap().into_iter().map(|q| q.id).collect();
        assert_eq!(ids, vec!["live"]);
        assert_eq!(
            h.stores.messages.get("spent").unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_clear_all_keeps_statuses() {
        let h = harness(true).await;
        h.queue.enqueue_at(&message("m1"), T0).unwrap();
        h.queue.enqueue_at(&message("m2"), T0).unwrap();

        assert_eq!(h.queue.clear_all().unwrap(), 2);
        assert!(h.queue.items().unwrap().is_empty());
        assert_eq!(
            h.stores.messages.get("m1").unwrap().unwrap().status,
            MessageStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_busy() {
        let h = harness(true).await;
        let _running = h.queue.inner.pass_lock.lock().await;
        assert_eq!(h.queue.process_queue_at(T0).await.unwrap(), PassOutcome::Busy);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let stores = Stores::in_memory();
        let mut config = DeliveryConfig::default();
        config.max_retry_attempts = 0;
        let result = DeliveryQueue::new(
            config,
            stores.messages.clone(),
            stores.queue.clone(),
            Arc::new(MemoryTransport::new()),
            Arc::new(PacketCodec::new()),
        );
        assert!(matches!(result, Err(DeliveryError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_sends_after_enqueue() {
        let h = harness(true).await;
        h.queue.start();
        assert!(h.queue.is_running());

        h.queue.enqueue(&message("m1")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.transport.sent_frames().len(), 1);
        assert_eq!(
            h.stores.messages.get("m1").unwrap().unwrap().status,
            MessageStatus::Sent
        );

        h.queue.stop();
        assert!(!h.queue.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_persisted_items() {
        let h = harness(false).await;
        h.queue.start();
        h.queue.enqueue(&message("m1")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.queue.stop();

        assert_eq!(h.queue.items().unwrap().len(), 1);
        assert_eq!(h.transport.send_attempts(), 0);
    }

    /// Memory backend whose writes and scans under `prefix` fail
    struct BrokenPrefix {
        inner: MemoryStorage,
        prefix: &'static [u8],
    }

    impl BrokenPrefix {
        fn check(&self, key: &[u8]) -> Result<(), StoreError> {
            if key.starts_with(self.prefix) {
                return Err(StoreError::Backend("disk full".into()));
            }
            Ok(())
        }
    }

    impl StorageBackend for BrokenPrefix {
        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.check(key)?;
            self.inner.put(key, value)
        }

        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
            self.inner.remove(key)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
            self.check(prefix)?;
            self.inner.scan_prefix(prefix)
        }

        fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StoreError> {
            self.inner.count_prefix(prefix)
        }

        fn flush(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn broken_queue(prefix: &'static [u8]) -> (Stores, DeliveryQueue) {
        let stores = Stores::new(Arc::new(BrokenPrefix {
            inner: MemoryStorage::new(),
            prefix,
        }));
        let queue = DeliveryQueue::new(
            DeliveryConfig::default(),
            stores.messages.clone(),
            stores.queue.clone(),
            Arc::new(MemoryTransport::new()),
            Arc::new(PacketCodec::new()),
        )
        .unwrap();
        (stores, queue)
    }

    #[test]
    fn test_enqueue_queue_write_failure_leaves_nothing() {
        let (stores, queue) = broken_queue(b"queue_");

        let result = queue.enqueue_at(&message("m1"), T0);
        assert!(matches!(result, Err(DeliveryError::Store(StoreError::Backend(_)))));
        assert!(stores.messages.get("m1").unwrap().is_none());
        assert!(stores.messages.conversations().unwrap().is_empty());
        assert!(queue.status_at(T0).is_err());
    }

    #[test]
    fn test_enqueue_message_write_failure_rolls_back_item() {
        let (stores, queue) = broken_queue(b"msg_");

        let result = queue.enqueue_at(&message("m1"), T0);
        assert!(matches!(result, Err(DeliveryError::Store(_))));
        assert!(stores.queue.get("m1").unwrap().is_none());
        assert_eq!(queue.status_at(T0).unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_retry_all_during_send_is_kept() {
        let h = harness(true).await;
        h.transport.fail_sends("radio busy");
        h.queue.enqueue_at(&message("m1"), T0).unwrap();
        h.stores
            .queue
            .update("m1", |q| {
                q.retry_count = 3;
                q.last_error = Some("radio busy".into());
            })
            .unwrap();
        h.transport.hold_sends();

        // The reset lands while the pass is parked inside send
        let (outcome, reset) = tokio::join!(h.queue.process_queue_at(T0), async {
            while h.transport.send_attempts() == 0 {
                tokio::task::yield_now().await;
            }
            let reset = h.queue.retry_all_at(T0 + 10).unwrap();
            h.transport.release_sends();
            reset
        });

        assert_eq!(reset, 1);
        let pass = report(outcome.unwrap());
        assert!(pass.rescheduled.is_empty());
        assert_eq!(pass.next_due, Some(T0 + 10));

        let item = &h.queue.items().unwrap()[0];
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.next_retry_time, T0 + 10);
        assert!(item.last_error.is_none());
    }

    #[tokio::test]
    async fn test_clear_all_during_send_is_not_undone() {
        let h = harness(true).await;
        h.transport.fail_sends("radio busy");
        h.queue.enqueue_at(&message("m1"), T0).unwrap();
        h.transport.hold_sends();

        let (outcome, cleared) = tokio::join!(h.queue.process_queue_at(T0), async {
            while h.transport.send_attempts() == 0 {
                tokio::task::yield_now().await;
            }
            let cleared = h.queue.clear_all().unwrap();
            h.transport.release_sends();
            cleared
        });

        assert_eq!(cleared, 1);
        assert!(report(outcome.unwrap()).rescheduled.is_empty());
        assert!(h.queue.items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_transport_pass_is_noop() {
        let stores = Stores::in_memory();
        let transport = Arc::new(MemoryTransport::unavailable());
        let queue = DeliveryQueue::new(
            DeliveryConfig::default(),
            stores.messages.clone(),
            stores.queue.clone(),
            transport.clone(),
            Arc::new(PacketCodec::new()),
        )
        .unwrap();
        queue.enqueue_at(&message("m1"), T0).unwrap();

        assert_eq!(
            queue.process_queue_at(T0).await.unwrap(),
            PassOutcome::Disconnected
        );
        assert_eq!(transport.send_attempts(), 0);
        assert_eq!(queue.items().unwrap()[0].retry_count, 0);
    }
}
