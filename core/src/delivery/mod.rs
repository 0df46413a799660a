// Delivery module: persistent outbound queue with retry and backoff

pub mod config;
pub mod queue;

pub use config::{
    DeliveryConfig, FALLBACK_DELAY_MS, MAX_RETRY_ATTEMPTS, PROCESS_INTERVAL_MS, RETRY_DELAYS_MS,
};
pub use queue::{DeliveryQueue, FailedDelivery, PassOutcome, PassReport, QueueStatus};

use crate::protocol::ProtocolError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid delivery config: {0}")]
    InvalidConfig(String),
}
