//! Abstract GATT boundary between the DFU core and the radio.
//!
//! The transport owns the radio resources; the core only holds opaque
//! target/session handles. Notifications are pushed into a bounded channel
//! that the driver task drains in FIFO order.

use std::time::SystemTime;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::DfuError;

/// Depth of the control-point notification queue. The protocol has at most
/// one request in flight plus a burst of PRNs, so a small buffer suffices.
pub const RESPONSE_QUEUE_DEPTH: usize = 16;

/// One control-point notification, timestamped at receipt.
#[derive(Debug, Clone)]
pub struct Notification {
    pub sender: Uuid,
    pub received: SystemTime,
    pub data: Vec<u8>,
}

/// Scanner/connector half of the transport.
pub trait GattClient {
    /// Opaque peripheral reference produced by scanning.
    type Target;
    type Session: GattSession;

    /// Scan for a peripheral advertising the given name. A scan that ends
    /// without a match reports `None`, not an error.
    async fn find_by_name(&self, name: &str) -> Result<Option<Self::Target>, DfuError>;

    async fn connect(&self, target: &Self::Target) -> Result<Self::Session, DfuError>;
}

/// One established connection to a DFU target.
pub trait GattSession {
    /// Write a control-point request. Commands require an ack; ABORT is
    /// written without one.
    async fn write_control_point(&self, bytes: &[u8], with_ack: bool) -> Result<(), DfuError>;

    /// Write bulk object bytes to the packet characteristic, no ack.
    async fn write_packet(&self, bytes: &[u8]) -> Result<(), DfuError>;

    /// Start forwarding control-point notifications into `queue`.
    async fn subscribe_control_point(
        &self,
        queue: mpsc::Sender<Notification>,
    ) -> Result<(), DfuError>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), DfuError>;
}
