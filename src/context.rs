//! Shared state of one update session.

use std::collections::VecDeque;

use indicatif::ProgressBar;
use tokio::sync::mpsc;

use crate::error::DfuError;
use crate::package::{FwType, Image, Package};
use crate::protocol::{ObjectType, PacketReceipt, Request, Response};
use crate::states::{Status, TxState};
use crate::transport::{GattClient, GattSession, Notification};

/// Mutable state of an update session, owned exclusively by the driver task.
pub struct DfuContext<C: GattClient> {
    pub state: TxState,
    pub prev_state: TxState,

    pub target_name: String,
    pub target: Option<C::Target>,
    pub session: Option<C::Session>,
    pub package: Package,
    /// Images left to send, head first.
    pub image_queue: VecDeque<FwType>,
    /// Image currently being transferred.
    pub image: Option<FwType>,

    /// Which procedure of the current image is active.
    pub phase: ObjectType,
    /// Bytes of the current phase not yet committed.
    pub txdata: Vec<u8>,
    /// Bytes of the current object still to be streamed.
    pub object: Vec<u8>,
    /// Full span of the current object within `txdata`.
    pub object_len: u32,

    /// Object capacity reported by the target during SELECT.
    pub max_size: u32,
    /// Offset last reported by the target.
    pub offset: u32,
    /// CRC last reported by the target.
    pub target_crc: u32,
    /// Running CRC-32 over all bytes streamed in the current phase.
    pub local_crc: u32,
    /// Bytes streamed in the current phase.
    pub bytes_sent: u32,
    /// `local_crc` at the start of the current object, for retries.
    pub base_crc: u32,
    /// `bytes_sent` at the start of the current object, for retries.
    pub base_sent: u32,

    pub objects_sent: u32,
    pub num_objects: u32,
    /// Per-object transfer attempts.
    pub attempts: u32,
    /// Currently configured Packet Receipt Notification interval.
    pub prn: u16,

    pub responses: Option<mpsc::Receiver<Notification>>,
    pub search_attempts: u32,

    // Transfer-scoped counters of the object being streamed.
    pub total_pkts: u32,
    pub pkts_sent: u32,
    /// `pkts_sent` when the PRN interval was last configured. The target
    /// counts packets from that point, so receipt waits must too.
    pub prn_base: u32,
    pub pkt_cursor: usize,

    pub progress: Option<ProgressBar>,
}

impl<C: GattClient> DfuContext<C> {
    pub fn new(target_name: String, package: Package) -> DfuContext<C> {
        let image_queue = package.send_queue().into();
        DfuContext {
            state: TxState::Disconnected,
            prev_state: TxState::Disconnected,
            target_name,
            target: None,
            session: None,
            package,
            image_queue,
            image: None,
            phase: ObjectType::Command,
            txdata: Vec::new(),
            object: Vec::new(),
            object_len: 0,
            max_size: 0,
            offset: 0,
            target_crc: 0,
            local_crc: 0,
            bytes_sent: 0,
            base_crc: 0,
            base_sent: 0,
            objects_sent: 0,
            num_objects: 0,
            attempts: 0,
            prn: 0,
            responses: None,
            search_attempts: 0,
            total_pkts: 0,
            pkts_sent: 0,
            prn_base: 0,
            pkt_cursor: 0,
            progress: None,
        }
    }

    pub fn transition(&mut self, next: TxState) -> Status {
        self.prev_state = self.state;
        self.state = next;
        Status::Transitioned
    }

    pub fn session(&self) -> Result<&C::Session, DfuError> {
        self.session.as_ref().ok_or(DfuError::InvalidInternalState)
    }

    pub fn image(&self) -> Result<&Image, DfuError> {
        self.image
            .and_then(|fw| self.package.image(fw))
            .ok_or(DfuError::InvalidInternalState)
    }

    /// Await the next control-point notification, parsed as a response.
    pub async fn get_response(&mut self) -> Result<Response, DfuError> {
        let queue = self
            .responses
            .as_mut()
            .ok_or(DfuError::InvalidInternalState)?;
        let notification = queue.recv().await.ok_or(DfuError::DeviceDisconnected)?;
        let response = Response::parse(&notification.data)?;
        log::info!("{} {response}", notification.sender);
        Ok(response)
    }

    /// Non-blocking variant of [`Self::get_response`]. `None` when the queue
    /// is empty.
    pub fn get_response_nowait(&mut self) -> Result<Option<Response>, DfuError> {
        let queue = self
            .responses
            .as_mut()
            .ok_or(DfuError::InvalidInternalState)?;
        match queue.try_recv() {
            Ok(notification) => {
                let response = Response::parse(&notification.data)?;
                log::info!("{} {response}", notification.sender);
                Ok(Some(response))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(DfuError::DeviceDisconnected),
        }
    }

    /// Await the next notification, parsed as a Packet Receipt Notification.
    pub async fn get_prn(&mut self) -> Result<PacketReceipt, DfuError> {
        let queue = self
            .responses
            .as_mut()
            .ok_or(DfuError::InvalidInternalState)?;
        let notification = queue.recv().await.ok_or(DfuError::DeviceDisconnected)?;
        let receipt = PacketReceipt::parse(&notification.data)?;
        log::debug!("{} {receipt}", notification.sender);
        Ok(receipt)
    }

    /// Non-blocking variant of [`Self::get_prn`].
    pub fn get_prn_nowait(&mut self) -> Result<Option<PacketReceipt>, DfuError> {
        let queue = self
            .responses
            .as_mut()
            .ok_or(DfuError::InvalidInternalState)?;
        match queue.try_recv() {
            Ok(notification) => {
                let receipt = PacketReceipt::parse(&notification.data)?;
                log::debug!("{} {receipt}", notification.sender);
                Ok(Some(receipt))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(DfuError::DeviceDisconnected),
        }
    }

    async fn write_request(&self, request: Request) -> Result<(), DfuError> {
        let bytes = request.to_bytes();
        log::debug!("REQUEST: {request:?} [{bytes:02x?}]");
        let with_ack = request != Request::Abort;
        self.session()?.write_control_point(&bytes, with_ack).await
    }

    fn ensure_prn_clear(&self) -> Result<(), DfuError> {
        if self.prn != 0 {
            return Err(DfuError::InvalidInternalState);
        }
        Ok(())
    }

    /// Set the PRN interval and consume the response. Handlers calling this
    /// must check the returned response immediately.
    pub async fn set_prn(&mut self, value: u16) -> Result<Response, DfuError> {
        self.prn = value;
        self.write_request(Request::SetPrn(value)).await?;
        self.get_response().await
    }

    /// Reset the PRN interval to 0. A no-op when already clear, unless
    /// `force` is set.
    pub async fn clear_prn(&mut self, force: bool) -> Result<(), DfuError> {
        if !force && self.prn == 0 {
            return Ok(());
        }
        self.set_prn(0).await?.check()?;
        Ok(())
    }

    /// Send OBJECT_SELECT. The response is consumed by the caller.
    pub async fn object_select(&self, object_type: ObjectType) -> Result<(), DfuError> {
        self.ensure_prn_clear()?;
        self.write_request(Request::Select(object_type)).await
    }

    /// Send OBJECT_CREATE. The response is consumed by the caller.
    pub async fn object_create(&self, object_type: ObjectType, size: u32) -> Result<(), DfuError> {
        self.ensure_prn_clear()?;
        self.write_request(Request::Create(object_type, size)).await
    }

    /// Send OBJECT_EXECUTE. The response is consumed by the caller.
    pub async fn object_execute(&self) -> Result<(), DfuError> {
        self.ensure_prn_clear()?;
        self.write_request(Request::Execute).await
    }

    /// Send CRC_GET. The response is consumed by the caller.
    pub async fn crc_get(&self) -> Result<(), DfuError> {
        self.write_request(Request::GetCrc).await
    }

    /// Send ABORT. Written without ack; the target resets its DFU state.
    pub async fn abort(&self) -> Result<(), DfuError> {
        self.write_request(Request::Abort).await
    }
}
