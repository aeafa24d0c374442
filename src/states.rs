//! The Secure DFU transfer state machine.
//!
//! Every state has three hooks: `entry` fires once after a transition,
//! `handle` is invoked repeatedly while the state is current, and `exit`
//! runs before the next state's `entry`. Dispatch is an exhaustive `match`
//! over [`TxState`], so a new state cannot be added without handlers.

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::context::DfuContext;
use crate::error::DfuError;
use crate::protocol::{crc32, ObjectType, OpCode, ResponseData, DEFAULT_PRN, GATT_PKT_SIZE};
use crate::transport::{GattClient, GattSession, RESPONSE_QUEUE_DEPTH};

/// Scan attempts before the target is declared unreachable.
pub const MAX_SEARCH_ATTEMPTS: u32 = 10;

/// Transfer attempts per object before giving up with a CRC error.
const MAX_OBJECT_ATTEMPTS: u32 = 3;

/// Handler result, deciding what the driver loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Init,
    Ignored,
    Handled,
    Transitioned,
    Complete,
    Error,
}

/// States of a Secure DFU session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Disconnected,
    Connecting,
    TransferReady,
    PreparingDataObject,
    SelectObject,
    CreateObject,
    TransferringObject,
    ValidateObject,
    ExecuteObject,
    TransferDone,
}

impl TxState {
    pub async fn entry<C: GattClient>(
        self,
        cx: &mut DfuContext<C>,
        client: &C,
    ) -> Result<Status, DfuError> {
        log::info!("entering state: {self:?}");
        match self {
            TxState::Disconnected => disconnected_entry(cx).await,
            TxState::Connecting => connecting_entry(cx, client).await,
            TxState::TransferReady => Ok(Status::Handled),
            TxState::PreparingDataObject => Ok(Status::Handled),
            TxState::SelectObject => select_object_entry(cx).await,
            TxState::CreateObject => create_object_entry(cx).await,
            TxState::TransferringObject => transferring_object_entry(cx).await,
            TxState::ValidateObject => validate_object_entry(cx).await,
            TxState::ExecuteObject => execute_object_entry(cx).await,
            TxState::TransferDone => transfer_done_entry(cx).await,
        }
    }

    pub async fn handle<C: GattClient>(
        self,
        cx: &mut DfuContext<C>,
        client: &C,
    ) -> Result<Status, DfuError> {
        match self {
            TxState::Disconnected => disconnected_handle(cx, client).await,
            TxState::Connecting => connecting_handle(cx).await,
            TxState::TransferReady => transfer_ready_handle(cx).await,
            TxState::PreparingDataObject => preparing_data_object_handle(cx).await,
            TxState::SelectObject => select_object_handle(cx).await,
            TxState::CreateObject => create_object_handle(cx).await,
            TxState::TransferringObject => transferring_object_handle(cx).await,
            TxState::ValidateObject => validate_object_handle(cx).await,
            TxState::ExecuteObject => execute_object_handle(cx).await,
            TxState::TransferDone => Err(DfuError::InvalidInternalState),
        }
    }

    // Exit hooks stay synchronous; they must not touch the response queue.
    pub fn exit<C: GattClient>(self, cx: &mut DfuContext<C>) -> Status {
        match self {
            TxState::TransferringObject => {
                cx.attempts += 1;
                Status::Handled
            }
            TxState::Disconnected
            | TxState::Connecting
            | TxState::TransferReady
            | TxState::PreparingDataObject
            | TxState::SelectObject
            | TxState::CreateObject
            | TxState::ValidateObject
            | TxState::ExecuteObject
            | TxState::TransferDone => Status::Ignored,
        }
    }
}

async fn disconnected_entry<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    cx.search_attempts = 0;
    Ok(Status::Handled)
}

async fn disconnected_handle<C: GattClient>(
    cx: &mut DfuContext<C>,
    client: &C,
) -> Result<Status, DfuError> {
    if cx.image_queue.is_empty() {
        log::info!("all images sent!");
        return Ok(cx.transition(TxState::TransferDone));
    }

    cx.search_attempts += 1;
    log::info!(
        "searching for target (attempt {}): {}",
        cx.search_attempts,
        cx.target_name
    );
    match client.find_by_name(&cx.target_name).await? {
        Some(target) => {
            log::info!("{} found!", cx.target_name);
            cx.target = Some(target);
            Ok(cx.transition(TxState::Connecting))
        }
        None if cx.search_attempts < MAX_SEARCH_ATTEMPTS => Ok(Status::Handled),
        None => Err(DfuError::FailedToConnect),
    }
}

async fn connecting_entry<C: GattClient>(
    cx: &mut DfuContext<C>,
    client: &C,
) -> Result<Status, DfuError> {
    let target = cx.target.as_ref().ok_or(DfuError::InvalidInternalState)?;
    match client.connect(target).await {
        Ok(session) => cx.session = Some(session),
        Err(err) => {
            log::warn!("connection attempt failed: {err}");
            cx.session = None;
        }
    }
    Ok(Status::Handled)
}

async fn connecting_handle<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    let connected = match &cx.session {
        Some(session) => session.is_connected().await,
        None => false,
    };
    if !connected {
        return Ok(cx.transition(TxState::Disconnected));
    }

    log::info!(
        "connected to target {}! beginning notifications...",
        cx.target_name
    );
    let (queue_tx, queue_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
    cx.session()?.subscribe_control_point(queue_tx).await?;
    cx.responses = Some(queue_rx);
    Ok(cx.transition(TxState::TransferReady))
}

async fn transfer_ready_handle<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    let fw_type = *cx
        .image_queue
        .front()
        .ok_or(DfuError::InvalidInternalState)?;
    let init_data = cx
        .package
        .image(fw_type)
        .ok_or(DfuError::InvalidInternalState)?
        .init_data
        .clone();

    log::info!("preparing to send {fw_type} image...");
    cx.image = Some(fw_type);
    cx.phase = ObjectType::Command;
    cx.txdata = init_data;
    reset_phase_counters(cx);
    Ok(cx.transition(TxState::SelectObject))
}

async fn preparing_data_object_handle<C: GattClient>(
    cx: &mut DfuContext<C>,
) -> Result<Status, DfuError> {
    let img_data = cx.image()?.img_data.clone();
    log::info!(
        "preparing to send {} ({} bytes) data objects...",
        cx.image()?.fw_type,
        img_data.len()
    );

    cx.phase = ObjectType::Data;
    cx.txdata = img_data;
    reset_phase_counters(cx);

    let bar = ProgressBar::new(cx.txdata.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} ({eta})").unwrap(),
    );
    cx.progress = Some(bar);
    Ok(cx.transition(TxState::SelectObject))
}

fn reset_phase_counters<C: GattClient>(cx: &mut DfuContext<C>) {
    cx.object.clear();
    cx.object_len = 0;
    cx.bytes_sent = 0;
    cx.local_crc = 0;
    cx.base_crc = 0;
    cx.base_sent = 0;
    cx.objects_sent = 0;
    cx.num_objects = 0;
    cx.attempts = 0;
}

async fn select_object_entry<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    cx.clear_prn(true).await?;
    log::info!("sending OBJECT_SELECT request...");
    cx.object_select(cx.phase).await?;
    Ok(Status::Handled)
}

async fn select_object_handle<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    let res = cx.get_response().await?.check()?;
    let ResponseData::Select {
        max_size,
        offset,
        crc,
    } = res.data
    else {
        return Err(DfuError::UnsupportedResponse);
    };
    if max_size == 0 {
        return Err(DfuError::UnsupportedResponse);
    }
    log::info!("OBJECT_SELECT response received!");

    cx.max_size = max_size;
    cx.offset = offset;
    cx.target_crc = crc;

    if cx.num_objects == 0 {
        let payload_len = match cx.phase {
            ObjectType::Command => cx.image()?.init_data.len() as u32,
            ObjectType::Data => cx.image()?.img_data.len() as u32,
        };
        cx.num_objects = payload_len.div_ceil(max_size);
    }

    let txlen = cx.txdata.len() as u32;
    if offset == txlen && crc == crc32(&cx.txdata, 0) {
        // Everything for this phase is already on the target.
        let window = max_size.min(txlen) as usize;
        cx.object = cx.txdata[..window].to_vec();
        cx.object_len = window as u32;
        cx.objects_sent = cx.num_objects;
        cx.bytes_sent = offset;
        cx.local_crc = crc;

        log::info!("object has already been sent. skipping to EXECUTE_OBJECT...");
        Ok(cx.transition(TxState::ExecuteObject))
    } else if offset > 0 && offset <= txlen && crc == crc32(&cx.txdata[..offset as usize], 0) {
        // The target holds a valid prefix; resume inside the current object.
        let win_start = (offset / max_size) * max_size;
        let win_end = (win_start + max_size).min(txlen);
        cx.object = cx.txdata[offset as usize..win_end as usize].to_vec();
        cx.object_len = win_end - win_start;
        cx.objects_sent = offset / max_size;
        cx.bytes_sent = offset;
        cx.local_crc = crc;
        cx.base_sent = win_start;
        cx.base_crc = crc32(&cx.txdata[..win_start as usize], 0);
        // Executed objects never need re-sending; keep txdata aligned with
        // the current object window.
        cx.txdata.drain(..win_start as usize);

        log::info!("object transfer incomplete. resuming transfer...");
        Ok(cx.transition(TxState::TransferringObject))
    } else {
        log::info!("object not yet sent. creating object...");
        Ok(cx.transition(TxState::CreateObject))
    }
}

async fn create_object_entry<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    cx.clear_prn(false).await?;

    let window = (cx.max_size as usize).min(cx.txdata.len());
    cx.object = cx.txdata[..window].to_vec();
    cx.object_len = window as u32;
    // A fresh object always streams from the committed base, also on retry.
    cx.local_crc = cx.base_crc;
    cx.bytes_sent = cx.base_sent;

    log::info!(
        "creating {:?} object {} ({:#x} bytes)...",
        cx.phase,
        cx.objects_sent + 1,
        cx.object_len
    );
    log::info!("sending OBJECT_CREATE request...");
    cx.object_create(cx.phase, cx.object_len).await?;
    Ok(Status::Handled)
}

async fn create_object_handle<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    cx.get_response().await?.check()?;
    log::info!("OBJECT_CREATE response received!");

    log::info!("beginning object transfer...");
    Ok(cx.transition(TxState::TransferringObject))
}

async fn transferring_object_entry<C: GattClient>(
    cx: &mut DfuContext<C>,
) -> Result<Status, DfuError> {
    log::info!("setting PRN = {DEFAULT_PRN}");
    cx.set_prn(DEFAULT_PRN).await?.check()?;

    cx.total_pkts = (cx.object.len() as u32).div_ceil(GATT_PKT_SIZE as u32);
    cx.pkts_sent = 0;
    cx.prn_base = 0;
    cx.pkt_cursor = 0;
    Ok(Status::Handled)
}

async fn transferring_object_handle<C: GattClient>(
    cx: &mut DfuContext<C>,
) -> Result<Status, DfuError> {
    if cx.pkts_sent >= cx.total_pkts {
        log::info!(
            "object {} / {} transferred. proceeding to validate object...",
            cx.objects_sent + 1,
            cx.num_objects
        );
        cx.objects_sent += 1;
        return Ok(cx.transition(TxState::ValidateObject));
    }

    let remaining_pkts = cx.total_pkts - cx.pkts_sent;
    if cx.pkts_sent % u32::from(DEFAULT_PRN) == 0 && remaining_pkts < u32::from(cx.prn) {
        // Fewer packets left than the PRN interval; lower it so the final
        // group still produces a receipt. The target restarts its packet
        // count on RECEIPT_NOTIF_SET, so the group base moves here.
        cx.set_prn(remaining_pkts as u16).await?.check()?;
        cx.prn_base = cx.pkts_sent;
    }

    let end = (cx.pkt_cursor + GATT_PKT_SIZE).min(cx.object.len());
    let pkt = cx.object[cx.pkt_cursor..end].to_vec();
    cx.local_crc = crc32(&pkt, cx.local_crc);

    log::debug!(
        "sending pkt ({} / {}): [{pkt:02x?}]",
        cx.pkts_sent + 1,
        cx.total_pkts
    );
    cx.session()?.write_packet(&pkt).await?;
    cx.pkt_cursor = end;
    cx.pkts_sent += 1;
    cx.bytes_sent += pkt.len() as u32;
    if let Some(bar) = &cx.progress {
        bar.set_position(u64::from(cx.bytes_sent));
    }

    if cx.prn == 0 || (cx.pkts_sent - cx.prn_base) % u32::from(cx.prn) != 0 {
        // No receipt expected yet, keep streaming.
        return Ok(Status::Handled);
    }

    let receipt = cx.get_prn().await?;
    cx.offset = receipt.offset;
    cx.target_crc = receipt.crc;

    if cx.offset != cx.bytes_sent {
        log::error!(
            "offset mismatch! expected: {:#x}, got: {:#x}",
            cx.bytes_sent,
            cx.offset
        );
        return Err(DfuError::BytesLost);
    }
    if cx.target_crc != cx.local_crc {
        log::error!(
            "crc mismatch! expected: {:#x}, got: {:#x}",
            cx.local_crc,
            cx.target_crc
        );
        return Ok(cx.transition(TxState::ValidateObject));
    }
    Ok(Status::Handled)
}

async fn validate_object_entry<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    cx.clear_prn(false).await?;
    log::info!("sending CRC_GET request...");
    cx.crc_get().await?;
    Ok(Status::Handled)
}

async fn validate_object_handle<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    let res = cx.get_response().await?;
    if res.request != OpCode::CrcGet {
        return Err(DfuError::UnsupportedResponse);
    }
    let res = res.check()?;
    let ResponseData::Crc { crc, .. } = res.data else {
        return Err(DfuError::UnsupportedResponse);
    };
    log::info!("CRC_GET response received!");
    cx.target_crc = crc;

    if cx.target_crc != cx.local_crc {
        if cx.attempts >= MAX_OBJECT_ATTEMPTS {
            return Err(DfuError::CrcError);
        }
        log::info!(
            "object CRC mismatch! trying again... (attempts: {})",
            cx.attempts
        );
        // Un-count the failed object if its transfer had completed.
        if cx.pkts_sent >= cx.total_pkts && cx.objects_sent > 0 {
            cx.objects_sent -= 1;
        }
        return Ok(cx.transition(TxState::CreateObject));
    }

    log::info!("object CRC matched, proceeding to execute object...");
    Ok(cx.transition(TxState::ExecuteObject))
}

async fn execute_object_entry<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    log::info!("sending OBJECT_EXECUTE request...");
    cx.object_execute().await?;
    Ok(Status::Handled)
}

async fn execute_object_handle<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    let res = cx.get_response().await?;
    if res.request != OpCode::ObjectExecute {
        return Err(DfuError::UnsupportedResponse);
    }
    res.check()?;
    log::info!("OBJECT_EXECUTE response received!");

    match cx.phase {
        ObjectType::Command => {
            // Init command committed, continue with the firmware image.
            log::info!("proceeding to transfer image data...");
            Ok(cx.transition(TxState::PreparingDataObject))
        }
        ObjectType::Data if cx.objects_sent < cx.num_objects => {
            let executed = (cx.object_len as usize).min(cx.txdata.len());
            cx.txdata.drain(..executed);
            cx.base_sent = cx.bytes_sent;
            cx.base_crc = cx.local_crc;

            log::info!("sending next data object...");
            Ok(cx.transition(TxState::CreateObject))
        }
        ObjectType::Data => {
            if let Some(bar) = cx.progress.take() {
                bar.finish();
            }
            cx.image_queue.pop_front();
            cx.image = None;
            // The bootloader resets the peripheral after the final execute;
            // the reconnect drives the next image or the final confirmation.
            log::info!("image transfer completed!");
            Ok(cx.transition(TxState::Disconnected))
        }
    }
}

async fn transfer_done_entry<C: GattClient>(cx: &mut DfuContext<C>) -> Result<Status, DfuError> {
    log::info!("transfer done! disconnecting...");
    if let Some(session) = cx.session.take() {
        session.disconnect().await?;
    }
    log::info!("update complete!");
    Ok(Status::Complete)
}
