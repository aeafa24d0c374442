//! End-to-end state machine tests against an in-process fake bootloader.
//!
//! The fake implements `GattClient`/`GattSession` over shared state and
//! mimics the target-side request handler: objects are selected, created,
//! streamed, CRC-checked and executed, with packet receipts emitted on the
//! configured PRN cadence.

use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use nrfdfu_secure::context::DfuContext;
use nrfdfu_secure::error::DfuError;
use nrfdfu_secure::manager::DfuManager;
use nrfdfu_secure::package::{FwType, Package};
use nrfdfu_secure::protocol::{crc32, OpCode, DFU_CTRL_POINT_UUID};
use nrfdfu_secure::transport::{GattClient, GattSession, Notification};

// ---------------------------------------------------------------------------
// test package construction

fn pb_varint(out: &mut Vec<u8>, v: u64) {
    leb128::write::unsigned(out, v).unwrap();
}

fn pb_field_varint(out: &mut Vec<u8>, field: u64, v: u64) {
    pb_varint(out, field << 3);
    pb_varint(out, v);
}

fn pb_field_bytes(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    pb_varint(out, (field << 3) | 2);
    pb_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// A `dfu.Packet` blob of exactly `total` bytes; `seed` varies the content
/// so different images get different init packets.
fn dat_of_len(total: usize, seed: u8) -> Vec<u8> {
    let mut hash = Vec::new();
    pb_field_varint(&mut hash, 1, 3); // SHA256
    pb_field_bytes(&mut hash, 2, &[seed; 32]);

    let mut init = Vec::new();
    pb_field_varint(&mut init, 1, 1); // fw_version
    pb_field_varint(&mut init, 2, 52); // hw_version
    pb_field_varint(&mut init, 7, 0x1000); // app_size
    pb_field_bytes(&mut init, 8, &hash);

    let mut cmd = Vec::new();
    pb_field_varint(&mut cmd, 1, 1); // op_code = INIT
    pb_field_bytes(&mut cmd, 2, &init);

    let mut pkt = Vec::new();
    pb_field_bytes(&mut pkt, 1, &cmd);

    // pad with an unknown field up to the requested size
    assert!(pkt.len() + 2 < total, "padding underflow");
    let pad = total - pkt.len() - 2;
    assert!(pad < 128);
    pb_field_bytes(&mut pkt, 15, &vec![seed ^ 0xFF; pad]);
    assert_eq!(pkt.len(), total);
    pkt
}

fn build_package(entries: &[(&str, &[u8], &[u8])]) -> Package {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default();

    let mut manifest = String::from("{\"manifest\":{");
    for (i, (name, _, _)) in entries.iter().enumerate() {
        if i > 0 {
            manifest.push(',');
        }
        manifest.push_str(&format!(
            "\"{name}\":{{\"bin_file\":\"{name}.bin\",\"dat_file\":\"{name}.dat\"}}"
        ));
    }
    manifest.push_str("}}");

    zip.start_file("manifest.json", opts).unwrap();
    zip.write_all(manifest.as_bytes()).unwrap();
    for (name, bin, dat) in entries {
        zip.start_file(format!("{name}.bin"), opts).unwrap();
        zip.write_all(bin).unwrap();
        zip.start_file(format!("{name}.dat"), opts).unwrap();
        zip.write_all(dat).unwrap();
    }
    let mut cursor = zip.finish().unwrap();
    cursor.set_position(0);
    Package::from_reader(cursor).unwrap()
}

fn application_package(img: &[u8]) -> Package {
    let dat = dat_of_len(140, 0x11);
    build_package(&[("application", img, &dat)])
}

// ---------------------------------------------------------------------------
// fake bootloader

const OBJ_COMMAND: u8 = 1;

#[derive(Default)]
struct ObjectStream {
    bytes: Vec<u8>,
    executed: usize,
    created: u32,
}

#[derive(Default)]
struct TargetState {
    command: ObjectStream,
    data: ObjectStream,
    current: u8,
    prn: u16,
    pkt_counter: u16,
    max_size: u32,
    notify: Option<mpsc::Sender<Notification>>,

    // fault injection
    corrupt_crc_get: u32,
    scan_misses: u32,
    truncate_first_packet: bool,

    // observation
    scans: u32,
    connects: u32,
    disconnects: u32,
    aborts: u32,
    control_log: Vec<Vec<u8>>,
    receipt_offsets: Vec<u32>,
}

impl TargetState {
    fn stream(&mut self, ty: u8) -> &mut ObjectStream {
        if ty == OBJ_COMMAND {
            &mut self.command
        } else {
            &mut self.data
        }
    }
}

#[derive(Clone)]
struct FakeClient {
    state: Arc<Mutex<TargetState>>,
}

impl FakeClient {
    fn new(max_size: u32) -> FakeClient {
        let state = TargetState {
            max_size,
            ..TargetState::default()
        };
        FakeClient {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut TargetState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Control-point opcodes written so far.
    fn opcodes(&self) -> Vec<u8> {
        self.with(|st| st.control_log.iter().map(|req| req[0]).collect())
    }
}

struct FakeSession {
    state: Arc<Mutex<TargetState>>,
}

fn notification(data: Vec<u8>) -> Notification {
    Notification {
        sender: DFU_CTRL_POINT_UUID,
        received: SystemTime::now(),
        data,
    }
}

fn crc_frame(request: u8, offset: u32, crc: u32) -> Vec<u8> {
    let mut frame = vec![0x60, request, 0x01];
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

impl GattClient for FakeClient {
    type Target = ();
    type Session = FakeSession;

    async fn find_by_name(&self, _name: &str) -> Result<Option<()>, DfuError> {
        self.with(|st| {
            st.scans += 1;
            if st.scan_misses > 0 {
                st.scan_misses -= 1;
                Ok(None)
            } else {
                Ok(Some(()))
            }
        })
    }

    async fn connect(&self, _target: &()) -> Result<FakeSession, DfuError> {
        self.with(|st| st.connects += 1);
        Ok(FakeSession {
            state: self.state.clone(),
        })
    }
}

impl GattSession for FakeSession {
    async fn write_control_point(&self, bytes: &[u8], _with_ack: bool) -> Result<(), DfuError> {
        let (reply, sender) = {
            let mut st = self.state.lock().unwrap();
            st.control_log.push(bytes.to_vec());
            let op = bytes[0];
            if matches!(op, 0x01 | 0x03 | 0x04 | 0x06) {
                assert_eq!(st.prn, 0, "request {op:#04x} sent while PRN is active");
            }
            let reply = match op {
                // RECEIPT_NOTIF_SET
                0x02 => {
                    st.prn = u16::from_le_bytes([bytes[1], bytes[2]]);
                    st.pkt_counter = 0;
                    Some(vec![0x60, 0x02, 0x01])
                }
                // OBJECT_SELECT
                0x06 => {
                    st.current = bytes[1];
                    let max_size = st.max_size;
                    let stream = st.stream(bytes[1]);
                    let mut frame = vec![0x60, 0x06, 0x01];
                    frame.extend_from_slice(&max_size.to_le_bytes());
                    frame.extend_from_slice(&(stream.bytes.len() as u32).to_le_bytes());
                    frame.extend_from_slice(&crc32(&stream.bytes, 0).to_le_bytes());
                    Some(frame)
                }
                // OBJECT_CREATE
                0x01 => {
                    let ty = bytes[1];
                    let size = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
                    st.current = ty;
                    let stream = st.stream(ty);
                    if ty == OBJ_COMMAND {
                        // a new init command replaces the old one entirely
                        stream.bytes.clear();
                        stream.executed = 0;
                    } else {
                        let executed = stream.executed;
                        stream.bytes.truncate(executed);
                    }
                    stream.created = size;
                    Some(vec![0x60, 0x01, 0x01])
                }
                // CRC_GET
                0x03 => {
                    let corrupt = st.corrupt_crc_get > 0;
                    if corrupt {
                        st.corrupt_crc_get -= 1;
                    }
                    let current = st.current;
                    let stream = st.stream(current);
                    let offset = stream.bytes.len() as u32;
                    let mut crc = crc32(&stream.bytes, 0);
                    if corrupt {
                        crc ^= 0xDEAD_BEEF;
                    }
                    Some(crc_frame(0x03, offset, crc))
                }
                // OBJECT_EXECUTE
                0x04 => {
                    let current = st.current;
                    let stream = st.stream(current);
                    stream.executed = stream.bytes.len();
                    if current == OBJ_COMMAND {
                        // executing a new init command resets data progress
                        st.data = ObjectStream::default();
                    }
                    Some(vec![0x60, 0x04, 0x01])
                }
                // ABORT, no response
                0x0C => {
                    st.aborts += 1;
                    st.command = ObjectStream::default();
                    st.data = ObjectStream::default();
                    st.prn = 0;
                    None
                }
                other => panic!("unexpected control opcode {other:#04x}"),
            };
            (reply, st.notify.clone())
        };
        if let (Some(frame), Some(tx)) = (reply, sender) {
            let _ = tx.send(notification(frame)).await;
        }
        Ok(())
    }

    async fn write_packet(&self, bytes: &[u8]) -> Result<(), DfuError> {
        let (receipt, sender) = {
            let mut st = self.state.lock().unwrap();
            assert!(bytes.len() <= 20, "bulk packet exceeds 20 bytes");
            let mut payload = bytes;
            if st.truncate_first_packet {
                st.truncate_first_packet = false;
                payload = &bytes[..bytes.len() / 2];
            }
            let current = st.current;
            let prn = st.prn;
            let stream = st.stream(current);
            stream.bytes.extend_from_slice(payload);
            assert!(
                stream.bytes.len() - stream.executed <= stream.created as usize,
                "write past the created object"
            );
            st.pkt_counter += 1;
            let receipt = if prn > 0 && st.pkt_counter >= prn {
                st.pkt_counter = 0;
                let stream = st.stream(current);
                let offset = stream.bytes.len() as u32;
                let crc = crc32(&stream.bytes, 0);
                st.receipt_offsets.push(offset);
                Some(crc_frame(0x03, offset, crc))
            } else {
                None
            };
            (receipt, st.notify.clone())
        };
        if let (Some(frame), Some(tx)) = (receipt, sender) {
            let _ = tx.send(notification(frame)).await;
        }
        Ok(())
    }

    async fn subscribe_control_point(
        &self,
        queue: mpsc::Sender<Notification>,
    ) -> Result<(), DfuError> {
        self.state.lock().unwrap().notify = Some(queue);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn disconnect(&self) -> Result<(), DfuError> {
        self.state.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// scenarios

/// Fresh transfer: init 140 bytes, image 520 bytes, max_size 256.
#[tokio::test]
async fn fresh_transfer_full_update() {
    let img = vec![0xA5u8; 520];
    let package = application_package(&img);
    let init_data = package
        .image(FwType::Application)
        .unwrap()
        .init_data
        .clone();
    let client = FakeClient::new(256);

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    manager.run().await.unwrap();

    client.with(|st| {
        assert_eq!(st.command.bytes, init_data);
        assert_eq!(st.data.bytes, img);
        assert_eq!(st.data.executed, img.len());
        assert_eq!(st.scans, 1);
        assert_eq!(st.connects, 1);
        assert_eq!(st.disconnects, 1);
        assert_eq!(st.aborts, 0);
    });

    // COMMAND phase: PRN cleared, select, create, PRN 10 then lowered to 7
    // (140 bytes = 7 packets), final PRN clear, CRC check, execute.
    let opcodes = client.opcodes();
    assert_eq!(
        &opcodes[..8],
        &[0x02, 0x06, 0x01, 0x02, 0x02, 0x02, 0x03, 0x04]
    );
    // `clear_prn` must not touch the transport when PRN is already 0:
    // between select-response and create there is no extra SetPrn frame.
    let create = client.with(|st| st.control_log[2].clone());
    assert_eq!(create, [0x01, 0x01, 140, 0, 0, 0]);
}

/// Multi-object DATA phase: 520 bytes at max_size 256 gives three objects
/// (256 + 256 + 8) and receipts on every PRN boundary.
#[tokio::test]
async fn multi_object_data_phase() {
    let img = vec![0x3Cu8; 520];
    let package = application_package(&img);
    let client = FakeClient::new(256);

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    manager.run().await.unwrap();

    let creates: Vec<(u8, u32)> = client.with(|st| {
        st.control_log
            .iter()
            .filter(|req| req[0] == 0x01 && req[1] == 0x02)
            .map(|req| (req[1], u32::from_le_bytes(req[2..6].try_into().unwrap())))
            .collect()
    });
    assert_eq!(creates, [(2, 256), (2, 256), (2, 8)]);

    // One receipt at 140 for the init packet (PRN lowered to 7), then the
    // image: 10-packet groups at 200/456, object tails at 256/512/520.
    let receipts = client.with(|st| st.receipt_offsets.clone());
    assert_eq!(receipts, [140, 200, 256, 456, 512, 520]);
}

/// Resume: 80 of 140 init bytes already on the target.
#[tokio::test]
async fn resume_partial_command_object() {
    let img = vec![0x42u8; 100];
    let package = application_package(&img);
    let init_data = package
        .image(FwType::Application)
        .unwrap()
        .init_data
        .clone();
    let client = FakeClient::new(256);
    client.with(|st| {
        st.command.bytes = init_data[..80].to_vec();
        st.command.created = 140;
    });

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    manager.run().await.unwrap();

    client.with(|st| {
        assert_eq!(st.command.bytes, init_data);
        assert_eq!(st.data.bytes, img);
    });
    // no OBJECT_CREATE for the command object before the first execute
    let opcodes = client.opcodes();
    let first_execute = opcodes.iter().position(|&op| op == 0x04).unwrap();
    assert!(!opcodes[..first_execute].contains(&0x01));
}

/// Already sent: select reports the full init packet present and matching.
#[tokio::test]
async fn already_sent_command_skips_to_execute() {
    let img = vec![0x42u8; 100];
    let package = application_package(&img);
    let init_data = package
        .image(FwType::Application)
        .unwrap()
        .init_data
        .clone();
    let client = FakeClient::new(256);
    client.with(|st| {
        st.command.bytes = init_data.clone();
        st.command.executed = init_data.len();
    });

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    manager.run().await.unwrap();

    // command phase: PRN clear + select + execute, nothing else
    let opcodes = client.opcodes();
    assert_eq!(&opcodes[..3], &[0x02, 0x06, 0x04]);
    client.with(|st| assert_eq!(st.command.bytes, init_data));
}

/// One corrupted CRC_GET: the object is re-created and re-sent, then the
/// update completes.
#[tokio::test]
async fn crc_mismatch_retries_object() {
    let img = vec![0x99u8; 100];
    let package = application_package(&img);
    let init_data = package
        .image(FwType::Application)
        .unwrap()
        .init_data
        .clone();
    let client = FakeClient::new(256);
    client.with(|st| st.corrupt_crc_get = 1);

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    manager.run().await.unwrap();

    // exactly two CREATE(command) frames, and the re-sent bytes are clean
    let command_creates = client.with(|st| {
        st.control_log
            .iter()
            .filter(|req| req[0] == 0x01 && req[1] == OBJ_COMMAND)
            .count()
    });
    assert_eq!(command_creates, 2);
    client.with(|st| {
        assert_eq!(st.command.bytes, init_data);
        assert_eq!(st.data.executed, img.len());
    });
}

/// Three consecutive CRC mismatches terminate the run with code 309 and a
/// single teardown.
#[tokio::test]
async fn crc_mismatch_exhausts_attempts() {
    let img = vec![0x99u8; 100];
    let package = application_package(&img);
    let client = FakeClient::new(256);
    client.with(|st| st.corrupt_crc_get = u32::MAX);

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    let err = manager.run().await.unwrap_err();
    assert_eq!(err, DfuError::CrcError);
    assert_eq!(err.code(), 309);

    client.with(|st| {
        assert_eq!(st.disconnects, 1);
        assert_eq!(st.aborts, 1);
    });
}

/// A short write is detected at the next packet receipt.
#[tokio::test]
async fn lost_bytes_detected() {
    let img = vec![0x77u8; 520];
    let package = application_package(&img);
    let client = FakeClient::new(256);
    client.with(|st| st.truncate_first_packet = true);

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    let err = manager.run().await.unwrap_err();
    assert_eq!(err, DfuError::BytesLost);
    assert_eq!(err.code(), 308);
    client.with(|st| assert_eq!(st.disconnects, 1));
}

/// Ten scans without a match raise FAILED_TO_CONNECT.
#[tokio::test]
async fn scan_failure_exhausts_attempts() {
    let img = vec![0x10u8; 40];
    let package = application_package(&img);
    let client = FakeClient::new(256);
    client.with(|st| st.scan_misses = u32::MAX);

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    let err = manager.run().await.unwrap_err();
    assert_eq!(err, DfuError::FailedToConnect);
    assert_eq!(err.code(), 201);
    client.with(|st| {
        assert_eq!(st.scans, 10);
        assert_eq!(st.connects, 0);
    });
}

/// A combined bootloader + softdevice package reconnects between images and
/// sends them in fixed order.
#[tokio::test]
async fn combined_update_reconnects_between_images() {
    let bl = vec![0xB0u8; 300];
    let sd = vec![0x5Du8; 700];
    let bl_dat = dat_of_len(140, 0x21);
    let sd_dat = dat_of_len(140, 0x22);
    let package = build_package(&[("softdevice", &sd, &sd_dat), ("bootloader", &bl, &bl_dat)]);
    assert_eq!(
        package.send_queue(),
        [FwType::Bootloader, FwType::Softdevice]
    );
    let client = FakeClient::new(256);

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    manager.run().await.unwrap();

    client.with(|st| {
        assert_eq!(st.connects, 2);
        assert_eq!(st.scans, 2);
        assert_eq!(st.disconnects, 1);
        // the last image through the pipe was the softdevice
        assert_eq!(st.command.bytes, sd_dat);
        assert_eq!(st.data.bytes, sd);
        assert_eq!(st.data.executed, sd.len());
    });
}

/// The non-blocking queue accessors report `None` on an empty queue and
/// drain one notification per call.
#[tokio::test]
async fn nowait_queue_accessors() {
    let package = application_package(&[0u8; 40]);
    let mut cx: DfuContext<FakeClient> = DfuContext::new("DfuTarg".into(), package);
    let (tx, rx) = mpsc::channel(4);
    cx.responses = Some(rx);

    assert_eq!(cx.get_response_nowait().unwrap(), None);
    tx.send(notification(vec![0x60, 0x04, 0x01])).await.unwrap();
    let res = cx.get_response_nowait().unwrap().unwrap();
    assert_eq!(res.request, OpCode::ObjectExecute);

    tx.send(notification(crc_frame(0x03, 40, 7))).await.unwrap();
    let receipt = cx.get_prn_nowait().unwrap().unwrap();
    assert_eq!(receipt.offset, 40);
    assert_eq!(receipt.crc, 7);
    assert_eq!(cx.get_prn_nowait().unwrap(), None);
}

/// An image that is an exact multiple of 20 bytes sends no short tail
/// packet and still completes.
#[tokio::test]
async fn exact_packet_multiple_image() {
    let img = vec![0xEEu8; 200];
    let package = application_package(&img);
    let client = FakeClient::new(256);

    let mut manager = DfuManager::new(client.clone(), "DfuTarg", package);
    manager.run().await.unwrap();

    client.with(|st| {
        assert_eq!(st.data.bytes, img);
        // 10 packets, exactly one receipt for the image at its full length
        assert_eq!(st.receipt_offsets.last(), Some(&200));
    });
}
