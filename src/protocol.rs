//! Control-point wire codec for the Secure DFU protocol.
//!
//! Frame layout as defined in
//! nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::error::DfuError;

/// DFU Service (16 bit UUID 0xFE59)
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);
/// Control Point characteristic: commands out, responses in via notification.
pub const DFU_CTRL_POINT_UUID: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
/// Packet characteristic: bulk object bytes, write-without-response.
pub const DFU_PACKET_UUID: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);

/// Maximum payload of a single write to the packet characteristic.
pub const GATT_PKT_SIZE: usize = 20;

/// Packet Receipt Notification interval used while streaming an object.
pub const DEFAULT_PRN: u16 = 10;

/// DFU object variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    Command = 0x01,
    Data = 0x02,
}

/// Control-point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    ObjectCreate = 0x01,
    ReceiptNotifSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    Abort = 0x0C,
    Response = 0x60,
}

/// Result codes carried in byte 2 of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtendedError = 0x0B,
}

/// Sub-codes following an `EXTENDED_ERROR` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ExtendedError {
    NoError = 0x00,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
}

pub fn crc32(buf: &[u8], init: u32) -> u32 {
    let mut h = crc32fast::Hasher::new_with_initial(init);
    h.update(buf);
    h.finalize()
}

/// Control-point requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Allocate an object slot of the given size.
    Create(ObjectType, u32),
    /// Configure the Packet Receipt Notification cadence.
    SetPrn(u16),
    /// Ask for the current offset and running CRC.
    GetCrc,
    /// Commit the current object.
    Execute,
    /// Report max_size/offset/crc for the given object type.
    Select(ObjectType),
    /// Reset target-side DFU state. The only request written without ack.
    Abort,
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Create(..) => OpCode::ObjectCreate,
            Request::SetPrn(_) => OpCode::ReceiptNotifSet,
            Request::GetCrc => OpCode::CrcGet,
            Request::Execute => OpCode::ObjectExecute,
            Request::Select(_) => OpCode::ObjectSelect,
            Request::Abort => OpCode::Abort,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.opcode().into()];
        match self {
            Request::Create(obj_type, size) => {
                bytes.push((*obj_type).into());
                bytes.extend_from_slice(&size.to_le_bytes());
            }
            Request::SetPrn(value) => bytes.extend_from_slice(&value.to_le_bytes()),
            Request::Select(obj_type) => bytes.push((*obj_type).into()),
            Request::GetCrc | Request::Execute | Request::Abort => {}
        }
        bytes
    }
}

/// Payload of a successful response, dependent on the request opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseData {
    Empty,
    Crc { offset: u32, crc: u32 },
    Select { max_size: u32, offset: u32, crc: u32 },
}

/// A decoded control-point response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub request: OpCode,
    pub result: ResultCode,
    pub ext: Option<ExtendedError>,
    pub data: ResponseData,
}

impl Response {
    pub fn parse(bytes: &[u8]) -> Result<Self, DfuError> {
        if bytes.len() < 3 || bytes[0] != u8::from(OpCode::Response) {
            return Err(DfuError::UnsupportedResponse);
        }
        let request = OpCode::try_from(bytes[1]).map_err(|_| DfuError::UnsupportedResponse)?;
        let result = ResultCode::try_from(bytes[2]).map_err(|_| DfuError::UnsupportedResponse)?;

        if result == ResultCode::ExtendedError {
            let code = bytes.get(3).ok_or(DfuError::UnsupportedResponse)?;
            let ext = ExtendedError::try_from(*code).map_err(|_| DfuError::UnsupportedResponse)?;
            return Ok(Response {
                request,
                result,
                ext: Some(ext),
                data: ResponseData::Empty,
            });
        }

        let data = match (result, request) {
            (ResultCode::Success, OpCode::ObjectSelect) => {
                if bytes.len() < 15 {
                    return Err(DfuError::UnsupportedResponse);
                }
                ResponseData::Select {
                    max_size: u32::from_le_bytes(bytes[3..7].try_into().unwrap()),
                    offset: u32::from_le_bytes(bytes[7..11].try_into().unwrap()),
                    crc: u32::from_le_bytes(bytes[11..15].try_into().unwrap()),
                }
            }
            (ResultCode::Success, OpCode::CrcGet) => {
                if bytes.len() < 11 {
                    return Err(DfuError::UnsupportedResponse);
                }
                ResponseData::Crc {
                    offset: u32::from_le_bytes(bytes[3..7].try_into().unwrap()),
                    crc: u32::from_le_bytes(bytes[7..11].try_into().unwrap()),
                }
            }
            _ => ResponseData::Empty,
        };

        Ok(Response {
            request,
            result,
            ext: None,
            data,
        })
    }

    /// Re-encode the semantic fields back into wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![
            OpCode::Response.into(),
            self.request.into(),
            self.result.into(),
        ];
        if let Some(ext) = self.ext {
            bytes.push(ext.into());
            return bytes;
        }
        match self.data {
            ResponseData::Empty => {}
            ResponseData::Crc { offset, crc } => {
                bytes.extend_from_slice(&offset.to_le_bytes());
                bytes.extend_from_slice(&crc.to_le_bytes());
            }
            ResponseData::Select {
                max_size,
                offset,
                crc,
            } => {
                bytes.extend_from_slice(&max_size.to_le_bytes());
                bytes.extend_from_slice(&offset.to_le_bytes());
                bytes.extend_from_slice(&crc.to_le_bytes());
            }
        }
        bytes
    }

    pub fn ok(&self) -> bool {
        self.result == ResultCode::Success
    }

    /// Turn a non-SUCCESS response into its `DfuError`.
    pub fn check(self) -> Result<Self, DfuError> {
        match self.result {
            ResultCode::Success => Ok(self),
            ResultCode::ExtendedError => Err(self
                .ext
                .map(DfuError::from_extended)
                .unwrap_or(DfuError::RemoteExtendedError)),
            other => {
                Err(DfuError::from_result_code(other).unwrap_or(DfuError::UnsupportedResponse))
            }
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RESPONSE: {:?} - {:?}", self.request, self.result)?;
        if let Some(ext) = self.ext {
            return write!(f, ":{ext:?}");
        }
        match self.data {
            ResponseData::Empty => Ok(()),
            ResponseData::Crc { offset, crc } => {
                write!(f, ": [ offset={offset:#x}; crc={crc:#010x} ]")
            }
            ResponseData::Select {
                max_size,
                offset,
                crc,
            } => write!(
                f,
                ": [ max_size={max_size:#x}; offset={offset:#x}; crc={crc:#010x} ]"
            ),
        }
    }
}

/// A Packet Receipt Notification.
///
/// Wire-identical to a successful CRC_GET response; the target emits it
/// asynchronously every PRN packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketReceipt {
    pub offset: u32,
    pub crc: u32,
}

impl PacketReceipt {
    pub fn parse(bytes: &[u8]) -> Result<Self, DfuError> {
        let res = Response::parse(bytes)?;
        if res.request != OpCode::CrcGet {
            return Err(DfuError::UnsupportedResponse);
        }
        match res.check()?.data {
            ResponseData::Crc { offset, crc } => Ok(PacketReceipt { offset, crc }),
            _ => Err(DfuError::UnsupportedResponse),
        }
    }
}

impl fmt::Display for PacketReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PRN: [ offset={:#x}; crc={:#010x} ]",
            self.offset, self.crc
        )
    }
}
