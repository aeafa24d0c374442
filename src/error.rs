use thiserror::Error;

use crate::protocol::{ExtendedError, ResultCode};

// Code values follow Nordic's DFU libraries: remote result codes are offset
// by 10, extended error codes by 20, so the families never overlap.

/// Errors that can occur during a device firmware update.
///
/// Every variant carries a stable numeric code, split into remote families
/// (reported by the bootloader) and local codes (produced on the host).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DfuError {
    // Remote Secure DFU result codes (11-21).
    #[error("Requested Opcode is not supported")]
    RemoteOpcodeNotSupported,
    #[error("Invalid Parameter")]
    RemoteInvalidParameter,
    #[error("Secure DFU bootloader cannot complete due to insufficient resources")]
    RemoteInsufficientResources,
    #[error("Object is invalid")]
    RemoteInvalidObject,
    #[error("Requested type is not supported")]
    RemoteUnsupportedType,
    #[error("Requested operation is not permitted")]
    RemoteOperationNotPermitted,
    #[error("Operation failed for an unknown reason")]
    RemoteOperationFailed,
    #[error("Secure DFU bootloader reported a detailed error")]
    RemoteExtendedError,

    // Remote Secure DFU extended error codes (23-33).
    #[error("Command successfully parsed, but not supported or unknown")]
    RemoteUnknownCommand,
    #[error("Init command has invalid update type or missing required fields")]
    RemoteInitCommandInvalid,
    #[error("Firmware version is older than current version, cannot downgrade")]
    RemoteFwVersionFailure,
    #[error("Hardware version of device does not match required version for update")]
    RemoteHwVersionFailure,
    #[error("Current SoftDevice FWID does not support the update")]
    RemoteSdVersionFailure,
    #[error("Hash type specified by init packet is not supported by the DFU bootloader")]
    RemoteWrongHashType,
    #[error("Firmware image hash cannot be calculated")]
    RemoteHashFailed,
    #[error("Signature type is unknown or not supported by the DFU bootloader")]
    RemoteWrongSignatureType,
    #[error("Hash of received firmware image does not match hash in init packet")]
    RemoteVerificationFailed,
    #[error("Available space on device is insufficient to hold firmware")]
    RemoteInsufficientSpace,

    // Local errors (101-).
    #[error("Providing DFU firmware is required")]
    FileNotSpecified,
    #[error("Given firmware file is not supported")]
    FileInvalid,
    #[error("DFU bootloader requires extended Init Packet")]
    ExtendedInitPacketRequired,
    #[error("Init packet is required and has not been found")]
    InitPacketRequired,
    #[error("DFU service failed to connect to target peripheral")]
    FailedToConnect,
    #[error("DFU target disconnected unexpectedly")]
    DeviceDisconnected,
    #[error("Bluetooth adapter is disabled")]
    BluetoothDisabled,
    #[error("Service discovery has failed")]
    ServiceDiscoveryFailed,
    #[error("Selected device does not support legacy, secure, or buttonless DFU")]
    DeviceNotSupported,
    #[error("Reading DFU version characteristic has failed")]
    ReadingVersionFailed,
    #[error("Enabling control point notifications has failed")]
    EnablingControlPointFailed,
    #[error("Failed to write to characteristic")]
    WritingCharacteristicFailed,
    #[error("An error was reported for a notification")]
    ReceivingNotificationsFailed,
    #[error("Received response is not supported")]
    UnsupportedResponse,
    #[error("Number of bytes sent is not equal to number of bytes confirmed during upload")]
    BytesLost,
    #[error("CRC reported by remote device does not match after 3 attempts to send data")]
    CrcError,
    #[error("Service went into an invalid state")]
    InvalidInternalState,
}

impl DfuError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> u32 {
        use DfuError::*;
        match self {
            RemoteOpcodeNotSupported => 12,
            RemoteInvalidParameter => 13,
            RemoteInsufficientResources => 14,
            RemoteInvalidObject => 15,
            RemoteUnsupportedType => 17,
            RemoteOperationNotPermitted => 18,
            RemoteOperationFailed => 20,
            RemoteExtendedError => 21,

            RemoteUnknownCommand => 23,
            RemoteInitCommandInvalid => 24,
            RemoteFwVersionFailure => 25,
            RemoteHwVersionFailure => 26,
            RemoteSdVersionFailure => 27,
            RemoteWrongHashType => 29,
            RemoteHashFailed => 30,
            RemoteWrongSignatureType => 31,
            RemoteVerificationFailed => 32,
            RemoteInsufficientSpace => 33,

            FileNotSpecified => 101,
            FileInvalid => 102,
            ExtendedInitPacketRequired => 103,
            InitPacketRequired => 104,
            FailedToConnect => 201,
            DeviceDisconnected => 202,
            BluetoothDisabled => 203,
            ServiceDiscoveryFailed => 301,
            DeviceNotSupported => 302,
            ReadingVersionFailed => 303,
            EnablingControlPointFailed => 304,
            WritingCharacteristicFailed => 305,
            ReceivingNotificationsFailed => 306,
            UnsupportedResponse => 307,
            BytesLost => 308,
            CrcError => 309,
            InvalidInternalState => 500,
        }
    }

    /// True if the error was reported by the remote device rather than
    /// raised locally.
    pub fn is_remote(&self) -> bool {
        let code = self.code();
        code < 100 || code > 9000
    }

    /// The SUCCESS sentinels of the four remote code families (legacy,
    /// secure, buttonless, experimental buttonless) are not failures.
    pub fn code_is_success(code: u32) -> bool {
        matches!(code, 1 | 11 | 91 | 9001)
    }

    /// Map a non-SUCCESS wire result code to its error. Returns `None` for
    /// `SUCCESS`.
    pub fn from_result_code(code: ResultCode) -> Option<DfuError> {
        match code {
            ResultCode::Success => None,
            ResultCode::Invalid => Some(DfuError::UnsupportedResponse),
            ResultCode::OpCodeNotSupported => Some(DfuError::RemoteOpcodeNotSupported),
            ResultCode::InvalidParameter => Some(DfuError::RemoteInvalidParameter),
            ResultCode::InsufficientResources => Some(DfuError::RemoteInsufficientResources),
            ResultCode::InvalidObject => Some(DfuError::RemoteInvalidObject),
            ResultCode::UnsupportedType => Some(DfuError::RemoteUnsupportedType),
            ResultCode::OperationNotPermitted => Some(DfuError::RemoteOperationNotPermitted),
            ResultCode::OperationFailed => Some(DfuError::RemoteOperationFailed),
            ResultCode::ExtendedError => Some(DfuError::RemoteExtendedError),
        }
    }

    /// Map an extended error sub-code to its error.
    pub fn from_extended(code: ExtendedError) -> DfuError {
        match code {
            // NO_ERROR inside an EXTENDED_ERROR frame is malformed; surface
            // the generic extended error.
            ExtendedError::NoError => DfuError::RemoteExtendedError,
            ExtendedError::UnknownCommand => DfuError::RemoteUnknownCommand,
            ExtendedError::InitCommandInvalid => DfuError::RemoteInitCommandInvalid,
            ExtendedError::FwVersionFailure => DfuError::RemoteFwVersionFailure,
            ExtendedError::HwVersionFailure => DfuError::RemoteHwVersionFailure,
            ExtendedError::SdVersionFailure => DfuError::RemoteSdVersionFailure,
            ExtendedError::WrongHashType => DfuError::RemoteWrongHashType,
            ExtendedError::HashFailed => DfuError::RemoteHashFailed,
            ExtendedError::WrongSignatureType => DfuError::RemoteWrongSignatureType,
            ExtendedError::VerificationFailed => DfuError::RemoteVerificationFailed,
            ExtendedError::InsufficientSpace => DfuError::RemoteInsufficientSpace,
        }
    }
}
