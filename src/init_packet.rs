//! Init-packet (`.dat`) parsing.
//!
//! The init packet is a protobuf `dfu.Packet` message (the SDK's
//! `dfu-cc.proto`). The packet is transmitted to the target as an opaque
//! blob; locally we only walk the wire format to pull out the hash and the
//! informational InitCommand fields, so no generated protobuf code is
//! needed. Field numbers below are fixed by the SDK schema.

use crate::error::DfuError;

/// Hash function named by the init packet.
///
/// The schema also defines `SHA128 = 2`, which is not a real hash function;
/// packets carrying it are rejected while loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    NoHash,
    Crc,
    Sha256,
    Sha512,
}

impl HashType {
    fn from_wire(value: u64) -> Result<Self, DfuError> {
        match value {
            0 => Ok(HashType::NoHash),
            1 => Ok(HashType::Crc),
            3 => Ok(HashType::Sha256),
            4 => Ok(HashType::Sha512),
            _ => Err(DfuError::FileInvalid),
        }
    }
}

/// `dfu.Hash` sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitHash {
    pub hash_type: HashType,
    pub hash: Vec<u8>,
}

/// The fields of `dfu.InitCommand` we care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitPacket {
    pub fw_version: Option<u32>,
    pub hw_version: Option<u32>,
    pub sd_req: Vec<u32>,
    pub fw_type: Option<u32>,
    pub sd_size: Option<u32>,
    pub bl_size: Option<u32>,
    pub app_size: Option<u32>,
    pub hash: Option<InitHash>,
    pub is_debug: bool,
    /// Whether the init command arrived wrapped in a `SignedCommand`.
    pub signed: bool,
}

enum Field<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

fn read_varint(buf: &mut &[u8]) -> Result<u64, DfuError> {
    leb128::read::unsigned(buf).map_err(|_| DfuError::FileInvalid)
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], DfuError> {
    if buf.len() < n {
        return Err(DfuError::FileInvalid);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

/// Visit every field of one message level. Unknown wire types fail; fixed32
/// and fixed64 fields are skipped.
fn walk<'a>(
    mut buf: &'a [u8],
    mut visit: impl FnMut(u32, Field<'a>) -> Result<(), DfuError>,
) -> Result<(), DfuError> {
    while !buf.is_empty() {
        let key = read_varint(&mut buf)?;
        let field = (key >> 3) as u32;
        match key & 7 {
            0 => visit(field, Field::Varint(read_varint(&mut buf)?))?,
            1 => {
                take(&mut buf, 8)?;
            }
            2 => {
                let len = read_varint(&mut buf)? as usize;
                visit(field, Field::Bytes(take(&mut buf, len)?))?;
            }
            5 => {
                take(&mut buf, 4)?;
            }
            _ => return Err(DfuError::FileInvalid),
        }
    }
    Ok(())
}

impl InitPacket {
    /// Parse the raw `.dat` bytes.
    ///
    /// The packet must carry at least one field and must contain an `init`
    /// command, either directly or nested inside `signed_command.command`.
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        if data.is_empty() {
            return Err(DfuError::InitPacketRequired);
        }

        // Packet: command = 1, signed_command = 2
        let mut command: Option<&[u8]> = None;
        let mut signed_command: Option<&[u8]> = None;
        walk(data, |field, value| {
            match (field, value) {
                (1, Field::Bytes(b)) => command = Some(b),
                (2, Field::Bytes(b)) => signed_command = Some(b),
                _ => {}
            }
            Ok(())
        })?;

        let mut signed = false;
        let command = match signed_command {
            // SignedCommand: command = 1
            Some(sc) => {
                signed = true;
                let mut inner: Option<&[u8]> = None;
                walk(sc, |field, value| {
                    if let (1, Field::Bytes(b)) = (field, value) {
                        inner = Some(b);
                    }
                    Ok(())
                })?;
                inner.ok_or(DfuError::InitPacketRequired)?
            }
            None => command.ok_or(DfuError::InitPacketRequired)?,
        };

        // Command: op_code = 1, init = 2
        let mut init: Option<&[u8]> = None;
        walk(command, |field, value| {
            if let (2, Field::Bytes(b)) = (field, value) {
                init = Some(b);
            }
            Ok(())
        })?;
        let init = init.ok_or(DfuError::InitPacketRequired)?;

        let mut pkt = InitPacket {
            signed,
            ..Default::default()
        };
        let mut hash_raw: Option<&[u8]> = None;
        walk(init, |field, value| {
            match (field, value) {
                (1, Field::Varint(v)) => pkt.fw_version = Some(v as u32),
                (2, Field::Varint(v)) => pkt.hw_version = Some(v as u32),
                (3, Field::Varint(v)) => pkt.sd_req.push(v as u32),
                // sd_req is declared packed
                (3, Field::Bytes(mut b)) => {
                    while !b.is_empty() {
                        pkt.sd_req.push(read_varint(&mut b)? as u32);
                    }
                }
                (4, Field::Varint(v)) => pkt.fw_type = Some(v as u32),
                (5, Field::Varint(v)) => pkt.sd_size = Some(v as u32),
                (6, Field::Varint(v)) => pkt.bl_size = Some(v as u32),
                (7, Field::Varint(v)) => pkt.app_size = Some(v as u32),
                (8, Field::Bytes(b)) => hash_raw = Some(b),
                (9, Field::Varint(v)) => pkt.is_debug = v != 0,
                _ => {}
            }
            Ok(())
        })?;

        // Hash: hash_type = 1, hash = 2
        if let Some(raw) = hash_raw {
            let mut hash_type: Option<HashType> = None;
            let mut hash = Vec::new();
            walk(raw, |field, value| {
                match (field, value) {
                    (1, Field::Varint(v)) => hash_type = Some(HashType::from_wire(v)?),
                    (2, Field::Bytes(b)) => hash = b.to_vec(),
                    _ => {}
                }
                Ok(())
            })?;
            pkt.hash = Some(InitHash {
                hash_type: hash_type.ok_or(DfuError::FileInvalid)?,
                hash,
            });
        }

        Ok(pkt)
    }
}
