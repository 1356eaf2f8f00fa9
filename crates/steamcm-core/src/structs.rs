//! Legacy message bodies with hand-rolled little-endian layouts.
//!
//! These predate protobuf bodies and always travel behind the plain 20-byte
//! header.

use crate::enums::{EMsg, EResult};
use crate::error::{CmError, CmResult};

pub const CHANNEL_PROTOCOL_VERSION: u32 = 1;

fn read_u32(data: &[u8], at: usize, what: &str) -> CmResult<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| CmError::Decode(format!("{what}: body too short ({} bytes)", data.len())))
}

fn decode_encrypt_request(data: &[u8]) -> CmResult<StructBody> {
    Ok(StructBody::ChannelEncryptRequest(ChannelEncryptRequest {
        protocol_version: read_u32(data, 0, "ChannelEncryptRequest")?,
        universe: read_u32(data, 4, "ChannelEncryptRequest")?,
        challenge: data[8..].to_vec(),
    }))
}

fn decode_encrypt_response(data: &[u8]) -> CmResult<StructBody> {
    Ok(StructBody::ChannelEncryptResponse(ChannelEncryptResponse {
        protocol_version: read_u32(data, 0, "ChannelEncryptResponse")?,
        key_size: read_u32(data, 4, "ChannelEncryptResponse")?,
        payload: data[8..].to_vec(),
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEncryptRequest {
    pub protocol_version: u32,
    pub universe: u32,
    pub challenge: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEncryptResponse {
    pub protocol_version: u32,
    pub key_size: u32,
    /// Encrypted session key followed by its checksum.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEncryptResult {
    pub eresult: EResult,
}

/// A decoded non-protobuf body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructBody {
    ChannelEncryptRequest(ChannelEncryptRequest),
    ChannelEncryptResponse(ChannelEncryptResponse),
    ChannelEncryptResult(ChannelEncryptResult),
}

impl StructBody {
    /// Decode the body registered for `msg`, or `None` if no layout is known.
    pub fn decode(msg: EMsg, data: &[u8]) -> Option<CmResult<Self>> {
        let decoded = match msg {
            EMsg::ChannelEncryptRequest => decode_encrypt_request(data),
            EMsg::ChannelEncryptResponse => decode_encrypt_response(data),
            EMsg::ChannelEncryptResult => read_u32(data, 0, "ChannelEncryptResult").map(|r| {
                StructBody::ChannelEncryptResult(ChannelEncryptResult {
                    eresult: EResult::from(r as i32),
                })
            }),
            _ => return None,
        };
        Some(decoded)
    }

    pub fn emsg(&self) -> EMsg {
        match self {
            StructBody::ChannelEncryptRequest(_) => EMsg::ChannelEncryptRequest,
            StructBody::ChannelEncryptResponse(_) => EMsg::ChannelEncryptResponse,
            StructBody::ChannelEncryptResult(_) => EMsg::ChannelEncryptResult,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            StructBody::ChannelEncryptRequest(b) => {
                out.extend_from_slice(&b.protocol_version.to_le_bytes());
                out.extend_from_slice(&b.universe.to_le_bytes());
                out.extend_from_slice(&b.challenge);
            }
            StructBody::ChannelEncryptResponse(b) => {
                out.extend_from_slice(&b.protocol_version.to_le_bytes());
                out.extend_from_slice(&b.key_size.to_le_bytes());
                out.extend_from_slice(&b.payload);
            }
            StructBody::ChannelEncryptResult(b) => {
                out.extend_from_slice(&(i32::from(b.eresult) as u32).to_le_bytes());
            }
        }
    }
}
