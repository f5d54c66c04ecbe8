//! Command layer carried in the raw data of a HIPC message.
//!
//! The CMIF header starts at the first 16-byte boundary of the message
//! buffer:
//!
//! ```text
//! request   magic "SFCI"  version  command id  token   payload...
//! response  magic "SFCO"  version  result      token   payload...
//! ```

use kernel::{CommandType, HipcMessage};
use types::primitives::FieldReader;
use types::result::cmif;
use types::ResultCode;

pub const REQUEST_MAGIC: u32 = u32::from_le_bytes(*b"SFCI");
pub const RESPONSE_MAGIC: u32 = u32::from_le_bytes(*b"SFCO");
pub const HEADER_SIZE: usize = 16;
const ALIGNMENT: usize = 16;

/// Bytes between the start of raw data and the CMIF header.
fn padding(raw_offset: usize) -> usize {
    (ALIGNMENT - raw_offset % ALIGNMENT) % ALIGNMENT
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmifRequest {
    pub command_id: u32,
    pub token: u32,
    pub payload: Vec<u8>,
}

impl CmifRequest {
    pub fn parse(msg: &HipcMessage) -> Result<Self, ResultCode> {
        let start = padding(msg.raw_offset);
        let mut r = FieldReader::at(&msg.raw, start);
        let magic = r.u32().ok_or(cmif::INVALID_HEADER)?;
        if magic != REQUEST_MAGIC {
            return Err(cmif::INVALID_HEADER);
        }
        let _version = r.u32().ok_or(cmif::INVALID_HEADER)?;
        let command_id = r.u32().ok_or(cmif::INVALID_HEADER)?;
        let token = r.u32().ok_or(cmif::INVALID_HEADER)?;
        let payload = msg.raw.get(r.offset()..).unwrap_or_default().to_vec();
        Ok(Self {
            command_id,
            token,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmifResponse {
    pub result: ResultCode,
    pub payload: Vec<u8>,
    pub copy_handles: Vec<u32>,
    pub move_handles: Vec<u32>,
}

impl CmifResponse {
    /// Decodes a reply as a guest finds it in its message buffer.
    pub fn parse(buf: &[u8]) -> Result<Self, ResultCode> {
        let msg = HipcMessage::parse(buf)?;
        let start = padding(msg.raw_offset);
        let mut r = FieldReader::at(&msg.raw, start);
        if r.u32() != Some(RESPONSE_MAGIC) {
            return Err(cmif::INVALID_HEADER);
        }
        let _version = r.u32().ok_or(cmif::INVALID_HEADER)?;
        let result = ResultCode::from_raw(r.u32().ok_or(cmif::INVALID_HEADER)?);
        let _token = r.u32().ok_or(cmif::INVALID_HEADER)?;
        Ok(Self {
            result,
            payload: msg.raw.get(r.offset()..).unwrap_or_default().to_vec(),
            copy_handles: msg.copy_handles,
            move_handles: msg.move_handles,
        })
    }
}

/// Lays out `body` (header plus payload) after the alignment padding
/// that matches `msg`'s descriptors, with 16 spare bytes so the receiver
/// may realign.
fn attach_raw(msg: &mut HipcMessage, body: &[u8]) {
    let pad = padding(msg.encoded_raw_offset());
    let mut raw = vec![0u8; pad];
    raw.extend_from_slice(body);
    raw.resize(ALIGNMENT + body.len(), 0);
    msg.raw = raw;
}

/// Builds a reply image. Handle slots are left zero for the kernel to fill.
pub fn encode_response(
    result: ResultCode,
    payload: &[u8],
    num_copies: usize,
    num_moves: usize,
) -> Result<Vec<u8>, ResultCode> {
    let mut msg = HipcMessage {
        command_type: CommandType::Request.into(),
        copy_handles: vec![0; num_copies],
        move_handles: vec![0; num_moves],
        ..Default::default()
    };
    let mut body = Vec::with_capacity(HEADER_SIZE + payload.len());
    body.extend_from_slice(&RESPONSE_MAGIC.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&result.raw().to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(payload);
    attach_raw(&mut msg, &body);
    msg.encode()
}

/// Request image as a guest would write it. `msg` supplies descriptors
/// and handles; its raw data is replaced.
pub fn encode_request(mut msg: HipcMessage, command_id: u32, payload: &[u8]) -> Result<Vec<u8>, ResultCode> {
    let mut body = Vec::with_capacity(HEADER_SIZE + payload.len());
    body.extend_from_slice(&REQUEST_MAGIC.to_le_bytes());
    body.extend_from_slice(&1u32.to_le_bytes());
    body.extend_from_slice(&command_id.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(payload);
    attach_raw(&mut msg, &body);
    msg.encode()
}

/// Shorthand for a plain request with no handles or buffers.
pub fn simple_request(command_type: CommandType, command_id: u32, payload: &[u8]) -> Result<Vec<u8>, ResultCode> {
    let msg = HipcMessage {
        command_type: command_type.into(),
        ..Default::default()
    };
    encode_request(msg, command_id, payload)
}
