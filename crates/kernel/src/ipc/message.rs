//! HIPC message layout.
//!
//! A message lives in the first 0x100 bytes of the sending thread's TLS:
//!
//! ```text
//! word0   type[0:16] num_x[16:20] num_a[20:24] num_b[24:28] num_w[28:32]
//! word1   data_words[0:10] c_flags[10:14] has_handle_descriptor[31]
//! [handle descriptor: send_pid[0] num_copy[1:5] num_move[5:9]]
//! [pid: u64] [copy handles] [move handles]
//! X descriptors (2 words) A, B, W descriptors (3 words)
//! raw data (data_words * 4 bytes)
//! C descriptors (2 words)
//! ```
//!
//! The kernel only cares about the handle descriptor, which it rewrites
//! while copying a message between processes; everything else is opaque
//! to it and interpreted by the service layer.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use types::primitives::FieldReader;
use types::ResultCode;

pub const MESSAGE_BUFFER_SIZE: usize = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum CommandType {
    Invalid = 0,
    LegacyRequest = 1,
    Close = 2,
    LegacyControl = 3,
    Request = 4,
    Control = 5,
    RequestWithContext = 6,
    ControlWithContext = 7,
}

/// One buffer descriptor. `attribute` is the X-descriptor index or the
/// A/B/W transfer mode; unused for C descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    pub address: u64,
    pub size: u64,
    pub attribute: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HipcMessage {
    pub command_type: u16,
    pub pid: Option<u64>,
    pub copy_handles: Vec<u32>,
    pub move_handles: Vec<u32>,
    pub x_buffers: Vec<BufferDescriptor>,
    pub a_buffers: Vec<BufferDescriptor>,
    pub b_buffers: Vec<BufferDescriptor>,
    pub w_buffers: Vec<BufferDescriptor>,
    pub c_buffers: Vec<BufferDescriptor>,
    /// Raw data, including the alignment padding the CMIF layer adds.
    pub raw: Vec<u8>,
    /// Byte offset of the pid field, when present.
    pub pid_offset: Option<usize>,
    /// Byte offset of the first copy handle.
    pub handles_offset: usize,
    /// Byte offset of `raw` inside the buffer.
    pub raw_offset: usize,
}

fn bits(value: u32, shift: u32, width: u32) -> u32 {
    (value >> shift) & ((1 << width) - 1)
}

fn read_x(r: &mut FieldReader<'_>) -> Option<BufferDescriptor> {
    let w0 = r.u32()?;
    let lo = r.u32()? as u64;
    let address = lo | (bits(w0, 12, 4) as u64) << 32 | (bits(w0, 6, 3) as u64) << 36;
    Some(BufferDescriptor {
        address,
        size: bits(w0, 16, 16) as u64,
        attribute: bits(w0, 0, 6),
    })
}

fn read_abw(r: &mut FieldReader<'_>) -> Option<BufferDescriptor> {
    let size_lo = r.u32()? as u64;
    let addr_lo = r.u32()? as u64;
    let w2 = r.u32()?;
    Some(BufferDescriptor {
        address: addr_lo | (bits(w2, 28, 4) as u64) << 32 | (bits(w2, 2, 3) as u64) << 36,
        size: size_lo | (bits(w2, 24, 4) as u64) << 32,
        attribute: bits(w2, 0, 2),
    })
}

fn read_c(r: &mut FieldReader<'_>) -> Option<BufferDescriptor> {
    let lo = r.u32()? as u64;
    let w1 = r.u32()?;
    Some(BufferDescriptor {
        address: lo | (bits(w1, 0, 16) as u64) << 32,
        size: bits(w1, 16, 16) as u64,
        attribute: 0,
    })
}

fn c_count(c_flags: u32) -> usize {
    match c_flags {
        0 | 1 => 0,
        2 => 1,
        n => n as usize - 2,
    }
}

impl HipcMessage {
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::try_from(self.command_type).ok()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ResultCode> {
        Self::parse_inner(buf).ok_or(ResultCode::INVALID_COMBINATION)
    }

    fn parse_inner(buf: &[u8]) -> Option<Self> {
        let mut r = FieldReader::new(buf);
        let w0 = r.u32()?;
        let w1 = r.u32()?;
        let mut msg = HipcMessage {
            command_type: bits(w0, 0, 16) as u16,
            ..Default::default()
        };
        let (num_x, num_a, num_b, num_w) = (
            bits(w0, 16, 4),
            bits(w0, 20, 4),
            bits(w0, 24, 4),
            bits(w0, 28, 4),
        );
        let data_words = bits(w1, 0, 10) as usize;
        let c_flags = bits(w1, 10, 4);

        if bits(w1, 31, 1) != 0 {
            let desc = r.u32()?;
            if bits(desc, 0, 1) != 0 {
                msg.pid_offset = Some(r.offset());
                msg.pid = Some(r.u64()?);
            }
            msg.handles_offset = r.offset();
            for _ in 0..bits(desc, 1, 4) {
                msg.copy_handles.push(r.u32()?);
            }
            for _ in 0..bits(desc, 5, 4) {
                msg.move_handles.push(r.u32()?);
            }
        } else {
            msg.handles_offset = r.offset();
        }

        for _ in 0..num_x {
            msg.x_buffers.push(read_x(&mut r)?);
        }
        for _ in 0..num_a {
            msg.a_buffers.push(read_abw(&mut r)?);
        }
        for _ in 0..num_b {
            msg.b_buffers.push(read_abw(&mut r)?);
        }
        for _ in 0..num_w {
            msg.w_buffers.push(read_abw(&mut r)?);
        }
        msg.raw_offset = r.offset();
        msg.raw = r.bytes(data_words * 4)?.to_vec();
        for _ in 0..c_count(c_flags) {
            msg.c_buffers.push(read_c(&mut r)?);
        }
        Some(msg)
    }

    fn has_handle_descriptor(&self) -> bool {
        self.pid.is_some() || !self.copy_handles.is_empty() || !self.move_handles.is_empty()
    }

    /// Offset `raw` will be encoded at, given the current descriptor counts.
    pub fn encoded_raw_offset(&self) -> usize {
        let mut words = 2;
        if self.has_handle_descriptor() {
            words += 1;
            if self.pid.is_some() {
                words += 2;
            }
            words += self.copy_handles.len() + self.move_handles.len();
        }
        words += self.x_buffers.len() * 2;
        words += (self.a_buffers.len() + self.b_buffers.len() + self.w_buffers.len()) * 3;
        words * 4
    }

    /// Serializes into a message buffer image.
    pub fn encode(&self) -> Result<Vec<u8>, ResultCode> {
        let mut out: Vec<u8> = Vec::with_capacity(MESSAGE_BUFFER_SIZE);
        let mut push = |v: u32| out.extend_from_slice(&v.to_le_bytes());

        let w0 = self.command_type as u32
            | (self.x_buffers.len() as u32 & 0xF) << 16
            | (self.a_buffers.len() as u32 & 0xF) << 20
            | (self.b_buffers.len() as u32 & 0xF) << 24
            | (self.w_buffers.len() as u32 & 0xF) << 28;
        let data_words = self.raw.len().div_ceil(4) as u32;
        let c_flags = match self.c_buffers.len() {
            0 => 0,
            n => n as u32 + 2,
        };
        let w1 = (data_words & 0x3FF)
            | (c_flags & 0xF) << 10
            | (self.has_handle_descriptor() as u32) << 31;
        push(w0);
        push(w1);

        if self.has_handle_descriptor() {
            push(
                self.pid.is_some() as u32
                    | (self.copy_handles.len() as u32 & 0xF) << 1
                    | (self.move_handles.len() as u32 & 0xF) << 5,
            );
            if let Some(pid) = self.pid {
                push(pid as u32);
                push((pid >> 32) as u32);
            }
            for &h in self.copy_handles.iter().chain(&self.move_handles) {
                push(h);
            }
        }
        for x in &self.x_buffers {
            push(
                (x.attribute & 0x3F)
                    | ((x.address >> 36) as u32 & 0x7) << 6
                    | ((x.address >> 32) as u32 & 0xF) << 12
                    | (x.size as u32 & 0xFFFF) << 16,
            );
            push(x.address as u32);
        }
        for d in self.a_buffers.iter().chain(&self.b_buffers).chain(&self.w_buffers) {
            push(d.size as u32);
            push(d.address as u32);
            push(
                (d.attribute & 0x3)
                    | ((d.address >> 36) as u32 & 0x7) << 2
                    | ((d.size >> 32) as u32 & 0xF) << 24
                    | ((d.address >> 32) as u32 & 0xF) << 28,
            );
        }
        let mut raw = self.raw.clone();
        raw.resize(data_words as usize * 4, 0);
        for chunk in raw.chunks(4) {
            push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        for c in &self.c_buffers {
            push(c.address as u32);
            push(((c.address >> 32) as u32 & 0xFFFF) | (c.size as u32 & 0xFFFF) << 16);
        }

        if out.len() > MESSAGE_BUFFER_SIZE {
            return Err(ResultCode::MESSAGE_TOO_LARGE);
        }
        out.resize(MESSAGE_BUFFER_SIZE, 0);
        Ok(out)
    }
}

/// Writes `value` at byte `offset` of a message buffer.
pub fn patch_u32(buf: &mut [u8], offset: usize, value: u32) {
    if let Some(slot) = buf.get_mut(offset..offset + 4) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

pub fn patch_u64(buf: &mut [u8], offset: usize, value: u64) {
    if let Some(slot) = buf.get_mut(offset..offset + 8) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_handles_and_buffers() {
        let msg = HipcMessage {
            command_type: CommandType::Request.into(),
            pid: Some(0),
            copy_handles: vec![0x1234],
            move_handles: vec![0x5678, 0x9ABC],
            x_buffers: vec![BufferDescriptor { address: 0x7F_1234_5000, size: 0x40, attribute: 3 }],
            a_buffers: vec![BufferDescriptor { address: 0x12_0000_1000, size: 0x2_0000_0010, attribute: 1 }],
            c_buffers: vec![BufferDescriptor { address: 0xABCD_0000_2000, size: 0x80, attribute: 0 }],
            raw: vec![1, 2, 3, 4, 5, 6, 7, 8],
            ..Default::default()
        };
        let buf = msg.encode().unwrap();
        assert_eq!(buf.len(), MESSAGE_BUFFER_SIZE);

        let parsed = HipcMessage::parse(&buf).unwrap();
        assert_eq!(parsed.command_type(), Some(CommandType::Request));
        assert_eq!(parsed.pid_offset, Some(12));
        assert_eq!(parsed.handles_offset, 20);
        assert_eq!(parsed.copy_handles, msg.copy_handles);
        assert_eq!(parsed.move_handles, msg.move_handles);
        assert_eq!(parsed.x_buffers, msg.x_buffers);
        assert_eq!(parsed.a_buffers, msg.a_buffers);
        assert_eq!(parsed.c_buffers, msg.c_buffers);
        assert_eq!(parsed.raw, msg.raw);
        assert_eq!(parsed.raw_offset, msg.encoded_raw_offset());
    }

    #[test]
    fn header_without_handle_descriptor() {
        let mut buf = [0u8; MESSAGE_BUFFER_SIZE];
        patch_u32(&mut buf, 0, CommandType::Close as u32);
        let parsed = HipcMessage::parse(&buf).unwrap();
        assert_eq!(parsed.command_type(), Some(CommandType::Close));
        assert!(parsed.copy_handles.is_empty());
        assert_eq!(parsed.raw_offset, 8);
    }

    #[test]
    fn truncated_descriptor_is_rejected() {
        let mut buf = [0u8; 12];
        patch_u32(&mut buf, 0, 4 | 0xF << 16);
        assert!(HipcMessage::parse(&buf).is_err());
    }
}
