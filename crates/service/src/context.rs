use kernel::{BufferDescriptor, HipcMessage, Kernel, ObjectRef};
use types::primitives::FieldReader;
use types::result::cmif;
use types::ResultCode;

use crate::interface::SessionHandler;

/// One command as a handler sees it: input fields, objects sent along,
/// guest buffers, and the reply being built.
pub struct RequestContext<'a> {
    kernel: &'a Kernel,
    pub pid: u64,
    pub tid: u64,
    pub command_id: u32,
    message: &'a HipcMessage,
    input: FieldReader<'a>,
    pub copy_objects: Vec<ObjectRef>,
    pub move_objects: Vec<ObjectRef>,
    output: Vec<u8>,
    out_copies: Vec<ObjectRef>,
    out_moves: Vec<ObjectRef>,
    interfaces: Vec<Box<dyn SessionHandler>>,
}

/// What a finished request leaves behind for the reply.
pub(crate) struct ReplyParts {
    pub payload: Vec<u8>,
    pub copies: Vec<ObjectRef>,
    pub moves: Vec<ObjectRef>,
    pub interfaces: Vec<Box<dyn SessionHandler>>,
}

impl<'a> RequestContext<'a> {
    pub fn new(
        kernel: &'a Kernel,
        pid: u64,
        tid: u64,
        command_id: u32,
        message: &'a HipcMessage,
        payload: &'a [u8],
    ) -> Self {
        Self {
            kernel,
            pid,
            tid,
            command_id,
            message,
            input: FieldReader::new(payload),
            copy_objects: Vec::new(),
            move_objects: Vec::new(),
            output: Vec::new(),
            out_copies: Vec::new(),
            out_moves: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }

    pub fn message(&self) -> &HipcMessage {
        self.message
    }

    // ---- input ---------------------------------------------------------

    pub fn pop_u8(&mut self) -> Result<u8, ResultCode> {
        self.input.u8().ok_or(cmif::INVALID_HEADER)
    }

    pub fn pop_bool(&mut self) -> Result<bool, ResultCode> {
        Ok(self.pop_u8()? != 0)
    }

    pub fn pop_u32(&mut self) -> Result<u32, ResultCode> {
        self.input.u32().ok_or(cmif::INVALID_HEADER)
    }

    pub fn pop_u64(&mut self) -> Result<u64, ResultCode> {
        self.input.u64().ok_or(cmif::INVALID_HEADER)
    }

    pub fn pop_bytes<const N: usize>(&mut self) -> Result<[u8; N], ResultCode> {
        let bytes = self.input.bytes(N).ok_or(cmif::INVALID_HEADER)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Skips input up to the next multiple of `align` bytes.
    pub fn align_input(&mut self, align: usize) {
        let misalign = self.input.offset() % align;
        if misalign != 0 {
            self.input.skip(align - misalign);
        }
    }

    // ---- output --------------------------------------------------------

    pub fn push_u8(&mut self, value: u8) {
        self.output.push(value);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push_u8(value as u8);
    }

    pub fn push_u16(&mut self, value: u16) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u32(&mut self, value: u32) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    pub fn copy_object(&mut self, object: ObjectRef) {
        self.out_copies.push(object);
    }

    pub fn move_object(&mut self, object: ObjectRef) {
        self.out_moves.push(object);
    }

    /// Returns a sub-interface; the caller receives a session to it.
    pub fn push_interface(&mut self, handler: Box<dyn SessionHandler>) {
        self.interfaces.push(handler);
    }

    // ---- buffers -------------------------------------------------------

    fn in_descriptor(&self, index: usize) -> Option<BufferDescriptor> {
        let a = self.message.a_buffers.get(index).filter(|d| d.size > 0);
        a.or_else(|| self.message.x_buffers.get(index)).copied()
    }

    fn out_descriptor(&self, index: usize) -> Option<BufferDescriptor> {
        let b = self.message.b_buffers.get(index).filter(|d| d.size > 0);
        b.or_else(|| self.message.c_buffers.get(index)).copied()
    }

    /// Contents of input buffer `index` (A, else X).
    pub fn read_buffer(&self, index: usize) -> Result<Vec<u8>, ResultCode> {
        let d = self.in_descriptor(index).ok_or(ResultCode::INVALID_POINTER)?;
        if d.size == 0 {
            return Ok(Vec::new());
        }
        self.kernel.read_memory(self.pid, d.address, d.size as usize)
    }

    /// Size of output buffer `index` (B, else C), 0 when absent.
    pub fn buffer_capacity(&self, index: usize) -> u64 {
        self.out_descriptor(index).map_or(0, |d| d.size)
    }

    /// Copies as much of `data` as fits into output buffer `index`.
    pub fn write_buffer(&self, index: usize, data: &[u8]) -> Result<usize, ResultCode> {
        let d = self.out_descriptor(index).ok_or(ResultCode::INVALID_POINTER)?;
        let len = data.len().min(d.size as usize);
        if len > 0 {
            self.kernel.write_memory(self.pid, d.address, &data[..len])?;
        }
        Ok(len)
    }

    pub(crate) fn into_parts(self) -> ReplyParts {
        ReplyParts {
            payload: self.output,
            copies: self.out_copies,
            moves: self.out_moves,
            interfaces: self.interfaces,
        }
    }
}

impl ReplyParts {
    pub fn with_payload(payload: Vec<u8>) -> Self {
        Self {
            payload,
            copies: Vec::new(),
            moves: Vec::new(),
            interfaces: Vec::new(),
        }
    }
}
