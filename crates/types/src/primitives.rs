use crate::SerializeField;

impl SerializeField for u8 {
    fn serialize_field(&self, buf: &mut [u8], offset: &mut usize) {
        if *offset < buf.len() {
            buf[*offset] = *self;
            *offset += 1;
        }
    }
}

impl SerializeField for u16 {
    fn serialize_field(&self, buf: &mut [u8], offset: &mut usize) {
        put(buf, offset, &self.to_le_bytes());
    }
}

impl SerializeField for u32 {
    fn serialize_field(&self, buf: &mut [u8], offset: &mut usize) {
        put(buf, offset, &self.to_le_bytes());
    }
}

impl SerializeField for u64 {
    fn serialize_field(&self, buf: &mut [u8], offset: &mut usize) {
        put(buf, offset, &self.to_le_bytes());
    }
}

impl<const N: usize> SerializeField for [u8; N] {
    fn serialize_field(&self, buf: &mut [u8], offset: &mut usize) {
        put(buf, offset, self);
    }
}

fn put(buf: &mut [u8], offset: &mut usize, bytes: &[u8]) {
    if *offset + bytes.len() <= buf.len() {
        buf[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        *offset += bytes.len();
    }
}

/// Little-endian cursor over a guest byte buffer.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn at(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    pub fn skip(&mut self, bytes: usize) {
        self.offset += bytes;
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let out = self.buf.get(self.offset..end)?;
        self.offset = end;
        Some(out)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Option<u64> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Some(lo | (hi << 32))
    }
}
