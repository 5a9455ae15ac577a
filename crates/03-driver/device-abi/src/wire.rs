//! Explicit little-endian layout for control structures.
//!
//! Structures are written field by field; nothing is copied as raw struct
//! memory, so the layout does not depend on the host ABI.

use crate::error::{DeviceError, DeviceResult};

#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self, what: &str) -> DeviceResult<[u8; N]> {
        let end = self.pos + N;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            DeviceError::protocol(format!(
                "truncated payload reading {what} at byte {}",
                self.pos
            ))
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> DeviceResult<u8> {
        Ok(self.take::<1>("u8")?[0])
    }

    pub fn get_u32(&mut self) -> DeviceResult<u32> {
        self.take("u32").map(u32::from_le_bytes)
    }

    pub fn get_i32(&mut self) -> DeviceResult<i32> {
        self.take("i32").map(i32::from_le_bytes)
    }

    pub fn get_u64(&mut self) -> DeviceResult<u64> {
        self.take("u64").map(u64::from_le_bytes)
    }

    pub fn get_i64(&mut self) -> DeviceResult<i64> {
        self.take("i64").map(i64::from_le_bytes)
    }

    pub fn get_str(&mut self) -> DeviceResult<String> {
        let len = self.get_u32()? as usize;
        let end = self.pos + len;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| DeviceError::protocol("truncated string"))?;
        self.pos = end;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DeviceError::protocol("string is not valid UTF-8"))
    }

    /// Fails when bytes remain after the structure.
    pub fn finish(self) -> DeviceResult<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(DeviceError::protocol(format!(
                "{} trailing bytes after structure",
                self.buf.len() - self.pos
            )))
        }
    }
}

/// A structure with a fixed field-by-field wire layout.
pub trait WireFormat: Sized {
    fn encode(&self, w: &mut WireWriter);

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self>;

    fn to_wire(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode(&mut w);
        w.finish()
    }

    fn from_wire(bytes: &[u8]) -> DeviceResult<Self> {
        let mut r = WireReader::new(bytes);
        let value = Self::decode(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}
