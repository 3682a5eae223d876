//! Fixed-layout decoding of raw kernel buffers.
//!
//! Every event and map value handed over by the probe host is a plain byte
//! buffer. Instead of casting those buffers onto structs, decoders describe
//! their layout as byte offsets and read each field through a [`Reader`]
//! which checks the buffer length first and returns a [`DecodeError`] on
//! short input.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub const NATIVE: Endian = if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before `need` bytes were available.
    Short { need: usize, have: usize },
    /// A field held a value that is not valid for its type.
    Invalid { field: &'static str, value: u64 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Short { need, have } => {
                write!(f, "buffer too short: need {need} bytes, have {have}")
            }
            DecodeError::Invalid { field, value } => {
                write!(f, "invalid value {value:#x} for field {field}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Bounds-checked field reader over a borrowed buffer.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
    endian: Endian,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_endian(buf, Endian::NATIVE)
    }

    pub fn with_endian(buf: &'a [u8], endian: Endian) -> Self {
        Self { buf, endian }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Validate that the whole layout fits before decoding any field.
    pub fn require(&self, need: usize) -> Result<(), DecodeError> {
        if self.buf.len() < need {
            return Err(DecodeError::Short {
                need,
                have: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = offset.checked_add(len).ok_or(DecodeError::Short {
            need: usize::MAX,
            have: self.buf.len(),
        })?;
        self.require(end)?;
        Ok(&self.buf[offset..end])
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(offset, N)?);
        Ok(out)
    }

    pub fn u8(&self, offset: usize) -> Result<u8, DecodeError> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn u16(&self, offset: usize) -> Result<u16, DecodeError> {
        let raw = self.array::<2>(offset)?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    /// A 16-bit field stored in network byte order regardless of the reader's endianness.
    pub fn be16(&self, offset: usize) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array::<2>(offset)?))
    }

    pub fn u32(&self, offset: usize) -> Result<u32, DecodeError> {
        let raw = self.array::<4>(offset)?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }

    pub fn be32(&self, offset: usize) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array::<4>(offset)?))
    }

    pub fn i32(&self, offset: usize) -> Result<i32, DecodeError> {
        Ok(self.u32(offset)? as i32)
    }

    pub fn u64(&self, offset: usize) -> Result<u64, DecodeError> {
        let raw = self.array::<8>(offset)?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        })
    }

    /// Read a value of `width` bytes (1, 2, 4 or 8) zero-extended to u64.
    pub fn uint(&self, offset: usize, width: usize) -> Result<u64, DecodeError> {
        match width {
            1 => self.u8(offset).map(u64::from),
            2 => self.u16(offset).map(u64::from),
            4 => self.u32(offset).map(u64::from),
            8 => self.u64(offset),
            _ => Err(DecodeError::Invalid {
                field: "width",
                value: width as u64,
            }),
        }
    }

    /// Read a fixed-size, NUL padded string field.
    pub fn cstr(&self, offset: usize, len: usize) -> Result<String, DecodeError> {
        let raw = self.bytes(offset, len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Read a 16 byte address slot. IPv4 addresses occupy the last four bytes.
    pub fn addr(&self, offset: usize, ipv6: bool) -> Result<IpAddr, DecodeError> {
        let raw = self.array::<16>(offset)?;
        Ok(addr_from_slot(&raw, ipv6))
    }
}

/// Convert a 16 byte address slot into an `IpAddr`.
pub fn addr_from_slot(raw: &[u8; 16], ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::from(*raw))
    } else {
        IpAddr::V4(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]))
    }
}

/// Inverse of [`addr_from_slot`].
pub fn addr_to_slot(addr: &IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => {
            let mut slot = [0u8; 16];
            slot[12..].copy_from_slice(&v4.octets());
            slot
        }
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Growable writer used to build map keys and values.
#[derive(Debug, Clone)]
pub struct Writer {
    buf: Vec<u8>,
    endian: Endian,
}

impl Writer {
    pub fn new(size: usize) -> Self {
        Self::with_endian(size, Endian::NATIVE)
    }

    pub fn with_endian(size: usize, endian: Endian) -> Self {
        Self {
            buf: vec![0; size],
            endian,
        }
    }

    fn slot(&mut self, offset: usize, len: usize) -> &mut [u8] {
        if self.buf.len() < offset + len {
            self.buf.resize(offset + len, 0);
        }
        &mut self.buf[offset..offset + len]
    }

    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) -> &mut Self {
        self.slot(offset, bytes.len()).copy_from_slice(bytes);
        self
    }

    pub fn put_u8(&mut self, offset: usize, v: u8) -> &mut Self {
        self.put_bytes(offset, &[v])
    }

    pub fn put_u16(&mut self, offset: usize, v: u16) -> &mut Self {
        let raw = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.put_bytes(offset, &raw)
    }

    pub fn put_be16(&mut self, offset: usize, v: u16) -> &mut Self {
        self.put_bytes(offset, &v.to_be_bytes())
    }

    pub fn put_u32(&mut self, offset: usize, v: u32) -> &mut Self {
        let raw = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.put_bytes(offset, &raw)
    }

    pub fn put_u64(&mut self, offset: usize, v: u64) -> &mut Self {
        let raw = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.put_bytes(offset, &raw)
    }

    /// Write the low `width` bytes of `v`.
    pub fn put_uint(&mut self, offset: usize, width: usize, v: u64) -> &mut Self {
        match width {
            1 => self.put_u8(offset, v as u8),
            2 => self.put_u16(offset, v as u16),
            4 => self.put_u32(offset, v as u32),
            _ => self.put_u64(offset, v),
        }
    }

    pub fn put_cstr(&mut self, offset: usize, len: usize, s: &str) -> &mut Self {
        let slot = self.slot(offset, len);
        slot.fill(0);
        let n = s.len().min(len.saturating_sub(1));
        slot[..n].copy_from_slice(&s.as_bytes()[..n]);
        self
    }

    pub fn put_addr(&mut self, offset: usize, addr: &IpAddr) -> &mut Self {
        self.put_bytes(offset, &addr_to_slot(addr))
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_buffer_is_an_error() {
        let buf = [1u8, 2, 3];
        let r = Reader::new(&buf);
        assert_eq!(r.u32(0), Err(DecodeError::Short { need: 4, have: 3 }));
        assert_eq!(r.u16(2), Err(DecodeError::Short { need: 4, have: 3 }));
        assert!(r.require(3).is_ok());
    }

    #[test]
    fn test_endianness() {
        let buf = [0x12u8, 0x34, 0x56, 0x78];
        assert_eq!(
            Reader::with_endian(&buf, Endian::Little).u32(0).unwrap(),
            0x78563412
        );
        assert_eq!(
            Reader::with_endian(&buf, Endian::Big).u32(0).unwrap(),
            0x12345678
        );
        assert_eq!(Reader::with_endian(&buf, Endian::Little).be16(0).unwrap(), 0x1234);
    }

    #[test]
    fn test_uint_widths() {
        let mut w = Writer::with_endian(0, Endian::Little);
        w.put_uint(0, 2, 0xbeef).put_uint(2, 8, 7);
        let buf = w.into_inner();
        let r = Reader::with_endian(&buf, Endian::Little);
        assert_eq!(r.uint(0, 2).unwrap(), 0xbeef);
        assert_eq!(r.uint(2, 8).unwrap(), 7);
        assert!(matches!(r.uint(0, 3), Err(DecodeError::Invalid { .. })));
    }

    #[test]
    fn test_cstr_truncates_at_nul() {
        let mut w = Writer::new(16);
        w.put_cstr(0, 16, "hostflow");
        let buf = w.into_inner();
        assert_eq!(Reader::new(&buf).cstr(0, 16).unwrap(), "hostflow");
    }

    #[test]
    fn test_addr_slots() {
        let v4: IpAddr = "10.1.2.3".parse().unwrap();
        let slot = addr_to_slot(&v4);
        assert_eq!(&slot[..12], &[0u8; 12]);
        assert_eq!(addr_from_slot(&slot, false), v4);

        let v6: IpAddr = "fd00::1".parse().unwrap();
        assert_eq!(addr_from_slot(&addr_to_slot(&v6), true), v6);
    }
}
