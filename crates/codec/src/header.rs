use bytes::{BufMut, BytesMut};

use crate::{CommandId, Error};

/// Fixed magic byte identifying a pvAccess frame (spec.md §4.1).
pub const MAGIC: u8 = 0xCA;

/// Protocol revision this engine speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes: magic, version, flags, command, 4-byte length.
pub const HEADER_LEN: usize = 8;

/// Flag bits packed into the header's flags byte.
pub mod flags {
    /// Payload length (and every multi-byte field after it) is little-endian.
    /// Cleared means big-endian. Fixed for the lifetime of a transport once
    /// the connection-validation handshake completes (spec.md §4.1, §4.4).
    pub const LITTLE_ENDIAN: u8 = 0b0000_0001;
    /// Frame travels from server to client. Informational only; the client
    /// engine always sets this to 0 on frames it sends.
    pub const FROM_SERVER: u8 = 0b0000_0010;
}

/// Byte order negotiated during the connection-validation handshake
/// (spec.md §4.1, §4.4). Fixed per-transport once negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn from_flags(flags: u8) -> Self {
        if flags & self::flags::LITTLE_ENDIAN != 0 {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    fn flag_bit(self) -> u8 {
        match self {
            ByteOrder::Little => self::flags::LITTLE_ENDIAN,
            ByteOrder::Big => 0,
        }
    }

    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        let arr: [u8; 2] = bytes[..2].try_into().unwrap();
        match self {
            ByteOrder::Big => u16::from_be_bytes(arr),
            ByteOrder::Little => u16::from_le_bytes(arr),
        }
    }

    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let arr: [u8; 4] = bytes[..4].try_into().unwrap();
        match self {
            ByteOrder::Big => u32::from_be_bytes(arr),
            ByteOrder::Little => u32::from_le_bytes(arr),
        }
    }

    pub fn write_u16(self, buf: &mut BytesMut, value: u16) {
        match self {
            ByteOrder::Big => buf.put_u16(value),
            ByteOrder::Little => buf.put_u16_le(value),
        }
    }

    pub fn write_u32(self, buf: &mut BytesMut, value: u32) {
        match self {
            ByteOrder::Big => buf.put_u32(value),
            ByteOrder::Little => buf.put_u32_le(value),
        }
    }
}

/// The 8-byte frame header: magic byte, version byte, flags byte, command
/// byte, then a 4-byte payload length in the negotiated byte order
/// (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub command: CommandId,
    pub order: ByteOrder,
    pub from_server: bool,
    pub payload_len: u32,
}

impl Header {
    pub fn new(command: CommandId, order: ByteOrder, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
            order,
            from_server: false,
            payload_len,
        }
    }

    /// # Test
    ///
    /// ```
    /// use codec::header::{ByteOrder, Header};
    /// use codec::CommandId;
    ///
    /// let header = Header::new(CommandId::Get, ByteOrder::Little, 42);
    /// let mut buf = bytes::BytesMut::with_capacity(8);
    /// header.encode(&mut buf);
    ///
    /// let decoded = Header::decode(&buf).unwrap();
    /// assert_eq!(decoded, header);
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MAGIC);
        buf.put_u8(self.version);

        let mut flag_byte = self.order.flag_bit();
        if self.from_server {
            flag_byte |= self::flags::FROM_SERVER;
        }
        buf.put_u8(flag_byte);
        buf.put_u8(self.command as u8);
        self.order.write_u32(buf, self.payload_len);
    }

    /// # Test
    ///
    /// ```
    /// use codec::header::Header;
    ///
    /// assert!(Header::decode(&[0u8; 4]).is_err());
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }

        if bytes[0] != MAGIC {
            return Err(Error::BadMagic);
        }

        let version = bytes[1];
        let flag_byte = bytes[2];
        let order = ByteOrder::from_flags(flag_byte);
        let command = CommandId::from_u8(bytes[3])?;
        let payload_len = order.read_u32(&bytes[4..8]);

        Ok(Self {
            version,
            command,
            order,
            from_server: flag_byte & self::flags::FROM_SERVER != 0,
            payload_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_big_endian() {
        let header = Header::new(CommandId::Monitor, ByteOrder::Big, 1024);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn round_trips_little_endian() {
        let header = Header::new(CommandId::Rpc, ByteOrder::Little, 7);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = BytesMut::new();
        Header::new(CommandId::Get, ByteOrder::Big, 0).encode(&mut buf);
        buf[0] = 0x00;
        assert_eq!(Header::decode(&buf), Err(Error::BadMagic));
    }
}
