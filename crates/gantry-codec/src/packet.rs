use std::{io::Cursor, sync::Arc};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::message::Message;

/// `id:u32 | data_len:u32` either way round; both codecs use 8 bytes.
const HEADER_LEN: u32 = 8;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackError {
    #[error("packet header too short: got {0} bytes, need {HEADER_LEN}")]
    HeaderTooShort(usize),
    #[error("message data length {len} exceeds max packet size {max}")]
    DataTooLarge { len: u32, max: u32 },
}

/// Pack/unpack of `(msg id, length, payload)` headers.
///
/// `unpack` only consumes the header: it yields a message with `id` and
/// `data_len` set and leaves reading `data_len` further payload bytes to
/// the caller.
pub trait Packet: Send + Sync {
    fn head_len(&self) -> u32;
    fn pack(&self, msg: &Message) -> Result<Vec<u8>, PackError>;
    fn unpack(&self, data: &[u8]) -> Result<Message, PackError>;
}

fn check_size(data_len: u32, max_packet_size: u32) -> Result<(), PackError> {
    if max_packet_size > 0 && data_len > max_packet_size {
        return Err(PackError::DataTooLarge { len: data_len, max: max_packet_size });
    }
    Ok(())
}

/// Default wire format: big-endian `id:u32 | data_len:u32 | payload`.
pub struct TlvPacket {
    max_packet_size: u32,
}

impl TlvPacket {
    pub fn new(max_packet_size: u32) -> Self {
        Self { max_packet_size }
    }
}

impl Packet for TlvPacket {
    fn head_len(&self) -> u32 {
        HEADER_LEN
    }

    fn pack(&self, msg: &Message) -> Result<Vec<u8>, PackError> {
        let mut out = Vec::with_capacity(HEADER_LEN as usize + msg.data().len());
        out.write_u32::<BigEndian>(msg.id()).expect("vec write");
        out.write_u32::<BigEndian>(msg.data_len()).expect("vec write");
        out.extend_from_slice(msg.data());
        Ok(out)
    }

    fn unpack(&self, data: &[u8]) -> Result<Message, PackError> {
        if data.len() < HEADER_LEN as usize {
            return Err(PackError::HeaderTooShort(data.len()));
        }
        let mut cur = Cursor::new(data);
        let id = cur.read_u32::<BigEndian>().expect("length checked");
        let data_len = cur.read_u32::<BigEndian>().expect("length checked");
        check_size(data_len, self.max_packet_size)?;
        Ok(Message::header_only(id, data_len))
    }
}

/// Legacy wire format: little-endian `data_len:u32 | id:u32 | payload`.
pub struct LtvPacket {
    max_packet_size: u32,
}

impl LtvPacket {
    pub fn new(max_packet_size: u32) -> Self {
        Self { max_packet_size }
    }
}

impl Packet for LtvPacket {
    fn head_len(&self) -> u32 {
        HEADER_LEN
    }

    fn pack(&self, msg: &Message) -> Result<Vec<u8>, PackError> {
        let mut out = Vec::with_capacity(HEADER_LEN as usize + msg.data().len());
        out.write_u32::<LittleEndian>(msg.data_len()).expect("vec write");
        out.write_u32::<LittleEndian>(msg.id()).expect("vec write");
        out.extend_from_slice(msg.data());
        Ok(out)
    }

    fn unpack(&self, data: &[u8]) -> Result<Message, PackError> {
        if data.len() < HEADER_LEN as usize {
            return Err(PackError::HeaderTooShort(data.len()));
        }
        let mut cur = Cursor::new(data);
        let data_len = cur.read_u32::<LittleEndian>().expect("length checked");
        let id = cur.read_u32::<LittleEndian>().expect("length checked");
        check_size(data_len, self.max_packet_size)?;
        Ok(Message::header_only(id, data_len))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PackKind {
    #[default]
    TlvBigEndian,
    LtvLittleEndian,
}

pub fn new_packet(kind: PackKind, max_packet_size: u32) -> Arc<dyn Packet> {
    match kind {
        PackKind::TlvBigEndian => Arc::new(TlvPacket::new(max_packet_size)),
        PackKind::LtvLittleEndian => Arc::new(LtvPacket::new(max_packet_size)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlv_pack_layout_is_big_endian() {
        let pack = TlvPacket::new(4096);
        let bytes = pack.pack(&Message::with_id(7, b"hi".to_vec())).unwrap();
        assert_eq!(bytes, [0, 0, 0, 7, 0, 0, 0, 2, 0x68, 0x69]);
    }

    #[test]
    fn tlv_unpack_reads_header_only() {
        let pack = TlvPacket::new(4096);
        let bytes = pack.pack(&Message::with_id(7, b"hi".to_vec())).unwrap();

        let msg = pack.unpack(&bytes[..8]).unwrap();
        assert_eq!(msg.id(), 7);
        assert_eq!(msg.data_len(), 2);
        assert!(msg.data().is_empty());
    }

    #[test]
    fn ltv_roundtrip_swaps_field_order() {
        let pack = LtvPacket::new(4096);
        let bytes = pack.pack(&Message::with_id(0x0102_0304, b"xyz".to_vec())).unwrap();
        assert_eq!(&bytes[..4], [3, 0, 0, 0]);
        assert_eq!(&bytes[4..8], [0x04, 0x03, 0x02, 0x01]);

        let msg = pack.unpack(&bytes).unwrap();
        assert_eq!(msg.id(), 0x0102_0304);
        assert_eq!(msg.data_len(), 3);
    }

    #[test]
    fn unpack_rejects_oversized_and_short() {
        let pack = TlvPacket::new(8);
        let bytes = pack.pack(&Message::with_id(1, vec![0u8; 9])).unwrap();
        assert_eq!(
            pack.unpack(&bytes).unwrap_err(),
            PackError::DataTooLarge { len: 9, max: 8 }
        );
        assert_eq!(pack.unpack(&bytes[..5]).unwrap_err(), PackError::HeaderTooShort(5));

        // Zero disables the limit.
        let unlimited = TlvPacket::new(0);
        assert!(unlimited.unpack(&bytes).is_ok());
    }
}
