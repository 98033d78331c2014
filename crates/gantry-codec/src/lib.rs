mod crc;
mod frame;
mod message;
mod packet;

pub use crc::{check_crc16, crc16};
pub use frame::{Endianness, FrameDecoder, FrameError, LengthField};
pub use message::Message;
pub use packet::{LtvPacket, PackError, PackKind, Packet, TlvPacket, new_packet};
