use std::sync::Arc;

use gantry_codec::{LengthField, check_crc16};
use tracing::warn;

use crate::interceptor::{Chain, IcResp, Interceptor};
use crate::request::Request;

/// An inbound decoder: an interceptor (installed at the chain head) that
/// also publishes the frame geometry connections should decode with.
pub trait Decoder: Interceptor {
    fn length_field(&self) -> Option<LengthField>;
}

/// TLV frame header length: tag + length, 4 bytes each.
const TLV_HEADER_SIZE: usize = 8;

/// Parsed view of a TLV frame, attached to the request as the interceptor
/// response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlvFrame {
    pub tag: u32,
    pub length: u32,
    pub value: Vec<u8>,
}

/// Default inbound decoder: big-endian `tag:u32 | length:u32 | value`.
///
/// Rewrites the raw frame message into `(id = tag, data = value)` so the
/// router can address by msg id.
#[derive(Default)]
pub struct TlvDecoder;

impl Decoder for TlvDecoder {
    fn length_field(&self) -> Option<LengthField> {
        // Length counts only the value; tag and length fields precede it.
        Some(LengthField::new(u64::from(u32::MAX) + 8, 4, 4, 0, 0))
    }
}

impl Interceptor for TlvDecoder {
    fn intercept(&self, chain: Chain<'_>, mut request: Request) -> IcResp {
        let data = request.message().data();
        if data.len() < TLV_HEADER_SIZE {
            return chain.proceed(request);
        }

        let tag = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let length = u32::from_be_bytes(data[4..8].try_into().unwrap());
        let end = TLV_HEADER_SIZE + length as usize;
        if data.len() < end {
            // The frame decoder emits whole frames; a short one means the
            // geometry and the header disagree.
            warn!(tag, length, got = data.len(), "tlv frame shorter than header claims");
            return chain.proceed(request);
        }
        let value = data[TLV_HEADER_SIZE..end].to_vec();

        let msg = request.message_mut();
        msg.set_id(tag);
        msg.set_data(value.clone());

        chain.proceed_with_message(request, Some(Arc::new(TlvFrame { tag, length, value })))
    }
}

/// HTLV+CRC header length: head, funcode, length.
const HTLV_HEADER_SIZE: usize = 5;

/// Parsed view of an HTLV+CRC frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlvCrcFrame {
    pub head: u8,
    pub funcode: u8,
    pub length: u8,
    pub body: Vec<u8>,
    pub crc: [u8; 2],
}

/// Example decoder for the legacy device protocol
/// `head:u8 | funcode:u8 | len:u8 | body[len] | crc:u16`.
///
/// Sets `id = funcode` for routing and attaches the parsed structure; a
/// CRC mismatch drops the frame (the chain short-circuits).
#[derive(Default)]
pub struct HtlvCrcDecoder;

impl Decoder for HtlvCrcDecoder {
    fn length_field(&self) -> Option<LengthField> {
        // len counts only the body; head, funcode, len and the 2 CRC
        // bytes surround it.
        Some(LengthField::new(u64::from(u8::MAX) + 4, 2, 1, 2, 0))
    }
}

impl Interceptor for HtlvCrcDecoder {
    fn intercept(&self, chain: Chain<'_>, mut request: Request) -> IcResp {
        let data = request.message().data();
        if data.len() < HTLV_HEADER_SIZE {
            return chain.proceed(request);
        }

        let end = data.len();
        let frame = HtlvCrcFrame {
            head: data[0],
            funcode: data[1],
            length: data[2],
            body: data[3..end - 2].to_vec(),
            crc: [data[end - 2], data[end - 1]],
        };

        if !check_crc16(&data[..end - 2], &frame.crc) {
            warn!(funcode = frame.funcode, "crc mismatch, frame dropped");
            return None;
        }

        request.message_mut().set_id(u32::from(frame.funcode));
        chain.proceed_with_message(request, Some(Arc::new(frame)))
    }
}
