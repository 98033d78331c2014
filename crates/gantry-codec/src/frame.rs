use std::sync::Mutex;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("negative pre-adjustment length field: {0}")]
    NegativeLength(i64),
    #[error("frame length {length} exceeds max frame length {max}")]
    FrameTooLong { length: u64, max: u64 },
    #[error("frame length {frame} is less than initial bytes to strip {strip}")]
    StripExceedsFrame { frame: u64, strip: usize },
}

/// Byte order of the length field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Geometry of a length-prefixed framing scheme.
///
/// `length_adjustment` compensates for length fields that do not count
/// the whole remainder of the frame (e.g. a trailing checksum), and
/// `initial_bytes_to_strip` removes leading bytes from the emitted frame.
#[derive(Clone, Copy, Debug)]
pub struct LengthField {
    pub max_frame_length: u64,
    pub length_field_offset: usize,
    pub length_field_length: usize,
    pub length_adjustment: i64,
    pub initial_bytes_to_strip: usize,
    pub order: Endianness,
}

impl LengthField {
    pub fn new(
        max_frame_length: u64,
        length_field_offset: usize,
        length_field_length: usize,
        length_adjustment: i64,
        initial_bytes_to_strip: usize,
    ) -> Self {
        Self {
            max_frame_length,
            length_field_offset,
            length_field_length,
            length_adjustment,
            initial_bytes_to_strip,
            order: Endianness::Big,
        }
    }

    pub fn with_order(mut self, order: Endianness) -> Self {
        self.order = order;
        self
    }
}

struct DecodeState {
    acc: BytesMut,
    discarding: bool,
    bytes_to_discard: u64,
    longest_overflow: u64,
}

/// Stateful stream-to-frame converter for length-prefixed framing.
///
/// `decode_with` appends input to an internal accumulator and emits every
/// complete frame it contains; partial trailing data is retained for the
/// next call, so arbitrary re-chunking of the stream yields the same
/// frame sequence. Oversized frames switch the decoder into discard mode:
/// the overflowing bytes are swallowed (across calls if need be) and the
/// error is reported once, on first detection. Decoding is serialized by
/// an internal lock; the canonical caller is a single reader task.
pub struct FrameDecoder {
    field: LengthField,
    len_end: usize,
    state: Mutex<DecodeState>,
}

impl FrameDecoder {
    /// # Panics
    /// Panics when `length_field_length` is not one of 1, 2, 3, 4, 8.
    /// Geometry is setup-time configuration; a bad width is a programming
    /// error, not a runtime condition.
    pub fn new(field: LengthField) -> Self {
        assert!(
            matches!(field.length_field_length, 1 | 2 | 3 | 4 | 8),
            "unsupported length field width: {}",
            field.length_field_length
        );
        Self {
            len_end: field.length_field_offset + field.length_field_length,
            field,
            state: Mutex::new(DecodeState {
                acc: BytesMut::new(),
                discarding: false,
                bytes_to_discard: 0,
                longest_overflow: 0,
            }),
        }
    }

    pub fn length_field(&self) -> LengthField {
        self.field
    }

    /// Longest over-limit frame length observed so far.
    pub fn longest_overflow(&self) -> u64 {
        self.state.lock().unwrap().longest_overflow
    }

    /// Feeds `buf` and invokes `on_frame` for every frame that is now
    /// complete.
    ///
    /// Frames preceding an error in the same input have already been
    /// delivered when the error is returned. The offending bytes have been
    /// consumed (or queued for discard) and the decoder stays usable;
    /// frames later in the stream parse normally on subsequent calls.
    pub fn decode_with<F>(&self, buf: &[u8], mut on_frame: F) -> Result<(), FrameError>
    where
        F: FnMut(Vec<u8>),
    {
        let mut state = self.state.lock().unwrap();
        state.acc.extend_from_slice(buf);

        loop {
            match self.decode_one(&mut state)? {
                Some(frame) => on_frame(frame),
                None => return Ok(()),
            }
        }
    }

    fn decode_one(&self, st: &mut DecodeState) -> Result<Option<Vec<u8>>, FrameError> {
        if st.discarding {
            let drop = st.bytes_to_discard.min(st.acc.len() as u64);
            st.acc.advance(drop as usize);
            st.bytes_to_discard -= drop;
            if st.bytes_to_discard == 0 {
                st.discarding = false;
            }
        }

        if st.acc.len() < self.len_end {
            return Ok(None);
        }

        let unadjusted = self.unadjusted_length(&st.acc);
        if unadjusted < 0 {
            st.acc.advance(self.len_end);
            return Err(FrameError::NegativeLength(unadjusted));
        }

        let frame_length = unadjusted + self.field.length_adjustment + self.len_end as i64;
        if frame_length < 0 {
            st.acc.advance(self.len_end);
            return Err(FrameError::NegativeLength(frame_length));
        }
        if frame_length as u64 > self.field.max_frame_length {
            return Err(self.enter_discard(st, frame_length as u64));
        }

        let frame_length = frame_length as usize;
        if st.acc.len() < frame_length {
            return Ok(None);
        }

        let strip = self.field.initial_bytes_to_strip;
        if strip > frame_length {
            st.acc.advance(frame_length);
            return Err(FrameError::StripExceedsFrame { frame: frame_length as u64, strip });
        }

        st.acc.advance(strip);
        let frame = st.acc.split_to(frame_length - strip).to_vec();
        Ok(Some(frame))
    }

    /// Oversized frame: drop it whole when fully buffered, otherwise drop
    /// everything buffered and remember how much is still owed.
    fn enter_discard(&self, st: &mut DecodeState, frame_length: u64) -> FrameError {
        st.longest_overflow = st.longest_overflow.max(frame_length);

        let buffered = st.acc.len() as u64;
        if frame_length <= buffered {
            st.acc.advance(frame_length as usize);
        } else {
            st.discarding = true;
            st.bytes_to_discard = frame_length - buffered;
            st.acc.advance(buffered as usize);
        }

        warn!(
            length = frame_length,
            max = self.field.max_frame_length,
            "frame exceeds max length, discarding"
        );
        FrameError::FrameTooLong { length: frame_length, max: self.field.max_frame_length }
    }

    fn unadjusted_length(&self, acc: &BytesMut) -> i64 {
        let off = self.field.length_field_offset;
        let raw = &acc[off..off + self.field.length_field_length];

        match self.field.length_field_length {
            1 => i64::from(raw[0]),
            2 => match self.field.order {
                Endianness::Big => i64::from(u16::from_be_bytes([raw[0], raw[1]])),
                Endianness::Little => i64::from(u16::from_le_bytes([raw[0], raw[1]])),
            },
            // 24-bit fields have no native integer type; assemble by hand.
            3 => match self.field.order {
                Endianness::Big => {
                    i64::from(raw[2]) | i64::from(raw[1]) << 8 | i64::from(raw[0]) << 16
                }
                Endianness::Little => {
                    i64::from(raw[0]) | i64::from(raw[1]) << 8 | i64::from(raw[2]) << 16
                }
            },
            4 => match self.field.order {
                Endianness::Big => i64::from(u32::from_be_bytes(raw.try_into().unwrap())),
                Endianness::Little => i64::from(u32::from_le_bytes(raw.try_into().unwrap())),
            },
            8 => match self.field.order {
                Endianness::Big => i64::from_be_bytes(raw.try_into().unwrap()),
                Endianness::Little => i64::from_le_bytes(raw.try_into().unwrap()),
            },
            _ => unreachable!("width validated in new()"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(dec: &FrameDecoder, buf: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut out = Vec::new();
        dec.decode_with(buf, |f| out.push(f))?;
        Ok(out)
    }

    fn u32_prefixed() -> FrameDecoder {
        FrameDecoder::new(LengthField::new(u64::from(u32::MAX), 0, 4, 0, 0))
    }

    #[test]
    fn half_packet_is_retained_until_complete() {
        let dec = u32_prefixed();

        let frames = feed(&dec, &[0x00, 0x00, 0x00, 0x03, 0x41, 0x42]).unwrap();
        assert!(frames.is_empty());

        let frames = feed(&dec, &[0x43]).unwrap();
        assert_eq!(frames, vec![vec![0x00, 0x00, 0x00, 0x03, 0x41, 0x42, 0x43]]);
    }

    #[test]
    fn rechunking_is_equivalent_to_one_shot() {
        let mut stream = Vec::new();
        for i in 0..20u8 {
            let body: Vec<u8> = (0..i).collect();
            stream.extend_from_slice(&(u32::from(i)).to_be_bytes());
            stream.extend_from_slice(&body);
        }

        let whole = feed(&u32_prefixed(), &stream).unwrap();
        assert_eq!(whole.len(), 20);

        for chunk_size in [1, 2, 3, 7, 16, 64] {
            let dec = u32_prefixed();
            let mut split = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                split.extend(feed(&dec, chunk).unwrap());
            }
            assert_eq!(split, whole, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn oversize_frame_enters_discard_mode_once() {
        let dec = FrameDecoder::new(LengthField::new(16, 0, 4, 0, 0));

        // Declares 32 payload bytes (36 total), only the header arrives.
        let err = feed(&dec, &[0x00, 0x00, 0x00, 0x20]).unwrap_err();
        assert_eq!(err, FrameError::FrameTooLong { length: 36, max: 16 });
        assert_eq!(dec.longest_overflow(), 36);

        // The 32 owed bytes drain silently across feeds.
        assert!(feed(&dec, &[0u8; 20]).unwrap().is_empty());
        assert!(feed(&dec, &[0u8; 12]).unwrap().is_empty());

        // A valid frame right after parses normally.
        let frames = feed(&dec, &[0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB]).unwrap();
        assert_eq!(frames, vec![vec![0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB]]);
    }

    #[test]
    fn oversize_frame_fully_buffered_is_dropped_whole() {
        let dec = FrameDecoder::new(LengthField::new(8, 0, 4, 0, 0));

        let mut input = vec![0x00, 0x00, 0x00, 0x0C];
        input.extend_from_slice(&[0xEE; 12]);
        // Valid frame concatenated right behind the oversized one.
        input.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x7F]);

        let err = feed(&dec, &input).unwrap_err();
        assert_eq!(err, FrameError::FrameTooLong { length: 16, max: 8 });

        // The trailing valid frame survived in the accumulator.
        let frames = feed(&dec, &[]).unwrap();
        assert_eq!(frames, vec![vec![0x00, 0x00, 0x00, 0x01, 0x7F]]);
    }

    #[test]
    fn negative_length_skips_header_bytes() {
        let dec = FrameDecoder::new(LengthField::new(1024, 0, 8, 0, 0));

        let mut input = (-5i64).to_be_bytes().to_vec();
        input.extend_from_slice(&1u64.to_be_bytes());
        input.push(0x42);

        let err = feed(&dec, &input).unwrap_err();
        assert_eq!(err, FrameError::NegativeLength(-5));

        // The stream resynchronizes after the bad header.
        let frames = feed(&dec, &[]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 9);
        assert_eq!(frames[0][8], 0x42);
    }

    #[test]
    fn strip_exceeding_frame_is_fatal_and_skips_frame() {
        let dec = FrameDecoder::new(LengthField::new(1024, 0, 4, 0, 16));

        let err = feed(&dec, &[0x00, 0x00, 0x00, 0x01, 0x11]).unwrap_err();
        assert_eq!(err, FrameError::StripExceedsFrame { frame: 5, strip: 16 });
        assert!(feed(&dec, &[]).unwrap().is_empty());
    }

    #[test]
    fn adjustment_and_strip_cooperate() {
        // HTLV-style geometry: len at offset 2, 1 byte wide, 2 trailing
        // CRC bytes past the counted body.
        let dec = FrameDecoder::new(LengthField::new(255 + 4, 2, 1, 2, 0));

        let input = [0xA2, 0x10, 0x03, 0x01, 0x02, 0x03, 0xBE, 0xEF];
        let frames = feed(&dec, &input).unwrap();
        assert_eq!(frames, vec![input.to_vec()]);
    }

    #[test]
    fn three_byte_width_both_endians() {
        let big = FrameDecoder::new(LengthField::new(1024, 0, 3, 0, 3));
        let frames = feed(&big, &[0x00, 0x00, 0x02, 0xCA, 0xFE]).unwrap();
        assert_eq!(frames, vec![vec![0xCA, 0xFE]]);

        let little = FrameDecoder::new(
            LengthField::new(1024, 0, 3, 0, 3).with_order(Endianness::Little),
        );
        let frames = feed(&little, &[0x02, 0x00, 0x00, 0xCA, 0xFE]).unwrap();
        assert_eq!(frames, vec![vec![0xCA, 0xFE]]);
    }
}
