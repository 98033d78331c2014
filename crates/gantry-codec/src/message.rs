/// One application message, as extracted from the wire.
///
/// `data_len` always equals `data.len()`; the setters keep the two in
/// sync. `raw_data` carries the frame bytes as they arrived, before any
/// decoder interceptor rewrote `data` (for the default TLV pipeline the
/// raw frame still contains the 8-byte header).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    id: u32,
    data_len: u32,
    data: Vec<u8>,
    raw_data: Vec<u8>,
}

impl Message {
    /// Builds a message straight from frame bytes; `data` and `raw_data`
    /// both carry the frame.
    pub fn from_frame(frame: Vec<u8>) -> Self {
        Self { id: 0, data_len: frame.len() as u32, data: frame.clone(), raw_data: frame }
    }

    pub fn with_id(id: u32, data: Vec<u8>) -> Self {
        Self { id, data_len: data.len() as u32, raw_data: data.clone(), data }
    }

    /// Header-only message: `id` and `data_len` set, payload not yet read.
    pub fn header_only(id: u32, data_len: u32) -> Self {
        Self { id, data_len, data: Vec::new(), raw_data: Vec::new() }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    #[inline]
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data_len = data.len() as u32;
        self.data = data;
    }

    #[inline]
    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }
}
