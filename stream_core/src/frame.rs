use bytes::Bytes;

/// One chunk of raw PCM as delivered by the provider.
///
/// `seq` is assigned locally when the frame enters a relay queue and is never
/// sent over the wire; ordering on the wire is carried by the channel itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub seq: u64,
    pub data: Bytes,
}

impl AudioFrame {
    pub fn new(seq: u64, data: Bytes) -> Self {
        Self { seq, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}
