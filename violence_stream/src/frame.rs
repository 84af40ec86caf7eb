use bytes::Bytes;

pub const RGB_CHANNELS: usize = 3;

/// Snapshot of the capture source's pixel buffer, tightly packed RGB8.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB_CHANNELS
    }
}

/// JPEG bytes of one captured frame, ready to be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame(Bytes);

impl EncodedFrame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_dimension_frame_is_empty() {
        assert!(VideoFrame::new(0, 480, vec![]).is_empty());
        assert!(VideoFrame::new(640, 0, vec![]).is_empty());
        assert!(!VideoFrame::new(2, 2, vec![0; 12]).is_empty());
    }

    #[test]
    fn test_expected_len() {
        let frame = VideoFrame::new(4, 3, vec![]);
        assert_eq!(frame.expected_len(), 36);
    }
}
