//! Length-prefixed frame codec.
//!
//! A frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. [`FrameBuffer`] accumulates whatever chunk sizes the
//! socket hands us and yields complete payloads in order, so decoding is
//! independent of how reads were split.

use bytes::{Buf, Bytes, BytesMut};

use super::NetError;
use crate::protocol::Message;

/// Size of the length prefix on every frame.
const LEN_PREFIX_SIZE: usize = 4;

/// Maximum frame body size (100MB) to prevent OOM from malicious/buggy peers.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Serialize a message and prefix it with its body length.
///
/// # Errors
///
/// Returns `NetError::Encode` if serialization fails and
/// `NetError::FrameTooLarge` if the body would exceed [`MAX_FRAME_SIZE`].
pub fn encode(message: &Message) -> Result<Bytes, NetError> {
    let body = serde_json::to_vec(message).map_err(NetError::Encode)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge(body.len()));
    }

    let mut frame = BytesMut::with_capacity(LEN_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Deserialize one frame payload into a message.
///
/// # Errors
///
/// Returns `NetError::Decode` when the payload is not a valid message.
pub fn decode_payload(payload: &[u8]) -> Result<Message, NetError> {
    serde_json::from_slice(payload).map_err(NetError::Decode)
}

/// Accumulator for incoming bytes, extracting complete frame payloads.
///
/// Complete frames are always extracted before control returns to the
/// caller; between calls the buffer holds at most an incomplete frame's
/// worth of bytes.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a buffer with the default [`MAX_FRAME_SIZE`] cap.
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    /// Create a buffer with a custom frame size cap.
    pub fn with_max_frame(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Append a chunk and extract every complete frame payload it finishes.
    ///
    /// Returns payloads in wire order; the returned vector is empty when
    /// more data is still needed. A zero-length frame yields an empty
    /// payload, it is not "no frame yet".
    ///
    /// # Errors
    ///
    /// Returns `NetError::FrameTooLarge` when a declared length exceeds the
    /// cap. The stream is desynced at that point; the caller should drop
    /// the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, NetError> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        while let Some(payload) = self.try_extract()? {
            payloads.push(payload);
        }
        Ok(payloads)
    }

    /// Extract the first complete frame payload, if fully buffered.
    fn try_extract(&mut self) -> Result<Option<Bytes>, NetError> {
        if self.buffer.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let declared =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        if declared > self.max_frame_size {
            return Err(NetError::FrameTooLarge(declared));
        }
        if self.buffer.len() < LEN_PREFIX_SIZE + declared {
            return Ok(None);
        }

        self.buffer.advance(LEN_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(declared).freeze()))
    }

    /// Number of buffered, not-yet-framed bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no partial frame.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any buffered partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(id: u64, contents: &str) -> Message {
        Message::Success {
            request_id: Some(id),
            contents: contents.to_string(),
        }
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let original = request(7, "1+1");
        let frame = encode(&original).unwrap();

        let mut buffer = FrameBuffer::new();
        let payloads = buffer.push(&frame).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(decode_payload(&payloads[0]).unwrap(), original);
        assert!(buffer.is_empty());
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let frame = encode(&Message::Start).unwrap();
        let body_len = frame.len() - 4;
        assert_eq!(&frame[..4], (body_len as u32).to_be_bytes().as_slice());
    }

    #[test]
    fn multiple_frames_in_one_chunk_all_decode() {
        let messages = [Message::Affirm, request(1, "a"), request(2, "b")];
        let mut stream = Vec::new();
        for message in &messages {
            stream.extend_from_slice(&encode(message).unwrap());
        }

        let mut buffer = FrameBuffer::new();
        let payloads = buffer.push(&stream).unwrap();
        assert_eq!(payloads.len(), 3);
        for (payload, expected) in payloads.iter().zip(&messages) {
            assert_eq!(&decode_payload(payload).unwrap(), expected);
        }
    }

    #[test]
    fn decoding_is_chunk_boundary_independent() {
        let messages = [request(1, "first"), Message::Affirm, request(2, "second")];
        let mut stream = Vec::new();
        for message in &messages {
            stream.extend_from_slice(&encode(message).unwrap());
        }

        // Whole stream at once.
        let mut whole = FrameBuffer::new();
        let expected: Vec<Message> = whole
            .push(&stream)
            .unwrap()
            .iter()
            .map(|p| decode_payload(p).unwrap())
            .collect();

        // One byte at a time.
        let mut trickle = FrameBuffer::new();
        let mut got = Vec::new();
        for byte in &stream {
            for payload in trickle.push(&[*byte]).unwrap() {
                got.push(decode_payload(&payload).unwrap());
            }
        }
        assert_eq!(got, expected);

        // Awkward mid-prefix split.
        let mut split = FrameBuffer::new();
        let mut got = Vec::new();
        for chunk in stream.chunks(7) {
            for payload in split.push(chunk).unwrap() {
                got.push(decode_payload(&payload).unwrap());
            }
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn zero_length_frame_is_an_empty_payload_not_incomplete() {
        let mut buffer = FrameBuffer::new();
        let payloads = buffer.push(&0u32.to_be_bytes()).unwrap();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_prefix_waits_for_more_data() {
        let frame = encode(&Message::Check).unwrap();
        let mut buffer = FrameBuffer::new();

        assert!(buffer.push(&frame[..2]).unwrap().is_empty());
        assert_eq!(buffer.len(), 2);

        let payloads = buffer.push(&frame[2..]).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(decode_payload(&payloads[0]).unwrap(), Message::Check);
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let mut buffer = FrameBuffer::with_max_frame(1024);
        let err = buffer.push(&4096u32.to_be_bytes()).unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge(4096)));
    }

    #[test]
    fn clear_drops_a_partial_frame() {
        let frame = encode(&request(9, "leftover")).unwrap();
        let mut buffer = FrameBuffer::new();
        buffer.push(&frame[..frame.len() - 1]).unwrap();
        assert!(!buffer.is_empty());

        buffer.clear();
        assert!(buffer.is_empty());

        // The buffer is usable again after a clear.
        let payloads = buffer.push(&encode(&Message::Affirm).unwrap()).unwrap();
        assert_eq!(decode_payload(&payloads[0]).unwrap(), Message::Affirm);
    }
}
