//! HTTP/2 frame encoding and decoding
//!
//! Low-level frame construction and header parsing shared by the session
//! and by tests that need to craft raw frames.

use super::error::{Error, Result};
use super::frames::*;
use bytes::{BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header into a buffer
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        // Type (8 bits)
        header[3] = frame_type.as_u8();

        // Flags (8 bits)
        header[4] = flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFF_FFFF;
        header[5] = ((stream_id >> 24) & 0xFF) as u8;
        header[6] = ((stream_id >> 16) & 0xFF) as u8;
        header[7] = ((stream_id >> 8) & 0xFF) as u8;
        header[8] = (stream_id & 0xFF) as u8;

        header
    }

    /// Decode a frame header from bytes
    ///
    /// The frame type is returned raw so that unknown types can be skipped
    /// rather than rejected.
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, u32, usize) {
        // Length (24 bits, big-endian)
        let length =
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);

        let raw_type = bytes[3];
        let flags = FrameFlags::from_u8(bytes[4]);

        // Stream ID (31 bits, ignore reserved bit)
        let stream_id = ((bytes[5] as u32 & 0x7F) << 24)
            | ((bytes[6] as u32) << 16)
            | ((bytes[7] as u32) << 8)
            | (bytes[8] as u32);

        (raw_type, flags, stream_id, length)
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.data.len());

        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let header =
            Self::encode_header(FrameType::Data, flags, frame.stream_id, frame.data.len());
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }

        let header = Self::encode_header(FrameType::Headers, flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        if let Some(priority) = &frame.priority {
            let mut dep = priority.stream_dependency;
            if priority.exclusive {
                dep |= 0x8000_0000;
            }
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }

        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let header = Self::encode_header(
            FrameType::Continuation,
            flags,
            frame.stream_id,
            frame.header_block.len(),
        );
        buf.put_slice(&header);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let settings_data = if frame.ack {
            Vec::new()
        } else {
            frame.settings.encode_payload()
        };

        // Stream ID must be 0 for SETTINGS
        let header = Self::encode_header(FrameType::Settings, flags, 0, settings_data.len());
        buf.put_slice(&header);
        buf.put_slice(&settings_data);

        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        // Stream ID must be 0 for PING, payload is always 8 bytes
        let header = Self::encode_header(FrameType::Ping, flags, 0, 8);
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let payload_len = 8 + frame.debug_data.len();

        // Stream ID must be 0 for GOAWAY
        let header = Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len);
        buf.put_slice(&header);
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);

        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header =
            Self::encode_header(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_slice(&header);
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);

        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header =
            Self::encode_header(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_slice(&header);
        buf.put_u32(frame.error_code.as_u32());

        buf.freeze()
    }

    /// Strip the padding envelope from a DATA or HEADERS payload
    ///
    /// Returns the unpadded slice bounds. The pad length byte itself and
    /// the trailing padding are flow-controlled but carry no data.
    pub fn strip_padding(payload: &[u8], flags: FrameFlags) -> Result<(usize, usize)> {
        if !flags.is_padded() {
            return Ok((0, payload.len()));
        }
        if payload.is_empty() {
            return Err(Error::Protocol("PADDED frame with no pad length".into()));
        }
        let pad_len = payload[0] as usize;
        let body = payload.len() - 1;
        if pad_len > body {
            return Err(Error::Protocol(format!(
                "Pad length {} exceeds payload {}",
                pad_len, body
            )));
        }
        Ok((1, payload.len() - pad_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::error::ErrorCode;
    use crate::h2::settings::SettingsBuilder;

    #[test]
    fn test_encode_decode_header() {
        let frame_type = FrameType::Headers;
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);
        let stream_id = 42;
        let length = 1234;

        let header = FrameCodec::encode_header(frame_type, flags, stream_id, length);
        let (decoded_type, decoded_flags, decoded_id, decoded_len) =
            FrameCodec::decode_header(&header);

        assert_eq!(decoded_type, frame_type.as_u8());
        assert_eq!(decoded_flags.as_u8(), flags.as_u8());
        assert_eq!(decoded_id, stream_id);
        assert_eq!(decoded_len, length);
    }

    #[test]
    fn test_encode_data_frame() {
        let frame = DataFrame::new(1, Bytes::from("Hello"), true);
        let encoded = FrameCodec::encode_data_frame(&frame);

        assert_eq!(encoded[0..3], [0, 0, 5]);
        assert_eq!(encoded[3], FrameType::Data.as_u8());
        assert_eq!(encoded[4], FrameFlags::END_STREAM);
        assert_eq!(&encoded[5..9], &[0, 0, 0, 1]);
        assert_eq!(&encoded[9..], b"Hello");
    }

    #[test]
    fn test_encode_settings_frame() {
        let settings = SettingsBuilder::new()
            .header_table_size(8192)
            .enable_push(false)
            .initial_window_size(65535)
            .build()
            .unwrap();

        let frame = SettingsFrame::new(settings);
        let encoded = FrameCodec::encode_settings_frame(&frame);

        assert_eq!(encoded[3], FrameType::Settings.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 0]);

        // 3 settings * 6 bytes = 18 bytes payload
        assert_eq!(encoded[0..3], [0, 0, 18]);
    }

    #[test]
    fn test_encode_settings_ack() {
        let frame = SettingsFrame::ack();
        let encoded = FrameCodec::encode_settings_frame(&frame);

        assert_eq!(encoded[0..3], [0, 0, 0]);
        assert_eq!(encoded[4], FrameFlags::ACK);
    }

    #[test]
    fn test_encode_rst_stream() {
        let frame = RstStreamFrame {
            stream_id: 7,
            error_code: ErrorCode::RefusedStream,
        };
        let encoded = FrameCodec::encode_rst_stream_frame(&frame);

        assert_eq!(encoded[3], FrameType::RstStream.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 7]);
        assert_eq!(
            u32::from_be_bytes([encoded[9], encoded[10], encoded[11], encoded[12]]),
            ErrorCode::RefusedStream.as_u32()
        );
    }

    #[test]
    fn test_encode_goaway() {
        let frame = GoawayFrame::new(5, ErrorCode::SettingsTimeout, Bytes::new());
        let encoded = FrameCodec::encode_goaway_frame(&frame);

        assert_eq!(encoded[3], FrameType::Goaway.as_u8());
        assert_eq!(encoded[0..3], [0, 0, 8]);
        assert_eq!(&encoded[9..13], &[0, 0, 0, 5]);
        assert_eq!(
            u32::from_be_bytes([encoded[13], encoded[14], encoded[15], encoded[16]]),
            ErrorCode::SettingsTimeout.as_u32()
        );
    }

    #[test]
    fn test_encode_window_update() {
        let frame = WindowUpdateFrame::new(42, 1000);
        let encoded = FrameCodec::encode_window_update_frame(&frame);

        assert_eq!(encoded[0..3], [0, 0, 4]);
        assert_eq!(encoded[3], FrameType::WindowUpdate.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 42]);

        let increment = u32::from_be_bytes([encoded[9], encoded[10], encoded[11], encoded[12]]);
        assert_eq!(increment, 1000);
    }

    #[test]
    fn test_strip_padding() {
        let flags = FrameFlags::from_u8(FrameFlags::PADDED);
        // pad length 3, data "ab", padding "xxx"
        let payload = [3u8, b'a', b'b', 0, 0, 0];
        let (start, end) = FrameCodec::strip_padding(&payload, flags).unwrap();
        assert_eq!(&payload[start..end], b"ab");

        // pad length exceeding the payload is a protocol error
        let bad = [9u8, b'a'];
        assert!(FrameCodec::strip_padding(&bad, flags).is_err());

        // unpadded payloads come back whole
        let (start, end) =
            FrameCodec::strip_padding(b"hello", FrameFlags::empty()).unwrap();
        assert_eq!((start, end), (0, 5));
    }
}
