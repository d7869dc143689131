//! Shared harness for bridge integration tests
//!
//! Provides a scripted client handler, a client-side frame builder/parser
//! built on the crate's own codec primitives, and a scriptable origin
//! connection for failure injection.

#![allow(dead_code)]

use bytes::Bytes;
use h2bridge::bridge::{BridgeConfig, ClientHandler, Http2Bridge};
use h2bridge::h2::codec::FrameCodec;
use h2bridge::h2::frames::{
    DataFrame, FrameFlags, FrameType, HeadersFrame, PingFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
use h2bridge::h2::settings::Settings;
use h2bridge::h2::{ErrorCode, CONNECTION_PREFACE};
use h2bridge::origin::{
    H1Origin, OriginConnection, OriginError, OriginEvent, OriginRequest,
};
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// State shared between a test and its handler
#[derive(Default)]
pub struct Shared {
    pub output: Vec<u8>,
    pub pooled: usize,
    pub connects: usize,
    pub fail_connect: bool,
    pub scripted_origins: VecDeque<Box<dyn OriginConnection>>,
}

pub struct TestHandler {
    shared: Rc<RefCell<Shared>>,
}

impl ClientHandler for TestHandler {
    fn append_output(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.shared.borrow_mut().output.extend_from_slice(data);
        Ok(())
    }

    fn output_len(&self) -> usize {
        self.shared.borrow().output.len()
    }

    fn connect_origin(&mut self) -> h2bridge::origin::Result<Box<dyn OriginConnection>> {
        let mut shared = self.shared.borrow_mut();
        if shared.fail_connect {
            return Err(OriginError::Connect("scripted connect failure".to_string()));
        }
        shared.connects += 1;
        if let Some(origin) = shared.scripted_origins.pop_front() {
            return Ok(origin);
        }
        Ok(Box::new(H1Origin::new()))
    }

    fn pool_origin(&mut self, _conn: Box<dyn OriginConnection>) {
        self.shared.borrow_mut().pooled += 1;
    }

    fn set_upstream_timeouts(&mut self, _read: Duration, _write: Duration) {}

    fn client_scheme(&self) -> &str {
        "https"
    }
}

/// An origin connection that replays a scripted event sequence
pub struct ScriptedOrigin {
    pub events: VecDeque<OriginEvent>,
    stream_id: Option<u32>,
    paused: bool,
}

impl ScriptedOrigin {
    pub fn new(events: Vec<OriginEvent>) -> Self {
        ScriptedOrigin {
            events: events.into(),
            stream_id: None,
            paused: false,
        }
    }
}

impl OriginConnection for ScriptedOrigin {
    fn attach(&mut self, stream_id: u32) -> h2bridge::origin::Result<()> {
        self.stream_id = Some(stream_id);
        Ok(())
    }

    fn detach(&mut self) {
        self.stream_id = None;
    }

    fn attached_stream(&self) -> Option<u32> {
        self.stream_id
    }

    fn push_request_headers(&mut self, _request: &OriginRequest<'_>) -> h2bridge::origin::Result<()> {
        Ok(())
    }

    fn push_upload_data(&mut self, _data: &[u8]) -> h2bridge::origin::Result<()> {
        Ok(())
    }

    fn end_upload_data(&mut self) -> h2bridge::origin::Result<()> {
        Ok(())
    }

    fn on_read(&mut self, _input: &[u8]) -> h2bridge::origin::Result<Vec<OriginEvent>> {
        Ok(self.events.drain(..).collect())
    }

    fn pause_read(&mut self) {
        self.paused = true;
    }

    fn resume_read(&mut self) {
        self.paused = false;
    }

    fn wants_read(&self) -> bool {
        !self.paused
    }

    fn on_connected(&mut self) -> h2bridge::origin::Result<()> {
        Ok(())
    }

    fn rst_error_code(&self) -> Option<ErrorCode> {
        None
    }

    fn take_output(&mut self) -> Bytes {
        Bytes::new()
    }

    fn output_len(&self) -> usize {
        0
    }
}

/// Client-side HPACK state for building requests and reading responses
pub struct TestClient {
    encoder: HpackEncoder<'static>,
    decoder: HpackDecoder<'static>,
}

impl TestClient {
    pub fn new() -> Self {
        TestClient {
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
        }
    }

    /// Connection preface plus an empty client SETTINGS frame
    pub fn preface_and_settings() -> Vec<u8> {
        let mut bytes = CONNECTION_PREFACE.to_vec();
        bytes.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(
            Settings::new(),
        )));
        bytes
    }

    pub fn settings_ack() -> Vec<u8> {
        FrameCodec::encode_settings_frame(&SettingsFrame::ack()).to_vec()
    }

    pub fn headers(
        &mut self,
        stream_id: u32,
        fields: &[(&str, &str)],
        end_stream: bool,
    ) -> Vec<u8> {
        let tuples: Vec<(&[u8], &[u8])> = fields
            .iter()
            .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
            .collect();
        let mut block = Vec::new();
        self.encoder.encode_into(tuples, &mut block).unwrap();
        FrameCodec::encode_headers_frame(&HeadersFrame::new(
            stream_id,
            Bytes::from(block),
            end_stream,
            true,
        ))
        .to_vec()
    }

    pub fn data(stream_id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
        FrameCodec::encode_data_frame(&DataFrame::new(
            stream_id,
            Bytes::copy_from_slice(payload),
            end_stream,
        ))
        .to_vec()
    }

    pub fn rst_stream(stream_id: u32, error_code: ErrorCode) -> Vec<u8> {
        FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
            stream_id,
            error_code,
        })
        .to_vec()
    }

    pub fn ping(data: [u8; 8]) -> Vec<u8> {
        FrameCodec::encode_ping_frame(&PingFrame::new(data)).to_vec()
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Vec<u8> {
        FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(stream_id, increment))
            .to_vec()
    }

    pub fn decode_headers(&mut self, block: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(block)
            .unwrap()
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n).unwrap(),
                    String::from_utf8(v).unwrap(),
                )
            })
            .collect()
    }
}

/// One parsed frame from the bridge's output
#[derive(Debug)]
pub struct Frame {
    pub frame_type: u8,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is(&self, frame_type: FrameType) -> bool {
        self.frame_type == frame_type.as_u8()
    }
}

/// Split a byte run into frames
pub fn parse_frames(bytes: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + 9 <= bytes.len() {
        let mut hdr = [0u8; 9];
        hdr.copy_from_slice(&bytes[pos..pos + 9]);
        let (frame_type, flags, stream_id, length) = FrameCodec::decode_header(&hdr);
        let payload = bytes[pos + 9..pos + 9 + length].to_vec();
        frames.push(Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        });
        pos += 9 + length;
    }
    frames
}

/// RST_STREAM / GOAWAY error code of a frame
pub fn rst_code(frame: &Frame) -> u32 {
    assert!(frame.is(FrameType::RstStream));
    u32::from_be_bytes([
        frame.payload[0],
        frame.payload[1],
        frame.payload[2],
        frame.payload[3],
    ])
}

pub fn goaway_code(frame: &Frame) -> u32 {
    assert!(frame.is(FrameType::Goaway));
    u32::from_be_bytes([
        frame.payload[4],
        frame.payload[5],
        frame.payload[6],
        frame.payload[7],
    ])
}

/// Build a bridge over a scripted handler
pub fn setup_with(config: BridgeConfig) -> (Http2Bridge, Rc<RefCell<Shared>>, TestClient) {
    let shared = Rc::new(RefCell::new(Shared::default()));
    let handler = TestHandler {
        shared: Rc::clone(&shared),
    };
    let bridge = Http2Bridge::new(config, Box::new(handler)).unwrap();
    (bridge, shared, TestClient::new())
}

pub fn setup() -> (Http2Bridge, Rc<RefCell<Shared>>, TestClient) {
    setup_with(BridgeConfig::default())
}

/// Drain and return everything the bridge wrote toward the client
pub fn take_output(shared: &Rc<RefCell<Shared>>) -> Vec<u8> {
    std::mem::take(&mut shared.borrow_mut().output)
}

/// Flush the server SETTINGS and run the client-side settings exchange
pub fn handshake(bridge: &mut Http2Bridge, shared: &Rc<RefCell<Shared>>) {
    bridge.send().unwrap();
    bridge
        .on_read(&TestClient::preface_and_settings())
        .unwrap();
    bridge.on_read(&TestClient::settings_ack()).unwrap();
    take_output(shared);
}

/// The serialized request the origin of `stream_id` has received so far
pub fn origin_wire(bridge: &mut Http2Bridge, stream_id: u32) -> Vec<u8> {
    bridge
        .find_stream_mut(stream_id)
        .and_then(|s| s.origin.as_mut())
        .map(|o| o.take_output().to_vec())
        .unwrap_or_default()
}
