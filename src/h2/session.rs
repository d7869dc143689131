//! Sans-IO HTTP/2 server session
//!
//! The embedded codec consumed by the bridge. Bytes go in through
//! [`H2Session::mem_recv`], frames come out through [`H2Session::mem_send`],
//! and everything the application must react to is reported through the
//! event queue ([`H2Session::poll_event`]).
//!
//! Response bodies are pulled, not pushed: `submit_response` binds a
//! per-stream data source, and `mem_send` asks the [`ResponseSource`] for
//! bytes each time the stream is scheduled. A source that has nothing yet
//! returns [`PullOutcome::Deferred`] and the stream is parked until
//! [`H2Session::resume_data`]. A source may also finish a stream with
//! RST_STREAM instead of END_STREAM, which is how tunnel teardown is made
//! visible to the peer.

use super::codec::{FrameCodec, FRAME_HEADER_SIZE};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlPair;
use super::frames::*;
use super::settings::Settings;
use super::stream::{H2Stream, StreamId, StreamMap};
use super::{CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};
use std::collections::VecDeque;

/// Upper bound for one DATA frame produced by the session
const SEND_CHUNK: usize = 16384;

/// Upper bound for an accumulated HEADERS + CONTINUATION block
const MAX_HEADER_BLOCK: usize = 1024 * 1024;

/// Session tuning flags
///
/// The bridge suppresses both automatic window updates and maintains the
/// windows itself via [`H2Session::submit_window_update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Do not replenish stream receive windows automatically
    pub no_auto_stream_window_update: bool,
    /// Do not replenish the connection receive window automatically
    pub no_auto_connection_window_update: bool,
}

/// Notifications drained by the application after every byte pump
#[derive(Debug)]
pub enum SessionEvent {
    /// A request HEADERS frame opened a new stream
    BeginRequestHeaders { stream_id: StreamId, priority: u32 },
    /// The request header block for a stream is complete
    RequestHeaders {
        stream_id: StreamId,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        end_stream: bool,
    },
    /// A DATA chunk arrived for a stream
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// The peer re-prioritized a stream
    Priority { stream_id: StreamId, priority: u32 },
    /// A SETTINGS frame arrived
    SettingsRecv { ack: bool },
    /// A non-ACK SETTINGS frame of ours reached the wire
    SettingsSent,
    /// The peer tried to push a stream
    PushPromise { promised_stream_id: StreamId },
    /// The peer sent GOAWAY
    GoawayRecv {
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// A stream is gone (RST in either direction, or both sides finished)
    StreamClosed {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// Queued response HEADERS could not be sent (stream vanished first)
    ResponseHeadersNotSent { stream_id: StreamId },
    /// A frame of unknown type arrived and was skipped
    UnknownFrame { raw_type: u8, stream_id: StreamId },
}

/// Outcome of one response data pull
#[derive(Debug)]
pub enum PullOutcome {
    /// `read` bytes were produced; `eof` closes the stream with END_STREAM
    Data { read: usize, eof: bool },
    /// Nothing available; park the stream until `resume_data`
    Deferred,
    /// Finish the stream with RST_STREAM instead of END_STREAM
    Finish(ErrorCode),
    /// Unrecoverable source failure; fatal to the session
    Failure,
}

/// Provider of response body bytes, consulted during `mem_send`
pub trait ResponseSource {
    /// Fill `buf` with up to `buf.len()` bytes for `stream_id`
    fn pull(&mut self, stream_id: StreamId, buf: &mut [u8]) -> PullOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutKind {
    /// Plain control frame
    Control,
    /// Our non-ACK SETTINGS; emits `SettingsSent` once flushed
    SettingsNonAck,
    /// Response HEADERS/CONTINUATION; dropped if the stream vanished
    ResponseHeaders { stream_id: StreamId, first: bool },
    /// RST_STREAM; the stream closes when the frame reaches the wire so
    /// that frames queued before it still go out
    RstStream { stream_id: StreamId, code: ErrorCode },
}

struct OutFrame {
    bytes: Bytes,
    kind: OutKind,
}

struct HeaderBlock {
    stream_id: StreamId,
    end_stream: bool,
    priority: u32,
    block: BytesMut,
}

/// Sans-IO HTTP/2 server session
pub struct H2Session {
    input: BytesMut,
    expect_preface: bool,
    encoder: HpackEncoder<'static>,
    decoder: HpackDecoder<'static>,
    local_settings: Settings,
    remote_settings: Settings,
    conn_flow: FlowControlPair,
    streams: StreamMap,
    events: VecDeque<SessionEvent>,
    outq: VecDeque<OutFrame>,
    sendable: VecDeque<StreamId>,
    continuation: Option<HeaderBlock>,
    last_recv_stream_id: StreamId,
    term: Option<ErrorCode>,
    opts: SessionOptions,
    send_buf: Vec<u8>,
}

impl H2Session {
    /// Create a server-side session
    ///
    /// The session expects the client connection preface before any frame.
    /// No SETTINGS frame is submitted automatically; the application does
    /// that via [`H2Session::submit_settings`].
    pub fn server(opts: SessionOptions) -> Self {
        H2Session {
            input: BytesMut::with_capacity(4096),
            expect_preface: true,
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
            local_settings: Settings::new(),
            remote_settings: Settings::new(),
            conn_flow: FlowControlPair::with_initial_sizes(
                DEFAULT_INITIAL_WINDOW_SIZE,
                DEFAULT_INITIAL_WINDOW_SIZE,
            ),
            streams: StreamMap::new(),
            events: VecDeque::new(),
            outq: VecDeque::new(),
            sendable: VecDeque::new(),
            continuation: None,
            last_recv_stream_id: 0,
            term: None,
            opts,
            send_buf: vec![0; SEND_CHUNK],
        }
    }

    /// Seed the session from an HTTP/1.1 `Upgrade: h2c` handshake
    ///
    /// `settings_payload` is the decoded `HTTP2-Settings` header value,
    /// applied as if the client had sent it in a SETTINGS frame. Stream 1
    /// is opened half-closed (remote): the request was already received
    /// over HTTP/1.1. The connection preface is still expected next.
    pub fn upgrade(&mut self, settings_payload: &[u8]) -> Result<()> {
        let settings = Settings::parse_payload(settings_payload)?;
        self.apply_remote_settings(settings)?;

        let stream = H2Stream::new(
            1,
            self.remote_settings.get_initial_window_size(),
            self.local_settings.get_initial_window_size(),
            true,
        );
        self.streams.insert(stream);
        self.last_recv_stream_id = 1;
        Ok(())
    }

    /// Next pending notification, if any
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Whether the session still wants inbound bytes
    pub fn want_read(&self) -> bool {
        self.term.is_none()
    }

    /// Whether the session has (or may produce) outbound bytes
    pub fn want_write(&self) -> bool {
        if !self.outq.is_empty() {
            return true;
        }
        self.term.is_none() && self.has_schedulable()
    }

    /// Feed inbound bytes; returns the number of bytes consumed
    ///
    /// Partial frames are buffered internally, so the whole span is always
    /// consumed. Errors are fatal to the connection.
    pub fn mem_recv(&mut self, data: &[u8]) -> Result<usize> {
        if self.term.is_some() {
            // Draining after GOAWAY; discard.
            return Ok(data.len());
        }

        self.input.extend_from_slice(data);

        if self.expect_preface {
            if self.input.len() < CONNECTION_PREFACE.len() {
                return Ok(data.len());
            }
            if &self.input[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
                return Err(Error::MissingPreface);
            }
            self.input.advance(CONNECTION_PREFACE.len());
            self.expect_preface = false;
        }

        loop {
            if self.input.len() < FRAME_HEADER_SIZE {
                break;
            }
            let mut hdr = [0u8; FRAME_HEADER_SIZE];
            hdr.copy_from_slice(&self.input[..FRAME_HEADER_SIZE]);
            let (raw_type, flags, stream_id, length) = FrameCodec::decode_header(&hdr);

            if length > self.local_settings.get_max_frame_size() as usize {
                return Err(Error::FrameSize(format!(
                    "frame of {} bytes exceeds SETTINGS_MAX_FRAME_SIZE",
                    length
                )));
            }
            if self.input.len() < FRAME_HEADER_SIZE + length {
                break;
            }

            self.input.advance(FRAME_HEADER_SIZE);
            let payload = self.input.split_to(length).freeze();
            self.process_frame(raw_type, flags, stream_id, payload)?;
        }

        Ok(data.len())
    }

    /// Produce the next outbound byte span, or `None` when idle
    ///
    /// Control frames drain first; then DATA is generated by pulling from
    /// `source`, honoring both flow control windows and the peer's maximum
    /// frame size.
    pub fn mem_send(&mut self, source: &mut dyn ResponseSource) -> Result<Option<Bytes>> {
        while let Some(frame) = self.outq.pop_front() {
            match frame.kind {
                OutKind::Control => return Ok(Some(frame.bytes)),
                OutKind::SettingsNonAck => {
                    self.events.push_back(SessionEvent::SettingsSent);
                    return Ok(Some(frame.bytes));
                }
                OutKind::ResponseHeaders { stream_id, first } => {
                    if self.streams.contains(stream_id) {
                        return Ok(Some(frame.bytes));
                    }
                    // The stream was reset before its response HEADERS
                    // reached the wire.
                    if first {
                        self.events
                            .push_back(SessionEvent::ResponseHeadersNotSent { stream_id });
                    }
                }
                OutKind::RstStream { stream_id, code } => {
                    self.close_stream(stream_id, code);
                    return Ok(Some(frame.bytes));
                }
            }
        }

        if self.term.is_some() {
            return Ok(None);
        }

        let mut rounds = self.sendable.len();
        while rounds > 0 {
            rounds -= 1;
            let Some(stream_id) = self.sendable.pop_front() else {
                break;
            };

            let budget = {
                let Some(stream) = self.streams.get(stream_id) else {
                    continue;
                };
                if !stream.has_response() || stream.is_deferred() || stream.end_sent() {
                    continue;
                }
                let cap = std::cmp::min(
                    SEND_CHUNK,
                    self.remote_settings.get_max_frame_size() as usize,
                );
                let cap = stream.flow().sendable(cap);
                self.conn_flow.sendable(cap)
            };
            if budget == 0 {
                // Flow-control blocked; rescheduled on WINDOW_UPDATE.
                continue;
            }

            match source.pull(stream_id, &mut self.send_buf[..budget]) {
                PullOutcome::Data { read, eof } => {
                    let read = std::cmp::min(read, budget);
                    self.conn_flow.consume_send_window(read);
                    let mut closed = false;
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        stream.send_data(read, eof);
                        closed = stream.state().is_closed();
                    }
                    let frame = FrameCodec::encode_data_frame(&DataFrame::new(
                        stream_id,
                        Bytes::copy_from_slice(&self.send_buf[..read]),
                        eof,
                    ));
                    if eof {
                        if closed {
                            self.close_stream(stream_id, ErrorCode::NoError);
                        }
                    } else {
                        self.schedule(stream_id);
                    }
                    return Ok(Some(frame));
                }
                PullOutcome::Deferred => {
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        stream.set_deferred(true);
                    }
                }
                PullOutcome::Finish(code) => {
                    let frame = FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
                        stream_id,
                        error_code: code,
                    });
                    self.close_stream(stream_id, code);
                    return Ok(Some(frame));
                }
                PullOutcome::Failure => {
                    return Err(Error::Internal(
                        "response data source failure".to_string(),
                    ));
                }
            }
        }

        Ok(None)
    }

    /// Queue a SETTINGS frame carrying `settings`
    pub fn submit_settings(&mut self, settings: Settings) -> Result<()> {
        settings.validate()?;
        self.local_settings.merge(&settings);
        let bytes = FrameCodec::encode_settings_frame(&SettingsFrame::new(settings));
        self.outq.push_back(OutFrame {
            bytes,
            kind: OutKind::SettingsNonAck,
        });
        Ok(())
    }

    /// Queue a WINDOW_UPDATE and replenish the matching receive window
    ///
    /// `stream_id` 0 targets the connection window. Updates for vanished
    /// streams are dropped silently.
    pub fn submit_window_update(&mut self, stream_id: StreamId, increment: u32) -> Result<()> {
        if increment == 0 {
            return Ok(());
        }
        if stream_id == 0 {
            self.conn_flow.apply_window_update(increment)?;
        } else if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.flow_mut().apply_window_update(increment)?;
        } else {
            return Ok(());
        }
        let bytes = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(
            stream_id, increment,
        ));
        self.outq.push_back(OutFrame {
            bytes,
            kind: OutKind::Control,
        });
        Ok(())
    }

    /// Increment for a WINDOW_UPDATE that is due, if any
    ///
    /// `stream_id` 0 queries the connection window. Returns `None` while
    /// the window is still above half of its initial size.
    pub fn pending_window_update(&self, stream_id: StreamId) -> Option<u32> {
        if stream_id == 0 {
            self.conn_flow.pending_window_update()
        } else {
            self.streams.get(stream_id)?.flow().pending_window_update()
        }
    }

    /// Queue RST_STREAM for a stream
    ///
    /// The stream closes when the frame reaches the wire, so that a
    /// response HEADERS frame queued before the reset is still delivered.
    /// Also used for streams this session never opened (refusing a pushed
    /// stream id), so a missing stream is not an error. Repeated resets of
    /// the same stream collapse into one frame.
    pub fn submit_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            if stream.rst_queued() {
                return;
            }
            stream.set_rst_queued();
        }
        let bytes = FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
            stream_id,
            error_code,
        });
        self.outq.push_back(OutFrame {
            bytes,
            kind: OutKind::RstStream {
                stream_id,
                code: error_code,
            },
        });
    }

    /// Submit response headers for a stream and bind its pull data source
    ///
    /// Headers are HPACK-encoded and split across HEADERS + CONTINUATION
    /// frames as needed. If the stream has already vanished, a
    /// [`SessionEvent::ResponseHeadersNotSent`] is queued instead.
    pub fn submit_response(&mut self, stream_id: StreamId, headers: &[(String, String)]) -> Result<()> {
        if !self.streams.contains(stream_id) {
            self.events
                .push_back(SessionEvent::ResponseHeadersNotSent { stream_id });
            return Ok(());
        }

        let mut block = Vec::new();
        let fields: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
            .collect();
        self.encoder
            .encode_into(fields, &mut block)
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;

        let max = self.remote_settings.get_max_frame_size() as usize;
        if block.len() <= max {
            let bytes = FrameCodec::encode_headers_frame(&HeadersFrame::new(
                stream_id,
                Bytes::from(block),
                false,
                true,
            ));
            self.outq.push_back(OutFrame {
                bytes,
                kind: OutKind::ResponseHeaders {
                    stream_id,
                    first: true,
                },
            });
        } else {
            let mut offset = 0;
            let mut first = true;
            while offset < block.len() {
                let end = std::cmp::min(offset + max, block.len());
                let last = end == block.len();
                let fragment = Bytes::copy_from_slice(&block[offset..end]);
                let bytes = if first {
                    FrameCodec::encode_headers_frame(&HeadersFrame::new(
                        stream_id, fragment, false, last,
                    ))
                } else {
                    FrameCodec::encode_continuation_frame(&ContinuationFrame {
                        stream_id,
                        header_block: fragment,
                        end_headers: last,
                    })
                };
                self.outq.push_back(OutFrame {
                    bytes,
                    kind: OutKind::ResponseHeaders { stream_id, first },
                });
                first = false;
                offset = end;
            }
        }

        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.set_has_response();
        }
        self.schedule(stream_id);
        Ok(())
    }

    /// Un-park a deferred stream so `mem_send` pulls from it again
    pub fn resume_data(&mut self, stream_id: StreamId) {
        if let Some(stream) = self.streams.get_mut(stream_id) {
            if stream.has_response() {
                stream.set_deferred(false);
                self.schedule(stream_id);
            }
        }
    }

    /// Queue GOAWAY with `error_code` and stop accepting input
    pub fn terminate(&mut self, error_code: ErrorCode) {
        if self.term.is_some() {
            return;
        }
        self.term = Some(error_code);
        let bytes = FrameCodec::encode_goaway_frame(&GoawayFrame::new(
            self.last_recv_stream_id,
            error_code,
            Bytes::new(),
        ));
        self.outq.push_back(OutFrame {
            bytes,
            kind: OutKind::Control,
        });
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    // ── Frame processing ───────────────────────────────────────────────

    fn process_frame(
        &mut self,
        raw_type: u8,
        flags: FrameFlags,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<()> {
        // A header block in progress admits only its own CONTINUATIONs.
        if let Some(hb) = &self.continuation {
            if raw_type != FrameType::Continuation.as_u8() || stream_id != hb.stream_id {
                return Err(Error::Protocol(
                    "expected CONTINUATION for open header block".to_string(),
                ));
            }
        }

        let Some(frame_type) = FrameType::from_u8(raw_type) else {
            // Unknown frame types are skipped per RFC 7540 Section 4.1.
            self.events
                .push_back(SessionEvent::UnknownFrame { raw_type, stream_id });
            return Ok(());
        };

        match frame_type {
            FrameType::Data => self.recv_data(flags, stream_id, payload),
            FrameType::Headers => self.recv_headers(flags, stream_id, payload),
            FrameType::Continuation => self.recv_continuation(flags, stream_id, payload),
            FrameType::Priority => self.recv_priority(stream_id, payload),
            FrameType::RstStream => self.recv_rst_stream(stream_id, payload),
            FrameType::Settings => self.recv_settings(flags, stream_id, payload),
            FrameType::PushPromise => self.recv_push_promise(flags, payload),
            FrameType::Ping => self.recv_ping(flags, stream_id, payload),
            FrameType::Goaway => self.recv_goaway(payload),
            FrameType::WindowUpdate => self.recv_window_update(stream_id, payload),
        }
    }

    fn recv_data(&mut self, flags: FrameFlags, stream_id: StreamId, payload: Bytes) -> Result<()> {
        if stream_id == 0 {
            return Err(Error::Protocol("DATA on stream 0".to_string()));
        }
        let (start, end) = FrameCodec::strip_padding(&payload, flags)?;

        // The whole payload, padding included, counts against flow control.
        let flow_len = payload.len();
        self.conn_flow.consume_recv_window(flow_len);
        if self.conn_flow.recv_overdrawn() {
            return Err(Error::FlowControl(
                "connection receive window overrun".to_string(),
            ));
        }
        if !self.opts.no_auto_connection_window_update {
            if let Some(increment) = self.conn_flow.pending_window_update() {
                self.conn_flow.apply_window_update(increment)?;
                let bytes = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(
                    0, increment,
                ));
                self.outq.push_back(OutFrame {
                    bytes,
                    kind: OutKind::Control,
                });
            }
        }

        let end_stream = flags.is_end_stream();
        if !self.streams.contains(stream_id) {
            // Stream already reset; the bytes are accounted and dropped.
            return Ok(());
        }

        let mut auto_update = None;
        {
            let stream = self.streams.get_mut(stream_id).expect("checked above");
            stream.receive_data(flow_len, end_stream)?;
            if !self.opts.no_auto_stream_window_update {
                if let Some(increment) = stream.flow().pending_window_update() {
                    stream.flow_mut().apply_window_update(increment)?;
                    auto_update = Some(increment);
                }
            }
        }
        if let Some(increment) = auto_update {
            let bytes = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(
                stream_id, increment,
            ));
            self.outq.push_back(OutFrame {
                bytes,
                kind: OutKind::Control,
            });
        }

        self.events.push_back(SessionEvent::Data {
            stream_id,
            data: payload.slice(start..end),
            end_stream,
        });

        let closed = self
            .streams
            .get(stream_id)
            .map(|s| s.state().is_closed())
            .unwrap_or(false);
        if closed {
            self.close_stream(stream_id, ErrorCode::NoError);
        }
        Ok(())
    }

    fn recv_headers(
        &mut self,
        flags: FrameFlags,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<()> {
        if stream_id == 0 {
            return Err(Error::Protocol("HEADERS on stream 0".to_string()));
        }
        let (start, end) = FrameCodec::strip_padding(&payload, flags)?;

        let mut pos = start;
        let mut priority = 0u32;
        if flags.is_priority() {
            let spec = PrioritySpec::parse(&payload[pos..end]).ok_or_else(|| {
                Error::Protocol("HEADERS PRIORITY flag without priority fields".to_string())
            })?;
            priority = spec.weight as u32;
            pos += 5;
        }

        let fragment = payload.slice(pos..end);
        let end_stream = flags.is_end_stream();

        if flags.is_end_headers() {
            self.finish_header_block(stream_id, &fragment, end_stream, priority)
        } else {
            let mut block = BytesMut::new();
            block.extend_from_slice(&fragment);
            self.continuation = Some(HeaderBlock {
                stream_id,
                end_stream,
                priority,
                block,
            });
            Ok(())
        }
    }

    fn recv_continuation(
        &mut self,
        flags: FrameFlags,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<()> {
        let Some(mut hb) = self.continuation.take() else {
            return Err(Error::Protocol(
                "CONTINUATION without open header block".to_string(),
            ));
        };
        if hb.stream_id != stream_id {
            return Err(Error::Protocol(
                "CONTINUATION on unexpected stream".to_string(),
            ));
        }
        hb.block.extend_from_slice(&payload);
        if hb.block.len() > MAX_HEADER_BLOCK {
            return Err(Error::FrameSize("header block too large".to_string()));
        }

        if flags.is_end_headers() {
            let block = hb.block.freeze();
            self.finish_header_block(hb.stream_id, &block, hb.end_stream, hb.priority)
        } else {
            self.continuation = Some(hb);
            Ok(())
        }
    }

    fn finish_header_block(
        &mut self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        priority: u32,
    ) -> Result<()> {
        // The HPACK state advances even for blocks we end up discarding.
        let decoded = self
            .decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;

        if self.streams.contains(stream_id) {
            // Trailers. Pass-through semantics beyond the state transition
            // are out of scope; the fields are dropped.
            if end_stream {
                let closed = {
                    let stream = self.streams.get_mut(stream_id).expect("checked above");
                    stream.receive_end_stream();
                    stream.state().is_closed()
                };
                if closed {
                    self.close_stream(stream_id, ErrorCode::NoError);
                }
            }
            return Ok(());
        }

        if stream_id % 2 == 0 || stream_id <= self.last_recv_stream_id {
            return Err(Error::Protocol(format!(
                "invalid new stream id {}",
                stream_id
            )));
        }

        if let Some(max) = self.local_settings.get_max_concurrent_streams() {
            if self.streams.len() >= max as usize {
                self.submit_rst_stream(stream_id, ErrorCode::RefusedStream);
                self.last_recv_stream_id = stream_id;
                return Ok(());
            }
        }

        let mut stream = H2Stream::new(
            stream_id,
            self.remote_settings.get_initial_window_size(),
            self.local_settings.get_initial_window_size(),
            end_stream,
        );
        stream.set_priority(priority);
        self.streams.insert(stream);
        self.last_recv_stream_id = stream_id;

        self.events.push_back(SessionEvent::BeginRequestHeaders {
            stream_id,
            priority,
        });
        self.events.push_back(SessionEvent::RequestHeaders {
            stream_id,
            headers: decoded,
            end_stream,
        });
        Ok(())
    }

    fn recv_priority(&mut self, stream_id: StreamId, payload: Bytes) -> Result<()> {
        if payload.len() != 5 {
            return Err(Error::FrameSize("PRIORITY must be 5 bytes".to_string()));
        }
        if stream_id == 0 {
            return Err(Error::Protocol("PRIORITY on stream 0".to_string()));
        }
        let spec = PrioritySpec::parse(&payload).expect("length checked");
        let priority = spec.weight as u32;
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.set_priority(priority);
            self.events
                .push_back(SessionEvent::Priority { stream_id, priority });
        }
        Ok(())
    }

    fn recv_rst_stream(&mut self, stream_id: StreamId, payload: Bytes) -> Result<()> {
        if payload.len() != 4 {
            return Err(Error::FrameSize("RST_STREAM must be 4 bytes".to_string()));
        }
        if stream_id == 0 {
            return Err(Error::Protocol("RST_STREAM on stream 0".to_string()));
        }
        let code = ErrorCode::from_u32(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]));
        if self.streams.contains(stream_id) {
            self.close_stream(stream_id, code);
        }
        Ok(())
    }

    fn recv_settings(
        &mut self,
        flags: FrameFlags,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<()> {
        if stream_id != 0 {
            return Err(Error::Protocol("SETTINGS on nonzero stream".to_string()));
        }
        if flags.is_ack() {
            if !payload.is_empty() {
                return Err(Error::FrameSize(
                    "SETTINGS ACK with non-empty payload".to_string(),
                ));
            }
            self.events
                .push_back(SessionEvent::SettingsRecv { ack: true });
            return Ok(());
        }

        let settings = Settings::parse_payload(&payload)?;
        self.apply_remote_settings(settings)?;

        let bytes = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
        self.outq.push_back(OutFrame {
            bytes,
            kind: OutKind::Control,
        });
        self.events
            .push_back(SessionEvent::SettingsRecv { ack: false });
        // Larger windows or frame sizes may unblock pending sends.
        self.reschedule_all();
        Ok(())
    }

    fn recv_push_promise(&mut self, flags: FrameFlags, payload: Bytes) -> Result<()> {
        let (start, end) = FrameCodec::strip_padding(&payload, flags)?;
        if end - start < 4 {
            return Err(Error::FrameSize("PUSH_PROMISE too short".to_string()));
        }
        let promised = u32::from_be_bytes([
            payload[start],
            payload[start + 1],
            payload[start + 2],
            payload[start + 3],
        ]) & 0x7FFF_FFFF;
        self.events.push_back(SessionEvent::PushPromise {
            promised_stream_id: promised,
        });
        Ok(())
    }

    fn recv_ping(&mut self, flags: FrameFlags, stream_id: StreamId, payload: Bytes) -> Result<()> {
        if stream_id != 0 {
            return Err(Error::Protocol("PING on nonzero stream".to_string()));
        }
        if payload.len() != 8 {
            return Err(Error::FrameSize("PING must be 8 bytes".to_string()));
        }
        if !flags.is_ack() {
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            let bytes = FrameCodec::encode_ping_frame(&PingFrame::ack(data));
            self.outq.push_back(OutFrame {
                bytes,
                kind: OutKind::Control,
            });
        }
        Ok(())
    }

    fn recv_goaway(&mut self, payload: Bytes) -> Result<()> {
        if payload.len() < 8 {
            return Err(Error::FrameSize("GOAWAY too short".to_string()));
        }
        let last_stream_id =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
        let error_code =
            ErrorCode::from_u32(u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]));
        self.events.push_back(SessionEvent::GoawayRecv {
            last_stream_id,
            error_code,
        });
        Ok(())
    }

    fn recv_window_update(&mut self, stream_id: StreamId, payload: Bytes) -> Result<()> {
        if payload.len() != 4 {
            return Err(Error::FrameSize(
                "WINDOW_UPDATE must be 4 bytes".to_string(),
            ));
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
        if increment == 0 {
            return Err(Error::Protocol(
                "WINDOW_UPDATE with zero increment".to_string(),
            ));
        }

        if stream_id == 0 {
            self.conn_flow.increase_send_window(increment)?;
            self.reschedule_all();
        } else if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.flow_mut().increase_send_window(increment)?;
            self.schedule(stream_id);
        }
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────────────────

    fn apply_remote_settings(&mut self, settings: Settings) -> Result<()> {
        if let Some(new_size) = settings.initial_window_size {
            // RFC 7540 Section 6.9.2: adjust all stream send windows by
            // the difference.
            for stream in self.streams.iter_mut() {
                stream
                    .flow_mut()
                    .send_window_mut()
                    .update_initial_size(new_size)?;
            }
        }
        self.remote_settings.merge(&settings);
        Ok(())
    }

    fn close_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if self.streams.remove(stream_id).is_some() {
            self.events.push_back(SessionEvent::StreamClosed {
                stream_id,
                error_code,
            });
        }
    }

    fn schedule(&mut self, stream_id: StreamId) {
        if !self.sendable.contains(&stream_id) {
            self.sendable.push_back(stream_id);
        }
    }

    fn reschedule_all(&mut self) {
        for stream_id in self.streams.ids() {
            let eligible = self
                .streams
                .get(stream_id)
                .map(|s| s.has_response() && !s.is_deferred() && !s.end_sent())
                .unwrap_or(false);
            if eligible {
                self.schedule(stream_id);
            }
        }
    }

    fn has_schedulable(&self) -> bool {
        self.streams
            .ids()
            .iter()
            .filter_map(|id| self.streams.get(*id))
            .any(|s| s.has_response() && !s.is_deferred() && !s.end_sent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::settings::SettingsBuilder;

    /// Source backed by a fixed byte script
    struct ScriptSource {
        data: Vec<u8>,
        complete: bool,
        finish: Option<ErrorCode>,
    }

    impl ResponseSource for ScriptSource {
        fn pull(&mut self, _stream_id: StreamId, buf: &mut [u8]) -> PullOutcome {
            if self.data.is_empty() {
                if let Some(code) = self.finish {
                    return PullOutcome::Finish(code);
                }
                if self.complete {
                    return PullOutcome::Data { read: 0, eof: true };
                }
                return PullOutcome::Deferred;
            }
            let n = std::cmp::min(buf.len(), self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data.drain(..n);
            PullOutcome::Data {
                read: n,
                eof: self.data.is_empty() && self.complete && self.finish.is_none(),
            }
        }
    }

    fn server() -> H2Session {
        H2Session::server(SessionOptions {
            no_auto_stream_window_update: true,
            no_auto_connection_window_update: true,
        })
    }

    fn client_preface_and_settings() -> Vec<u8> {
        let mut bytes = CONNECTION_PREFACE.to_vec();
        let frame = FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new()));
        bytes.extend_from_slice(&frame);
        bytes
    }

    fn client_request(
        encoder: &mut HpackEncoder<'_>,
        stream_id: u32,
        headers: &[(&str, &str)],
        end_stream: bool,
    ) -> Vec<u8> {
        let fields: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
            .collect();
        let mut block = Vec::new();
        encoder.encode_into(fields, &mut block).unwrap();
        FrameCodec::encode_headers_frame(&HeadersFrame::new(
            stream_id,
            Bytes::from(block),
            end_stream,
            true,
        ))
        .to_vec()
    }

    fn drain(session: &mut H2Session) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(ev) = session.poll_event() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn test_preface_then_settings_acked() {
        let mut session = server();
        session
            .mem_recv(&client_preface_and_settings())
            .unwrap();

        let events = drain(&mut session);
        assert!(matches!(
            events[..],
            [SessionEvent::SettingsRecv { ack: false }]
        ));

        // The ACK is queued for sending.
        let mut none = ScriptSource {
            data: vec![],
            complete: false,
            finish: None,
        };
        let frame = session.mem_send(&mut none).unwrap().unwrap();
        assert_eq!(frame[3], FrameType::Settings.as_u8());
        assert_eq!(frame[4], FrameFlags::ACK);
    }

    #[test]
    fn test_bad_preface_is_fatal() {
        let mut session = server();
        let err = session.mem_recv(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_request_headers_events() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        let mut encoder = HpackEncoder::new();
        let bytes = client_request(
            &mut encoder,
            1,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "a.example"),
                (":path", "/x"),
            ],
            true,
        );
        session.mem_recv(&bytes).unwrap();

        let events = drain(&mut session);
        assert!(matches!(
            events[0],
            SessionEvent::BeginRequestHeaders { stream_id: 1, .. }
        ));
        match &events[1] {
            SessionEvent::RequestHeaders {
                stream_id,
                headers,
                end_stream,
            } => {
                assert_eq!(*stream_id, 1);
                assert!(*end_stream);
                assert_eq!(headers.len(), 4);
                assert_eq!(headers[0].0, b":method");
                assert_eq!(headers[0].1, b"GET");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_response_data_and_end_stream() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        let mut encoder = HpackEncoder::new();
        let bytes = client_request(
            &mut encoder,
            1,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "a.example"),
                (":path", "/"),
            ],
            true,
        );
        session.mem_recv(&bytes).unwrap();
        drain(&mut session);

        session
            .submit_response(1, &[(":status".to_string(), "200".to_string())])
            .unwrap();

        let mut source = ScriptSource {
            data: b"hello".to_vec(),
            complete: true,
            finish: None,
        };

        // SETTINGS ACK, then HEADERS, then DATA with END_STREAM.
        let mut frames = Vec::new();
        while let Some(frame) = session.mem_send(&mut source).unwrap() {
            frames.push(frame);
        }
        let types: Vec<u8> = frames.iter().map(|f| f[3]).collect();
        assert_eq!(
            types,
            vec![
                FrameType::Settings.as_u8(),
                FrameType::Headers.as_u8(),
                FrameType::Data.as_u8()
            ]
        );
        let data = frames.last().unwrap();
        assert_eq!(data[4] & FrameFlags::END_STREAM, FrameFlags::END_STREAM);
        assert_eq!(&data[9..], b"hello");

        // Both sides done: the stream is closed.
        let events = drain(&mut session);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::StreamClosed { stream_id: 1, .. })));
        assert_eq!(session.stream_count(), 0);
    }

    #[test]
    fn test_finish_emits_rst_stream() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        let mut encoder = HpackEncoder::new();
        let bytes = client_request(
            &mut encoder,
            1,
            &[
                (":method", "CONNECT"),
                (":authority", "a.example:443"),
            ],
            false,
        );
        session.mem_recv(&bytes).unwrap();
        drain(&mut session);

        session
            .submit_response(1, &[(":status".to_string(), "200".to_string())])
            .unwrap();

        let mut source = ScriptSource {
            data: vec![],
            complete: false,
            finish: Some(ErrorCode::InternalError),
        };
        let mut last = None;
        while let Some(frame) = session.mem_send(&mut source).unwrap() {
            last = Some(frame);
        }
        let frame = last.unwrap();
        assert_eq!(frame[3], FrameType::RstStream.as_u8());
    }

    #[test]
    fn test_deferred_stream_until_resumed() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        let mut encoder = HpackEncoder::new();
        let bytes = client_request(
            &mut encoder,
            1,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "a.example"),
                (":path", "/"),
            ],
            true,
        );
        session.mem_recv(&bytes).unwrap();
        drain(&mut session);

        session
            .submit_response(1, &[(":status".to_string(), "200".to_string())])
            .unwrap();

        let mut source = ScriptSource {
            data: vec![],
            complete: false,
            finish: None,
        };
        while session.mem_send(&mut source).unwrap().is_some() {}
        assert!(!session.want_write());

        // Body arrives: resume and pull again.
        session.resume_data(1);
        let mut source = ScriptSource {
            data: b"late".to_vec(),
            complete: true,
            finish: None,
        };
        let frame = session.mem_send(&mut source).unwrap().unwrap();
        assert_eq!(frame[3], FrameType::Data.as_u8());
        assert_eq!(&frame[9..], b"late");
    }

    #[test]
    fn test_ping_is_acked_internally() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        let ping = FrameCodec::encode_ping_frame(&PingFrame::new([7; 8]));
        session.mem_recv(&ping).unwrap();

        let mut none = ScriptSource {
            data: vec![],
            complete: false,
            finish: None,
        };
        let mut frames = Vec::new();
        while let Some(frame) = session.mem_send(&mut none).unwrap() {
            frames.push(frame);
        }
        let pong = frames
            .iter()
            .find(|f| f[3] == FrameType::Ping.as_u8())
            .unwrap();
        assert_eq!(pong[4], FrameFlags::ACK);
        assert_eq!(&pong[9..17], &[7; 8]);
    }

    #[test]
    fn test_settings_sent_event_fires_on_flush() {
        let mut session = server();
        session
            .submit_settings(
                SettingsBuilder::new()
                    .max_concurrent_streams(100)
                    .initial_window_size(65535)
                    .build()
                    .unwrap(),
            )
            .unwrap();

        assert!(drain(&mut session).is_empty());

        let mut none = ScriptSource {
            data: vec![],
            complete: false,
            finish: None,
        };
        session.mem_send(&mut none).unwrap().unwrap();
        let events = drain(&mut session);
        assert!(matches!(events[..], [SessionEvent::SettingsSent]));
    }

    #[test]
    fn test_terminate_queues_goaway_and_stops_reading() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        session.terminate(ErrorCode::SettingsTimeout);
        assert!(!session.want_read());

        let mut none = ScriptSource {
            data: vec![],
            complete: false,
            finish: None,
        };
        let mut goaway = None;
        while let Some(frame) = session.mem_send(&mut none).unwrap() {
            if frame[3] == FrameType::Goaway.as_u8() {
                goaway = Some(frame);
            }
        }
        let frame = goaway.unwrap();
        let code = u32::from_be_bytes([frame[13], frame[14], frame[15], frame[16]]);
        assert_eq!(code, ErrorCode::SettingsTimeout.as_u32());
        assert!(!session.want_write());
    }

    #[test]
    fn test_upgrade_seeds_stream_one() {
        let mut session = server();
        let payload = SettingsBuilder::new()
            .max_concurrent_streams(50)
            .build()
            .unwrap()
            .encode_payload();
        session.upgrade(&payload).unwrap();
        assert_eq!(session.stream_count(), 1);

        // The preface still arrives after the 101 exchange.
        session.mem_recv(&client_preface_and_settings()).unwrap();
        let events = drain(&mut session);
        assert!(matches!(
            events[..],
            [SessionEvent::SettingsRecv { ack: false }]
        ));
    }

    #[test]
    fn test_rst_stream_closes_stream() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        let mut encoder = HpackEncoder::new();
        let bytes = client_request(
            &mut encoder,
            1,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "a.example"),
                (":path", "/"),
            ],
            false,
        );
        session.mem_recv(&bytes).unwrap();
        drain(&mut session);
        assert_eq!(session.stream_count(), 1);

        let rst = FrameCodec::encode_rst_stream_frame(&RstStreamFrame {
            stream_id: 1,
            error_code: ErrorCode::Cancel,
        });
        session.mem_recv(&rst).unwrap();

        let events = drain(&mut session);
        assert!(matches!(
            events[..],
            [SessionEvent::StreamClosed {
                stream_id: 1,
                error_code: ErrorCode::Cancel
            }]
        ));
        assert_eq!(session.stream_count(), 0);
    }

    #[test]
    fn test_push_promise_reported() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        // PUSH_PROMISE for promised stream 2 on stream 1 (no stream 1
        // needed for the event to be reported).
        let mut payload = vec![0, 0, 0, 2];
        payload.extend_from_slice(&[0x82]); // arbitrary block
        let mut frame = FrameCodec::encode_header(
            FrameType::PushPromise,
            FrameFlags::from_u8(FrameFlags::END_HEADERS),
            1,
            payload.len(),
        )
        .to_vec();
        frame.extend_from_slice(&payload);
        session.mem_recv(&frame).unwrap();

        let events = drain(&mut session);
        assert!(matches!(
            events[..],
            [SessionEvent::PushPromise {
                promised_stream_id: 2
            }]
        ));
    }

    #[test]
    fn test_window_update_unblocks_send() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        // Shrink the peer's advertised window to zero via SETTINGS.
        let small = FrameCodec::encode_settings_frame(&SettingsFrame::new(
            SettingsBuilder::new().initial_window_size(0).build().unwrap(),
        ));
        session.mem_recv(&small).unwrap();
        drain(&mut session);

        let mut encoder = HpackEncoder::new();
        let bytes = client_request(
            &mut encoder,
            1,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "a.example"),
                (":path", "/"),
            ],
            true,
        );
        session.mem_recv(&bytes).unwrap();
        drain(&mut session);

        session
            .submit_response(1, &[(":status".to_string(), "200".to_string())])
            .unwrap();

        let mut source = ScriptSource {
            data: b"x".to_vec(),
            complete: true,
            finish: None,
        };
        // HEADERS and control frames drain, but no DATA: window is zero.
        let mut saw_data = false;
        while let Some(frame) = session.mem_send(&mut source).unwrap() {
            if frame[3] == FrameType::Data.as_u8() {
                saw_data = true;
            }
        }
        assert!(!saw_data);

        // Open the stream window; DATA flows.
        let wu = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(1, 10));
        session.mem_recv(&wu).unwrap();
        let frame = session.mem_send(&mut source).unwrap().unwrap();
        assert_eq!(frame[3], FrameType::Data.as_u8());
    }

    #[test]
    fn test_unknown_frame_skipped() {
        let mut session = server();
        session.mem_recv(&client_preface_and_settings()).unwrap();
        drain(&mut session);

        let mut frame =
            FrameCodec::encode_header(FrameType::Data, FrameFlags::empty(), 0, 3).to_vec();
        frame[3] = 0xfa; // unknown type
        frame.extend_from_slice(b"abc");
        session.mem_recv(&frame).unwrap();

        let events = drain(&mut session);
        assert!(matches!(
            events[..],
            [SessionEvent::UnknownFrame { raw_type: 0xfa, .. }]
        ));
    }
}
