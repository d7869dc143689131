//! Bridge session: driver, frame event handlers, timers
//!
//! [`Http2Bridge`] owns the codec session, the stream table and the client
//! handler. The external loop feeds it client bytes (`on_read`), write
//! readiness (`on_write`), origin relay events (see `relay`), and the
//! timer poll. All per-stream failure handling happens inside; only
//! session-fatal conditions surface as [`BridgeError`].

use super::response::infer_origin_rst_code;
use super::stream::{RequestState, ResponseState, Stream, StreamTable};
use super::validate::{self, ValidationError};
use super::{BridgeConfig, BridgeError, ClientHandler, Result, OUTBUF_MAX_THRES};
use crate::h2::{
    ErrorCode, H2Session, PullOutcome, ResponseSource, SessionEvent, SessionOptions,
    SettingsBuilder, DEFAULT_INITIAL_WINDOW_SIZE,
};
use crate::origin::OriginRequest;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// SETTINGS ACK must arrive within this long of submission
pub const SETTINGS_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) struct Core {
    pub(super) config: BridgeConfig,
    pub(super) streams: StreamTable,
    pub(super) settings_deadline: Option<Instant>,
    pub(super) flow_control: bool,
    /// Streams whose origin reads should resume after the send loop
    pub(super) resume_pending: Vec<u32>,
}

/// The HTTP/2 upstream bridge for one client connection
pub struct Http2Bridge {
    pub(super) codec: H2Session,
    pub(super) core: Core,
    pub(super) handler: Box<dyn ClientHandler>,
}

/// Pull adapter feeding stream response buffers into the codec
struct BodySource<'a> {
    core: &'a mut Core,
    outbuf_len: usize,
}

impl ResponseSource for BodySource<'_> {
    fn pull(&mut self, stream_id: u32, buf: &mut [u8]) -> PullOutcome {
        let mut resume = false;
        let outcome = {
            let Some(stream) = self.core.streams.find_mut(stream_id) else {
                return PullOutcome::Failure;
            };

            let n = std::cmp::min(buf.len(), stream.response_body.len());
            buf[..n].copy_from_slice(&stream.response_body[..n]);
            let _ = stream.response_body.split_to(n);

            if n == 0 && stream.response_state == ResponseState::MsgComplete {
                if stream.upgraded {
                    // Tunnels finish with RST_STREAM so teardown is
                    // visible to the peer.
                    let code = stream
                        .response_rst_error_code
                        .unwrap_or(ErrorCode::NoError);
                    PullOutcome::Finish(infer_origin_rst_code(code))
                } else {
                    PullOutcome::Data { read: 0, eof: true }
                }
            } else {
                // Resume origin reads before the buffer runs dry to avoid
                // an RTT of idle.
                if self.outbuf_len + stream.response_body.len() < OUTBUF_MAX_THRES {
                    resume = true;
                }
                if n == 0 {
                    PullOutcome::Deferred
                } else {
                    PullOutcome::Data { read: n, eof: false }
                }
            }
        };
        if resume {
            self.core.resume_pending.push(stream_id);
        }
        outcome
    }
}

impl Http2Bridge {
    /// Create a bridge session over a client handler
    ///
    /// Submits the initial SETTINGS {MAX_CONCURRENT_STREAMS,
    /// INITIAL_WINDOW_SIZE} and, when the configured connection window
    /// exceeds 16 bits, a connection-level WINDOW_UPDATE for the delta
    /// over the protocol default.
    pub fn new(config: BridgeConfig, mut handler: Box<dyn ClientHandler>) -> Result<Self> {
        handler.set_upstream_timeouts(
            config.upstream_read_timeout,
            config.upstream_write_timeout,
        );

        let mut codec = H2Session::server(SessionOptions {
            no_auto_stream_window_update: true,
            no_auto_connection_window_update: true,
        });

        codec.submit_settings(
            SettingsBuilder::new()
                .max_concurrent_streams(config.max_concurrent_streams)
                .initial_window_size(config.initial_window_size())
                .build()?,
        )?;

        if config.connection_window_bits > 16 {
            let delta = config.connection_window_size() - DEFAULT_INITIAL_WINDOW_SIZE;
            codec.submit_window_update(0, delta)?;
        }

        Ok(Http2Bridge {
            codec,
            core: Core {
                config,
                streams: StreamTable::new(),
                settings_deadline: None,
                flow_control: true,
                resume_pending: Vec::new(),
            },
            handler,
        })
    }

    /// Look up a stream
    pub fn find_stream(&self, stream_id: u32) -> Option<&Stream> {
        self.core.streams.find(stream_id)
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.core.streams.len()
    }

    /// Access the client handler
    pub fn handler(&self) -> &dyn ClientHandler {
        &*self.handler
    }

    // ── Session driver ─────────────────────────────────────────────────

    /// Feed bytes read from the client socket
    ///
    /// Returns the number of bytes consumed (always the whole span). A
    /// returned error is session-fatal: the caller tears down the client.
    pub fn on_read(&mut self, input: &[u8]) -> Result<usize> {
        let n = self.codec.mem_recv(input)?;
        self.send()?;
        Ok(n)
    }

    /// The client socket became writable
    pub fn on_write(&mut self) -> Result<()> {
        self.send()
    }

    /// Pump codec output into the client output buffer
    ///
    /// Stops once the output buffer crosses `OUTBUF_MAX_THRES`. Returns
    /// [`BridgeError::SessionEnd`] when the codec wants neither read nor
    /// write and nothing remains buffered.
    pub fn send(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;
            while self.handler.output_len() <= OUTBUF_MAX_THRES {
                let frame = {
                    let outbuf_len = self.handler.output_len();
                    let mut source = BodySource {
                        core: &mut self.core,
                        outbuf_len,
                    };
                    self.codec.mem_send(&mut source)?
                };
                match frame {
                    Some(bytes) => {
                        self.handler
                            .append_output(&bytes)
                            .map_err(BridgeError::Output)?;
                        progressed = true;
                    }
                    None => break,
                }
            }

            let handled = self.dispatch_events()?;
            self.apply_pending_resumes();
            if !progressed && handled == 0 {
                break;
            }
        }

        if !self.codec.want_read() && !self.codec.want_write() && self.handler.output_len() == 0 {
            debug!("no more read/write for this HTTP/2 session");
            return Err(BridgeError::SessionEnd);
        }
        Ok(())
    }

    /// Reopen client-side flow control windows for a stream and pump
    ///
    /// Called when the origin's output buffer drained; both the connection
    /// window and the stream window are recomputed.
    pub fn resume_read(&mut self, stream_id: u32) -> Result<()> {
        if self.core.flow_control {
            if let Some(increment) = self.codec.pending_window_update(0) {
                self.codec.submit_window_update(0, increment)?;
            }
            if let Some(increment) = self.codec.pending_window_update(stream_id) {
                self.codec.submit_window_update(stream_id, increment)?;
            }
        }
        self.send()
    }

    // ── Timers ─────────────────────────────────────────────────────────

    /// Deadline the external loop must call [`Http2Bridge::handle_timeout`]
    /// at, if any
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.core.settings_deadline
    }

    /// Fire due timers
    ///
    /// A SETTINGS ACK overdue at `now` terminates the session with
    /// SETTINGS_TIMEOUT; the resulting GOAWAY is pumped out before this
    /// returns.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        let Some(deadline) = self.core.settings_deadline else {
            return Ok(());
        };
        if now < deadline {
            return Ok(());
        }
        info!("SETTINGS timeout");
        self.core.settings_deadline = None;
        self.codec.terminate(ErrorCode::SettingsTimeout);
        self.send()
    }

    // ── Frame event handlers ───────────────────────────────────────────

    fn dispatch_events(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Some(event) = self.codec.poll_event() {
            self.handle_event(event)?;
            handled += 1;
        }
        Ok(handled)
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::BeginRequestHeaders {
                stream_id,
                priority,
            } => {
                debug!(stream_id, "received upstream request HEADERS");
                self.core.streams.insert(Stream::new(stream_id, priority));
                Ok(())
            }
            SessionEvent::RequestHeaders {
                stream_id,
                headers,
                end_stream,
            } => self.on_request_headers(stream_id, headers, end_stream),
            SessionEvent::Data {
                stream_id,
                data,
                end_stream,
            } => {
                self.on_request_data(stream_id, &data, end_stream);
                Ok(())
            }
            SessionEvent::Priority {
                stream_id,
                priority,
            } => {
                if let Some(stream) = self.core.streams.find_mut(stream_id) {
                    stream.set_priority(priority);
                }
                Ok(())
            }
            SessionEvent::SettingsRecv { ack } => {
                if ack {
                    debug!("SETTINGS ACK received; stopping timer");
                    self.core.settings_deadline = None;
                }
                Ok(())
            }
            SessionEvent::SettingsSent => {
                // Armed once; a second submission before the first ACK
                // does not restart the clock.
                if self.core.settings_deadline.is_none() {
                    self.core.settings_deadline = Some(Instant::now() + SETTINGS_TIMEOUT);
                }
                Ok(())
            }
            SessionEvent::PushPromise { promised_stream_id } => {
                // This bridge never accepts server push toward the client.
                self.codec
                    .submit_rst_stream(promised_stream_id, ErrorCode::RefusedStream);
                Ok(())
            }
            SessionEvent::ResponseHeadersNotSent { stream_id } => {
                warn!(stream_id, "response HEADERS could not be sent");
                if self.core.streams.find(stream_id).is_some() {
                    self.codec
                        .submit_rst_stream(stream_id, ErrorCode::InternalError);
                }
                Ok(())
            }
            SessionEvent::StreamClosed { stream_id, .. } => {
                self.on_stream_close(stream_id);
                Ok(())
            }
            SessionEvent::GoawayRecv {
                last_stream_id,
                error_code,
            } => {
                debug!(last_stream_id, %error_code, "client sent GOAWAY");
                Ok(())
            }
            SessionEvent::UnknownFrame { raw_type, .. } => {
                debug!(frame_type = raw_type, "received unknown control frame");
                Ok(())
            }
        }
    }

    /// Request header block complete: ingest, validate, connect the origin
    fn on_request_headers(
        &mut self,
        stream_id: u32,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        end_stream: bool,
    ) -> Result<()> {
        let max_sum = self.core.config.max_headers_sum;
        let http2_proxy = self.core.config.http2_proxy;

        let mut too_large = false;
        {
            let Some(stream) = self.core.streams.find_mut(stream_id) else {
                return Ok(());
            };
            for (name, value) in &headers {
                if stream.request_headers_sum > max_sum {
                    too_large = true;
                    break;
                }
                if !validate::check_nv(name, value) {
                    // Invalid pairs are dropped, never fatal.
                    continue;
                }
                let (Ok(name), Ok(value)) =
                    (std::str::from_utf8(name), std::str::from_utf8(value))
                else {
                    continue;
                };
                stream.append_request_header(name, value);
            }
        }
        if too_large {
            info!(stream_id, "request header block too large");
            self.codec
                .submit_rst_stream(stream_id, ErrorCode::InternalError);
            return Ok(());
        }

        let validated: std::result::Result<validate::RequestParts, ValidationError> = {
            let Some(stream) = self.core.streams.find(stream_id) else {
                return Ok(());
            };
            validate::validate_request(&stream.request_headers, end_stream, http2_proxy)
        };
        let parts = match validated {
            Ok(parts) => parts,
            Err(violation) => {
                info!(stream_id, %violation, "rejecting request");
                self.codec
                    .submit_rst_stream(stream_id, ErrorCode::ProtocolError);
                return Ok(());
            }
        };

        if let Some(stream) = self.core.streams.find_mut(stream_id) {
            stream.method = parts.method;
            stream.scheme = parts.scheme;
            stream.authority = parts.authority;
            stream.path = parts.path;
        }

        // Obtain and attach an origin connection for this request.
        let mut origin = match self.handler.connect_origin() {
            Ok(origin) => origin,
            Err(err) => {
                warn!(stream_id, error = %err, "origin connect failed");
                self.codec
                    .submit_rst_stream(stream_id, ErrorCode::InternalError);
                if let Some(stream) = self.core.streams.find_mut(stream_id) {
                    stream.request_state = RequestState::ConnectFail;
                }
                return Ok(());
            }
        };
        if let Err(err) = origin.attach(stream_id) {
            warn!(stream_id, error = %err, "origin attach failed");
            self.codec
                .submit_rst_stream(stream_id, ErrorCode::InternalError);
            if let Some(stream) = self.core.streams.find_mut(stream_id) {
                stream.request_state = RequestState::ConnectFail;
            }
            return Ok(());
        }

        let pushed = {
            let Some(stream) = self.core.streams.find(stream_id) else {
                return Ok(());
            };
            let regular = stream.regular_request_headers();
            let request = OriginRequest {
                method: &stream.method,
                authority: stream.request_authority(),
                path: &stream.path,
                headers: &regular,
            };
            origin.push_request_headers(&request)
        };
        if let Err(err) = pushed {
            warn!(stream_id, error = %err, "pushing request headers failed");
            self.codec
                .submit_rst_stream(stream_id, ErrorCode::InternalError);
            return Ok(());
        }

        if let Some(stream) = self.core.streams.find_mut(stream_id) {
            stream.origin = Some(origin);
            stream.request_state = if end_stream {
                RequestState::MsgComplete
            } else {
                RequestState::HeaderComplete
            };
        }
        Ok(())
    }

    /// Forward an upload chunk to the origin
    fn on_request_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        let mut failed = false;
        {
            let Some(stream) = self.core.streams.find_mut(stream_id) else {
                return;
            };
            if let Some(origin) = stream.origin.as_mut() {
                if !data.is_empty() && origin.push_upload_data(data).is_err() {
                    failed = true;
                }
                if !failed && end_stream && origin.end_upload_data().is_err() {
                    failed = true;
                }
            }
            if !failed && end_stream {
                stream.request_state = RequestState::MsgComplete;
            }
        }
        if failed {
            warn!(stream_id, "origin upload write failed");
            self.codec
                .submit_rst_stream(stream_id, ErrorCode::InternalError);
        }
    }

    /// The codec closed a stream: tear down or pool the origin side
    fn on_stream_close(&mut self, stream_id: u32) {
        debug!(stream_id, "stream is being closed");
        let Some(stream) = self.core.streams.find_mut(stream_id) else {
            return;
        };

        if stream.request_state == RequestState::ConnectFail {
            // Nothing origin-side to detach.
            self.core.streams.remove(stream_id);
            return;
        }

        stream.request_state = RequestState::StreamClosed;
        let poolable = stream.response_state == ResponseState::MsgComplete
            && !stream.upgraded
            && !stream.response_connection_close;

        if poolable {
            if let Some(mut origin) = stream.origin.take() {
                origin.detach();
                self.handler.pool_origin(origin);
            }
        }
        // In every other subcase the origin, if still attached, is dropped
        // with the stream rather than pooled.
        self.core.streams.remove(stream_id);
    }

    fn apply_pending_resumes(&mut self) {
        let pending = std::mem::take(&mut self.core.resume_pending);
        for stream_id in pending {
            if let Some(stream) = self.core.streams.find_mut(stream_id) {
                if let Some(origin) = stream.origin.as_mut() {
                    origin.resume_read();
                }
            }
        }
    }

    /// Look up a stream mutably
    pub fn find_stream_mut(&mut self, stream_id: u32) -> Option<&mut Stream> {
        self.core.streams.find_mut(stream_id)
    }
}
