//! Origin relay
//!
//! The external loop drives these entry points for each origin socket:
//! [`Http2Bridge::on_origin_read`] when origin bytes arrive,
//! [`Http2Bridge::on_origin_write`] when the origin output buffer drains,
//! and [`Http2Bridge::on_origin_event`] for transport-level events. Origin
//! failures become stream resets or synthesized error replies; only
//! client-side failures are fatal.

use super::response::infer_origin_rst_code;
use super::session::Http2Bridge;
use super::stream::{RequestState, ResponseState};
use super::Result;
use crate::h2::ErrorCode;
use crate::http::Status;
use crate::origin::{OriginEvent, OriginIoEvent};
use tracing::{debug, info, warn};

enum ReadAction {
    /// Client already closed the stream: no consumer, destroy
    Destroy,
    /// Origin cancelled earlier: reset toward the client
    Reset,
    /// Run the origin response parser
    Parse,
}

impl Http2Bridge {
    /// Bytes arrived from a stream's origin connection
    pub fn on_origin_read(&mut self, stream_id: u32, input: &[u8]) -> Result<()> {
        let action = {
            let Some(stream) = self.core.streams.find(stream_id) else {
                return Ok(());
            };
            if stream.request_state == RequestState::StreamClosed {
                ReadAction::Destroy
            } else if stream.response_state == ResponseState::MsgReset {
                ReadAction::Reset
            } else {
                ReadAction::Parse
            }
        };

        match action {
            ReadAction::Destroy => {
                // The client closed its end; the origin connection goes
                // down with the stream.
                debug!(stream_id, "origin data with stream closed; dropping stream");
                self.core.streams.remove(stream_id);
                return Ok(());
            }
            ReadAction::Reset => {
                let code = self
                    .core
                    .streams
                    .find(stream_id)
                    .and_then(|s| s.response_rst_error_code)
                    .unwrap_or(ErrorCode::NoError);
                self.codec
                    .submit_rst_stream(stream_id, infer_origin_rst_code(code));
                if let Some(stream) = self.core.streams.find_mut(stream_id) {
                    stream.origin = None;
                }
                // The stream itself is destroyed via stream close.
            }
            ReadAction::Parse => {
                let parsed = {
                    let Some(stream) = self.core.streams.find_mut(stream_id) else {
                        return Ok(());
                    };
                    match stream.origin.as_mut() {
                        Some(origin) => origin.on_read(input),
                        None => Ok(Vec::new()),
                    }
                };
                match parsed {
                    Ok(events) => {
                        for event in events {
                            self.handle_origin_event(stream_id, event)?;
                        }
                    }
                    Err(err) => {
                        info!(stream_id, error = %err, "origin response parse failure");
                        match self.core.streams.find(stream_id).map(|s| s.response_state) {
                            Some(ResponseState::HeaderComplete) => {
                                self.codec
                                    .submit_rst_stream(stream_id, ErrorCode::InternalError);
                            }
                            Some(ResponseState::MsgComplete) => {
                                // Response already complete; nothing to reset.
                            }
                            Some(_) => {
                                self.error_reply(stream_id, Status::BAD_GATEWAY)?;
                            }
                            None => {}
                        }
                        if let Some(stream) = self.core.streams.find_mut(stream_id) {
                            stream.response_state = ResponseState::MsgComplete;
                            // Parse failure always closes the origin
                            // connection.
                            stream.origin = None;
                        }
                    }
                }
            }
        }

        self.send()
    }

    /// The origin's output buffer drained to zero
    pub fn on_origin_write(&mut self, stream_id: u32) -> Result<()> {
        self.resume_read(stream_id)
    }

    /// A transport-level event fired on a stream's origin connection
    pub fn on_origin_event(&mut self, stream_id: u32, event: OriginIoEvent) -> Result<()> {
        match event {
            OriginIoEvent::Connected => {
                debug!(stream_id, "origin connection established");
                if let Some(stream) = self.core.streams.find_mut(stream_id) {
                    if let Some(origin) = stream.origin.as_mut() {
                        if let Err(err) = origin.on_connected() {
                            warn!(stream_id, error = %err, "setting origin transport options failed");
                        }
                    }
                }
                Ok(())
            }
            OriginIoEvent::Eof => self.on_origin_eof(stream_id),
            OriginIoEvent::Error => self.on_origin_failure(stream_id, false),
            OriginIoEvent::Timeout => self.on_origin_failure(stream_id, true),
        }
    }

    fn handle_origin_event(&mut self, stream_id: u32, event: OriginEvent) -> Result<()> {
        match event {
            OriginEvent::HeadersComplete(head) => {
                self.on_origin_header_complete(stream_id, head)
            }
            OriginEvent::Body(data) => self.on_origin_body(stream_id, &data),
            OriginEvent::BodyComplete => {
                self.on_origin_body_complete(stream_id);
                Ok(())
            }
            OriginEvent::Cancelled(code) => {
                info!(stream_id, origin_code = %code, "origin cancelled the stream");
                if let Some(stream) = self.core.streams.find_mut(stream_id) {
                    stream.response_state = ResponseState::MsgReset;
                    stream.response_rst_error_code = Some(code);
                }
                self.codec
                    .submit_rst_stream(stream_id, infer_origin_rst_code(code));
                if let Some(stream) = self.core.streams.find_mut(stream_id) {
                    stream.origin = None;
                }
                Ok(())
            }
        }
    }

    /// The origin closed its side
    fn on_origin_eof(&mut self, stream_id: u32) -> Result<()> {
        debug!(stream_id, "origin EOF");
        let Some(state) = self
            .core
            .streams
            .find(stream_id)
            .map(|s| (s.request_state, s.response_state))
        else {
            return Ok(());
        };
        let (request_state, response_state) = state;

        if request_state == RequestState::StreamClosed {
            self.core.streams.remove(stream_id);
            return Ok(());
        }

        // Drop the origin now so stream close cannot pool it.
        if let Some(stream) = self.core.streams.find_mut(stream_id) {
            stream.origin = None;
        }

        match response_state {
            ResponseState::HeaderComplete => {
                // The origin may indicate the end of the body by EOF. For
                // tunnels, MSG_COMPLETE drives the RST-after-drain path in
                // the data source.
                info!(stream_id, "origin body ended by EOF");
                self.on_origin_body_complete(stream_id);
            }
            ResponseState::MsgComplete => {}
            _ => {
                self.error_reply(stream_id, Status::BAD_GATEWAY)?;
            }
        }
        self.send()
    }

    /// The origin transport failed or timed out
    fn on_origin_failure(&mut self, stream_id: u32, timeout: bool) -> Result<()> {
        info!(stream_id, timeout, "origin network failure");
        let Some(state) = self
            .core
            .streams
            .find(stream_id)
            .map(|s| (s.request_state, s.response_state, s.upgraded))
        else {
            return Ok(());
        };
        let (request_state, response_state, upgraded) = state;

        if request_state == RequestState::StreamClosed {
            self.core.streams.remove(stream_id);
            return Ok(());
        }

        if let Some(stream) = self.core.streams.find_mut(stream_id) {
            stream.origin = None;
        }

        match response_state {
            ResponseState::MsgComplete => {
                // The response was already complete; only a tunnel needs
                // the truncation made visible.
                if upgraded {
                    self.codec
                        .submit_rst_stream(stream_id, ErrorCode::InternalError);
                }
            }
            ResponseState::HeaderComplete => {
                self.codec
                    .submit_rst_stream(stream_id, ErrorCode::InternalError);
                if let Some(stream) = self.core.streams.find_mut(stream_id) {
                    stream.response_state = ResponseState::MsgComplete;
                }
            }
            _ => {
                let status = if timeout {
                    Status::GATEWAY_TIMEOUT
                } else {
                    Status::BAD_GATEWAY
                };
                self.error_reply(stream_id, status)?;
            }
        }
        self.send()
    }
}
