//! HTTP/2 stream state tracking
//!
//! Per-stream codec state as defined in RFC 7540 Section 5.1. The session
//! keeps one record per live stream: the RFC state machine, the flow
//! control windows, and the response data-source bookkeeping.

use super::error::{Error, Result};
use super::flow_control::FlowControlPair;
use std::collections::HashMap;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed
    Closed,
}

impl StreamState {
    /// Check if the peer may still send on this stream
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// One HTTP/2 stream as tracked by the codec session
#[derive(Debug)]
pub struct H2Stream {
    /// Stream ID
    id: StreamId,
    /// Stream state
    state: StreamState,
    /// Flow control windows
    flow: FlowControlPair,
    /// Priority weight advertised by the peer
    priority: u32,
    /// A response with a pull data source has been submitted
    has_response: bool,
    /// The data source returned no bytes and is parked until resumed
    deferred: bool,
    /// END_STREAM or RST_STREAM has been emitted for the response
    end_sent: bool,
    /// RST_STREAM has been queued for this stream
    rst_queued: bool,
}

impl H2Stream {
    /// Create a stream record for a peer-initiated stream
    ///
    /// `send_size` is the peer's advertised initial window (bounds our DATA
    /// frames); `recv_size` is our own advertised initial window.
    pub fn new(id: StreamId, send_size: u32, recv_size: u32, end_stream: bool) -> Self {
        H2Stream {
            id,
            state: if end_stream {
                StreamState::HalfClosedRemote
            } else {
                StreamState::Open
            },
            flow: FlowControlPair::with_initial_sizes(send_size, recv_size),
            priority: 0,
            has_response: false,
            deferred: false,
            end_sent: false,
            rst_queued: false,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get stream state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Get flow control windows
    pub fn flow(&self) -> &FlowControlPair {
        &self.flow
    }

    /// Get mutable flow control windows
    pub fn flow_mut(&mut self) -> &mut FlowControlPair {
        &mut self.flow
    }

    /// Get priority weight
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Set priority weight
    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Whether a response data source is bound to this stream
    pub fn has_response(&self) -> bool {
        self.has_response
    }

    /// Bind a response data source
    pub fn set_has_response(&mut self) {
        self.has_response = true;
    }

    /// Whether the data source is parked
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Park or resume the data source
    pub fn set_deferred(&mut self, deferred: bool) {
        self.deferred = deferred;
    }

    /// Whether the response side has been finished
    pub fn end_sent(&self) -> bool {
        self.end_sent
    }

    /// Whether RST_STREAM is already queued for this stream
    pub fn rst_queued(&self) -> bool {
        self.rst_queued
    }

    /// Record that RST_STREAM has been queued
    pub fn set_rst_queued(&mut self) {
        self.rst_queued = true;
        self.end_sent = true;
    }

    /// Account an inbound DATA payload against the receive windows
    ///
    /// Updates the stream state on END_STREAM.
    pub fn receive_data(&mut self, len: usize, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }

        self.flow.consume_recv_window(len);
        if self.flow.recv_overdrawn() {
            return Err(Error::FlowControl(format!(
                "stream {} receive window overrun",
                self.id
            )));
        }

        if end_stream {
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedRemote,
                StreamState::HalfClosedLocal => StreamState::Closed,
                other => other,
            };
        }

        Ok(())
    }

    /// The peer half-closed its side with END_STREAM on trailers
    pub fn receive_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// Account an outbound DATA payload and apply END_STREAM transitions
    pub fn send_data(&mut self, len: usize, end_stream: bool) {
        self.flow.consume_send_window(len);

        if end_stream {
            self.end_sent = true;
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedLocal,
                StreamState::HalfClosedRemote => StreamState::Closed,
                other => other,
            };
        }
    }

    /// Close the stream outright (RST_STREAM in either direction)
    pub fn close(&mut self) {
        self.state = StreamState::Closed;
        self.end_sent = true;
    }
}

/// Stream table for one codec session
#[derive(Debug, Default)]
pub struct StreamMap {
    streams: HashMap<StreamId, H2Stream>,
}

impl StreamMap {
    /// Create an empty stream table
    pub fn new() -> Self {
        StreamMap {
            streams: HashMap::new(),
        }
    }

    /// Insert a newly opened stream
    pub fn insert(&mut self, stream: H2Stream) {
        self.streams.insert(stream.id(), stream);
    }

    /// Get a stream by ID
    pub fn get(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    /// Get a mutable stream by ID
    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Check if a stream exists
    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Remove a stream
    pub fn remove(&mut self, stream_id: StreamId) -> Option<H2Stream> {
        self.streams.remove(&stream_id)
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// All live stream IDs
    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Iterate over all streams mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut H2Stream> {
        self.streams.values_mut()
    }
}
