//! h2bridge - HTTP/2 upstream bridge for a reverse proxy
//!
//! This crate terminates an HTTP/2 connection from a client and relays each
//! request stream to a per-request HTTP/1.x origin connection, carrying the
//! origin's response back over the same HTTP/2 stream.
//!
//! The crate is sans-IO: the external event loop owns the sockets and hands
//! byte spans to [`bridge::Http2Bridge`], which pumps them through the
//! embedded HTTP/2 codec in [`h2`] and drives the per-stream state machine.

pub mod bridge;
pub mod h2;
pub mod http;
pub mod origin;
