//! Bridge integration tests: session setup, request validation, stream
//! lifecycle and the client-facing driver.

mod common;

use common::*;
use h2bridge::bridge::{BridgeConfig, BridgeError};
use h2bridge::h2::{ErrorCode, FrameType};
use std::time::Duration;

const GET_HEADERS: &[(&str, &str)] = &[
    (":method", "GET"),
    (":scheme", "https"),
    (":authority", "a.example"),
    (":path", "/x"),
];

#[test]
fn settings_exchange_and_ack_clears_timer() {
    let (mut bridge, shared, _client) = setup();

    // The bridge's first output is SETTINGS{MAX_CONCURRENT_STREAMS=100,
    // INITIAL_WINDOW_SIZE=65535}.
    bridge.send().unwrap();
    let frames = parse_frames(&take_output(&shared));
    assert!(frames[0].is(FrameType::Settings));
    let payload = &frames[0].payload;
    let mut params = std::collections::HashMap::new();
    let mut pos = 0;
    while pos + 6 <= payload.len() {
        let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        let value = u32::from_be_bytes([
            payload[pos + 2],
            payload[pos + 3],
            payload[pos + 4],
            payload[pos + 5],
        ]);
        params.insert(id, value);
        pos += 6;
    }
    assert_eq!(params.get(&0x3), Some(&100));
    assert_eq!(params.get(&0x4), Some(&65535));

    // The SETTINGS ACK deadline is armed once the frame is on the wire.
    assert!(bridge.poll_timeout().is_some());

    bridge.on_read(&TestClient::preface_and_settings()).unwrap();
    bridge.on_read(&TestClient::settings_ack()).unwrap();
    assert!(bridge.poll_timeout().is_none());

    // No GOAWAY was emitted.
    let frames = parse_frames(&take_output(&shared));
    assert!(!frames.iter().any(|f| f.is(FrameType::Goaway)));
}

#[test]
fn settings_timeout_emits_goaway() {
    let (mut bridge, shared, _client) = setup();
    bridge.send().unwrap();
    let deadline = bridge.poll_timeout().unwrap();
    take_output(&shared);

    bridge
        .handle_timeout(deadline + Duration::from_millis(1))
        .unwrap();

    let frames = parse_frames(&take_output(&shared));
    let goaway = frames.iter().find(|f| f.is(FrameType::Goaway)).unwrap();
    assert_eq!(goaway_code(goaway), ErrorCode::SettingsTimeout.as_u32());

    // Nothing left to do: the driver reports the terminal condition.
    assert!(matches!(bridge.on_write(), Err(BridgeError::SessionEnd)));
}

#[test]
fn get_request_round_trip() {
    let (mut bridge, shared, mut client) = setup();
    handshake(&mut bridge, &shared);

    bridge
        .on_read(&client.headers(1, GET_HEADERS, true))
        .unwrap();

    // The origin saw a well-formed HTTP/1.1 request.
    let wire = origin_wire(&mut bridge, 1);
    let text = String::from_utf8(wire).unwrap();
    assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
    assert!(text.contains("host: a.example\r\n"));

    bridge
        .on_origin_read(1, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();

    let frames = parse_frames(&take_output(&shared));
    let headers_frame = frames.iter().find(|f| f.is(FrameType::Headers)).unwrap();
    let headers = client.decode_headers(&headers_frame.payload);
    assert_eq!(headers[0], (":status".to_string(), "200".to_string()));
    assert!(headers.contains(&("content-length".to_string(), "5".to_string())));
    assert!(headers.contains(&("via".to_string(), "1.1 h2bridge".to_string())));

    // Response body arrives in order and the stream ends with END_STREAM.
    let body: Vec<u8> = frames
        .iter()
        .filter(|f| f.is(FrameType::Data))
        .flat_map(|f| f.payload.clone())
        .collect();
    assert_eq!(body, b"hello");
    let last_data = frames.iter().filter(|f| f.is(FrameType::Data)).last().unwrap();
    assert!(last_data.flags.is_end_stream());

    // Stream is gone and the idle origin connection was pooled.
    assert_eq!(bridge.stream_count(), 0);
    assert_eq!(shared.borrow().pooled, 1);
}

#[test]
fn connect_with_scheme_is_protocol_error() {
    let (mut bridge, shared, mut client) = setup();
    handshake(&mut bridge, &shared);

    bridge
        .on_read(&client.headers(
            1,
            &[
                (":method", "CONNECT"),
                (":scheme", "https"),
                (":authority", "a.example:443"),
            ],
            false,
        ))
        .unwrap();

    let frames = parse_frames(&take_output(&shared));
    let rst = frames.iter().find(|f| f.is(FrameType::RstStream)).unwrap();
    assert_eq!(rst.stream_id, 1);
    assert_eq!(rst_code(rst), ErrorCode::ProtocolError.as_u32());

    // No origin connection was ever established.
    assert_eq!(shared.borrow().connects, 0);
    assert_eq!(bridge.stream_count(), 0);
}

#[test]
fn missing_path_is_protocol_error() {
    let (mut bridge, shared, mut client) = setup();
    handshake(&mut bridge, &shared);

    bridge
        .on_read(&client.headers(
            1,
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "a.example"),
            ],
            true,
        ))
        .unwrap();

    let frames = parse_frames(&take_output(&shared));
    let rst = frames.iter().find(|f| f.is(FrameType::RstStream)).unwrap();
    assert_eq!(rst_code(rst), ErrorCode::ProtocolError.as_u32());
}

#[test]
fn post_without_content_length_is_protocol_error() {
    let (mut bridge, shared, mut client) = setup();
    handshake(&mut bridge, &shared);

    bridge
        .on_read(&client.headers(
            1,
            &[
                (":method", "POST"),
                (":scheme", "https"),
                (":authority", "a.example"),
                (":path", "/upload"),
            ],
            false,
        ))
        .unwrap();

    let frames = parse_frames(&take_output(&shared));
    let rst = frames.iter().find(|f| f.is(FrameType::RstStream)).unwrap();
    assert_eq!(rst_code(rst), ErrorCode::ProtocolError.as_u32());
    assert_eq!(shared.borrow().connects, 0);
}

#[test]
fn upload_flows_to_origin_with_window_updates() {
    let (mut bridge, shared, mut client) = setup();
    handshake(&mut bridge, &shared);

    let body = vec![0x5au8; 40000];
    bridge
        .on_read(&client.headers(
            1,
            &[
                (":method", "POST"),
                (":scheme", "https"),
                (":authority", "a.example"),
                (":path", "/upload"),
                ("content-length", "40000"),
            ],
            false,
        ))
        .unwrap();
    take_output(&shared);
    origin_wire(&mut bridge, 1);

    let chunks: Vec<&[u8]> = body.chunks(16000).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let last = i == chunks.len() - 1;
        bridge.on_read(&TestClient::data(1, chunk, last)).unwrap();
    }

    // The whole body reached the origin.
    let wire = origin_wire(&mut bridge, 1);
    assert_eq!(wire, body);

    // The origin drained its buffer: the bridge replenishes both the
    // connection window and the stream window.
    take_output(&shared);
    bridge.on_origin_write(1).unwrap();
    let frames = parse_frames(&take_output(&shared));
    let updates: Vec<&Frame> = frames
        .iter()
        .filter(|f| f.is(FrameType::WindowUpdate))
        .collect();
    assert!(updates.iter().any(|f| f.stream_id == 0));
    assert!(updates.iter().any(|f| f.stream_id == 1));
}

#[test]
fn push_promise_is_refused() {
    let (mut bridge, shared, _client) = setup();
    handshake(&mut bridge, &shared);

    // A PUSH_PROMISE frame promising stream 2.
    let mut frame = Vec::new();
    let payload = [0u8, 0, 0, 2, 0x82];
    frame.extend_from_slice(&h2bridge::h2::codec::FrameCodec::encode_header(
        FrameType::PushPromise,
        h2bridge::h2::FrameFlags::from_u8(h2bridge::h2::FrameFlags::END_HEADERS),
        1,
        payload.len(),
    ));
    frame.extend_from_slice(&payload);
    bridge.on_read(&frame).unwrap();

    let frames = parse_frames(&take_output(&shared));
    let rst = frames.iter().find(|f| f.is(FrameType::RstStream)).unwrap();
    assert_eq!(rst.stream_id, 2);
    assert_eq!(rst_code(rst), ErrorCode::RefusedStream.as_u32());

    // No stream was created for the promise.
    assert_eq!(bridge.stream_count(), 0);
}

#[test]
fn client_rst_destroys_stream_without_pooling() {
    let (mut bridge, shared, mut client) = setup();
    handshake(&mut bridge, &shared);

    bridge
        .on_read(&client.headers(1, GET_HEADERS, true))
        .unwrap();
    assert_eq!(bridge.stream_count(), 1);

    bridge
        .on_read(&TestClient::rst_stream(1, ErrorCode::Cancel))
        .unwrap();

    // The request side is no longer authoritative: the stream is gone and
    // the in-flight origin connection was dropped, not pooled.
    assert_eq!(bridge.stream_count(), 0);
    assert_eq!(shared.borrow().pooled, 0);

    // Late origin events for the dead stream are no-ops.
    bridge.on_origin_read(1, b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
    assert!(parse_frames(&take_output(&shared))
        .iter()
        .all(|f| !f.is(FrameType::Headers)));
}

#[test]
fn oversized_request_headers_reset_stream() {
    let config = BridgeConfig::builder().max_headers_sum(64).build();
    let (mut bridge, shared, mut client) = setup_with(config);
    handshake(&mut bridge, &shared);

    let big = "v".repeat(200);
    let mut fields = GET_HEADERS.to_vec();
    fields.push(("x-filler", big.as_str()));
    fields.push(("x-filler-2", big.as_str()));
    bridge.on_read(&client.headers(1, &fields, true)).unwrap();

    let frames = parse_frames(&take_output(&shared));
    let rst = frames.iter().find(|f| f.is(FrameType::RstStream)).unwrap();
    assert_eq!(rst_code(rst), ErrorCode::InternalError.as_u32());
    assert_eq!(shared.borrow().connects, 0);
}

#[test]
fn origin_connect_failure_resets_stream() {
    let (mut bridge, shared, mut client) = setup();
    handshake(&mut bridge, &shared);
    shared.borrow_mut().fail_connect = true;

    bridge
        .on_read(&client.headers(1, GET_HEADERS, true))
        .unwrap();

    let frames = parse_frames(&take_output(&shared));
    let rst = frames.iter().find(|f| f.is(FrameType::RstStream)).unwrap();
    assert_eq!(rst_code(rst), ErrorCode::InternalError.as_u32());

    // CONNECT_FAIL streams are destroyed at stream close without any
    // origin-side detach.
    assert_eq!(bridge.stream_count(), 0);
}

#[test]
fn ping_is_answered() {
    let (mut bridge, shared, _client) = setup();
    handshake(&mut bridge, &shared);

    bridge.on_read(&TestClient::ping([9; 8])).unwrap();
    let frames = parse_frames(&take_output(&shared));
    let pong = frames.iter().find(|f| f.is(FrameType::Ping)).unwrap();
    assert!(pong.flags.is_ack());
    assert_eq!(pong.payload, [9; 8]);
}

#[test]
fn concurrent_streams_multiplex() {
    let (mut bridge, shared, mut client) = setup();
    handshake(&mut bridge, &shared);

    bridge
        .on_read(&client.headers(1, GET_HEADERS, true))
        .unwrap();
    let mut second = GET_HEADERS.to_vec();
    second[3] = (":path", "/y");
    bridge.on_read(&client.headers(3, &second, true)).unwrap();
    assert_eq!(bridge.stream_count(), 2);
    origin_wire(&mut bridge, 1);
    origin_wire(&mut bridge, 3);

    // Stream 3 answers first; stream 1 follows.
    bridge
        .on_origin_read(3, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nthr")
        .unwrap();
    bridge
        .on_origin_read(1, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none")
        .unwrap();

    let frames = parse_frames(&take_output(&shared));
    let data_streams: Vec<u32> = frames
        .iter()
        .filter(|f| f.is(FrameType::Data) && !f.payload.is_empty())
        .map(|f| f.stream_id)
        .collect();
    assert_eq!(data_streams, vec![3, 1]);
    assert_eq!(bridge.stream_count(), 0);
    assert_eq!(shared.borrow().pooled, 2);
}
