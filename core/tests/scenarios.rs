//! End-to-end round-trip reconstruction scenarios, driven through the public
//! `Engine`/`Conn`/decoder surface with hand-built wire bytes for each
//! protocol rather than a captured pcap, since the crate has no capture
//! engine of its own to replay one through.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use retina_core::config::{default_config, ProtocolBinding};
use retina_core::conn::Direction;
use retina_core::protocols::amqp::AmqpDecoder;
use retina_core::protocols::mongodb::MongoDecoder;
use retina_core::protocols::redis::RespValue;
use retina_core::protocols::{Decoder, ProtocolId, Role};
use retina_core::roundtrip::{RoundTrip, RoundTripPayload};
use retina_core::stream::Stream;
use retina_core::tuple::{L4Packet, Tuple};
use retina_core::Engine;

fn tuple(src_port: u16, dst_port: u16) -> Tuple {
    Tuple::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        src_port,
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        dst_port,
    )
}

fn collecting_engine<'p>(binding: ProtocolBinding, worker_concurrency: usize) -> (Engine<'p>, Arc<Mutex<Vec<RoundTrip>>>) {
    let mut cfg = default_config();
    cfg.protocols.push(binding);
    cfg.conntrack.worker_concurrency = worker_concurrency;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let engine = Engine::new(cfg, move |rt| sink.lock().unwrap().push(rt));
    (engine, received)
}

#[test]
fn http1_single_get_yields_one_round_trip() {
    let (engine, received) = collecting_engine(
        ProtocolBinding { protocol: ProtocolId::Http1, host: None, ports: vec![80] },
        1,
    );

    let t = tuple(51234, 80);
    let now = Instant::now();
    let req = L4Packet::new_tcp(now, t, b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n", 0, false);
    engine.on_l4_packet(&req).unwrap();

    let later = now + Duration::from_millis(3);
    let resp = L4Packet::new_tcp(
        later,
        t.mirror(),
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK",
        0,
        false,
    );
    engine.on_l4_packet(&resp).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    engine.shutdown();

    let out = received.lock().unwrap();
    assert_eq!(out.len(), 1);
    match &out[0].proto {
        RoundTripPayload::Http1 { request, response } => {
            assert_eq!(request.method, "GET");
            assert_eq!(request.path, "/index.html");
            assert_eq!(response.status, 200);
            assert_eq!(response.body_len, 2);
        }
        other => panic!("expected Http1 payload, got {other:?}"),
    }
    assert!(out[0].duration > Duration::ZERO);
}

#[test]
fn redis_pipelined_pings_yield_two_pairs_in_order() {
    let (engine, received) = collecting_engine(
        ProtocolBinding { protocol: ProtocolId::Redis, host: None, ports: vec![6379] },
        1,
    );

    let t = tuple(40000, 6379);
    let now = Instant::now();
    let req = L4Packet::new_tcp(now, t, b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n", 0, false);
    engine.on_l4_packet(&req).unwrap();

    let later = now + Duration::from_millis(1);
    let resp = L4Packet::new_tcp(later, t.mirror(), b"+PONG\r\n+PONG\r\n", 0, false);
    engine.on_l4_packet(&resp).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    engine.shutdown();

    let out = received.lock().unwrap();
    assert_eq!(out.len(), 2);
    for rt in out.iter() {
        match &rt.proto {
            RoundTripPayload::Redis { request, response } => {
                assert!(matches!(request, RespValue::Array(items) if matches!(&items[..], [RespValue::Bulk(b)] if b == b"PING")));
                assert!(matches!(response, RespValue::Simple(s) if s == "PONG"));
            }
            other => panic!("expected Redis payload, got {other:?}"),
        }
    }
}

// --- HTTP/2 frame-building helpers, duplicated from the decoder's own test
// module since integration tests can't reach its private helpers. ---

const H2_TYPE_HEADERS: u8 = 0x1;
const H2_TYPE_DATA: u8 = 0x0;
const H2_FLAG_END_STREAM: u8 = 0x1;
const H2_FLAG_END_HEADERS: u8 = 0x4;

fn h2_frame(frame_type: u8, stream_id: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    let len = payload.len() as u32;
    frame.push((len >> 16) as u8);
    frame.push((len >> 8) as u8);
    frame.push(len as u8);
    frame.push(frame_type);
    frame.push(flags);
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn h2_headers_frame(stream_id: u32, end_stream: bool, block: &[u8]) -> Vec<u8> {
    let mut flags = H2_FLAG_END_HEADERS;
    if end_stream {
        flags |= H2_FLAG_END_STREAM;
    }
    h2_frame(H2_TYPE_HEADERS, stream_id, flags, block)
}

fn h2_data_frame(stream_id: u32, end_stream: bool, body: &[u8]) -> Vec<u8> {
    let flags = if end_stream { H2_FLAG_END_STREAM } else { 0 };
    h2_frame(H2_TYPE_DATA, stream_id, flags, body)
}

/// Literal-header-field-never-indexed encoding, matching the decoder's own
/// test fixture — no full HPACK encoder dependency needed for this subset.
fn h2_literal_header(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![0x00];
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out
}

fn h2_request_block(path: &str) -> Vec<u8> {
    let mut block = Vec::new();
    block.extend(h2_literal_header(":method", "GET"));
    block.extend(h2_literal_header(":path", path));
    block.extend(h2_literal_header(":scheme", "http"));
    block.extend(h2_literal_header(":authority", "example.com"));
    block
}

fn h2_response_block() -> Vec<u8> {
    h2_literal_header(":status", "200")
}

#[test]
fn http2_two_interleaved_streams_pair_in_server_response_order() {
    let (engine, received) = collecting_engine(
        ProtocolBinding { protocol: ProtocolId::Http2, host: None, ports: vec![443] },
        1,
    );

    let t = tuple(55000, 443);
    let now = Instant::now();

    // Client opens stream 1 and stream 3's headers, then completes stream 3's
    // request body before stream 1's.
    let mut req_bytes = Vec::new();
    req_bytes.extend(h2_headers_frame(1, false, &h2_request_block("/a")));
    req_bytes.extend(h2_headers_frame(3, false, &h2_request_block("/b")));
    req_bytes.extend(h2_data_frame(3, true, b"x"));
    req_bytes.extend(h2_data_frame(1, true, b"y"));
    let req = L4Packet::new_tcp(now, t, &req_bytes, 0, false);
    engine.on_l4_packet(&req).unwrap();

    // Server responds to stream 3 before stream 1.
    let later = now + Duration::from_millis(2);
    let mut resp_bytes = Vec::new();
    resp_bytes.extend(h2_headers_frame(3, true, &h2_response_block()));
    resp_bytes.extend(h2_headers_frame(1, true, &h2_response_block()));
    let resp = L4Packet::new_tcp(later, t.mirror(), &resp_bytes, 0, false);
    engine.on_l4_packet(&resp).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    engine.shutdown();

    let out = received.lock().unwrap();
    assert_eq!(out.len(), 2);
    let stream_ids: Vec<u32> = out
        .iter()
        .map(|rt| match &rt.proto {
            RoundTripPayload::Http2 { request, .. } => request.stream_id,
            other => panic!("expected Http2 payload, got {other:?}"),
        })
        .collect();
    // Stream 3's response arrived first, so its round trip is emitted first.
    assert_eq!(stream_ids, vec![3, 1]);
}

#[test]
fn tcp_retransmit_is_deduplicated_before_reaching_the_decoder() {
    let mut stream = Stream::new(Instant::now());
    let mut decoded = Vec::new();
    let now = Instant::now();
    let t = tuple(1234, 80);

    let p1 = L4Packet::new_tcp(now, t, b"abc", 0, false);
    stream
        .write(&p1, |buf, _| {
            if let Ok(s) = buf.read(1024) {
                decoded.extend_from_slice(s);
            }
        })
        .unwrap();

    let p2 = L4Packet::new_tcp(now, t, b"def", 3, false);
    stream
        .write(&p2, |buf, _| {
            if let Ok(s) = buf.read(1024) {
                decoded.extend_from_slice(s);
            }
        })
        .unwrap();

    // A network-level retransmit of the second segment.
    let p3 = L4Packet::new_tcp(now, t, b"def", 3, false);
    stream.write(&p3, |_buf, _| {}).unwrap();

    assert_eq!(decoded, b"abcdef");
    assert_eq!(stream.stats().bytes, 6);
    assert_eq!(stream.stats().skipped, 1);
}

fn bson_string_field(doc: &mut Vec<u8>, key: &str, value: &str) {
    doc.push(0x02);
    doc.extend_from_slice(key.as_bytes());
    doc.push(0);
    let val_bytes = value.as_bytes();
    doc.extend_from_slice(&((val_bytes.len() + 1) as i32).to_le_bytes());
    doc.extend_from_slice(val_bytes);
    doc.push(0);
}

fn bson_insert_command_doc() -> Vec<u8> {
    let mut doc = vec![0u8; 4]; // length placeholder
    bson_string_field(&mut doc, "insert", "users");
    bson_string_field(&mut doc, "$db", "mydb");
    doc.push(0x00); // terminator
    let len = doc.len() as i32;
    doc[0..4].copy_from_slice(&len.to_le_bytes());
    doc
}

#[test]
fn mongodb_op_msg_insert_is_skimmed_without_full_bson_decode() {
    let mut decoder = MongoDecoder::new(false);

    let doc = bson_insert_command_doc();
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // flag bits
    body.push(0); // section kind 0: body document
    body.extend_from_slice(&doc);

    let mut message = Vec::new();
    let message_length = (16 + body.len()) as i32;
    message.extend_from_slice(&message_length.to_le_bytes());
    message.extend_from_slice(&7i32.to_le_bytes()); // request_id
    message.extend_from_slice(&0i32.to_le_bytes()); // response_to
    message.extend_from_slice(&2013i32.to_le_bytes()); // OP_MSG
    message.extend_from_slice(&body);

    let mut buf = retina_core::buffer::ZeroCopyBuffer::new();
    buf.write(&message);
    let out = decoder.decode(Direction::Originator, true, &mut buf, Instant::now()).unwrap();

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].role, Role::Request);
    let msg = &out[0].payload;
    assert_eq!(msg.command.as_deref(), Some("insert"));
    assert_eq!(msg.top_level_fields.len(), 2);
    assert_eq!(msg.top_level_fields[0].key, "insert");
    assert_eq!(msg.top_level_fields[0].bson_type, 0x02);
}

fn amqp_shortstr(s: &str) -> Vec<u8> {
    let mut out = vec![s.len() as u8];
    out.extend_from_slice(s.as_bytes());
    out
}

fn amqp_frame(frame_type: u8, channel: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![frame_type];
    frame.extend_from_slice(&channel.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.push(0xCE); // frame-end octet
    frame
}

#[test]
fn amqp_basic_publish_assembles_across_three_frames() {
    let mut decoder = AmqpDecoder::new();

    // Method frame: class 60 (basic), method 40 (publish).
    let mut method_payload = Vec::new();
    method_payload.extend_from_slice(&60u16.to_be_bytes());
    method_payload.extend_from_slice(&40u16.to_be_bytes());
    method_payload.extend_from_slice(&[0u8, 0u8]); // reserved
    method_payload.extend(amqp_shortstr("e"));
    method_payload.extend(amqp_shortstr("k"));
    method_payload.push(0); // mandatory/immediate bits
    let method_frame = amqp_frame(1, 1, &method_payload);

    // Content header frame: class 60, weight 0, body size 5, no properties.
    let mut header_payload = Vec::new();
    header_payload.extend_from_slice(&60u16.to_be_bytes());
    header_payload.extend_from_slice(&0u16.to_be_bytes());
    header_payload.extend_from_slice(&5u64.to_be_bytes());
    header_payload.extend_from_slice(&0u16.to_be_bytes()); // property flags
    let header_frame = amqp_frame(2, 1, &header_payload);

    // Content body frame: the 5-byte message.
    let body_frame = amqp_frame(3, 1, b"hello");

    let mut wire = Vec::new();
    wire.extend(method_frame);
    wire.extend(header_frame);
    wire.extend(body_frame);

    let mut buf = retina_core::buffer::ZeroCopyBuffer::new();
    buf.write(&wire);
    let out = decoder.decode(Direction::Originator, true, &mut buf, Instant::now()).unwrap();

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].role, Role::Request);
    let method = &out[0].payload;
    assert_eq!(method.name, "basic.publish");
    assert_eq!(method.exchange_or_queue.as_deref(), Some("e"));
    assert_eq!(method.routing_key.as_deref(), Some("k"));
    assert_eq!(method.body.as_deref(), Some(&b"hello"[..]));
}
