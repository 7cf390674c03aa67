//! Per-connection protocol state: the (Decoder, Matcher) pair bound to a
//! [`Conn`](crate::conn::Conn) once its protocol is known, plus the glue that
//! turns a decoded object stream into [`RoundTrip`] values.
//!
//! One enum, one variant per protocol, dispatched by `match` — the same
//! shape `ProtocolId` and `RoundTripPayload` use, rather than a trait object
//! registry (Retina never needs dynamic dispatch across protocols
//! either; `ConnParser` in `core/src/protocols/stream/mod.rs` is the same
//! "one enum wrapping per-protocol state" shape).
//!
//! ## Matcher assignment
//!
//! HTTP/1.1, MySQL, PostgreSQL, and DNS get a literal [`SingleMatcher`]: at
//! most one request in flight, matching the synchronous request/response
//! rhythm these protocols' clients actually use. Redis is the one exception:
//! its pipelining round-trip law (`K` requests followed by `K` responses
//! yield `K` pairs *in order*) cannot be satisfied by `SingleMatcher`, whose
//! "a new request replaces any unmatched prior one" rule would silently
//! drop all but the last request of a pipelined batch. Redis therefore uses
//! a [`ListMatcher`] with an always-true predicate, which degenerates to a
//! plain FIFO queue — oldest pending request matches the next response,
//! exactly the semantics the pipelining law calls for, while keeping a
//! single lightweight matcher shape.
//!
//! MongoDB appears under both `SingleMatcher` ("single-reply") and
//! `ListMatcher` ("multi") groupings; a `ListMatcher` keyed on
//! `response_to == request_id` subsumes the single-reply case (a connection
//! that never overlaps requests just keeps one pending entry) without
//! needing two separate matcher instances per connection, so Mongo is
//! implemented with `ListMatcher` throughout.

use crate::conn::Direction;
use crate::matcher::{FuzzyMatcher, ListMatcher, Pair, SingleMatcher};
use crate::protocols::amqp::{AmqpDecoder, AmqpMethod};
use crate::protocols::dns::{DnsDecoder, DnsMessage};
use crate::protocols::http1::{Http1Decoder, HttpObject};
use crate::protocols::http2::{Http2Decoder, Http2Message};
use crate::protocols::kafka::{KafkaDecoder, KafkaMessage};
use crate::protocols::mongodb::{MongoDecoder, MongoMessage};
use crate::protocols::mysql::{MysqlDecoder, MysqlMessage};
use crate::protocols::postgres::{PostgresDecoder, PostgresMessage};
use crate::protocols::redis::{RedisDecoder, RespValue};
use crate::protocols::{DecodeError, Decoder, ProtocolId};
use crate::roundtrip::RoundTripPayload;

use std::time::Instant;

use crate::buffer::ZeroCopyBuffer;
use crate::config::{Http2Config, HttpConfig};
use crate::tuple::L4Protocol;

fn amqp_base_name(name: &str) -> &str {
    name.strip_suffix("-ok").or_else(|| name.strip_suffix("-empty")).unwrap_or(name)
}

fn amqp_matches(a: &AmqpMethod, b: &AmqpMethod) -> bool {
    amqp_base_name(a.name) == amqp_base_name(b.name) && a.exchange_or_queue == b.exchange_or_queue
}

fn mongo_matches(req: &MongoMessage, resp: &MongoMessage) -> bool {
    resp.response_to == req.request_id
}

fn kafka_matches(req: &KafkaMessage, resp: &KafkaMessage) -> bool {
    resp.correlation_id == req.correlation_id
}

fn http2_matches(req: &Http2Message, resp: &Http2Message) -> bool {
    resp.stream_id == req.stream_id
}

/// Per-protocol decoder + matcher state attached to one [`Conn`](crate::conn::Conn).
pub enum Session {
    Http1 { decoder: Http1Decoder, matcher: SingleMatcher<HttpObject> },
    Http2 { decoder: Http2Decoder, matcher: ListMatcher<Http2Message> },
    Redis { decoder: RedisDecoder, matcher: ListMatcher<RespValue> },
    Mongodb { decoder: MongoDecoder, matcher: ListMatcher<MongoMessage> },
    Amqp { decoder: AmqpDecoder, matcher: FuzzyMatcher<AmqpMethod> },
    Kafka { decoder: KafkaDecoder, matcher: ListMatcher<KafkaMessage> },
    Mysql { decoder: MysqlDecoder, matcher: SingleMatcher<MysqlMessage> },
    Postgres { decoder: PostgresDecoder, matcher: SingleMatcher<PostgresMessage> },
    Dns { decoder: DnsDecoder, matcher: SingleMatcher<DnsMessage> },
}

/// Everything a fresh [`Session`] needs besides the protocol tag, collected
/// from [`crate::config::RuntimeConfig`] so construction doesn't thread
/// individual fields through every call site.
pub struct SessionConfig<'a> {
    pub http: &'a HttpConfig,
    pub http2: &'a Http2Config,
    pub mongodb_enable_response_code: bool,
    pub list_cap_http2: usize,
    pub list_cap_keyed: usize,
    pub fuzzy_cap: usize,
}

impl Session {
    /// `transport` selects DNS's framing (2-byte length prefix over TCP, one
    /// datagram per message over UDP); it's otherwise unused, since every
    /// other protocol here only ever runs over TCP.
    pub fn new(proto: ProtocolId, transport: L4Protocol, cfg: &SessionConfig<'_>) -> Option<Session> {
        Some(match proto {
            ProtocolId::Http1 => Session::Http1 {
                decoder: Http1Decoder::new(cfg.http.enable_body, cfg.http.max_body_size),
                matcher: SingleMatcher::new(),
            },
            ProtocolId::Http2 | ProtocolId::Grpc => Session::Http2 {
                decoder: Http2Decoder::new(cfg.http2.max_concurrent_streams, cfg.http2.trailer_keys.clone()),
                matcher: ListMatcher::new(cfg.list_cap_http2),
            },
            ProtocolId::Redis => {
                Session::Redis { decoder: RedisDecoder::new(), matcher: ListMatcher::new(cfg.list_cap_keyed) }
            }
            ProtocolId::Mongodb => Session::Mongodb {
                decoder: MongoDecoder::new(cfg.mongodb_enable_response_code),
                matcher: ListMatcher::new(cfg.list_cap_keyed),
            },
            ProtocolId::Amqp => {
                Session::Amqp { decoder: AmqpDecoder::new(), matcher: FuzzyMatcher::new(cfg.fuzzy_cap) }
            }
            ProtocolId::Kafka => {
                Session::Kafka { decoder: KafkaDecoder::new(), matcher: ListMatcher::new(cfg.list_cap_keyed) }
            }
            ProtocolId::Mysql => {
                Session::Mysql { decoder: MysqlDecoder::new(), matcher: SingleMatcher::new() }
            }
            ProtocolId::Postgres => {
                Session::Postgres { decoder: PostgresDecoder::new(), matcher: SingleMatcher::new() }
            }
            ProtocolId::Dns => Session::Dns {
                decoder: match transport {
                    L4Protocol::Udp => DnsDecoder::new_udp(),
                    L4Protocol::Tcp => DnsDecoder::new_tcp(),
                },
                matcher: SingleMatcher::new(),
            },
        })
    }

    /// Feeds one buffered chunk through this session's decoder, matching
    /// every decoded object as it arrives. For each completed pair, `emit`
    /// is called with the request and response timestamps plus the
    /// assembled [`RoundTripPayload`] — the caller (`Conn::process`) turns
    /// that into a [`crate::roundtrip::RoundTrip`] once it knows the flow's
    /// tuple. A decode error is logged and swallowed by the caller (malformed
    /// input never tears down the connection); this just surfaces it.
    pub fn decode_and_match(
        &mut self,
        direction: Direction,
        is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
        emit: &mut dyn FnMut(Instant, Instant, RoundTripPayload),
    ) -> Result<(), DecodeError> {
        match self {
            Session::Http1 { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        if let Some(payload) = unwrap_http1(pair) {
                            emit(req_time, resp_time, payload);
                        }
                    }
                }
            }
            Session::Http2 { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj, http2_matches) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        emit(
                            req_time,
                            resp_time,
                            RoundTripPayload::Http2 { request: pair.request.payload, response: pair.response.payload },
                        );
                    }
                }
            }
            Session::Redis { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj, |_, _| true) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        emit(
                            req_time,
                            resp_time,
                            RoundTripPayload::Redis { request: pair.request.payload, response: pair.response.payload },
                        );
                    }
                }
            }
            Session::Mongodb { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj, mongo_matches) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        emit(
                            req_time,
                            resp_time,
                            RoundTripPayload::Mongodb { request: pair.request.payload, response: pair.response.payload },
                        );
                    }
                }
            }
            Session::Amqp { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj, amqp_matches) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        emit(
                            req_time,
                            resp_time,
                            RoundTripPayload::Amqp { request: pair.request.payload, response: pair.response.payload },
                        );
                    }
                }
            }
            Session::Kafka { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj, kafka_matches) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        emit(
                            req_time,
                            resp_time,
                            RoundTripPayload::Kafka { request: pair.request.payload, response: pair.response.payload },
                        );
                    }
                }
            }
            Session::Mysql { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        emit(
                            req_time,
                            resp_time,
                            RoundTripPayload::Mysql { request: pair.request.payload, response: pair.response.payload },
                        );
                    }
                }
            }
            Session::Postgres { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        emit(
                            req_time,
                            resp_time,
                            RoundTripPayload::Postgres { request: pair.request.payload, response: pair.response.payload },
                        );
                    }
                }
            }
            Session::Dns { decoder, matcher } => {
                for obj in decoder.decode(direction, is_client, buf, now)? {
                    if let Some(pair) = matcher.feed(obj) {
                        let (req_time, resp_time) = (pair.request.timestamp, pair.response.timestamp);
                        emit(
                            req_time,
                            resp_time,
                            RoundTripPayload::Dns { request: pair.request.payload, response: pair.response.payload },
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

fn unwrap_http1(pair: Pair<HttpObject>) -> Option<RoundTripPayload> {
    match (pair.request.payload, pair.response.payload) {
        (HttpObject::Request(request), HttpObject::Response(response)) => {
            Some(RoundTripPayload::Http1 { request, response })
        }
        _ => None,
    }
}
