//! The matched request/response unit handed to the round-trip dispatcher
//! round trip, plus the error it can fail with.
//!
//! `RoundTrip` is a tagged sum type over the per-protocol payloads, matching
//! the "one enum, one variant per protocol, dispatch via match" shape used
//! throughout this crate (`ProtocolId`, `ConnParser` in Retina).

use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::matcher::Pair;
use crate::protocols::amqp::AmqpMethod;
use crate::protocols::dns::DnsMessage;
use crate::protocols::http1::{HttpRequest, HttpResponse};
use crate::protocols::http2::Http2Message;
use crate::protocols::kafka::KafkaMessage;
use crate::protocols::mongodb::MongoMessage;
use crate::protocols::mysql::MysqlMessage;
use crate::protocols::postgres::PostgresMessage;
use crate::protocols::redis::RespValue;
use crate::tuple::Tuple;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTripError {
    #[error("response did not arrive strictly after its request")]
    NonPositiveDuration,
}

/// A matched (Request, Response) pair for one protocol, plus the flow it
/// belongs to and the derived duration.
#[derive(Debug, Clone, Serialize)]
pub struct RoundTrip {
    pub tuple: Tuple,
    pub proto: RoundTripPayload,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// The per-protocol request/response payload. One variant per supported
/// protocol; HTTP/2 and gRPC share a variant since they ride the
/// same frame decoder (distinguished by the trailer-key configuration, not
/// by wire shape).
#[derive(Debug, Clone, Serialize)]
pub enum RoundTripPayload {
    Http1 { request: HttpRequest, response: HttpResponse },
    Http2 { request: Http2Message, response: Http2Message },
    Redis { request: RespValue, response: RespValue },
    Mongodb { request: MongoMessage, response: MongoMessage },
    Amqp { request: AmqpMethod, response: AmqpMethod },
    Kafka { request: KafkaMessage, response: KafkaMessage },
    Mysql { request: MysqlMessage, response: MysqlMessage },
    Postgres { request: PostgresMessage, response: PostgresMessage },
    Dns { request: DnsMessage, response: DnsMessage },
}

impl RoundTrip {
    /// Builds a `RoundTrip` from a matched [`Pair`], validating the
    /// strictly-positive-duration invariant.
    pub fn from_pair<T>(
        tuple: Tuple,
        pair: Pair<T>,
        wrap: impl FnOnce(T, T) -> RoundTripPayload,
    ) -> Result<Self, RoundTripError> {
        let req_time = pair.request.timestamp;
        let rsp_time = pair.response.timestamp;
        if rsp_time <= req_time {
            return Err(RoundTripError::NonPositiveDuration);
        }
        Ok(RoundTrip {
            tuple,
            proto: wrap(pair.request.payload, pair.response.payload),
            duration: rsp_time.duration_since(req_time),
        })
    }

    /// Builds a `RoundTrip` directly from a payload already unwrapped out of
    /// its matched [`Pair`], given the request/response timestamps the pair
    /// carried. Used where the payload's request/response types differ from
    /// the pair's element type (HTTP/1.1's `HttpObject` enum, for instance),
    /// so [`RoundTrip::from_pair`]'s single-type `wrap` closure doesn't fit.
    pub fn from_timestamps(
        tuple: Tuple,
        proto: RoundTripPayload,
        req_time: Instant,
        resp_time: Instant,
    ) -> Result<Self, RoundTripError> {
        if resp_time <= req_time {
            return Err(RoundTripError::NonPositiveDuration);
        }
        Ok(RoundTrip { tuple, proto, duration: resp_time.duration_since(req_time) })
    }

    pub fn validate(&self) -> Result<(), RoundTripError> {
        if self.duration.is_zero() {
            return Err(RoundTripError::NonPositiveDuration);
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}
