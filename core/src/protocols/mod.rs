//! The common decoder contract every application-layer protocol implements,
//! plus the `ProtocolId` enum used for port-binding lookup and registry
//! dispatch.
//!
//! Grounded on `core/src/protocols/stream/mod.rs`'s `ConnParser`/`Session`
//! split: one enum with a variant per protocol, dispatched by `match` rather
//! than trait objects, matching Retina's established shape throughout
//! `ConnParser`/`SessionData`.

pub mod amqp;
pub mod dns;
pub mod http1;
pub mod http2;
pub mod kafka;
pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod redis;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::buffer::ZeroCopyBuffer;
use crate::conn::Direction;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProtocolId {
    Http1,
    Http2,
    Grpc,
    Redis,
    Mongodb,
    Amqp,
    Kafka,
    Mysql,
    Postgres,
    Dns,
}

/// Which side of a round-trip an object belongs to.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
pub enum Role {
    Request,
    Response,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed framing: {0}")]
    Framing(String),
    #[error("unsupported or unrecognized message")]
    Unsupported,
    #[error("message exceeded configured size limit")]
    TooLarge,
}

/// A decoded application-layer object, tagged with the role it plays and the
/// wall-clock time its framing completed.
#[derive(Debug, Clone)]
pub struct DecodedObject<T> {
    pub role: Role,
    pub timestamp: Instant,
    pub payload: T,
}

/// The streaming decoder contract every protocol module implements: feed it
/// bytes from one direction of a connection, and it emits zero or more typed
/// objects per call. A framing error resets the decoder's local state but
/// never closes the connection — the caller simply keeps calling `decode`
/// with subsequent bytes, matching `core/src/protocols/stream/mod.rs`'s
/// "local state machine reset on `ParseResult::Skipped`" discipline.
pub trait Decoder {
    type Object;

    fn decode(
        &mut self,
        direction: Direction,
        is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
    ) -> Result<Vec<DecodedObject<Self::Object>>, DecodeError>;
}
