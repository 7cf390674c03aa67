//! MongoDB wire protocol decoding: message header framing plus a lightweight
//! BSON key/type skim of the document body (no full BSON parser, matching
//! the explicit "skim, don't fully decode" requirement).
//!
//! OpCode vocabulary grounded on
//! `other_examples/4983696a_dennisss-dacha__pkg-raft-src-mongodb-wire_protocol.rs.rs`.

mod transaction;

pub use transaction::MongoMessage;

use std::time::Instant;

use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;

use crate::buffer::{BufferError, ZeroCopyBuffer};
use crate::conn::Direction;
use crate::protocols::{DecodeError, DecodedObject, Decoder, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Command,
    CommandReply,
    Message,
    Unknown(i32),
}

impl OpCode {
    fn from_i32(v: i32) -> Self {
        match v {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2010 => OpCode::Command,
            2011 => OpCode::CommandReply,
            2013 => OpCode::Message,
            other => OpCode::Unknown(other),
        }
    }

}

#[derive(Default)]
pub struct MongoDecoder {
    scratch: Vec<u8>,
    enable_response_code: bool,
}

impl MongoDecoder {
    /// `enable_response_code` gates whether OP_REPLY/OP_MSG response bodies
    /// get their top-level fields (`ok`, `code`, ...) skimmed at all; request
    /// bodies are always skimmed so the command name is available.
    pub fn new(enable_response_code: bool) -> Self {
        MongoDecoder { scratch: Vec::new(), enable_response_code }
    }
}

const HEADER_LEN: usize = 16;

impl Decoder for MongoDecoder {
    type Object = MongoMessage;

    fn decode(
        &mut self,
        _direction: Direction,
        _is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
    ) -> Result<Vec<DecodedObject<MongoMessage>>, DecodeError> {
        loop {
            match buf.read(4096) {
                Ok(slice) if slice.is_empty() => break,
                Ok(slice) => self.scratch.extend_from_slice(slice),
                Err(BufferError::Eof) => break,
            }
        }

        let mut out = Vec::new();
        loop {
            if self.scratch.len() < HEADER_LEN {
                break;
            }
            let mut cursor = &self.scratch[0..HEADER_LEN];
            let message_length = cursor.read_i32::<LittleEndian>().unwrap() as usize;
            if message_length < HEADER_LEN {
                warn!(target: "mongodb", "bogus message length {message_length}, resetting");
                self.scratch.clear();
                return Err(DecodeError::Framing("message_length below header size".into()));
            }
            if self.scratch.len() < message_length {
                break;
            }
            let request_id = cursor.read_i32::<LittleEndian>().unwrap();
            let response_to = cursor.read_i32::<LittleEndian>().unwrap();
            let op_code = OpCode::from_i32(cursor.read_i32::<LittleEndian>().unwrap());
            let body = &self.scratch[HEADER_LEN..message_length];

            // The wire header alone identifies the role: a request carries a
            // fresh, positive `requestId` and replies to nothing; a response
            // always sets `responseTo` to the request's `requestId`.
            let role = if request_id > 0 && response_to == 0 { Role::Request } else { Role::Response };

            out.push(DecodedObject {
                role,
                timestamp: now,
                payload: MongoMessage::from_wire(
                    request_id,
                    response_to,
                    op_code,
                    body,
                    role == Role::Response,
                    self.enable_response_code,
                ),
            });
            self.scratch.drain(..message_length);
        }
        Ok(out)
    }
}
