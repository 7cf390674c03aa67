//! Typed Mongo wire message plus the BSON key/type skim.

use serde::Serialize;

use super::OpCode;

#[derive(Debug, Clone, Serialize)]
pub struct BsonField {
    pub key: String,
    pub bson_type: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct MongoMessage {
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: String,
    pub command: Option<String>,
    pub top_level_fields: Vec<BsonField>,
}

impl MongoMessage {
    /// `is_response`/`skim_response_body` gate whether a response's top-level
    /// fields get skimmed at all: requests are always skimmed (the command
    /// name comes from there), responses only when the caller has enabled it.
    pub fn from_wire(
        request_id: i32,
        response_to: i32,
        op_code: OpCode,
        body: &[u8],
        is_response: bool,
        skim_response_body: bool,
    ) -> Self {
        let doc_start = if is_response && !skim_response_body {
            None
        } else {
            match op_code {
                OpCode::Message if body.len() >= 5 => Some(5), // flag bits (4) + section kind (1)
                OpCode::Query if body.len() >= 4 => {
                    // flags(4) + cstring collection + skip(4) numberToSkip + numberToReturn(4)
                    skip_query_prefix(body)
                }
                OpCode::Insert | OpCode::Update | OpCode::Delete => None, // legacy ops: skim not attempted
                OpCode::Reply | OpCode::CommandReply => reply_doc_offset(),
                _ => None,
            }
        };

        let fields = doc_start
            .and_then(|off| body.get(off..))
            .map(|doc| skim_top_level_fields(doc))
            .unwrap_or_default();

        let command = fields.first().map(|f| f.key.clone());

        MongoMessage {
            request_id,
            response_to,
            op_code: format!("{:?}", op_code),
            command,
            top_level_fields: fields,
        }
    }
}

fn skip_query_prefix(body: &[u8]) -> Option<usize> {
    let mut pos = 4; // flags
    let nul = body[pos..].iter().position(|&b| b == 0)?;
    pos += nul + 1; // skip full collection name cstring
    pos += 8; // numberToSkip + numberToReturn
    Some(pos)
}

fn reply_doc_offset() -> Option<usize> {
    // responseFlags(4) + cursorID(8) + startingFrom(4) + numberReturned(4)
    Some(20)
}

/// Reads only the top-level (key, BSON type byte) pairs of the document
/// starting at `doc`, without decoding any value payloads in full — we skip
/// past each value by its encoded length so the next key can be found.
fn skim_top_level_fields(doc: &[u8]) -> Vec<BsonField> {
    let mut fields = Vec::new();
    if doc.len() < 5 {
        return fields;
    }
    let mut pos = 4usize; // skip the document's own int32 length
    loop {
        if pos >= doc.len() {
            break;
        }
        let bson_type = doc[pos];
        if bson_type == 0x00 {
            break; // document terminator
        }
        pos += 1;
        let name_end = match doc[pos..].iter().position(|&b| b == 0) {
            Some(p) => pos + p,
            None => break,
        };
        let key = String::from_utf8_lossy(&doc[pos..name_end]).into_owned();
        pos = name_end + 1;

        let value_len = match bson_value_len(bson_type, &doc[pos..]) {
            Some(l) => l,
            None => {
                // Unknown/unsupported type width: stop skimming further keys,
                // but keep what we've already read.
                fields.push(BsonField { key, bson_type });
                break;
            }
        };
        fields.push(BsonField { key, bson_type });
        pos += value_len;
    }
    fields
}

/// Returns the byte width of a BSON value given its type tag, for the subset
/// of types common in command documents. Returns `None` for types we don't
/// bother skipping past (the skim just stops there).
fn bson_value_len(bson_type: u8, rest: &[u8]) -> Option<usize> {
    match bson_type {
        0x01 => Some(8),                              // double
        0x08 => Some(1),                              // bool
        0x0A => Some(0),                               // null
        0x10 => Some(4),                               // int32
        0x12 => Some(8),                               // int64
        0x09 => Some(8),                               // UTC datetime
        0x07 => Some(12),                              // ObjectId
        0x02 => {
            // string: int32 length (includes trailing nul) + bytes
            let len = i32::from_le_bytes(rest.get(0..4)?.try_into().ok()?) as usize;
            Some(4 + len)
        }
        0x03 | 0x04 => {
            // embedded document/array: int32 length includes itself
            let len = i32::from_le_bytes(rest.get(0..4)?.try_into().ok()?) as usize;
            Some(len)
        }
        0x05 => {
            // binary: int32 length + subtype byte + bytes
            let len = i32::from_le_bytes(rest.get(0..4)?.try_into().ok()?) as usize;
            Some(4 + 1 + len)
        }
        _ => None,
    }
}
