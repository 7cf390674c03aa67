//! The RESP2 value tree. Redis doesn't distinguish request/response types at
//! the wire level — both are `RespValue` trees, and the matcher (§4.6's
//! `ListMatcher`) is what assigns request/response roles by pairing order.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<RespValue>),
}
