//! The decoded MySQL command/response unit. MySQL's wire protocol doesn't
//! distinguish request and response types at the type level any more than
//! Redis does — both sides produce the same enum, and role is assigned by
//! which direction emitted it (mirrors `protocols::redis::RespValue`).

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum MysqlMessage {
    /// A client command packet. `query` is populated only for `COM_QUERY`
    /// (`0x03`); other command bytes are recorded but not interpreted.
    Command { command_byte: u8, query: Option<String> },
    Ok,
    Error { code: u16, sql_state: String, message: String },
    Eof,
    LocalInfile,
    AuthSwitch,
    /// A fully-drained result set: column definitions and rows were counted
    /// but never materialized.
    ResultSet { column_count: u64, row_count: u64 },
}

pub const COM_QUERY: u8 = 0x03;
