//! The decoded PostgreSQL frontend/backend message. One enum for both
//! directions, tag-dispatched, mirroring `protocols::mysql::MysqlMessage`.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum PostgresMessage {
    Startup { params: Vec<(String, String)> },
    Query { sql: String },
    Parse { statement: String, sql: String },
    Bind { portal: String, statement: String },
    /// `sql` is resolved from the prepared-statement cache through the
    /// portal → statement → sql chain, when available.
    Execute { portal: String, sql: Option<String> },
    ParseComplete,
    BindComplete,
    CommandComplete { tag: String },
    ReadyForQuery,
    ErrorResponse { code: String, message: String },
    RowDescription { field_count: u16 },
    DataRow { field_count: u16 },
    Other { tag: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_carries_resolved_sql() {
        let msg = PostgresMessage::Execute { portal: "p1".into(), sql: Some("SELECT 1".into()) };
        match msg {
            PostgresMessage::Execute { sql, .. } => assert_eq!(sql.as_deref(), Some("SELECT 1")),
            _ => panic!("wrong variant"),
        }
    }
}
