//! The decoded Kafka request/response unit, paired by correlation id.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct KafkaMessage {
    pub correlation_id: i32,
    pub api_key: i16,
    pub api_version: i16,
    pub client_id: Option<String>,
    pub topic: Option<String>,
    pub group_id: Option<String>,
    pub error_code: Option<i16>,
}

impl KafkaMessage {
    pub fn request(correlation_id: i32, api_key: i16, api_version: i16, client_id: Option<String>) -> Self {
        KafkaMessage {
            correlation_id,
            api_key,
            api_version,
            client_id,
            topic: None,
            group_id: None,
            error_code: None,
        }
    }

    pub fn response(correlation_id: i32, api_key: i16, api_version: i16) -> Self {
        KafkaMessage {
            correlation_id,
            api_key,
            api_version,
            client_id: None,
            topic: None,
            group_id: None,
            error_code: None,
        }
    }
}

/// Keeps only printable ASCII in topic/group names, replacing anything else
/// with `?`.
pub fn ascii_safe(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}
