//! Typed DNS message, mirroring the field selection of Retina's
//! `dns::transaction::DnsTransaction` (question name/type/class plus answer
//! summary, not a full zone-record dump).

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: String,
    pub qclass: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsMessage {
    pub transaction_id: u16,
    pub query: bool,
    pub questions: Vec<DnsQuestion>,
    pub answer_count: u16,
    pub response_code: u8,
}

impl DnsMessage {
    pub fn from_packet(packet: &dns_parser::Packet) -> Self {
        DnsMessage {
            transaction_id: packet.header.id,
            query: packet.header.query,
            questions: packet
                .questions
                .iter()
                .map(|q| DnsQuestion {
                    name: q.qname.to_string(),
                    qtype: format!("{:?}", q.qtype),
                    qclass: format!("{:?}", q.qclass),
                })
                .collect(),
            answer_count: packet.header.answer_count,
            response_code: packet.header.response_code as u8,
        }
    }
}
