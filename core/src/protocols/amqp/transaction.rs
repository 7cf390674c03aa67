//! The typed AMQP method call, plus the small class/method-id name table.
//! An exhaustive table of every AMQP 0-9-1 method is collaborator data; this
//! covers the handful of methods that matter for round-trip reconstruction
//! (connection/channel negotiation, queue/exchange declaration, basic
//! publish/consume/deliver/ack).

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AmqpMethod {
    pub class_id: u16,
    pub method_id: u16,
    pub name: &'static str,
    pub exchange_or_queue: Option<String>,
    pub routing_key: Option<String>,
    #[serde(skip)]
    pub has_content: bool,
    pub body: Option<Vec<u8>>,
}

fn method_name(class_id: u16, method_id: u16) -> (&'static str, bool) {
    match (class_id, method_id) {
        (10, 10) => ("connection.start", false),
        (10, 11) => ("connection.start-ok", false),
        (10, 30) => ("connection.tune", false),
        (10, 31) => ("connection.tune-ok", false),
        (10, 40) => ("connection.open", false),
        (10, 41) => ("connection.open-ok", false),
        (10, 50) => ("connection.close", false),
        (10, 51) => ("connection.close-ok", false),
        (20, 10) => ("channel.open", false),
        (20, 11) => ("channel.open-ok", false),
        (20, 40) => ("channel.close", false),
        (20, 41) => ("channel.close-ok", false),
        (50, 10) => ("queue.declare", false),
        (50, 11) => ("queue.declare-ok", false),
        (50, 20) => ("queue.bind", false),
        (50, 21) => ("queue.bind-ok", false),
        (40, 10) => ("exchange.declare", false),
        (40, 11) => ("exchange.declare-ok", false),
        (60, 20) => ("basic.consume", false),
        (60, 21) => ("basic.consume-ok", false),
        (60, 40) => ("basic.publish", true),
        (60, 50) => ("basic.return", true),
        (60, 60) => ("basic.deliver", true),
        (60, 70) => ("basic.get", false),
        (60, 71) => ("basic.get-ok", true),
        (60, 72) => ("basic.get-empty", false),
        (60, 80) => ("basic.ack", false),
        (60, 90) => ("basic.reject", false),
        _ => ("unknown", false),
    }
}

/// Parses a shortstr (1-byte length prefix) at the start of `buf`, returning
/// the string and the rest of the buffer.
fn read_shortstr(buf: &[u8]) -> Option<(String, &[u8])> {
    let len = *buf.first()? as usize;
    let s = buf.get(1..1 + len)?;
    Some((String::from_utf8_lossy(s).into_owned(), &buf[1 + len..]))
}

impl AmqpMethod {
    pub fn from_ids(class_id: u16, method_id: u16, args: &[u8]) -> Self {
        let (name, has_content) = method_name(class_id, method_id);
        // For the two methods the matcher cares most about (publish/deliver),
        // the arguments layout is: [reserved(2) | exchange/queue (shortstr) |
        // routing-key (shortstr) | ...]. We skim just those two fields.
        let (exchange_or_queue, routing_key) = match (class_id, method_id) {
            (60, 40) | (60, 60) if args.len() > 2 => {
                let rest = &args[2..];
                match read_shortstr(rest) {
                    Some((exch, rest)) => match read_shortstr(rest) {
                        Some((rk, _)) => (Some(exch), Some(rk)),
                        None => (Some(exch), None),
                    },
                    None => (None, None),
                }
            }
            _ => (None, None),
        };

        AmqpMethod {
            class_id,
            method_id,
            name,
            exchange_or_queue,
            routing_key,
            has_content,
            body: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_args_yield_exchange_and_routing_key() {
        let mut args = vec![0u8, 0u8]; // reserved
        args.push(5);
        args.extend_from_slice(b"myexc");
        args.push(3);
        args.extend_from_slice(b"key");
        let m = AmqpMethod::from_ids(60, 40, &args);
        assert_eq!(m.name, "basic.publish");
        assert!(m.has_content);
        assert_eq!(m.exchange_or_queue.as_deref(), Some("myexc"));
        assert_eq!(m.routing_key.as_deref(), Some("key"));
    }
}
