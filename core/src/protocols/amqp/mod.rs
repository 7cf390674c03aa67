//! AMQP 0-9-1 frame decoding: method/content-header/content-body frame
//! bookkeeping per channel, assembled into complete method calls (and, for
//! `Basic.Publish`/`Basic.Deliver`, the full message body once all content
//! frames have arrived).
//!
//! No example in the pack implements AMQP; frame/channel bookkeeping follows
//! Retina's per-stream pending-state-map idiom (`HashMap<channel, _>`
//! mirroring `HttpParser`'s `pending: HashMap<usize, Http>`).

mod transaction;

pub use transaction::AmqpMethod;

use std::time::Instant;

use byteorder::{BigEndian, ReadBytesExt};
use hashlink::LinkedHashMap;
use log::{debug, warn};

use crate::buffer::{BufferError, ZeroCopyBuffer};
use crate::conn::Direction;
use crate::protocols::{DecodeError, DecodedObject, Decoder, Role};

const FRAME_METHOD: u8 = 1;
const FRAME_HEADER: u8 = 2;
const FRAME_BODY: u8 = 3;
const FRAME_HEARTBEAT: u8 = 8;
const FRAME_END: u8 = 0xCE;

/// `Channel.Close` (class 20, method 40): releases any content assembly
/// still pending on that channel, since the channel is going away.
const CLASS_CHANNEL: u16 = 20;
const METHOD_CHANNEL_CLOSE: u16 = 40;

/// Caps the number of channels with in-flight content assembly, so a peer
/// that opens channels and never finishes a `Basic.Publish`/`Basic.Deliver`
/// can't grow `pending` without bound.
const MAX_PENDING_CHANNELS: usize = 128;

/// Method IDs that originate from the server and therefore get swapped to
/// `Role::Response` regardless of which direction they happen to be
/// observed on — mirrors `Basic.Deliver`'s server-initiated-push shape,
/// which the fuzzy matcher handles by role swap.
fn is_server_initiated(class_id: u16, method_id: u16) -> bool {
    matches!((class_id, method_id), (60, 60) /* basic.deliver */ | (20, 11) /* channel.open-ok */)
}

#[derive(Default)]
struct PendingContent {
    class_id: u16,
    method: AmqpMethod,
    body_size: u64,
    body: Vec<u8>,
}

#[derive(Default)]
pub struct AmqpDecoder {
    scratch_req: Vec<u8>,
    scratch_resp: Vec<u8>,
    pending: LinkedHashMap<u16, PendingContent>,
}

impl AmqpDecoder {
    pub fn new() -> Self {
        AmqpDecoder::default()
    }

    fn feed(scratch: &mut Vec<u8>, buf: &mut ZeroCopyBuffer<'_>) {
        loop {
            match buf.read(4096) {
                Ok(slice) if slice.is_empty() => break,
                Ok(slice) => scratch.extend_from_slice(slice),
                Err(BufferError::Eof) => break,
            }
        }
    }

    fn take_frame(scratch: &mut Vec<u8>) -> Option<(u8, u16, Vec<u8>)> {
        if scratch.len() < 7 {
            return None;
        }
        let frame_type = scratch[0];
        let channel = u16::from_be_bytes([scratch[1], scratch[2]]);
        let size = u32::from_be_bytes([scratch[3], scratch[4], scratch[5], scratch[6]]) as usize;
        let total = 7 + size + 1;
        if scratch.len() < total {
            return None;
        }
        if scratch[7 + size] != FRAME_END {
            // Resync by dropping one byte; a malformed frame never hangs the decoder.
            scratch.remove(0);
            return None;
        }
        let payload = scratch[7..7 + size].to_vec();
        scratch.drain(..total);
        Some((frame_type, channel, payload))
    }

    fn handle_frame(
        &mut self,
        is_client: bool,
        frame_type: u8,
        channel: u16,
        payload: &[u8],
        now: Instant,
        out: &mut Vec<DecodedObject<AmqpMethod>>,
    ) -> Result<(), DecodeError> {
        match frame_type {
            FRAME_METHOD => {
                let mut cursor = payload;
                if cursor.len() < 4 {
                    return Err(DecodeError::Framing("short method frame".into()));
                }
                let class_id = cursor.read_u16::<BigEndian>().unwrap();
                let method_id = cursor.read_u16::<BigEndian>().unwrap();
                let method = AmqpMethod::from_ids(class_id, method_id, cursor);

                if (class_id, method_id) == (CLASS_CHANNEL, METHOD_CHANNEL_CLOSE) {
                    if self.pending.remove(&channel).is_some() {
                        debug!(target: "amqp", "channel {channel} closed, dropping its pending content assembly");
                    }
                }

                if method.has_content {
                    if !self.pending.contains_key(&channel) && self.pending.len() >= MAX_PENDING_CHANNELS {
                        if let Some((evicted, _)) = self.pending.pop_front() {
                            warn!(target: "amqp", "pending-channel cap reached, dropping assembly for channel {evicted}");
                        }
                    }
                    self.pending.insert(
                        channel,
                        PendingContent { class_id, method: method.clone(), body_size: 0, body: Vec::new() },
                    );
                } else {
                    out.push(self.tag_role(is_client, class_id, method_id, method, now));
                }
                Ok(())
            }
            FRAME_HEADER => {
                if payload.len() < 12 {
                    return Err(DecodeError::Framing("short header frame".into()));
                }
                let body_size = u64::from_be_bytes(payload[4..12].try_into().unwrap());
                if let Some(pending) = self.pending.get_mut(&channel) {
                    pending.body_size = body_size;
                    if body_size == 0 {
                        let pending = self.pending.remove(&channel).unwrap();
                        let class_id = pending.class_id;
                        let method_id = pending.method.method_id;
                        out.push(self.tag_role(is_client, class_id, method_id, pending.method, now));
                    }
                }
                Ok(())
            }
            FRAME_BODY => {
                let done = if let Some(pending) = self.pending.get_mut(&channel) {
                    pending.body.extend_from_slice(payload);
                    pending.body.len() as u64 >= pending.body_size
                } else {
                    false
                };
                if done {
                    if let Some(mut pending) = self.pending.remove(&channel) {
                        let class_id = pending.class_id;
                        let method_id = pending.method.method_id;
                        pending.method.body = Some(std::mem::take(&mut pending.body));
                        out.push(self.tag_role(is_client, class_id, method_id, pending.method, now));
                    }
                }
                Ok(())
            }
            FRAME_HEARTBEAT => Ok(()),
            other => {
                warn!(target: "amqp", "unknown frame type {other}");
                Err(DecodeError::Unsupported)
            }
        }
    }

    fn tag_role(
        &self,
        is_client: bool,
        class_id: u16,
        method_id: u16,
        method: AmqpMethod,
        now: Instant,
    ) -> DecodedObject<AmqpMethod> {
        let base_role = if is_client { Role::Request } else { Role::Response };
        let role = if is_server_initiated(class_id, method_id) {
            Role::Response
        } else {
            base_role
        };
        DecodedObject { role, timestamp: now, payload: method }
    }
}

impl Decoder for AmqpDecoder {
    type Object = AmqpMethod;

    fn decode(
        &mut self,
        direction: Direction,
        is_client: bool,
        buf: &mut ZeroCopyBuffer<'_>,
        now: Instant,
    ) -> Result<Vec<DecodedObject<AmqpMethod>>, DecodeError> {
        let scratch = match direction {
            Direction::Originator => &mut self.scratch_req,
            Direction::Responder => &mut self.scratch_resp,
        };
        Self::feed(scratch, buf);

        let mut out = Vec::new();
        loop {
            let scratch = match direction {
                Direction::Originator => &mut self.scratch_req,
                Direction::Responder => &mut self.scratch_resp,
            };
            let (frame_type, channel, payload) = match Self::take_frame(scratch) {
                Some(f) => f,
                None => break,
            };
            self.handle_frame(is_client, frame_type, channel, &payload, now, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method_frame(channel: u16, class_id: u16, method_id: u16, args: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&class_id.to_be_bytes());
        payload.extend_from_slice(&method_id.to_be_bytes());
        payload.extend_from_slice(args);
        let mut frame = Vec::new();
        frame.push(FRAME_METHOD);
        frame.extend_from_slice(&channel.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame.push(FRAME_END);
        frame
    }

    fn header_frame(channel: u16, body_size: u64) -> Vec<u8> {
        let mut payload = vec![0u8; 4];
        payload.extend_from_slice(&body_size.to_be_bytes());
        let mut frame = Vec::new();
        frame.push(FRAME_HEADER);
        frame.extend_from_slice(&channel.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame.push(FRAME_END);
        frame
    }

    #[test]
    fn channel_close_drops_its_pending_content_assembly() {
        let mut decoder = AmqpDecoder::new();
        let mut buf = ZeroCopyBuffer::new();
        // basic.publish (has content) opens a pending assembly on channel 1...
        buf.write(&method_frame(1, 60, 40, &[0, 0, 1, b'q']));
        decoder.decode(Direction::Originator, true, &mut buf, Instant::now()).unwrap();
        assert!(decoder.pending.contains_key(&1));

        // ...channel.close on the same channel must release it.
        let mut close_buf = ZeroCopyBuffer::new();
        close_buf.write(&method_frame(1, CLASS_CHANNEL, METHOD_CHANNEL_CLOSE, &[]));
        decoder.decode(Direction::Originator, true, &mut close_buf, Instant::now()).unwrap();
        assert!(!decoder.pending.contains_key(&1));
    }

    #[test]
    fn pending_channel_cap_evicts_oldest_assembly() {
        let mut decoder = AmqpDecoder::new();
        for channel in 0..(MAX_PENDING_CHANNELS as u16 + 1) {
            let mut buf = ZeroCopyBuffer::new();
            buf.write(&method_frame(channel, 60, 40, &[0, 0, 1, b'q']));
            decoder.decode(Direction::Originator, true, &mut buf, Instant::now()).unwrap();
        }
        assert_eq!(decoder.pending.len(), MAX_PENDING_CHANNELS);
        assert!(!decoder.pending.contains_key(&0));
        assert!(decoder.pending.contains_key(&(MAX_PENDING_CHANNELS as u16)));
    }

    #[test]
    fn role_is_derived_from_is_client_not_hardcoded_direction() {
        // A request method arriving on the `Responder` direction (server is
        // the connection's originator tuple) must still be Role::Request.
        let mut decoder = AmqpDecoder::new();
        let mut buf = ZeroCopyBuffer::new();
        buf.write(&method_frame(1, 50, 10, &[0, 0, 1, b'q'])); // queue.declare
        let out = decoder.decode(Direction::Responder, true, &mut buf, Instant::now()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].role, Role::Request));
    }

    #[test]
    fn header_frame_with_zero_body_completes_immediately() {
        let mut decoder = AmqpDecoder::new();
        let mut buf = ZeroCopyBuffer::new();
        buf.write(&method_frame(1, 60, 40, &[0, 0, 1, b'q']));
        buf.write(&header_frame(1, 0));
        let out = decoder.decode(Direction::Originator, true, &mut buf, Instant::now()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!decoder.pending.contains_key(&1));
    }
}
