//! UDPROS datagram framing: connection ids, per-message sequence numbers and
//! fragmentation.
//!
//! Each datagram starts with a fixed 8-byte header. A message that fits in one
//! payload travels as a single DATA0 frame; otherwise the first fragment's
//! `block_id` carries the total fragment count and every subsequent fragment
//! carries its 1-based index. Reassembly never reorders: fragments are buffered
//! by index until the set is complete or a new message id abandons it.

use byteorder::{ByteOrder, LittleEndian};
use log::*;
use rosnative_common::{Error, Result};
use std::collections::BTreeMap;

pub(crate) const OPCODE_DATA0: u8 = 0;
pub(crate) const OPCODE_DATA_FIRST: u8 = 1;
pub(crate) const OPCODE_DATA_NEXT: u8 = 2;
pub(crate) const OPCODE_PING: u8 = 3;

pub(crate) const HEADER_LEN: usize = 8;
pub(crate) const DEFAULT_MAX_PAYLOAD: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub connection_id: u32,
    pub opcode: u8,
    pub message_id: u8,
    pub block_id: u16,
}

impl FrameHeader {
    pub(crate) fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.connection_id);
        buf[4] = self.opcode;
        buf[5] = self.message_id;
        LittleEndian::write_u16(&mut buf[6..8], self.block_id);
        buf
    }

    /// Splits a datagram into its header and payload.
    pub(crate) fn decode(datagram: &[u8]) -> Result<(FrameHeader, &[u8])> {
        if datagram.len() < HEADER_LEN {
            return Err(Error::Malformed(format!(
                "datagram of {} bytes is shorter than the frame header",
                datagram.len()
            )));
        }
        let header = FrameHeader {
            connection_id: LittleEndian::read_u32(&datagram[0..4]),
            opcode: datagram[4],
            message_id: datagram[5],
            block_id: LittleEndian::read_u16(&datagram[6..8]),
        };
        Ok((header, &datagram[HEADER_LEN..]))
    }
}

/// Splits an encoded message body (without any length prefix) into ready-to-send
/// datagrams for the given connection.
pub(crate) fn split_message(
    connection_id: u32,
    message_id: u8,
    payload: &[u8],
    max_payload: usize,
) -> Vec<Vec<u8>> {
    let max_payload = max_payload.max(1);
    if payload.len() <= max_payload {
        let header = FrameHeader {
            connection_id,
            opcode: OPCODE_DATA0,
            message_id,
            block_id: 0,
        };
        let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
        datagram.extend_from_slice(&header.encode());
        datagram.extend_from_slice(payload);
        return vec![datagram];
    }

    let chunks: Vec<&[u8]> = payload.chunks(max_payload).collect();
    let total = chunks.len() as u16;
    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let header = FrameHeader {
                connection_id,
                message_id,
                // The first fragment announces the block count, the rest their index
                opcode: if index == 0 {
                    OPCODE_DATA_FIRST
                } else {
                    OPCODE_DATA_NEXT
                },
                block_id: if index == 0 { total } else { index as u16 },
            };
            let mut datagram = Vec::with_capacity(HEADER_LEN + chunk.len());
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(chunk);
            datagram
        })
        .collect()
}

#[derive(Debug)]
struct PartialMessage {
    message_id: u8,
    // Set once the first fragment arrives
    total: Option<u16>,
    // Fragment index -> payload; index 0 is the first fragment
    parts: BTreeMap<u16, Vec<u8>>,
}

/// Reassembles fragmented messages for a single connection.
///
/// One message is in flight at a time: a frame for a new message id discards
/// whatever incomplete set was pending, which is how lost fragments age out.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    pending: Option<PartialMessage>,
}

impl Reassembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame; returns the complete message body when the frame
    /// finishes a set. Pings and stray fragments return None.
    pub(crate) fn push(&mut self, header: FrameHeader, payload: Vec<u8>) -> Option<Vec<u8>> {
        match header.opcode {
            OPCODE_DATA0 => {
                self.pending = None;
                Some(payload)
            }
            OPCODE_DATA_FIRST => {
                self.start_message(header.message_id);
                let pending = self.pending.as_mut().unwrap();
                pending.total = Some(header.block_id.max(1));
                pending.parts.insert(0, payload);
                self.try_complete()
            }
            OPCODE_DATA_NEXT => {
                if header.block_id == 0 {
                    debug!("Dropping fragment with zero block index");
                    return None;
                }
                self.start_message(header.message_id);
                let pending = self.pending.as_mut().unwrap();
                pending.parts.insert(header.block_id, payload);
                self.try_complete()
            }
            OPCODE_PING => None,
            other => {
                debug!("Dropping datagram with unknown opcode {other}");
                None
            }
        }
    }

    fn start_message(&mut self, message_id: u8) {
        let stale = match &self.pending {
            Some(pending) => pending.message_id != message_id,
            None => true,
        };
        if stale {
            if let Some(old) = &self.pending {
                debug!(
                    "Abandoning incomplete message {} ({} of {:?} fragments)",
                    old.message_id,
                    old.parts.len(),
                    old.total
                );
            }
            self.pending = Some(PartialMessage {
                message_id,
                total: None,
                parts: BTreeMap::new(),
            });
        }
    }

    fn try_complete(&mut self) -> Option<Vec<u8>> {
        let pending = self.pending.as_ref()?;
        let total = pending.total? as usize;
        if pending.parts.len() < total {
            return None;
        }
        let pending = self.pending.take().unwrap();
        let mut message = Vec::new();
        for (_, part) in pending.parts {
            message.extend_from_slice(&part);
        }
        Some(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = FrameHeader {
            connection_id: 0xdeadbeef,
            opcode: OPCODE_DATA_FIRST,
            message_id: 7,
            block_id: 3,
        };
        let encoded = header.encode();
        let (decoded, rest) = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn short_datagram_is_malformed() {
        assert!(matches!(
            FrameHeader::decode(&[0u8; 7]),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn small_message_is_a_single_frame() {
        let frames = split_message(9, 1, b"hello", 1500);
        assert_eq!(frames.len(), 1);
        let (header, payload) = FrameHeader::decode(&frames[0]).unwrap();
        assert_eq!(header.opcode, OPCODE_DATA0);
        assert_eq!(header.connection_id, 9);
        assert_eq!(payload, b"hello");
    }

    fn reassemble(frames: Vec<Vec<u8>>) -> Option<Vec<u8>> {
        let mut reassembler = Reassembler::new();
        let mut out = None;
        for frame in frames {
            let (header, payload) = FrameHeader::decode(&frame).unwrap();
            if let Some(message) = reassembler.push(header, payload.to_vec()) {
                out = Some(message);
            }
        }
        out
    }

    #[test]
    fn fragmented_message_reassembles_in_order() {
        let payload: Vec<u8> = (0..4000).map(|i| (i % 251) as u8).collect();
        let frames = split_message(1, 2, &payload, 1500);
        assert_eq!(frames.len(), 3);
        let (first, _) = FrameHeader::decode(&frames[0]).unwrap();
        assert_eq!(first.opcode, OPCODE_DATA_FIRST);
        assert_eq!(first.block_id, 3);
        assert_eq!(reassemble(frames), Some(payload));
    }

    #[test]
    fn fragments_arriving_out_of_order_are_buffered() {
        let payload: Vec<u8> = (0..4000).map(|i| (i % 17) as u8).collect();
        let mut frames = split_message(1, 2, &payload, 1500);
        frames.reverse();
        assert_eq!(reassemble(frames), Some(payload));
    }

    #[test]
    fn new_message_id_abandons_incomplete_set() {
        let payload: Vec<u8> = vec![1u8; 4000];
        let mut frames = split_message(1, 2, &payload, 1500);
        // Lose the last fragment of message 2, then deliver message 3 in full
        frames.pop();
        let mut reassembler = Reassembler::new();
        for frame in frames {
            let (header, body) = FrameHeader::decode(&frame).unwrap();
            assert!(reassembler.push(header, body.to_vec()).is_none());
        }
        let second: Vec<u8> = vec![2u8; 2000];
        let mut out = None;
        for frame in split_message(1, 3, &second, 1500) {
            let (header, body) = FrameHeader::decode(&frame).unwrap();
            if let Some(message) = reassembler.push(header, body.to_vec()) {
                out = Some(message);
            }
        }
        assert_eq!(out, Some(second));
    }

    #[test]
    fn ping_frames_are_ignored() {
        let mut reassembler = Reassembler::new();
        let header = FrameHeader {
            connection_id: 1,
            opcode: OPCODE_PING,
            message_id: 0,
            block_id: 0,
        };
        assert!(reassembler.push(header, Vec::new()).is_none());
    }
}
