//! Splits the replication byte stream into protocol packets.
//!
//! Each packet starts with a 3-byte little-endian payload length and a
//! sequence byte. A payload of exactly `MAX_PACKET_LEN` bytes continues in
//! the next packet. Bytes that do not yet form a whole packet stay buffered.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{DecodeError, DecodeResult};

pub const PACKET_HEADER_LEN: usize = 4;
pub const MAX_PACKET_LEN: usize = 0xFF_FFFF;

/// One logical packet of the binlog stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A binlog event, without the leading status byte.
    Event(Bytes),
    /// The server ended the stream.
    Eof,
    /// The server reported an error and will close the connection.
    Error { code: u16, message: String },
}

#[derive(Debug, Default)]
pub struct PacketFramer {
    buf: BytesMut,
    partial: BytesMut,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that reads from the connection should append to.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() + self.partial.len()
    }

    /// Drop everything buffered, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.partial.clear();
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> DecodeResult<Option<Frame>> {
        loop {
            if self.buf.len() < PACKET_HEADER_LEN {
                return Ok(None);
            }

            let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], 0]) as usize;
            if self.buf.len() < PACKET_HEADER_LEN + len {
                return Ok(None);
            }

            self.buf.advance(PACKET_HEADER_LEN);
            let payload = self.buf.split_to(len);
            self.partial.extend_from_slice(&payload);

            if len == MAX_PACKET_LEN {
                continue;
            }

            let packet = self.partial.split().freeze();
            return classify(packet).map(Some);
        }
    }
}

fn classify(packet: Bytes) -> DecodeResult<Frame> {
    match packet.first() {
        Some(0x00) => Ok(Frame::Event(packet.slice(1..))),
        Some(0xFE) if packet.len() < 9 => Ok(Frame::Eof),
        Some(0xFF) => Ok(parse_error_packet(&packet)),
        Some(other) => Err(DecodeError::Malformed(format!(
            "unexpected packet status 0x{other:02X}"
        ))),
        None => Err(DecodeError::Malformed("empty packet".into())),
    }
}

/// Parse an ERR packet (`0xFF`, code, optional `#` + SQL state, message).
pub fn parse_error_packet(packet: &[u8]) -> Frame {
    if packet.len() < 3 {
        return Frame::Error {
            code: 0,
            message: "truncated error packet".into(),
        };
    }

    let code = u16::from_le_bytes([packet[1], packet[2]]);
    let mut rest = &packet[3..];
    if rest.first() == Some(&b'#') && rest.len() >= 6 {
        rest = &rest[6..];
    }

    Frame::Error {
        code,
        message: String::from_utf8_lossy(rest).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = len.to_le_bytes()[..3].to_vec();
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_partial_packet_is_held_back() {
        let mut framer = PacketFramer::new();
        let bytes = packet(1, &[0x00, 1, 2, 3]);

        framer.extend(&bytes[..5]);
        assert_eq!(framer.next_frame().unwrap(), None);
        assert_eq!(framer.buffered(), 5);

        framer.extend(&bytes[5..]);
        assert_eq!(
            framer.next_frame().unwrap(),
            Some(Frame::Event(Bytes::from_static(&[1, 2, 3])))
        );
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut framer = PacketFramer::new();
        let mut bytes = packet(1, &[0x00, 0xAA]);
        bytes.extend(packet(2, &[0xFE, 0, 0, 2, 0]));
        framer.extend(&bytes);

        assert_eq!(
            framer.next_frame().unwrap(),
            Some(Frame::Event(Bytes::from_static(&[0xAA])))
        );
        assert_eq!(framer.next_frame().unwrap(), Some(Frame::Eof));
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn test_error_packet() {
        let mut framer = PacketFramer::new();
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&1236u16.to_le_bytes());
        payload.extend_from_slice(b"#HY000");
        payload.extend_from_slice(b"Could not find first log file name in binary log index file");
        framer.extend(&packet(1, &payload));

        match framer.next_frame().unwrap() {
            Some(Frame::Error { code, message }) => {
                assert_eq!(code, 1236);
                assert!(message.starts_with("Could not find first log file"));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_continued_packet() {
        let mut framer = PacketFramer::new();
        let mut first = vec![0x00];
        first.resize(MAX_PACKET_LEN, 7);
        framer.extend(&packet(1, &first));
        assert_eq!(framer.next_frame().unwrap(), None);

        framer.extend(&packet(2, &[8, 9]));
        match framer.next_frame().unwrap() {
            Some(Frame::Event(body)) => {
                assert_eq!(body.len(), MAX_PACKET_LEN - 1 + 2);
                assert_eq!(&body[body.len() - 2..], &[8, 9]);
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_status() {
        let mut framer = PacketFramer::new();
        framer.extend(&packet(1, &[0x42, 1]));
        assert!(matches!(
            framer.next_frame(),
            Err(DecodeError::Malformed(_))
        ));
    }
}
