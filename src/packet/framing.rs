//! Splits a byte stream into packet-sized XML documents.
//!
//! A packet ends with the closing `</OTPPacket>` tag (or a self-closing root).
//! An end tag inside a CDATA section or a comment does not end the packet.
//! Bytes that cannot begin a packet are reported as soon as they arrive so a
//! garbage-sending peer is answered without waiting for the size limit.

use super::CodecError;
use super::otp_packet::ELEMENT;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default upper bound for one packet on the wire.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 64 * 1024;

const OPEN: &[u8] = b"<OTPPacket";
const CLOSE: &[u8] = b"</OTPPacket>";
const PI: &[u8] = b"<?";
const COMMENT: &[u8] = b"<!--";
const DOCTYPE: &[u8] = b"<!DOCTYPE";
const CDATA: &[u8] = b"<![CDATA[";

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum Frame {
    /// The full text of one packet.
    Packet(String),
    /// The stream cannot be framed any further; the peer must be told and dropped.
    Malformed(CodecError),
    /// Peer closed the stream between packets.
    Closed,
}

/// Buffers bytes read from a stream until a whole packet is available.
#[derive(Debug)]
pub struct PacketReader {
    buf: Vec<u8>,
    max_packet_bytes: usize,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_BYTES)
    }
}

impl PacketReader {
    #[must_use]
    pub fn new(max_packet_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_packet_bytes,
        }
    }

    /// Read from `stream` until one frame is complete.
    ///
    /// Bytes following the frame stay buffered for the next call.
    ///
    /// # Errors
    /// Returns the underlying I/O error if reading the stream fails.
    pub async fn read_frame<R>(&mut self, stream: &mut R) -> io::Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match self.take_frame() {
                Scan::Frame(frame) => return Ok(frame),
                Scan::NeedMore => {}
            }

            if self.buf.len() >= self.max_packet_bytes {
                return Ok(Frame::Malformed(CodecError::TooLarge(self.max_packet_bytes)));
            }

            let read = stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    self.buf.clear();
                    return Ok(Frame::Closed);
                }
                return Ok(Frame::Malformed(CodecError::UnexpectedEof));
            }
        }
    }

    fn take_frame(&mut self) -> Scan {
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return Scan::NeedMore;
        };

        let Some(head) = self.buf.get(start..) else {
            return Scan::NeedMore;
        };

        let end = match packet_end(head) {
            Boundary::End(end) => end,
            Boundary::Partial => return Scan::NeedMore,
            Boundary::Garbage => {
                return Scan::Frame(Frame::Malformed(CodecError::Xml(format!(
                    "stream does not start with <{ELEMENT}>"
                ))));
            }
        };

        if end > self.max_packet_bytes {
            return Scan::Frame(Frame::Malformed(CodecError::TooLarge(self.max_packet_bytes)));
        }

        let frame: Vec<u8> = self.buf.drain(..start + end).skip(start).collect();
        match String::from_utf8(frame) {
            Ok(text) => Scan::Frame(Frame::Packet(text)),
            Err(_) => Scan::Frame(Frame::Malformed(CodecError::Xml(
                "packet is not valid utf-8".to_string(),
            ))),
        }
    }
}

enum Scan {
    Frame(Frame),
    NeedMore,
}

enum Boundary {
    End(usize),
    Partial,
    Garbage,
}

/// Locate the end of the packet at the front of `head`.
///
/// Declarations, comments and a doctype may precede the root. Inside the root the
/// end tag only counts outside CDATA sections, comments and processing
/// instructions, the same places the XML reader treats as markup.
fn packet_end(head: &[u8]) -> Boundary {
    let Some(root) = skip_prologue(head) else {
        return Boundary::Partial;
    };
    let Some(rest) = head.get(root..) else {
        return Boundary::Partial;
    };
    if !could_open_packet(rest) {
        return Boundary::Garbage;
    }
    match self_closing_root(rest).or_else(|| close_tag_end(rest)) {
        Some(end) => Boundary::End(root + end),
        None => Boundary::Partial,
    }
}

/// Offset of the first byte after the prologue, or `None` while it is incomplete.
fn skip_prologue(head: &[u8]) -> Option<usize> {
    let mut pos = 0;
    loop {
        pos += head
            .get(pos..)?
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        let rest = head.get(pos..)?;

        let skipped = if rest.starts_with(PI) {
            skip_past(rest, PI.len(), b"?>")?
        } else if rest.starts_with(COMMENT) {
            skip_past(rest, COMMENT.len(), b"-->")?
        } else if rest.starts_with(DOCTYPE) {
            doctype_end(rest)?
        } else if rest.is_empty() || [PI, COMMENT, DOCTYPE].iter().any(|m| m.starts_with(rest)) {
            return None;
        } else {
            return Some(pos);
        };
        pos += skipped;
    }
}

/// End offset of the root's closing tag.
fn close_tag_end(root: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(offset) = root.get(pos..)?.iter().position(|&b| b == b'<') {
        let at = pos + offset;
        let tail = root.get(at..)?;
        pos = if tail.starts_with(CLOSE) {
            return Some(at + CLOSE.len());
        } else if tail.starts_with(CDATA) {
            at + skip_past(tail, CDATA.len(), b"]]>")?
        } else if tail.starts_with(COMMENT) {
            at + skip_past(tail, COMMENT.len(), b"-->")?
        } else if tail.starts_with(PI) {
            at + skip_past(tail, PI.len(), b"?>")?
        } else {
            at + 1
        };
    }
    None
}

/// Length of the construct at the front of `input` up to and including `terminator`.
fn skip_past(input: &[u8], from: usize, terminator: &[u8]) -> Option<usize> {
    let body = input.get(from..)?;
    find(body, terminator).map(|pos| from + pos + terminator.len())
}

/// Length of `<!DOCTYPE ...>`, stepping over an internal subset and quoted literals.
fn doctype_end(input: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = None;
    for (i, &b) in input.iter().enumerate().skip(DOCTYPE.len()) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'[') => depth += 1,
            (None, b']') => depth = depth.saturating_sub(1),
            (None, b'>') if depth == 0 => return Some(i + 1),
            (None, _) => {}
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// True while `head` is still a possible beginning of `<OTPPacket ...`.
fn could_open_packet(head: &[u8]) -> bool {
    if head.len() <= OPEN.len() {
        return OPEN.starts_with(head);
    }
    head.starts_with(OPEN)
        && head
            .get(OPEN.len())
            .is_some_and(|b| b.is_ascii_whitespace() || *b == b'>' || *b == b'/')
}

/// End offset of `<OTPPacket .../>` if the root start tag is complete and self-closing.
fn self_closing_root(head: &[u8]) -> Option<usize> {
    if !head.starts_with(OPEN) {
        return None;
    }
    let mut quote = None;
    for (i, &b) in head.iter().enumerate().skip(OPEN.len()) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'>') => {
                return (i > 0 && head.get(i - 1) == Some(&b'/')).then_some(i + 1);
            }
            (None, _) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::OtpPacket;
    use tokio::io::AsyncWriteExt;

    const HELLO: &str = r#"<OTPPacket version="1"><Message type="HELLO"></Message></OTPPacket>"#;

    async fn frames_of(input: &[u8], max: usize) -> Vec<Frame> {
        let (mut client, mut server) = tokio::io::duplex(64);
        let input = input.to_vec();
        let writer = tokio::spawn(async move {
            for chunk in input.chunks(7) {
                if client.write_all(chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut reader = PacketReader::new(max);
        let mut frames = Vec::new();
        loop {
            match reader.read_frame(&mut server).await {
                Ok(Frame::Closed) => {
                    frames.push(Frame::Closed);
                    break;
                }
                Ok(Frame::Malformed(e)) => {
                    frames.push(Frame::Malformed(e));
                    break;
                }
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }
        drop(server);
        let _ = writer.await;
        frames
    }

    #[tokio::test]
    async fn splits_back_to_back_packets() {
        let input = format!("{HELLO}\n{HELLO}  ");
        let frames = frames_of(input.as_bytes(), DEFAULT_MAX_PACKET_BYTES).await;
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], Frame::Packet(p) if p == HELLO));
        assert!(matches!(&frames[1], Frame::Packet(p) if p == HELLO));
        assert!(matches!(frames[2], Frame::Closed));
    }

    #[tokio::test]
    async fn keeps_xml_declaration() {
        let input = format!("<?xml version=\"1.0\"?>{HELLO}");
        let frames = frames_of(input.as_bytes(), DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(
            &frames[0],
            Frame::Packet(p) if p.starts_with("<?xml") && p.ends_with("</OTPPacket>")
        ));
    }

    #[tokio::test]
    async fn garbage_is_reported_immediately() {
        let frames = frames_of(b"GET / HTTP/1.1\r\n", DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(frames[0], Frame::Malformed(CodecError::Xml(_))));

        let frames = frames_of(b"<OTPPacketX>", DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(frames[0], Frame::Malformed(CodecError::Xml(_))));
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected() {
        let input = format!(
            "<OTPPacket><Message type=\"ADD\">{}</Message></OTPPacket>",
            "x".repeat(256)
        );
        let frames = frames_of(input.as_bytes(), 128).await;
        assert!(matches!(frames[0], Frame::Malformed(CodecError::TooLarge(128))));
    }

    #[tokio::test]
    async fn eof_inside_packet_is_malformed() {
        let input = b"<OTPPacket><Message type=\"HELLO\">";
        let frames = frames_of(input, DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(frames[0], Frame::Malformed(CodecError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn self_closing_root_is_a_frame() {
        let frames = frames_of(br#"<OTPPacket version="1>"/>"#, DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(&frames[0], Frame::Packet(p) if p == r#"<OTPPacket version="1>"/>"#));
    }

    #[tokio::test]
    async fn end_tag_inside_cdata_does_not_end_the_packet() {
        let input = concat!(
            r#"<OTPPacket version="1"><Message type="ADD">"#,
            "<![CDATA[x</OTPPacket>y]]></Message></OTPPacket>",
        );
        let frames = frames_of(input.as_bytes(), DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(&frames[0], Frame::Packet(p) if p == input));

        let Frame::Packet(text) = &frames[0] else {
            panic!("expected a packet, got {:?}", frames[0]);
        };
        let packet = OtpPacket::from_xml(text);
        assert_eq!(
            packet.ok().map(|p| p.message.content),
            Some("x</OTPPacket>y".to_string())
        );
    }

    #[tokio::test]
    async fn end_tag_inside_comment_does_not_end_the_packet() {
        let input = concat!(
            "<OTPPacket><!-- </OTPPacket> -->",
            r#"<Message type="HELLO"/><?note </OTPPacket>?></OTPPacket>"#,
        );
        let frames = frames_of(input.as_bytes(), DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(&frames[0], Frame::Packet(p) if p == input));
        assert!(matches!(frames[1], Frame::Closed));
    }

    #[tokio::test]
    async fn garbage_after_prologue_is_reported_immediately() {
        let frames = frames_of(
            b"<?xml version=\"1.0\"?>GET / HTTP/1.1\r\n",
            DEFAULT_MAX_PACKET_BYTES,
        )
        .await;
        assert!(matches!(frames[0], Frame::Malformed(CodecError::Xml(_))));

        let frames = frames_of(b"<!-- hi --> <Packet>", DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(frames[0], Frame::Malformed(CodecError::Xml(_))));
    }

    #[tokio::test]
    async fn self_closing_root_after_prologue_is_a_frame() {
        let input = r#"<?xml version="1.0"?><!DOCTYPE OTPPacket [<!ENTITY a "b">]><OTPPacket/>"#;
        let frames = frames_of(input.as_bytes(), DEFAULT_MAX_PACKET_BYTES).await;
        assert!(matches!(&frames[0], Frame::Packet(p) if p == input));
        assert!(matches!(frames[1], Frame::Closed));
    }

    #[test]
    fn incomplete_prologue_waits_for_more() {
        assert!(matches!(packet_end(b"<"), Boundary::Partial));
        assert!(matches!(packet_end(b"<!-"), Boundary::Partial));
        assert!(matches!(packet_end(b"<?xml version"), Boundary::Partial));
        assert!(matches!(packet_end(b"<!-- x --><OTP"), Boundary::Partial));
        assert!(matches!(packet_end(b"<![CDATA[x]]>"), Boundary::Garbage));
    }

    #[test]
    fn open_prefix_detection() {
        assert!(could_open_packet(b"<OTP"));
        assert!(could_open_packet(b"<OTPPacket "));
        assert!(could_open_packet(b"<OTPPacket>"));
        assert!(!could_open_packet(b"<Foo"));
        assert!(!could_open_packet(b"<OTPPackets>"));
    }
}
