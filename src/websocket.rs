// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! WebSocket transport for the RFB byte stream (RFC 6455, server side).
//!
//! Three layers live here:
//! - the HTTP upgrade handshake (`Sec-WebSocket-Key` → SHA-1 → Base64
//!   accept token),
//! - a pure frame codec over `BytesMut` (incremental decode of masked
//!   client frames in the 7/16/64-bit length forms, encode of unmasked
//!   server frames),
//! - [`WsStream`], a thin buffered wrapper that the session drives.
//!
//! The RFB layer above sees a plain byte stream; nothing about WebSocket
//! framing leaks upward. Decoding never consumes a partial frame, so a
//! cancelled read leaves the buffer in a valid state.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, VncError};

/// GUID appended to the client key when computing the accept token
/// (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the HTTP upgrade request.
const MAX_REQUEST: usize = 8 * 1024;

/// Upper bound on a single client frame payload. RFB client messages are
/// tiny; anything near this is a broken or hostile peer.
const MAX_CLIENT_PAYLOAD: u64 = 1024 * 1024;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// A decoded client frame, already unmasked.
#[derive(Debug)]
pub(crate) enum WsFrame {
    /// Application payload (binary or continuation).
    Data(Bytes),
    /// Close requested by the peer.
    Close(Bytes),
    /// Ping; must be answered with a pong carrying the same payload.
    Ping(Bytes),
    /// Pong; discarded.
    Pong(Bytes),
}

/// Computes the `Sec-WebSocket-Accept` token for a client key.
pub(crate) fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Extracts the `Sec-WebSocket-Key` from a buffered HTTP upgrade request.
///
/// Returns `Ok(None)` until the full header block (terminated by a blank
/// line) has arrived; on success the request bytes are consumed from the
/// buffer, leaving any pipelined frames behind.
pub(crate) fn parse_upgrade(buf: &mut BytesMut) -> Result<Option<String>> {
    let Some(end) = find_header_end(buf) else {
        if buf.len() > MAX_REQUEST {
            return Err(VncError::Handshake("upgrade request too large".into()));
        }
        return Ok(None);
    };

    let head = buf.split_to(end + 4);
    let text = std::str::from_utf8(&head)
        .map_err(|_| VncError::Handshake("upgrade request is not valid UTF-8".into()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next();
    let _target = parts.next();
    let version = parts.next();
    if method != Some("GET") || version != Some("HTTP/1.1") || parts.next().is_some() {
        return Err(VncError::Handshake(format!(
            "malformed request line: {request_line:?}"
        )));
    }

    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
                return Ok(Some(value.trim().to_string()));
            }
        }
    }

    Err(VncError::Handshake(
        "missing Sec-WebSocket-Key header".into(),
    ))
}

/// Renders the `101 Switching Protocols` response for an accept token.
pub(crate) fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Decodes the next complete client frame from the buffer, or returns
/// `Ok(None)` when more bytes are needed. Partial frames are never
/// consumed.
///
/// Client frames must be masked per RFC 6455 §5.1; reserved bits, text
/// frames, unknown opcodes, and oversized or fragmented control frames are
/// protocol errors.
#[allow(clippy::cast_possible_truncation)] // payload length bounded by MAX_CLIENT_PAYLOAD
pub(crate) fn decode_frame(buf: &mut BytesMut) -> Result<Option<WsFrame>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];

    if b0 & 0x70 != 0 {
        return Err(VncError::WebSocket("reserved bits set".into()));
    }
    let fin = b0 & 0x80 != 0;
    let opcode = b0 & 0x0F;
    let masked = b1 & 0x80 != 0;

    let (len, header_len) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        n => (u64::from(n), 2),
    };

    if !masked {
        return Err(VncError::WebSocket(
            "client frame is not masked".into(),
        ));
    }
    if len > MAX_CLIENT_PAYLOAD {
        return Err(VncError::WebSocket(format!(
            "client frame payload of {len} bytes exceeds limit"
        )));
    }
    let len = len as usize;

    if buf.len() < header_len + 4 + len {
        return Ok(None);
    }

    if opcode & 0x8 != 0 {
        if !fin {
            return Err(VncError::WebSocket("fragmented control frame".into()));
        }
        if len > 125 {
            return Err(VncError::WebSocket("control frame payload over 125 bytes".into()));
        }
    }

    buf.advance(header_len);
    let mut key = [0u8; 4];
    key.copy_from_slice(&buf[..4]);
    buf.advance(4);

    let mut payload = buf.split_to(len);
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
    let payload = payload.freeze();

    match opcode {
        OPCODE_BINARY | OPCODE_CONTINUATION => Ok(Some(WsFrame::Data(payload))),
        OPCODE_CLOSE => Ok(Some(WsFrame::Close(payload))),
        OPCODE_PING => Ok(Some(WsFrame::Ping(payload))),
        OPCODE_PONG => Ok(Some(WsFrame::Pong(payload))),
        OPCODE_TEXT => Err(VncError::WebSocket("unexpected text frame".into())),
        other => Err(VncError::WebSocket(format!("unknown opcode {other:#x}"))),
    }
}

/// Encodes a server frame: FIN set, no mask, length in the shortest of the
/// 7/16/64-bit forms.
fn encode_frame(opcode: u8, payload: &[u8]) -> BytesMut {
    use bytes::BufMut;

    let mut buf = BytesMut::with_capacity(payload.len() + 10);
    buf.put_u8(0x80 | opcode);
    match payload.len() {
        n if n < 126 => buf.put_u8(n as u8),
        n if n <= usize::from(u16::MAX) => {
            buf.put_u8(126);
            buf.put_u16(n as u16);
        }
        n => {
            buf.put_u8(127);
            buf.put_u64(n as u64);
        }
    }
    buf.put_slice(payload);
    buf
}

/// Buffered WebSocket connection, generic over the underlying transport so
/// sessions can run on TCP sockets and tests on in-memory duplex streams.
pub(crate) struct WsStream<S> {
    stream: S,
    raw: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WsStream<S> {
    /// Performs the server side of the upgrade handshake and returns the
    /// framed connection. Pipelined bytes that arrive after the header
    /// block are preserved.
    pub(crate) async fn accept(stream: S) -> Result<Self> {
        let mut ws = Self {
            stream,
            raw: BytesMut::with_capacity(4096),
        };
        let key = loop {
            if let Some(key) = parse_upgrade(&mut ws.raw)? {
                break key;
            }
            if ws.stream.read_buf(&mut ws.raw).await? == 0 {
                return Err(VncError::Handshake(
                    "connection closed during handshake".into(),
                ));
            }
        };

        let response = upgrade_response(&accept_key(&key));
        ws.stream.write_all(response.as_bytes()).await?;
        ws.stream.flush().await?;
        Ok(ws)
    }

    /// Reads more bytes off the wire into the frame buffer. Returns the
    /// number of bytes read; zero means EOF. Cancel-safe.
    pub(crate) async fn fill(&mut self) -> Result<usize> {
        Ok(self.stream.read_buf(&mut self.raw).await?)
    }

    /// Pops the next complete frame out of the buffer, if one has arrived.
    pub(crate) fn next_frame(&mut self) -> Result<Option<WsFrame>> {
        decode_frame(&mut self.raw)
    }

    /// Sends one binary frame carrying the payload.
    pub(crate) async fn send_binary(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(OPCODE_BINARY, payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Answers a ping with a pong carrying the same payload.
    pub(crate) async fn send_pong(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(OPCODE_PONG, payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a close frame as part of a clean teardown.
    pub(crate) async fn send_close(&mut self) -> Result<()> {
        let frame = encode_frame(OPCODE_CLOSE, &[]);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a masked client frame the way a browser would.
    fn client_frame(opcode: u8, payload: &[u8], len_form: u8) -> Vec<u8> {
        let key = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = vec![0x80 | opcode];
        match len_form {
            126 => {
                frame.push(0x80 | 126);
                frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            }
            127 => {
                frame.push(0x80 | 127);
                frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            }
            _ => frame.push(0x80 | payload.len() as u8),
        }
        frame.extend_from_slice(&key);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % 4]),
        );
        frame
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parse_upgrade_extracts_key() {
        let mut buf = BytesMut::from(
            &b"GET /vnc HTTP/1.1\r\nHost: example\r\nUpgrade: websocket\r\n\
               Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"[..],
        );
        let key = parse_upgrade(&mut buf).unwrap().unwrap();
        assert_eq!(key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_upgrade_is_case_insensitive_and_trims() {
        let mut buf = BytesMut::from(
            &b"GET / HTTP/1.1\r\nsec-websocket-KEY:   abc123  \r\n\r\n"[..],
        );
        assert_eq!(parse_upgrade(&mut buf).unwrap().unwrap(), "abc123");
    }

    #[test]
    fn parse_upgrade_waits_for_full_request() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nSec-WebSocket-Key: x"[..]);
        assert!(parse_upgrade(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 36); // nothing consumed
    }

    #[test]
    fn parse_upgrade_keeps_pipelined_bytes() {
        let mut buf = BytesMut::from(
            &b"GET / HTTP/1.1\r\nSec-WebSocket-Key: k\r\n\r\n\x82\x81"[..],
        );
        parse_upgrade(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..], &[0x82, 0x81]);
    }

    #[test]
    fn parse_upgrade_rejects_bad_request_line() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nSec-WebSocket-Key: k\r\n\r\n"[..]);
        assert!(matches!(
            parse_upgrade(&mut buf),
            Err(VncError::Handshake(_))
        ));
    }

    #[test]
    fn parse_upgrade_rejects_missing_key() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"[..]);
        assert!(matches!(
            parse_upgrade(&mut buf),
            Err(VncError::Handshake(_))
        ));
    }

    #[test]
    fn decode_short_frame_roundtrip() {
        let mut buf = BytesMut::from(&client_frame(OPCODE_BINARY, b"hello", 0)[..]);
        match decode_frame(&mut buf).unwrap().unwrap() {
            WsFrame::Data(payload) => assert_eq!(&payload[..], b"hello"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_16_bit_length_form() {
        let payload = vec![0xABu8; 300];
        let mut buf = BytesMut::from(&client_frame(OPCODE_BINARY, &payload, 126)[..]);
        match decode_frame(&mut buf).unwrap().unwrap() {
            WsFrame::Data(data) => assert_eq!(&data[..], &payload[..]),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_64_bit_length_form() {
        let payload = vec![0x5Au8; 700];
        let mut buf = BytesMut::from(&client_frame(OPCODE_BINARY, &payload, 127)[..]);
        match decode_frame(&mut buf).unwrap().unwrap() {
            WsFrame::Data(data) => assert_eq!(&data[..], &payload[..]),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_partial_frame_consumes_nothing() {
        let frame = client_frame(OPCODE_BINARY, b"hello world", 0);
        let mut buf = BytesMut::from(&frame[..frame.len() - 3]);
        let before = buf.len();
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn decode_rejects_unmasked_client_frame() {
        let mut buf = BytesMut::from(&[0x82u8, 0x02, 0xAA, 0xBB][..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(VncError::WebSocket(_))
        ));
    }

    #[test]
    fn decode_rejects_reserved_bits() {
        let mut buf = BytesMut::from(&[0xC2u8, 0x80][..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(VncError::WebSocket(_))
        ));
    }

    #[test]
    fn decode_rejects_text_frames() {
        let mut buf = BytesMut::from(&client_frame(OPCODE_TEXT, b"hi", 0)[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(VncError::WebSocket(_))
        ));
    }

    #[test]
    fn decode_classifies_control_frames() {
        let mut buf = BytesMut::from(&client_frame(OPCODE_PING, b"p", 0)[..]);
        assert!(matches!(
            decode_frame(&mut buf).unwrap().unwrap(),
            WsFrame::Ping(_)
        ));

        let mut buf = BytesMut::from(&client_frame(OPCODE_CLOSE, &[0x03, 0xE8], 0)[..]);
        assert!(matches!(
            decode_frame(&mut buf).unwrap().unwrap(),
            WsFrame::Close(_)
        ));

        let mut buf = BytesMut::from(&client_frame(OPCODE_PONG, b"", 0)[..]);
        assert!(matches!(
            decode_frame(&mut buf).unwrap().unwrap(),
            WsFrame::Pong(_)
        ));
    }

    #[test]
    fn decode_rejects_oversized_control_frame() {
        let payload = vec![0u8; 200];
        let mut buf = BytesMut::from(&client_frame(OPCODE_PING, &payload, 126)[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(VncError::WebSocket(_))
        ));
    }

    #[test]
    fn encode_picks_shortest_length_form() {
        let frame = encode_frame(OPCODE_BINARY, &[0u8; 125]);
        assert_eq!(&frame[..2], &[0x82, 125]);

        let frame = encode_frame(OPCODE_BINARY, &[0u8; 126]);
        assert_eq!(&frame[..4], &[0x82, 126, 0x00, 126]);

        let frame = encode_frame(OPCODE_BINARY, &[0u8; 70_000]);
        assert_eq!(&frame[..2], &[0x82, 127]);
        assert_eq!(&frame[2..10], &70_000u64.to_be_bytes());
    }

    #[tokio::test]
    async fn handshake_over_duplex_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let accept_task = tokio::spawn(WsStream::accept(server));

        let (mut read_half, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(
                b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = vec![0u8; 256];
        let n = read_half.read(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response[..n]);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        accept_task.await.unwrap().unwrap();
    }
}
