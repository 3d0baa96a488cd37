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

//! VNC Remote Framebuffer (RFB) protocol constants and structures.
//!
//! This module provides the building blocks for the RFB side of the wire:
//! protocol version negotiation, message types, the security handshake,
//! pixel format definitions, and the Raw-encoded `FramebufferUpdate`
//! serializer. It implements the subset of RFC 6143 this server speaks.
//!
//! # Protocol Overview
//!
//! The RFB protocol operates in the following phases:
//! 1. **Protocol Version** - Server and client agree on protocol version
//! 2. **Security Handshake** - Authentication method selection and result
//! 3. **Initialization** - Exchange of framebuffer parameters
//! 4. **Normal Operation** - Ongoing message exchange for input events and
//!    screen updates

use bytes::{Buf, BufMut, BytesMut};

use crate::framebuffer::FrameSnapshot;

/// The RFB protocol version string advertised by the server.
///
/// This server implements RFB protocol version 3.8. The version string must
/// be exactly 12 bytes including the newline character as specified by the
/// RFB protocol.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

// Client-to-Server Message Types

/// Message type: Client requests to change the pixel format.
///
/// Parsed for framing but otherwise ignored; the server always ships the
/// format announced in `ServerInit`.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: Client specifies supported encodings.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: Client requests a framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: Client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Message type: Server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

// Encoding Types

/// Encoding type: Raw (uncompressed pixel data).
///
/// The only encoding this server emits. Clients are required by RFC 6143 to
/// support it regardless of what they advertise.
pub const ENCODING_RAW: i32 = 0;

// Security Types

/// Security type: None (no authentication).
///
/// No authentication is required. The connection proceeds directly to the
/// initialization phase after the security result.
pub const SECURITY_TYPE_NONE: u8 = 1;

// Security Results

/// Security result: Authentication successful.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Describes how pixel values map to colour channels.
///
/// The 16-byte wire layout appears in both `ServerInit` and the client's
/// `SetPixelFormat` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits used to store a single pixel on the wire.
    pub bits_per_pixel: u8,
    /// Significant bits within a pixel value.
    pub depth: u8,
    /// Non-zero if multi-byte pixel values are big-endian.
    pub big_endian_flag: u8,
    /// Non-zero if the pixel value directly encodes RGB.
    pub true_colour_flag: u8,
    /// Maximum red value.
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
    /// Bit shift of the red channel within a pixel value.
    pub red_shift: u8,
    /// Bit shift of the green channel.
    pub green_shift: u8,
    /// Bit shift of the blue channel.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The 32-bit true-colour format this server always serves: byte 0 red,
    /// byte 1 green, byte 2 blue, byte 3 unused (shifts 16/8/0).
    #[must_use]
    pub fn rgba32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Serializes the 16-byte pixel format (13 fields + 3 padding bytes).
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Parses a 16-byte pixel format from the buffer.
    ///
    /// The caller must have verified that at least 16 bytes are available.
    pub fn from_bytes(buf: &mut BytesMut) -> Self {
        let format = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3); // padding
        format
    }
}

/// Represents the `ServerInit` message sent during VNC initialization.
///
/// Sent by the server after security negotiation is complete. It provides
/// the client with framebuffer dimensions, pixel format, and the desktop
/// name.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// The width of the framebuffer in pixels.
    pub framebuffer_width: u16,
    /// The height of the framebuffer in pixels.
    pub framebuffer_height: u16,
    /// The pixel format used by the framebuffer.
    pub pixel_format: PixelFormat,
    /// The name of the desktop shown to connected clients.
    pub name: String,
}

impl ServerInit {
    /// Serializes the `ServerInit` message into a byte buffer.
    ///
    /// The format follows the RFB protocol specification:
    /// - 2 bytes: framebuffer width
    /// - 2 bytes: framebuffer height
    /// - 16 bytes: pixel format
    /// - 4 bytes: name length
    /// - N bytes: name string
    #[allow(clippy::cast_possible_truncation)] // Desktop name length limited to u32 per VNC protocol
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// Represents a rectangle header in a framebuffer update message.
#[derive(Debug)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
    /// The encoding type used for this rectangle's pixel data.
    pub encoding: i32,
}

impl Rectangle {
    /// Writes the 12-byte rectangle header to a byte buffer.
    ///
    /// VNC protocol requires big-endian (network byte order) for all
    /// multi-byte integers.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}

/// Serializes a complete `FramebufferUpdate` message for a frame snapshot.
///
/// One Raw-encoded rectangle is emitted per dirty rect, in the order the
/// snapshot carries them. For rects `Rᵢ` the message is exactly
/// `4 + Σᵢ (12 + 4·wᵢ·hᵢ)` bytes.
#[allow(clippy::cast_possible_truncation)] // rect coordinates were clamped to u16 framebuffer bounds
#[allow(clippy::cast_sign_loss)]
pub(crate) fn encode_framebuffer_update(snapshot: &FrameSnapshot) -> BytesMut {
    let payload: usize = snapshot
        .rects
        .iter()
        .map(|r| 12 + 4 * (r.w as usize) * (r.h as usize))
        .sum();
    let mut buf = BytesMut::with_capacity(4 + payload);

    buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
    buf.put_u8(0); // padding
    buf.put_u16(snapshot.rects.len() as u16);

    let fb_width = snapshot.width as usize;
    for rect in &snapshot.rects {
        Rectangle {
            x: rect.x as u16,
            y: rect.y as u16,
            width: rect.w as u16,
            height: rect.h as u16,
            encoding: ENCODING_RAW,
        }
        .write_header(&mut buf);

        // Raw pixel data, row-major RGBA.
        for row in rect.y..rect.y + rect.h {
            let start = ((row as usize) * fb_width + rect.x as usize) * 4;
            let end = start + (rect.w as usize) * 4;
            buf.put_slice(&snapshot.pixels[start..end]);
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Rect;
    use std::sync::Arc;

    #[test]
    fn server_init_wire_layout() {
        let init = ServerInit {
            framebuffer_width: 640,
            framebuffer_height: 480,
            pixel_format: PixelFormat::rgba32(),
            name: "test".to_string(),
        };
        let mut buf = BytesMut::new();
        init.write_to(&mut buf);

        assert_eq!(buf.len(), 24 + 4);
        assert_eq!(&buf[0..2], &[0x02, 0x80]); // width 640
        assert_eq!(&buf[2..4], &[0x01, 0xE0]); // height 480
        assert_eq!(buf[4], 32); // bits-per-pixel
        assert_eq!(buf[5], 24); // depth
        assert_eq!(buf[6], 0); // big-endian flag
        assert_eq!(buf[7], 1); // true-colour flag
        assert_eq!(&buf[8..10], &[0, 255]); // red-max
        assert_eq!(&buf[10..12], &[0, 255]); // green-max
        assert_eq!(&buf[12..14], &[0, 255]); // blue-max
        assert_eq!(buf[14], 16); // red-shift
        assert_eq!(buf[15], 8); // green-shift
        assert_eq!(buf[16], 0); // blue-shift
        assert_eq!(&buf[17..20], &[0, 0, 0]); // padding
        assert_eq!(&buf[20..24], &[0, 0, 0, 4]); // name-length
        assert_eq!(&buf[24..], b"test");
    }

    #[test]
    fn pixel_format_roundtrip() {
        let mut buf = BytesMut::new();
        PixelFormat::rgba32().write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let parsed = PixelFormat::from_bytes(&mut buf);
        assert_eq!(parsed, PixelFormat::rgba32());
        assert!(buf.is_empty());
    }

    #[test]
    fn rectangle_header_is_big_endian() {
        let mut buf = BytesMut::new();
        Rectangle {
            x: 10,
            y: 20,
            width: 300,
            height: 40,
            encoding: ENCODING_RAW,
        }
        .write_header(&mut buf);
        assert_eq!(
            &buf[..],
            &[0, 10, 0, 20, 0x01, 0x2C, 0, 40, 0, 0, 0, 0]
        );
    }

    #[test]
    fn update_message_size_matches_rect_sum() {
        let width = 64u16;
        let height = 48u16;
        let pixels = Arc::new(vec![0u8; width as usize * height as usize * 4]);
        let rects = vec![Rect::new(10, 10, 20, 20), Rect::new(40, 40, 5, 5)];
        let snapshot = FrameSnapshot {
            frame_id: 1,
            width,
            height,
            rects: rects.clone(),
            pixels,
        };

        let buf = encode_framebuffer_update(&snapshot);
        let expected: usize = 4
            + rects
                .iter()
                .map(|r| 12 + 4 * (r.w as usize) * (r.h as usize))
                .sum::<usize>();
        assert_eq!(buf.len(), expected);
        assert_eq!(buf[0], SERVER_MSG_FRAMEBUFFER_UPDATE);
        assert_eq!(&buf[2..4], &[0, 2]); // two rectangles
    }

    #[test]
    fn update_message_extracts_rect_pixels() {
        // 4x2 framebuffer with a recognizable pattern; request the right half.
        let width = 4u16;
        let height = 2u16;
        let mut pixels = vec![0u8; 4 * 2 * 4];
        for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
            px[0] = i as u8; // R identifies the pixel index
            px[3] = 255;
        }
        let snapshot = FrameSnapshot {
            frame_id: 1,
            width,
            height,
            rects: vec![Rect::new(2, 0, 2, 2)],
            pixels: Arc::new(pixels),
        };

        let buf = encode_framebuffer_update(&snapshot);
        // Header (4) + rect header (12), then pixels 2,3 (row 0) and 6,7 (row 1).
        let data = &buf[16..];
        assert_eq!(data.len(), 2 * 2 * 4);
        assert_eq!(data[0], 2);
        assert_eq!(data[4], 3);
        assert_eq!(data[8], 6);
        assert_eq!(data[12], 7);
    }
}
