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

//! Per-client session handling: WebSocket upgrade, RFB handshake, and the
//! running message loop.
//!
//! # Protocol Flow
//!
//! 1. **WebSocket upgrade**: HTTP handshake, after which RFB bytes ride in
//!    binary frames
//! 2. **RFB handshake**: version exchange, security type None, security
//!    result, `ClientInit`/`ServerInit`
//! 3. **Message loop**: decode client messages from the byte stream and
//!    send framebuffer updates
//!
//! Updates are strictly request-driven: a `FramebufferUpdateRequest` arms
//! the session, and the next framebuffer generation the session has not
//! seen yet is sent as one Raw-encoded update. At most one update is in
//! flight per request, and frame ids seen by a client only ever increase.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::error::{Result, VncError};
use crate::events::ServerEvent;
use crate::framebuffer::FrameStore;
use crate::input::InputSink;
use crate::protocol::{
    self, PixelFormat, ServerInit, CLIENT_MSG_CLIENT_CUT_TEXT,
    CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST, CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT,
    CLIENT_MSG_SET_ENCODINGS, CLIENT_MSG_SET_PIXEL_FORMAT, PROTOCOL_VERSION, SECURITY_RESULT_OK,
    SECURITY_TYPE_NONE,
};
use crate::websocket::{WsFrame, WsStream};

/// Limit clipboard size to prevent memory exhaustion attacks.
const MAX_CUT_TEXT: usize = 10 * 1024 * 1024;

/// Runs one client from WebSocket upgrade through disconnect.
///
/// `Ok(())` is a clean disconnect (EOF or WebSocket close); protocol
/// violations and I/O failures surface as errors. The caller owns the
/// active-client accounting and the disconnect event.
pub(crate) async fn run_session<S>(
    stream: S,
    client_id: usize,
    address: SocketAddr,
    store: Arc<FrameStore>,
    input: Arc<dyn InputSink>,
    desktop_name: String,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frames = store.subscribe();
    let ws = WsStream::accept(stream).await?;

    let mut session = Session {
        client_id,
        ws,
        rfb: BytesMut::with_capacity(4096),
        store,
        input,
        encodings: Vec::new(),
        last_frame_seen: 0,
        update_pending: false,
    };

    session.handshake(&mut frames, &desktop_name).await?;
    info!("client {client_id} handshake completed ({address})");
    let _ = event_tx.send(ServerEvent::ClientConnected {
        id: client_id,
        address,
    });

    session.serve(&mut frames).await
}

struct Session<S> {
    client_id: usize,
    ws: WsStream<S>,
    /// RFB byte stream reassembled from WebSocket data frames.
    rfb: BytesMut,
    store: Arc<FrameStore>,
    input: Arc<dyn InputSink>,
    /// Encoding codes advertised by the client. Only Raw is ever used.
    encodings: Vec<i32>,
    last_frame_seen: u64,
    /// True iff an update request is outstanding and unsatisfied.
    update_pending: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// RFB 3.8 handshake: version, security (None), `ClientInit`,
    /// `ServerInit`.
    async fn handshake(
        &mut self,
        frames: &mut watch::Receiver<u64>,
        desktop_name: &str,
    ) -> Result<()> {
        self.ws.send_binary(PROTOCOL_VERSION.as_bytes()).await?;

        let version = self.read_exact(12).await?;
        // Any 3.x client is accepted; the minor version is not used.
        if !version.starts_with(b"RFB 003.") {
            return Err(VncError::Protocol(format!(
                "unsupported client version {:?}",
                String::from_utf8_lossy(&version)
            )));
        }

        self.ws.send_binary(&[1, SECURITY_TYPE_NONE]).await?;
        let choice = self.read_exact(1).await?;
        if choice[0] != SECURITY_TYPE_NONE {
            return Err(VncError::Protocol(format!(
                "client selected unsupported security type {}",
                choice[0]
            )));
        }
        self.ws.send_binary(&SECURITY_RESULT_OK.to_be_bytes()).await?;

        // ClientInit shared flag, read and ignored: the display is always
        // shared.
        let _shared = self.read_exact(1).await?;

        // Geometry comes from the capture adapter; the first client can
        // reach this point before the first frame has been captured.
        let (width, height) = loop {
            if let Some(geometry) = self.store.geometry() {
                break geometry;
            }
            frames.changed().await.map_err(|_| VncError::Closed)?;
        };

        let server_init = ServerInit {
            framebuffer_width: width,
            framebuffer_height: height,
            pixel_format: PixelFormat::rgba32(),
            name: desktop_name.to_string(),
        };
        let mut buf = BytesMut::new();
        server_init.write_to(&mut buf);
        self.ws.send_binary(&buf).await?;
        Ok(())
    }

    /// The running phase: interleaves inbound messages with outbound
    /// updates until the client goes away.
    async fn serve(&mut self, frames: &mut watch::Receiver<u64>) -> Result<()> {
        loop {
            if !self.drain_frames().await? {
                return Ok(()); // peer sent close
            }

            self.process_messages()?;

            if self.update_pending {
                if let Some(snapshot) = self.store.snapshot_if_newer(self.last_frame_seen) {
                    let update = protocol::encode_framebuffer_update(&snapshot);
                    self.ws.send_binary(&update).await?;
                    debug!(
                        "client {}: sent frame {} ({} rects, {} bytes)",
                        self.client_id,
                        snapshot.frame_id,
                        snapshot.rects.len(),
                        update.len()
                    );
                    self.last_frame_seen = snapshot.frame_id;
                    self.update_pending = false;
                }
            }

            tokio::select! {
                read = self.ws.fill() => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
                // Only wake on new frames while a request is outstanding.
                changed = frames.changed(), if self.update_pending => {
                    changed.map_err(|_| VncError::Closed)?;
                }
            }
        }
    }

    /// Moves every complete WebSocket frame into the RFB buffer, answering
    /// control frames inline. Returns `false` when the peer asked to
    /// close.
    async fn drain_frames(&mut self) -> Result<bool> {
        loop {
            match self.ws.next_frame()? {
                Some(WsFrame::Data(payload)) => self.rfb.extend_from_slice(&payload),
                Some(WsFrame::Ping(payload)) => self.ws.send_pong(&payload).await?,
                Some(WsFrame::Pong(_)) => {}
                Some(WsFrame::Close(_)) => {
                    let _ = self.ws.send_close().await;
                    return Ok(false);
                }
                None => return Ok(true),
            }
        }
    }

    /// Blocks until `n` bytes of the RFB stream are available, then
    /// consumes them. Handshake-phase helper.
    async fn read_exact(&mut self, n: usize) -> Result<BytesMut> {
        while self.rfb.len() < n {
            if !self.drain_frames().await? {
                return Err(VncError::Closed);
            }
            if self.rfb.len() >= n {
                break;
            }
            if self.ws.fill().await? == 0 {
                return Err(VncError::Closed);
            }
        }
        Ok(self.rfb.split_to(n))
    }

    /// Parses every complete RFB message sitting in the buffer. Incomplete
    /// trailing messages are left for the next read; unknown message codes
    /// are protocol errors.
    fn process_messages(&mut self) -> Result<()> {
        while !self.rfb.is_empty() {
            match self.rfb[0] {
                CLIENT_MSG_SET_PIXEL_FORMAT => {
                    if self.rfb.len() < 20 {
                        break; // 1 + 3 padding + 16 format
                    }
                    self.rfb.advance(4);
                    let requested = PixelFormat::from_bytes(&mut self.rfb);
                    // The server always ships the ServerInit format.
                    debug!(
                        "client {}: requested pixel format {}bpp depth {} (ignored)",
                        self.client_id, requested.bits_per_pixel, requested.depth
                    );
                }
                CLIENT_MSG_SET_ENCODINGS => {
                    if self.rfb.len() < 4 {
                        break; // 1 + 1 padding + 2 count
                    }
                    let count = usize::from(u16::from_be_bytes([self.rfb[2], self.rfb[3]]));
                    if self.rfb.len() < 4 + count * 4 {
                        break;
                    }
                    self.rfb.advance(4);
                    let mut encodings = Vec::with_capacity(count);
                    for _ in 0..count {
                        encodings.push(self.rfb.get_i32());
                    }
                    self.encodings = encodings;
                    debug!(
                        "client {}: advertised encodings {:?}",
                        self.client_id, self.encodings
                    );
                }
                CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                    if self.rfb.len() < 10 {
                        break; // 1 + 1 incremental + 8 rect
                    }
                    self.rfb.advance(1);
                    // Both incremental and full requests are answered with
                    // the current dirty-rect set.
                    let _incremental = self.rfb.get_u8();
                    let _x = self.rfb.get_u16();
                    let _y = self.rfb.get_u16();
                    let _width = self.rfb.get_u16();
                    let _height = self.rfb.get_u16();
                    self.update_pending = true;
                }
                CLIENT_MSG_KEY_EVENT => {
                    if self.rfb.len() < 8 {
                        break; // 1 + 1 down + 2 padding + 4 key
                    }
                    self.rfb.advance(1);
                    let down = self.rfb.get_u8() != 0;
                    self.rfb.advance(2);
                    let key = self.rfb.get_u32();
                    self.input.key_event(down, key);
                }
                CLIENT_MSG_POINTER_EVENT => {
                    if self.rfb.len() < 6 {
                        break; // 1 + 1 mask + 2 x + 2 y
                    }
                    self.rfb.advance(1);
                    let button_mask = self.rfb.get_u8();
                    let x = self.rfb.get_u16();
                    let y = self.rfb.get_u16();
                    self.input.pointer_event(button_mask, x, y);
                }
                CLIENT_MSG_CLIENT_CUT_TEXT => {
                    if self.rfb.len() < 8 {
                        break; // 1 + 3 padding + 4 length
                    }
                    let length = u32::from_be_bytes([
                        self.rfb[4],
                        self.rfb[5],
                        self.rfb[6],
                        self.rfb[7],
                    ]) as usize;
                    if length > MAX_CUT_TEXT {
                        return Err(VncError::Protocol(format!(
                            "cut text of {length} bytes exceeds limit"
                        )));
                    }
                    if self.rfb.len() < 8 + length {
                        break;
                    }
                    self.rfb.advance(8);
                    let _text = self.rfb.split_to(length);
                    debug!(
                        "client {}: discarded {length} bytes of cut text",
                        self.client_id
                    );
                }
                other => {
                    return Err(VncError::Protocol(format!(
                        "unknown client message type {other}"
                    )));
                }
            }
        }
        Ok(())
    }
}
