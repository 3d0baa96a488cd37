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

//! # webvncserver
//!
//! A VNC (RFB) server that streams a display to browser-based viewers over
//! WebSocket transport.
//!
//! The server couples a display-duplication capture source to N
//! independent RFB sessions through a shared framebuffer store: one
//! capture loop writes frames and a monotonic generation counter; each
//! session snapshots the store when — and only when — its client has an
//! outstanding `FramebufferUpdateRequest` and a generation it has not seen
//! yet. Clients never observe torn frames and never receive unrequested
//! updates.
//!
//! Wire stack: RFC 6455 WebSocket binary frames (plaintext, server side)
//! carrying an RFB 3.8 byte stream (RFC 6143) with the Raw encoding and
//! security type None.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use webvncserver::{
//!     CaptureFactory, CaptureSource, NoopInput, ServerConfig, SyntheticSource, VncServer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let capture: CaptureFactory = Box::new(|| {
//!         Ok(Box::new(SyntheticSource::new(1280, 720)) as Box<dyn CaptureSource>)
//!     });
//!     let (server, mut events) =
//!         VncServer::new(ServerConfig::default(), capture, Arc::new(NoopInput));
//!     let server = Arc::new(server);
//!
//!     server.start().await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   acquire()   ┌──────────────┐  write + counter  ┌────────────┐
//! │   Display    │ ────────────► │ Capture loop │ ────────────────► │ FrameStore │
//! │ (one thread) │               │   ~30 Hz     │                   │ (1 writer) │
//! └──────────────┘               └──────────────┘                   └─────┬──────┘
//!                                                                snapshot │ (N readers)
//!                                 ┌────────────┐  RFB in WS frames  ┌─────┴──────┐
//!                                 │  Viewer N  │ ◄───────────────── │ Session N  │
//!                                 └────────────┘                    └────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod input;
pub mod protocol;
pub mod server;

// Internal modules
mod client;
mod websocket;

// Re-exports
pub use capture::{CaptureEvent, CaptureFactory, CaptureSource, CapturedFrame, SyntheticSource};
pub use error::{Result, VncError};
pub use events::ServerEvent;
pub use framebuffer::{FrameSnapshot, FrameStore, Rect};
pub use input::{InputSink, NoopInput};
pub use protocol::PixelFormat;
pub use server::{ServerConfig, VncServer, DEFAULT_PORT};

/// VNC protocol version.
pub use protocol::PROTOCOL_VERSION;
