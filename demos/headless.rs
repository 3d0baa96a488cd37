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

//! Headless server with animated content.
//!
//! Serves a deterministic animated gradient instead of a real display,
//! demonstrating the server without any platform capture backend.
//!
//! Usage:
//!   cargo run --example headless
//!
//! Then point a WebSocket VNC viewer (e.g. noVNC) at ws://localhost:5900

use std::error::Error;
use std::sync::Arc;

use webvncserver::{
    CaptureFactory, CaptureSource, NoopInput, ServerConfig, ServerEvent, SyntheticSource,
    VncServer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let capture: CaptureFactory =
        Box::new(|| Ok(Box::new(SyntheticSource::new(640, 480)) as Box<dyn CaptureSource>));
    let (server, mut events) =
        VncServer::new(ServerConfig::default(), capture, Arc::new(NoopInput));
    let server = Arc::new(server);

    server.start().await?;
    println!("Serving an animated 640x480 test screen on port 5900");
    println!("Connect a WebSocket VNC viewer to ws://localhost:5900");
    println!("Press Ctrl+C to stop");

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ClientConnected { id, address } => {
                    println!("[event] client {id} connected from {address}");
                }
                ServerEvent::ClientDisconnected { id } => {
                    println!("[event] client {id} disconnected");
                }
                ServerEvent::Error { message } => {
                    eprintln!("[event] server error: {message}");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    server.stop().await;
    Ok(())
}
