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

//! Static test pattern with input logging.
//!
//! Serves a single gradient frame and prints every key and pointer event
//! received from viewers, demonstrating a custom capture source and a
//! custom input sink.
//!
//! Usage:
//!   cargo run --example pattern

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use webvncserver::{
    CaptureEvent, CaptureFactory, CaptureSource, CapturedFrame, InputSink, Result as VncResult,
    ServerConfig, VncServer,
};

const WIDTH: u16 = 800;
const HEIGHT: u16 = 600;

/// Produces one gradient frame, then reports an unchanged display.
struct GradientSource {
    sent: bool,
}

impl CaptureSource for GradientSource {
    fn acquire(&mut self, timeout: Duration) -> VncResult<CaptureEvent> {
        if self.sent {
            std::thread::sleep(timeout);
            return Ok(CaptureEvent::Timeout);
        }
        self.sent = true;

        let mut pixels = vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * 4];
        for y in 0..usize::from(HEIGHT) {
            for x in 0..usize::from(WIDTH) {
                let offset = (y * usize::from(WIDTH) + x) * 4;
                pixels[offset] = 128; // B constant
                pixels[offset + 1] = (y * 255 / usize::from(HEIGHT)) as u8; // G vertical
                pixels[offset + 2] = (x * 255 / usize::from(WIDTH)) as u8; // R horizontal
                pixels[offset + 3] = 255;
            }
        }

        Ok(CaptureEvent::Frame(CapturedFrame {
            width: WIDTH,
            height: HEIGHT,
            pixels,
            dirty: Vec::new(),
        }))
    }
}

/// Prints decoded input instead of injecting it.
struct PrintInput;

impl InputSink for PrintInput {
    fn key_event(&self, down: bool, key: u32) {
        let action = if down { "pressed" } else { "released" };
        println!("[input] key {key:#x} {action}");
    }

    fn pointer_event(&self, button_mask: u8, x: u16, y: u16) {
        println!("[input] pointer at ({x}, {y}) buttons: {button_mask:08b}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let capture: CaptureFactory = Box::new(|| {
        Ok(Box::new(GradientSource { sent: false }) as Box<dyn CaptureSource>)
    });
    let config = ServerConfig {
        desktop_name: "Test Pattern".to_string(),
        ..ServerConfig::default()
    };
    let (server, mut events) = VncServer::new(config, capture, Arc::new(PrintInput));
    let server = Arc::new(server);

    server.start().await?;
    println!("Serving a static {WIDTH}x{HEIGHT} pattern on port 5900");
    println!("Press Ctrl+C to stop");

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("[event] {event:?}");
        }
    });

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
