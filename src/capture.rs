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

//! Display capture: the platform adapter seam and the capture loop.
//!
//! The rest of the server depends only on [`CaptureSource`], one blocking
//! operation that yields the next frame, a timeout, or a lost-source
//! signal. Platform backends (desktop duplication and friends) implement
//! it; [`SyntheticSource`] implements it with generated frames for demos
//! and tests.
//!
//! The capture loop owns the source exclusively, runs on its own thread at
//! a ~30 Hz cadence, and publishes frames into the shared
//! [`FrameStore`](crate::framebuffer::FrameStore). While no clients are
//! connected it sleeps instead of acquiring, so an idle server does not
//! burn GPU time.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::events::ServerEvent;
use crate::framebuffer::{FrameStore, Rect};

/// Target cadence between captured frames (~30 fps).
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Sleep while no clients are connected.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// How long a single acquire may block waiting for a new frame.
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// One frame handed over by a capture source.
#[derive(Debug)]
pub struct CapturedFrame {
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Row-major BGRA8 pixel data (`width * height * 4` bytes).
    pub pixels: Vec<u8>,
    /// Minimal regions changed since the previous acquire, if the source
    /// tracks them. Empty means no incremental information.
    pub dirty: Vec<Rect>,
}

/// Outcome of a single acquire call.
#[derive(Debug)]
pub enum CaptureEvent {
    /// A new frame arrived.
    Frame(CapturedFrame),
    /// Nothing changed within the timeout.
    Timeout,
    /// The source became invalid (display mode change, session switch) and
    /// must be rebuilt before the next acquire.
    Lost,
}

/// A display capture backend.
///
/// Implementations wrap the platform's display-duplication facility; the
/// loop owns the source exclusively and never shares it with sessions.
/// Returning an `Err` is fatal and shuts the capture pipeline down.
pub trait CaptureSource: Send {
    /// Blocks up to `timeout` for the next frame.
    fn acquire(&mut self, timeout: Duration) -> Result<CaptureEvent>;
}

/// Builds (and after [`CaptureEvent::Lost`], rebuilds) a capture source.
pub type CaptureFactory = Box<dyn FnMut() -> Result<Box<dyn CaptureSource>> + Send>;

/// Deterministic frame generator for demos and tests: an animated gradient
/// that advances one step per acquire.
pub struct SyntheticSource {
    width: u16,
    height: u16,
    frame: u32,
}

impl SyntheticSource {
    /// Creates a generator with the given geometry.
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            frame: 0,
        }
    }
}

impl CaptureSource for SyntheticSource {
    #[allow(clippy::cast_possible_truncation)]
    fn acquire(&mut self, _timeout: Duration) -> Result<CaptureEvent> {
        let w = usize::from(self.width);
        let h = usize::from(self.height);
        let mut pixels = vec![0u8; w * h * 4];
        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * 4;
                pixels[offset] = ((self.frame / 2) % 256) as u8; // B
                pixels[offset + 1] = ((y as u32 + self.frame) % 256) as u8; // G
                pixels[offset + 2] = ((x as u32 + self.frame) % 256) as u8; // R
                pixels[offset + 3] = 255;
            }
        }
        self.frame = self.frame.wrapping_add(1);

        Ok(CaptureEvent::Frame(CapturedFrame {
            width: self.width,
            height: self.height,
            pixels,
            dirty: Vec::new(),
        }))
    }
}

/// Drives a capture source until shutdown or a fatal error.
///
/// Runs on a dedicated thread. Each tick with at least one active client:
/// acquire, clamp the dirty rects to the framebuffer bounds, fall back to
/// a full-screen rect on the first frame or when the source reported no
/// rects, then publish into the store. `Lost` (including a mid-session
/// geometry change) tears the source down and rebuilds it from the
/// factory; a fatal error emits [`ServerEvent::Error`] and exits, leaving
/// connected sessions serving the last frame.
pub(crate) fn run_capture_loop(
    mut factory: CaptureFactory,
    store: Arc<FrameStore>,
    running: Arc<AtomicBool>,
    capture_running: Arc<AtomicBool>,
    active_clients: Arc<AtomicI32>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut source: Option<Box<dyn CaptureSource>> = None;
    let mut first_frame = true;

    while running.load(Ordering::SeqCst) && capture_running.load(Ordering::SeqCst) {
        if active_clients.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        let tick = Instant::now();

        if source.is_none() {
            match factory() {
                Ok(built) => {
                    source = Some(built);
                    first_frame = true;
                }
                Err(e) => {
                    error!("capture initialization failed: {e}");
                    let _ = event_tx.send(ServerEvent::Error {
                        message: format!("capture initialization failed: {e}"),
                    });
                    return;
                }
            }
        }
        let Some(src) = source.as_mut() else { continue };

        match src.acquire(ACQUIRE_TIMEOUT) {
            Ok(CaptureEvent::Frame(frame)) => {
                // Geometry is fixed at the first frame; a change means the
                // display was reconfigured and the source must be rebuilt.
                let geometry_changed = store
                    .geometry()
                    .is_some_and(|(w, h)| (w, h) != (frame.width, frame.height));
                if geometry_changed {
                    warn!(
                        "display geometry changed to {}x{}, reinitializing capture",
                        frame.width, frame.height
                    );
                    source = None;
                } else {
                    let mut rects: Vec<Rect> = frame
                        .dirty
                        .iter()
                        .filter_map(|r| r.clamp_to(frame.width, frame.height))
                        .collect();
                    if rects.is_empty() || first_frame {
                        rects = vec![Rect::full(frame.width, frame.height)];
                    }

                    store.write_bgra(&frame.pixels, frame.width, frame.height, rects);
                    first_frame = false;
                }
            }
            Ok(CaptureEvent::Timeout) => {}
            Ok(CaptureEvent::Lost) => {
                info!("capture source lost, reinitializing");
                source = None;
            }
            Err(e) => {
                error!("capture failed: {e}");
                let _ = event_tx.send(ServerEvent::Error {
                    message: format!("capture failed: {e}"),
                });
                return;
            }
        }

        if let Some(remaining) = FRAME_INTERVAL.checked_sub(tick.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_is_deterministic() {
        let mut a = SyntheticSource::new(16, 8);
        let mut b = SyntheticSource::new(16, 8);
        for _ in 0..3 {
            let fa = match a.acquire(Duration::ZERO).unwrap() {
                CaptureEvent::Frame(f) => f,
                other => panic!("unexpected event: {other:?}"),
            };
            let fb = match b.acquire(Duration::ZERO).unwrap() {
                CaptureEvent::Frame(f) => f,
                other => panic!("unexpected event: {other:?}"),
            };
            assert_eq!(fa.pixels, fb.pixels);
        }
    }

    #[test]
    fn synthetic_source_animates() {
        let mut source = SyntheticSource::new(16, 8);
        let first = match source.acquire(Duration::ZERO).unwrap() {
            CaptureEvent::Frame(f) => f.pixels,
            other => panic!("unexpected event: {other:?}"),
        };
        let second = match source.acquire(Duration::ZERO).unwrap() {
            CaptureEvent::Frame(f) => f.pixels,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_ne!(first, second);
    }

    #[test]
    fn synthetic_frames_are_bgra_sized() {
        let mut source = SyntheticSource::new(10, 5);
        match source.acquire(Duration::ZERO).unwrap() {
            CaptureEvent::Frame(f) => {
                assert_eq!(f.pixels.len(), 10 * 5 * 4);
                assert_eq!((f.width, f.height), (10, 5));
                assert!(f.dirty.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
