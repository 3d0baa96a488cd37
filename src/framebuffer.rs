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

//! Shared framebuffer store between the capture loop and client sessions.
//!
//! One writer (the capture loop) and N readers (sessions) share a single
//! canonical RGBA buffer together with the dirty rects and a monotonic
//! frame counter. The three fields are replaced together under one brief
//! lock, so a reader that observes counter `k` always sees the pixels and
//! rects of generation `k` — never a torn frame.
//!
//! Pixels are held behind an `Arc` and swapped copy-on-write: a snapshot
//! clones the `Arc`, and the next write reuses the allocation when no
//! snapshot is outstanding. Sessions learn about new generations through a
//! `watch` channel carrying the counter, which plays the role of the frame
//! condition variable.

use std::sync::{Arc, Mutex};

use log::error;
use tokio::sync::watch;

/// An axis-aligned region of the framebuffer, half-open on the
/// right/bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of the top-left corner, in device pixels.
    pub x: i32,
    /// Y coordinate of the top-left corner, in device pixels.
    pub y: i32,
    /// Width in pixels.
    pub w: i32,
    /// Height in pixels.
    pub h: i32,
}

impl Rect {
    /// Creates a rect from its corner and extent.
    #[must_use]
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// The rect covering an entire framebuffer of the given geometry.
    #[must_use]
    pub fn full(width: u16, height: u16) -> Self {
        Self {
            x: 0,
            y: 0,
            w: i32::from(width),
            h: i32::from(height),
        }
    }

    /// Clips the rect to the framebuffer bounds.
    ///
    /// Returns `None` when nothing remains (zero or negative extent, or the
    /// rect lies entirely outside the framebuffer).
    #[must_use]
    pub fn clamp_to(&self, width: u16, height: u16) -> Option<Rect> {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = (self.x + self.w).min(i32::from(width));
        let y1 = (self.y + self.h).min(i32::from(height));
        if x1 > x0 && y1 > y0 {
            Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
        } else {
            None
        }
    }
}

/// A coherent view of one framebuffer generation.
///
/// The pixel buffer is shared, not copied: the store swaps in a fresh
/// allocation on the next write if this snapshot is still alive.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// The generation this snapshot belongs to.
    pub frame_id: u64,
    /// Framebuffer width in pixels.
    pub width: u16,
    /// Framebuffer height in pixels.
    pub height: u16,
    /// Regions changed since the previous generation, all within bounds.
    pub rects: Vec<Rect>,
    /// Full-frame RGBA pixel data (`width * height * 4` bytes).
    pub pixels: Arc<Vec<u8>>,
}

struct FrameState {
    /// Geometry, zero until the first capture completes. Immutable after.
    width: u16,
    height: u16,
    /// Canonical RGBA pixels for the current generation.
    pixels: Arc<Vec<u8>>,
    /// Dirty rects of the current generation.
    dirty: Vec<Rect>,
    /// Monotonic generation counter, bumped once per successful capture.
    counter: u64,
}

/// Process-wide framebuffer store; single writer, many readers.
pub struct FrameStore {
    state: Mutex<FrameState>,
    frame_tx: watch::Sender<u64>,
}

impl FrameStore {
    /// Creates an empty store with no geometry yet.
    #[must_use]
    pub fn new() -> Self {
        let (frame_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(FrameState {
                width: 0,
                height: 0,
                pixels: Arc::new(Vec::new()),
                dirty: Vec::new(),
                counter: 0,
            }),
            frame_tx,
        }
    }

    /// Subscribes to frame counter advances.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.frame_tx.subscribe()
    }

    /// The current generation counter.
    #[must_use]
    pub fn frame_counter(&self) -> u64 {
        self.lock().counter
    }

    /// The framebuffer geometry, once the first capture has set it.
    #[must_use]
    pub fn geometry(&self) -> Option<(u16, u16)> {
        let state = self.lock();
        if state.width == 0 {
            None
        } else {
            Some((state.width, state.height))
        }
    }

    /// Installs a new frame: converts the BGRA source into the canonical
    /// RGBA buffer, replaces the dirty rects, bumps the counter, and wakes
    /// waiting sessions.
    ///
    /// An empty `dirty` list is treated as a full-screen change. The first
    /// call fixes the store geometry for the lifetime of the server; the
    /// capture loop must not call this with a different geometry afterwards.
    pub(crate) fn write_bgra(&self, src: &[u8], width: u16, height: u16, dirty: Vec<Rect>) {
        let expected = usize::from(width) * usize::from(height) * 4;
        if src.len() != expected {
            error!(
                "capture frame size mismatch: got {} bytes, expected {expected}",
                src.len()
            );
            return;
        }

        let counter = {
            let mut state = self.lock();
            if state.width == 0 {
                state.width = width;
                state.height = height;
            }
            debug_assert_eq!((state.width, state.height), (width, height));

            // Readers holding a snapshot keep their generation; make_mut
            // gives the writer a private buffer in that case.
            let pixels = Arc::make_mut(&mut state.pixels);
            pixels.resize(expected, 0);
            for (dst, px) in pixels.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                dst[0] = px[2]; // R
                dst[1] = px[1]; // G
                dst[2] = px[0]; // B
                dst[3] = 255;
            }

            state.dirty = if dirty.is_empty() {
                vec![Rect::full(width, height)]
            } else {
                dirty
            };
            state.counter += 1;
            state.counter
        };

        // send_replace updates the value even when no session is
        // subscribed yet.
        self.frame_tx.send_replace(counter);
    }

    /// Returns a snapshot of the current generation when it is newer than
    /// `last_seen`, or `None` if the reader is already up to date.
    pub(crate) fn snapshot_if_newer(&self, last_seen: u64) -> Option<FrameSnapshot> {
        let state = self.lock();
        if state.counter <= last_seen {
            return None;
        }
        Some(FrameSnapshot {
            frame_id: state.counter,
            width: state.width,
            height: state.height,
            rects: state.dirty.clone(),
            pixels: Arc::clone(&state.pixels),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FrameState> {
        // The lock is only held for short copies; a poisoned mutex means a
        // panic mid-write and the pixel data can no longer be trusted.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgra_frame(width: u16, height: u16, b: u8, g: u8, r: u8) -> Vec<u8> {
        let mut frame = vec![0u8; usize::from(width) * usize::from(height) * 4];
        for px in frame.chunks_exact_mut(4) {
            px[0] = b;
            px[1] = g;
            px[2] = r;
            px[3] = 0; // source alpha is ignored
        }
        frame
    }

    #[test]
    fn write_converts_bgra_to_rgba_with_opaque_alpha() {
        let store = FrameStore::new();
        store.write_bgra(&bgra_frame(2, 2, 10, 20, 30), 2, 2, Vec::new());

        let snap = store.snapshot_if_newer(0).unwrap();
        assert_eq!(&snap.pixels[0..4], &[30, 20, 10, 255]);
    }

    #[test]
    fn empty_dirty_list_becomes_full_screen() {
        let store = FrameStore::new();
        store.write_bgra(&bgra_frame(8, 4, 0, 0, 0), 8, 4, Vec::new());

        let snap = store.snapshot_if_newer(0).unwrap();
        assert_eq!(snap.rects, vec![Rect::full(8, 4)]);
    }

    #[test]
    fn counter_advances_once_per_write() {
        let store = FrameStore::new();
        assert_eq!(store.frame_counter(), 0);
        store.write_bgra(&bgra_frame(2, 2, 0, 0, 0), 2, 2, Vec::new());
        store.write_bgra(&bgra_frame(2, 2, 0, 0, 0), 2, 2, Vec::new());
        assert_eq!(store.frame_counter(), 2);
    }

    #[test]
    fn snapshot_only_when_newer() {
        let store = FrameStore::new();
        store.write_bgra(&bgra_frame(2, 2, 0, 0, 0), 2, 2, Vec::new());

        let snap = store.snapshot_if_newer(0).unwrap();
        assert_eq!(snap.frame_id, 1);
        assert!(store.snapshot_if_newer(snap.frame_id).is_none());
    }

    #[test]
    fn held_snapshot_is_immune_to_later_writes() {
        let store = FrameStore::new();
        store.write_bgra(&bgra_frame(2, 2, 1, 2, 3), 2, 2, Vec::new());
        let snap = store.snapshot_if_newer(0).unwrap();

        store.write_bgra(&bgra_frame(2, 2, 9, 9, 9), 2, 2, Vec::new());
        // The old snapshot still carries generation 1's pixels.
        assert_eq!(&snap.pixels[0..4], &[3, 2, 1, 255]);
        let newer = store.snapshot_if_newer(snap.frame_id).unwrap();
        assert_eq!(&newer.pixels[0..4], &[9, 9, 9, 255]);
    }

    #[test]
    fn dirty_rects_pass_through_in_order() {
        let store = FrameStore::new();
        let rects = vec![Rect::new(10, 10, 20, 20), Rect::new(100, 100, 5, 5)];
        store.write_bgra(&bgra_frame(640, 480, 0, 0, 0), 640, 480, rects.clone());

        let snap = store.snapshot_if_newer(0).unwrap();
        assert_eq!(snap.rects, rects);
    }

    #[test]
    fn mismatched_frame_size_is_dropped() {
        let store = FrameStore::new();
        store.write_bgra(&[0u8; 16], 640, 480, Vec::new());
        assert_eq!(store.frame_counter(), 0);
        assert!(store.geometry().is_none());
    }

    #[test]
    fn rect_clamping() {
        assert_eq!(
            Rect::new(-5, -5, 20, 20).clamp_to(640, 480),
            Some(Rect::new(0, 0, 15, 15))
        );
        assert_eq!(
            Rect::new(630, 470, 100, 100).clamp_to(640, 480),
            Some(Rect::new(630, 470, 10, 10))
        );
        assert_eq!(Rect::new(10, 10, 0, 5).clamp_to(640, 480), None);
        assert_eq!(Rect::new(700, 10, 5, 5).clamp_to(640, 480), None);
        assert_eq!(Rect::new(10, 10, -4, 4).clamp_to(640, 480), None);
    }

    #[tokio::test]
    async fn watch_subscriber_sees_counter_advance() {
        let store = FrameStore::new();
        let mut rx = store.subscribe();
        store.write_bgra(&bgra_frame(2, 2, 0, 0, 0), 2, 2, Vec::new());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
