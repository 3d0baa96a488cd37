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

//! Input injection seam.
//!
//! Sessions decode `KeyEvent` and `PointerEvent` messages and hand them to
//! an [`InputSink`]; replaying them into the OS is the sink
//! implementation's concern. The default sink discards everything, which
//! is the right behavior for view-only servers.

/// Receives decoded client input. Called from session tasks, so
/// implementations must be cheap and non-blocking.
pub trait InputSink: Send + Sync {
    /// A key was pressed (`down = true`) or released. `key` is an X11
    /// keysym as carried by the RFB `KeyEvent` message.
    fn key_event(&self, down: bool, key: u32);

    /// Pointer moved or a button changed. `button_mask` bit 0 is the left
    /// button, bit 1 middle, bit 2 right; coordinates are framebuffer
    /// device pixels.
    fn pointer_event(&self, button_mask: u8, x: u16, y: u16);
}

/// Discards all input events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInput;

impl InputSink for NoopInput {
    fn key_event(&self, _down: bool, _key: u32) {}

    fn pointer_event(&self, _button_mask: u8, _x: u16, _y: u16) {}
}
