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

//! Error types shared across the server, sessions, and the capture pipeline.

use thiserror::Error;

/// Errors produced while serving clients or capturing the display.
#[derive(Debug, Error)]
pub enum VncError {
    /// Underlying socket or stream I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP request was not a valid WebSocket upgrade.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    /// A WebSocket frame violating RFC 6455 was received.
    #[error("WebSocket protocol error: {0}")]
    WebSocket(String),

    /// A malformed or unknown RFB message was received.
    #[error("RFB protocol error: {0}")]
    Protocol(String),

    /// The capture adapter failed in a way that cannot be retried.
    #[error("capture error: {0}")]
    Capture(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VncError>;
