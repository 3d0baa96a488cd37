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

//! Server events that can be received by the application.

use std::net::SocketAddr;

/// Events emitted by the VNC server.
///
/// Events are delivered over the unbounded channel returned by
/// [`crate::VncServer::new`]. Delivery is fire-and-forget: a dropped
/// receiver never blocks the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed the RFB handshake and is now being served.
    ClientConnected {
        /// Unique client identifier.
        id: usize,
        /// Client's socket address.
        address: SocketAddr,
    },

    /// A client session terminated, for any reason.
    ClientDisconnected {
        /// Unique client identifier.
        id: usize,
    },

    /// The capture pipeline or the listener hit an unrecoverable error.
    ///
    /// Connected sessions stay open and keep serving the last known frame;
    /// they simply stop receiving updates.
    Error {
        /// Human-readable description of the failure.
        message: String,
    },
}
