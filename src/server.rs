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

//! VNC-over-WebSocket server: listener, session lifecycle, and capture
//! loop ownership.
//!
//! # Architecture
//!
//! - One listener task accepts TCP connections and spawns a detached
//!   session task per client
//! - One capture thread, started lazily when the first client arrives,
//!   feeds the shared framebuffer store; it idles while nobody is watching
//!   and is only torn down by [`VncServer::stop`]
//! - Server events (connect/disconnect/error) flow to the application over
//!   an unbounded channel

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::capture::{run_capture_loop, CaptureFactory};
use crate::client;
use crate::error::{Result, VncError};
use crate::events::ServerEvent;
use crate::framebuffer::FrameStore;
use crate::input::InputSink;

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;

/// Global atomic counter for assigning unique client IDs.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Server construction parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on. Port 0 asks the OS for an ephemeral port,
    /// which [`VncServer::local_addr`] then reports.
    pub port: u16,
    /// Reserved. Accepted but unused: only security type None is
    /// advertised.
    pub password: Option<String>,
    /// Desktop name sent to clients in `ServerInit`.
    pub desktop_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            password: None,
            desktop_name: "WebVNC".to_string(),
        }
    }
}

/// A VNC server streaming one display to N WebSocket viewers.
pub struct VncServer {
    config: ServerConfig,
    store: Arc<FrameStore>,
    input: Arc<dyn InputSink>,
    /// Consumed when the capture thread starts; a fatally dead capture
    /// pipeline is not restarted (connected viewers keep the last frame).
    capture_factory: Mutex<Option<CaptureFactory>>,
    running: Arc<AtomicBool>,
    capture_running: Arc<AtomicBool>,
    active_clients: Arc<AtomicI32>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    session_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    capture_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl VncServer {
    /// Creates a server around a capture backend and an input sink.
    ///
    /// Framebuffer geometry is learned from the first captured frame, not
    /// configured. Returns the server together with the receiver for
    /// [`ServerEvent`]s.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        capture: CaptureFactory,
        input: Arc<dyn InputSink>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        if config.password.is_some() {
            warn!("a password was configured but authentication is not implemented; security type None is advertised");
        }

        let server = Self {
            config,
            store: Arc::new(FrameStore::new()),
            input,
            capture_factory: Mutex::new(Some(capture)),
            running: Arc::new(AtomicBool::new(false)),
            capture_running: Arc::new(AtomicBool::new(false)),
            active_clients: Arc::new(AtomicI32::new(0)),
            event_tx,
            shutdown_tx,
            local_addr: Mutex::new(None),
            listener_task: Mutex::new(None),
            session_tasks: Arc::new(Mutex::new(Vec::new())),
            capture_thread: Mutex::new(None),
        };

        (server, event_rx)
    }

    /// Binds the configured port and starts accepting viewers.
    ///
    /// Binding happens before this returns, so a port conflict surfaces
    /// here rather than from the background task.
    ///
    /// # Errors
    ///
    /// Returns the bind error (e.g. address in use) on failure.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("start called while already running");
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let addr = listener.local_addr()?;
        *lock(&self.local_addr) = Some(addr);
        let _ = self.shutdown_tx.send(false);
        info!("VNC server listening on {addr}");

        let server = Arc::clone(self);
        let handle = tokio::spawn(async move { server.accept_loop(listener).await });
        *lock(&self.listener_task) = Some(handle);
        Ok(())
    }

    /// Stops the listener, all sessions, and the capture loop, waiting for
    /// each to finish. Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.capture_running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        // Take the handles out before awaiting so no lock guard lives
        // across an await point.
        let listener = lock(&self.listener_task).take();
        if let Some(handle) = listener {
            let _ = handle.await;
        }

        let sessions = std::mem::take(&mut *lock(&self.session_tasks));
        for task in sessions {
            let _ = task.await;
        }

        let capture = lock(&self.capture_thread).take();
        if let Some(thread) = capture {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }

        info!("VNC server stopped");
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn active_clients_count(&self) -> i32 {
        self.active_clients.load(Ordering::SeqCst)
    }

    /// The bound listener address, once [`VncServer::start`] succeeded.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Placeholder for quality control; a Raw-only server has nothing to
    /// adjust.
    pub fn set_quality(&self, level: u8) {
        debug!("quality level {level} requested (ignored)");
    }

    /// Shared framebuffer store, e.g. for observing the frame counter.
    #[must_use]
    pub fn frame_store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => self.spawn_session(stream, address),
                    Err(e) => error!("error accepting connection: {e}"),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("listener exited");
    }

    #[allow(clippy::cast_possible_truncation)] // client ID counter is far below usize::MAX in practice
    fn spawn_session(self: &Arc<Self>, stream: TcpStream, address: SocketAddr) {
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst) as usize;
        info!("new connection from {address} (client {client_id})");

        if self.active_clients.fetch_add(1, Ordering::SeqCst) == 0 {
            self.start_capture();
        }

        let server = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let _ = stream.set_nodelay(true);

            // Dropping the session future on shutdown closes the socket
            // and unblocks any in-flight read.
            let result = tokio::select! {
                r = client::run_session(
                    stream,
                    client_id,
                    address,
                    Arc::clone(&server.store),
                    Arc::clone(&server.input),
                    server.config.desktop_name.clone(),
                    server.event_tx.clone(),
                ) => r,
                _ = shutdown.changed() => Ok(()),
            };

            match result {
                Ok(()) | Err(VncError::Closed) => info!("client {client_id} disconnected"),
                Err(e) => warn!("client {client_id} terminated: {e}"),
            }

            server.active_clients.fetch_sub(1, Ordering::SeqCst);
            let _ = server
                .event_tx
                .send(ServerEvent::ClientDisconnected { id: client_id });
        });

        lock(&self.session_tasks).push(handle);
    }

    /// Starts the capture thread on the 0 -> 1 client transition. Later
    /// transitions find `capture_running` already set; the thread idles on
    /// its own while the client count is zero.
    fn start_capture(&self) {
        if self.capture_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(factory) = lock(&self.capture_factory).take() else {
            // The capture loop already ran and exited fatally.
            warn!("capture pipeline is not available; clients will not receive updates");
            return;
        };

        let store = Arc::clone(&self.store);
        let running = Arc::clone(&self.running);
        let capture_running = Arc::clone(&self.capture_running);
        let active_clients = Arc::clone(&self.active_clients);
        let event_tx = self.event_tx.clone();

        let thread = std::thread::Builder::new()
            .name("vnc-capture".to_string())
            .spawn(move || {
                run_capture_loop(
                    factory,
                    store,
                    running,
                    capture_running,
                    active_clients,
                    event_tx,
                );
            });

        match thread {
            Ok(handle) => *lock(&self.capture_thread) = Some(handle),
            Err(e) => {
                error!("failed to spawn capture thread: {e}");
                let _ = self.event_tx.send(ServerEvent::Error {
                    message: format!("failed to spawn capture thread: {e}"),
                });
            }
        }
    }
}

/// The few std mutexes here guard short handle updates; poisoning would
/// mean a panic inside one of those and is not recoverable either way.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
