//! Connection driver for the client side of the module protocol
//!
//! Owns the TCP connection behind a [`Transport`]: writes queued outbound
//! frames, feeds inbound frames to the transport and, when the connection
//! drops, fails every waiting listener and reconnects with backoff.

use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::module::ipc::protocol::MAX_FRAME_LENGTH;
use crate::module::ipc::transport::Transport;
use crate::utils::{retry_async_with_backoff, RetryConfig};

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// Peer went away or the stream failed
    Lost,
    /// The transport was dropped; nothing left to drive
    Closed,
}

/// Reconnecting connection driver
pub struct ModuleClient {
    server_addr: String,
    transport: Weak<Transport>,
    outbound: mpsc::UnboundedReceiver<String>,
    retry: RetryConfig,
}

impl ModuleClient {
    /// Create a transport together with the driver that will carry it
    pub fn new(server_addr: impl Into<String>, retry: RetryConfig) -> (Self, Arc<Transport>) {
        let (transport, outbound) = Transport::new();
        let client = Self {
            server_addr: server_addr.into(),
            transport: Arc::downgrade(&transport),
            outbound,
            retry,
        };
        (client, transport)
    }

    /// Driver for the `[client]` section: server address and reconnect policy
    pub fn from_config(config: &ClientConfig) -> (Self, Arc<Transport>) {
        Self::new(config.server_addr.clone(), config.retry_config())
    }

    /// Drive the connection on a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect, serve, reconnect; returns once the transport is dropped
    pub async fn run(mut self) {
        loop {
            if self.transport.strong_count() == 0 {
                debug!("Transport dropped, stopping connection driver");
                return;
            }

            let addr = self.server_addr.clone();
            let connected = retry_async_with_backoff(&self.retry, || {
                let addr = addr.clone();
                async move { TcpStream::connect(addr).await }
            })
            .await;

            match connected {
                Ok(stream) => {
                    info!(server = %self.server_addr, "Connected to module server");
                    let end = self.drive(stream).await;
                    self.fail_pending();
                    if end == ConnectionEnd::Closed {
                        return;
                    }
                    info!(server = %self.server_addr, "Disconnected from module server");
                }
                Err(e) => {
                    warn!(
                        server = %self.server_addr,
                        "Failed to connect to module server: {}", e
                    );
                    self.fail_pending();
                    sleep(self.retry.max_delay).await;
                }
            }
        }
    }

    async fn drive(&mut self, stream: TcpStream) -> ConnectionEnd {
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));

        loop {
            tokio::select! {
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return ConnectionEnd::Closed;
                    };
                    if let Err(e) = framed.send(frame).await {
                        warn!("Failed to send frame: {}", e);
                        return ConnectionEnd::Lost;
                    }
                }
                line = framed.next() => match line {
                    Some(Ok(line)) => match self.transport.upgrade() {
                        Some(transport) => transport.handle_message(&line),
                        None => return ConnectionEnd::Closed,
                    },
                    Some(Err(e)) => {
                        warn!("Failed to read frame: {}", e);
                        return ConnectionEnd::Lost;
                    }
                    None => return ConnectionEnd::Lost,
                },
            }
        }
    }

    /// Drop frames whose requests are about to be failed, then broadcast
    /// the connection error
    fn fail_pending(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded unsent frames");
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.handle_disconnect();
        }
    }
}
