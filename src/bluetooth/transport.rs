// Copyright 2026 Daniel Pelikan
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

//! Transport abstraction for the chat service.
//!
//! A transport offers two roles over a shared service UUID: the server role
//! listens and accepts one peer at a time, the client role connects to a
//! peer by address. Every handle it returns can be closed from any task,
//! and closing a handle wakes up whoever is blocked on it.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use super::device::PeerDevice;

/// Rendezvous UUID shared by the server and client roles.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x7fec70b8_b851_43cc_b8f0_d12dd117f3db);

/// Service record name registered next to the UUID.
pub const SERVICE_NAME: &str = "chat_service";

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The process lacks the capability to use the radio.
    #[error("permission denied")]
    PermissionDenied,

    /// The radio or service could not be opened.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// An outbound session could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A socket failed mid-operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The handle was closed locally.
    #[error("handle closed")]
    Closed,
}

/// Platform socket layer providing both roles.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Begin accepting inbound sessions for `service`.
    async fn listen(&self, service: Uuid) -> Result<Arc<dyn ListenHandle>, TransportError>;

    /// Open an outbound session to `address` for `service`.
    async fn connect(
        &self,
        address: &str,
        service: Uuid,
    ) -> Result<Arc<dyn ConnectionHandle>, TransportError>;
}

/// Server-side listening socket.
#[async_trait]
pub trait ListenHandle: Send + Sync {
    /// Wait for the next inbound peer.
    ///
    /// Returns [`TransportError::Closed`] once [`close`](Self::close) has
    /// been called, including when the close happens while waiting.
    async fn accept(&self) -> Result<Arc<dyn ConnectionHandle>, TransportError>;

    /// Stop listening and release the socket. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// An established byte-stream session.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    fn peer(&self) -> &PeerDevice;

    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Read into `buf`. `Ok(0)` means the remote side closed the stream.
    async fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Release the socket. Idempotent; wakes pending reads and writes.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One-way latch that wakes every waiter once it trips.
#[derive(Debug)]
pub struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Trip the latch. Returns `true` only for the call that tripped it.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch has tripped.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_service_uuid_string_form() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "7fec70b8-b851-43cc-b8f0-d12dd117f3db"
        );
    }

    #[test]
    fn test_close_signal_trips_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_signal_already_closed_resolves_immediately() {
        let signal = CloseSignal::new();
        signal.close();
        tokio::time::timeout(Duration::from_millis(100), signal.closed())
            .await
            .expect("closed() should not block");
    }
}
