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

//! In-process transport and scripted discovery.
//!
//! A [`LoopbackHub`] plays the part of the radio: transports created from
//! the same hub can listen and connect to each other by address, with
//! in-memory pipes as sockets. The hub counts every open handle so callers
//! can check that nothing leaks.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use super::device::PeerDevice;
use super::discovery::{DiscoveryError, DiscoverySource, LinkEvent};
use super::stream::StreamConnection;
use super::transport::{
    CloseSignal, ConnectionHandle, ListenHandle, Transport, TransportError,
};

/// Pipe buffer size of a loopback socket.
const PIPE_CAPACITY: usize = 4096;

type ServiceKey = (String, Uuid);

struct Inbound {
    from: PeerDevice,
    stream: DuplexStream,
    accepted: oneshot::Sender<()>,
}

struct Registration {
    id: u64,
    host: PeerDevice,
    tx: mpsc::Sender<Inbound>,
}

/// Shared medium for loopback transports.
#[derive(Default)]
pub struct LoopbackHub {
    services: Mutex<HashMap<ServiceKey, Registration>>,
    next_id: AtomicU64,
    open: Arc<AtomicUsize>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport for the local device `local`.
    pub fn transport(self: &Arc<Self>, local: PeerDevice) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            local,
            available: AtomicBool::new(true),
            permitted: AtomicBool::new(true),
        }
    }

    /// Number of listen and connection handles not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Tear down the service registered by `address`, as if the radio lost
    /// it. A pending accept on it fails with an I/O error.
    pub fn revoke(&self, address: &str, service: Uuid) -> bool {
        let removed = self
            .services
            .lock()
            .remove(&(address.to_string(), service))
            .is_some();
        if removed {
            info!("Loopback service {} on {} revoked", service, address);
        }
        removed
    }

    fn track<S>(&self, connection: StreamConnection<S>) -> StreamConnection<S>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let open = self.open.clone();
        open.fetch_add(1, Ordering::SeqCst);
        connection.with_release(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

/// Transport endpoint attached to a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    local: PeerDevice,
    available: AtomicBool,
    permitted: AtomicBool,
}

impl LoopbackTransport {
    /// Simulate a powered-off radio.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate a missing platform permission.
    pub fn set_permitted(&self, permitted: bool) {
        self.permitted.store(permitted, Ordering::SeqCst);
    }

    fn check_usable(&self) -> Result<(), TransportError> {
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(TransportError::PermissionDenied);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("radio is off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn listen(&self, service: Uuid) -> Result<Arc<dyn ListenHandle>, TransportError> {
        self.check_usable()?;

        let key = (self.local.address.clone(), service);
        let (tx, rx) = mpsc::channel(4);
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut services = self.hub.services.lock();
            if services.contains_key(&key) {
                return Err(TransportError::Unavailable(format!(
                    "service {} already registered",
                    service
                )));
            }
            services.insert(
                key.clone(),
                Registration {
                    id,
                    host: self.local.clone(),
                    tx,
                },
            );
        }
        self.hub.open.fetch_add(1, Ordering::SeqCst);
        debug!("Loopback service {} registered on {}", service, self.local.address);

        Ok(Arc::new(LoopbackListener {
            hub: self.hub.clone(),
            key,
            id,
            rx: tokio::sync::Mutex::new(rx),
            closed: CloseSignal::new(),
            released: AtomicBool::new(false),
        }))
    }

    async fn connect(
        &self,
        address: &str,
        service: Uuid,
    ) -> Result<Arc<dyn ConnectionHandle>, TransportError> {
        self.check_usable()?;

        let (tx, host) = {
            let services = self.hub.services.lock();
            let registration = services
                .get(&(address.to_string(), service))
                .ok_or_else(|| {
                    TransportError::ConnectFailed(format!("service not found on {}", address))
                })?;
            (registration.tx.clone(), registration.host.clone())
        };

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let refused = || TransportError::ConnectFailed("connection refused".to_string());

        tx.send(Inbound {
            from: self.local.clone(),
            stream: remote,
            accepted: accepted_tx,
        })
        .await
        .map_err(|_| refused())?;
        accepted_rx.await.map_err(|_| refused())?;

        let connection = self.hub.track(StreamConnection::new(host, local));
        Ok(Arc::new(connection))
    }
}

/// Listening side of a loopback service.
pub struct LoopbackListener {
    hub: Arc<LoopbackHub>,
    key: ServiceKey,
    id: u64,
    rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    closed: CloseSignal,
    released: AtomicBool,
}

impl LoopbackListener {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut services = self.hub.services.lock();
        if services.get(&self.key).map(|r| r.id) == Some(self.id) {
            services.remove(&self.key);
        }
        self.hub.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ListenHandle for LoopbackListener {
    async fn accept(&self) -> Result<Arc<dyn ConnectionHandle>, TransportError> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.rx.lock().await;
        let inbound = tokio::select! {
            biased;
            _ = self.closed.closed() => return Err(TransportError::Closed),
            inbound = rx.recv() => inbound,
        };

        match inbound {
            Some(inbound) => {
                let _ = inbound.accepted.send(());
                let connection = self.hub.track(StreamConnection::new(inbound.from, inbound.stream));
                Ok(Arc::new(connection))
            }
            None => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "service revoked",
            ))),
        }
    }

    fn close(&self) {
        if self.closed.close() {
            self.release();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.release();
    }
}

/// Discovery source driven by the caller.
#[derive(Default)]
pub struct LoopbackDiscovery {
    paired: RwLock<Vec<PeerDevice>>,
    scan_tx: Mutex<Option<mpsc::Sender<PeerDevice>>>,
    link_tx: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl LoopbackDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paired(paired: Vec<PeerDevice>) -> Self {
        Self {
            paired: RwLock::new(paired),
            ..Self::default()
        }
    }

    /// Change the bonding database; seen at the next paired refresh.
    pub fn set_paired(&self, paired: Vec<PeerDevice>) {
        *self.paired.write() = paired;
    }

    /// Report a found device while scanning. Returns `false` when not scanning.
    pub fn announce(&self, device: PeerDevice) -> bool {
        match self.scan_tx.lock().as_ref() {
            Some(tx) => tx.try_send(device).is_ok(),
            None => false,
        }
    }

    /// Report a link change to the subscriber, if any.
    pub fn report_link(&self, event: LinkEvent) -> bool {
        match self.link_tx.lock().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_tx.lock().is_some()
    }
}

#[async_trait]
impl DiscoverySource for LoopbackDiscovery {
    async fn start(&self) -> Result<mpsc::Receiver<PeerDevice>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(32);
        *self.scan_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) {
        self.scan_tx.lock().take();
    }

    async fn paired_devices(&self) -> Result<Vec<PeerDevice>, DiscoveryError> {
        Ok(self.paired.read().clone())
    }

    async fn link_events(&self) -> Result<mpsc::Receiver<LinkEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(32);
        *self.link_tx.lock() = Some(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::transport::SERVICE_UUID;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_and_accept_exchange_bytes() {
        let hub = LoopbackHub::new();
        let server = hub.transport(PeerDevice::named("Server", "01"));
        let client = hub.transport(PeerDevice::named("Client", "02"));

        let listener = server.listen(SERVICE_UUID).await.unwrap();
        let accept = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await }
        });

        let outbound = client.connect("01", SERVICE_UUID).await.unwrap();
        let inbound = accept.await.unwrap().unwrap();
        assert_eq!(outbound.peer().address, "01");
        assert_eq!(inbound.peer().address, "02");
        assert_eq!(hub.open_handles(), 3);

        outbound.send(b"ping").await.unwrap();
        let mut buf = [0u8; 8];
        let n = inbound.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        outbound.close();
        inbound.close();
        listener.close();
        listener.close();
        assert_eq!(hub.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let hub = LoopbackHub::new();
        let client = hub.transport(PeerDevice::named("Client", "02"));

        let err = client.connect("01", SERVICE_UUID).await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectFailed(_)));
        assert_eq!(hub.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_close_interrupts_accept() {
        let hub = LoopbackHub::new();
        let server = hub.transport(PeerDevice::named("Server", "01"));
        let listener = server.listen(SERVICE_UUID).await.unwrap();

        let accept = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        listener.close();

        let result = tokio::time::timeout(Duration::from_secs(1), accept)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));

        // The service name is free again.
        let again = server.listen(SERVICE_UUID).await.unwrap();
        again.close();
        assert_eq!(hub.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_and_denied_radio() {
        let hub = LoopbackHub::new();
        let transport = hub.transport(PeerDevice::named("Server", "01"));

        transport.set_available(false);
        assert!(matches!(
            transport.listen(SERVICE_UUID).await.err().unwrap(),
            TransportError::Unavailable(_)
        ));

        transport.set_permitted(false);
        assert!(matches!(
            transport.connect("02", SERVICE_UUID).await.err().unwrap(),
            TransportError::PermissionDenied
        ));
    }

    #[tokio::test]
    async fn test_scripted_discovery() {
        let discovery = LoopbackDiscovery::with_paired(vec![PeerDevice::named("X", "AA")]);
        assert!(!discovery.announce(PeerDevice::named("B", "BB")));

        let mut found = discovery.start().await.unwrap();
        assert!(discovery.announce(PeerDevice::named("B", "BB")));
        assert_eq!(found.recv().await.unwrap().address, "BB");

        discovery.stop().await;
        assert!(!discovery.is_scanning());
        assert!(found.recv().await.is_none());

        assert_eq!(discovery.paired_devices().await.unwrap().len(), 1);
    }
}
