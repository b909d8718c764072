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

//! Connection lifecycle state machine.
//!
//! The controller owns the only listen handle and the only connection
//! handle. Every transition happens while holding the slot lock, so
//! transitions are applied one at a time no matter which worker triggers
//! them. Each server or client attempt gets a number; a worker that wakes
//! up after its attempt was superseded closes whatever it got and leaves
//! the state alone.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::PeerDevice;
use super::discovery::{DiscoveryError, DiscoverySource, LinkEvent};
use super::permissions::{Capability, Permissions};
use super::registry::DeviceRegistry;
use super::transport::{
    CloseSignal, ConnectionHandle, ListenHandle, Transport, TransportError, SERVICE_UUID,
};
use crate::events::{
    ConnectionResult, ErrorBus, ErrorEvent, CONNECTION_INTERRUPTED, NON_PAIRED_DEVICE,
};

/// Receive buffer size of the reader worker.
const READ_BUFFER_SIZE: usize = 1024;

/// Capacity of the incoming-data and result broadcasts.
const BROADCAST_CAPACITY: usize = 64;

/// Which side initiated the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Server,
    Client,
}

/// Connection state. Exactly one value is current at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Listening,
    Connecting(PeerDevice),
    Connected {
        peer: PeerDevice,
        role: ConnectionRole,
    },
    /// A single attempt failed; always followed by `Idle`.
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Idle)
    }

    /// Peer of the current session, if any.
    pub fn connected_peer(&self) -> Option<&PeerDevice> {
        match self {
            ConnectionState::Connected { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Listening => write!(f, "Listening"),
            ConnectionState::Connecting(peer) => write!(f, "Connecting to {}", peer),
            ConnectionState::Connected { peer, role } => {
                write!(f, "Connected to {} as {:?}", peer, role)
            }
            ConnectionState::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

/// Command precondition failures.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("another session is active ({0})")]
    Busy(ConnectionState),

    #[error("not connected")]
    NotConnected,

    #[error("controller has been shut down")]
    ShutDown,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Tunables of the state machine.
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Upper bound for an outbound connect, on top of the platform's own.
    pub connect_timeout: Option<Duration>,
}

/// Socket handles owned by the state machine.
#[derive(Default)]
struct Slots {
    attempt: u64,
    server: Option<Arc<dyn ListenHandle>>,
    client: Option<Arc<dyn ConnectionHandle>>,
    cancel: Option<Arc<CloseSignal>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn DiscoverySource>,
    permissions: Arc<dyn Permissions>,
    options: ControllerOptions,
    registry: DeviceRegistry,
    errors: ErrorBus,
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    results: broadcast::Sender<ConnectionResult>,
    incoming: broadcast::Sender<Vec<u8>>,
    slots: Mutex<Slots>,
    discovery_pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    link_pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Shared {
    /// Apply a transition. Requiring the slots ties every caller to the lock.
    fn transition(&self, _slots: &mut Slots, next: ConnectionState) {
        let connected = next.is_connected();
        let previous = self.state.send_replace(next.clone());
        info!("Connection state: {} -> {}", previous, next);

        self.connected.send_if_modified(|value| {
            if *value == connected {
                false
            } else {
                *value = connected;
                true
            }
        });
    }

    /// Close every handle: pending connect first, then client, then server.
    fn release_handles(&self, slots: &mut Slots) {
        if let Some(cancel) = slots.cancel.take() {
            cancel.close();
        }
        if let Some(client) = slots.client.take() {
            client.close();
        }
        if let Some(server) = slots.server.take() {
            server.close();
        }
    }

    fn publish_result(&self, result: ConnectionResult) {
        let _ = self.results.send(result);
    }

    fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }
}

/// Bluetooth chat controller: discovery, server and client roles.
///
/// Cheap to clone; all clones drive the same state machine.
#[derive(Clone)]
pub struct BluetoothController {
    shared: Arc<Shared>,
}

impl BluetoothController {
    /// Create a controller and load the initial paired snapshot.
    pub async fn new(
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn DiscoverySource>,
        permissions: Arc<dyn Permissions>,
        options: ControllerOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (connected, _) = watch::channel(false);
        let (results, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (incoming, _) = broadcast::channel(BROADCAST_CAPACITY);

        info!("Bluetooth controller using {} transport", transport.name());

        let controller = Self {
            shared: Arc::new(Shared {
                transport,
                discovery,
                permissions,
                options,
                registry: DeviceRegistry::new(),
                errors: ErrorBus::new(),
                state,
                connected,
                results,
                incoming,
                slots: Mutex::new(Slots::default()),
                discovery_pump: parking_lot::Mutex::new(None),
                link_pump: parking_lot::Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        };

        controller.refresh_paired_devices().await;
        controller.start_link_monitor().await;
        controller
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn granted(&self, capability: Capability) -> bool {
        self.shared.permissions.granted(capability)
    }

    fn ensure_running(&self) -> Result<(), ControllerError> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            Err(ControllerError::ShutDown)
        } else {
            Ok(())
        }
    }

    // ----- observables -----

    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn discovered_devices(&self) -> Vec<PeerDevice> {
        self.shared.registry.discovered()
    }

    pub fn watch_discovered(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.shared.registry.watch_discovered()
    }

    pub fn paired_devices(&self) -> Vec<PeerDevice> {
        self.shared.registry.paired()
    }

    pub fn watch_paired(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.shared.registry.watch_paired()
    }

    /// Subscribe to error notifications emitted from now on.
    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.shared.errors.subscribe()
    }

    /// Subscribe to attempt outcomes emitted from now on.
    pub fn results(&self) -> broadcast::Receiver<ConnectionResult> {
        self.shared.results.subscribe()
    }

    /// Subscribe to raw bytes received on the active connection.
    pub fn incoming(&self) -> broadcast::Receiver<Vec<u8>> {
        self.shared.incoming.subscribe()
    }

    pub fn is_discovering(&self) -> bool {
        self.shared
            .discovery_pump
            .lock()
            .as_ref()
            .map(|pump| !pump.is_finished())
            .unwrap_or(false)
    }

    /// Number of socket handles the state machine currently holds.
    pub async fn open_handles(&self) -> usize {
        let slots = self.shared.slots.lock().await;
        usize::from(slots.server.is_some()) + usize::from(slots.client.is_some())
    }

    // ----- discovery -----

    /// Reload the paired snapshot from the platform.
    pub async fn refresh_paired_devices(&self) {
        if !self.granted(Capability::Connect) {
            debug!("Connect permission missing, not reading paired devices");
            return;
        }

        match self.shared.discovery.paired_devices().await {
            Ok(devices) => self.shared.registry.set_paired(devices),
            Err(DiscoveryError::PermissionDenied) => {
                debug!("Not allowed to read paired devices");
            }
            Err(e) => warn!("Failed to read paired devices: {}", e),
        }
    }

    /// Start scanning. Does not affect the connection state.
    pub async fn start_discovery(&self) {
        if self.ensure_running().is_err() {
            return;
        }
        if !self.granted(Capability::Scan) {
            debug!("Scan permission missing, ignoring start_discovery");
            return;
        }

        self.refresh_paired_devices().await;

        if self.is_discovering() {
            debug!("Discovery already running");
            return;
        }

        let mut found = match self.shared.discovery.start().await {
            Ok(found) => found,
            Err(DiscoveryError::PermissionDenied) => {
                debug!("Not allowed to start discovery");
                return;
            }
            Err(e) => {
                warn!("Failed to start discovery: {}", e);
                return;
            }
        };

        let weak = Arc::downgrade(&self.shared);
        let pump = tokio::spawn(async move {
            while let Some(device) = found.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.registry.add_discovered(device);
            }
            debug!("Discovery pump finished");
        });

        if let Some(previous) = self.shared.discovery_pump.lock().replace(pump) {
            previous.abort();
        }
    }

    pub async fn stop_discovery(&self) {
        if !self.granted(Capability::Scan) {
            debug!("Scan permission missing, ignoring stop_discovery");
            return;
        }
        self.halt_discovery().await;
    }

    async fn halt_discovery(&self) {
        self.shared.discovery.stop().await;
        if let Some(pump) = self.shared.discovery_pump.lock().take() {
            pump.abort();
        }
    }

    async fn start_link_monitor(&self) {
        let mut links = match self.shared.discovery.link_events().await {
            Ok(links) => links,
            Err(e) => {
                warn!("Link monitoring unavailable: {}", e);
                return;
            }
        };

        let weak = Arc::downgrade(&self.shared);
        let pump = tokio::spawn(async move {
            while let Some(event) = links.recv().await {
                let Some(controller) = Self::upgrade(&weak) else { break };
                controller.on_link_event(event).await;
            }
        });

        if let Some(previous) = self.shared.link_pump.lock().replace(pump) {
            previous.abort();
        }
    }

    /// React to a platform link change.
    pub async fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected(device) => {
                if self.shared.registry.is_paired(&device.address) {
                    debug!("Link up: {}", device);
                } else {
                    warn!("Link from non-paired device {}", device);
                    self.shared.errors.emit(ErrorEvent::new(NON_PAIRED_DEVICE));
                }
            }
            LinkEvent::Disconnected(address) => {
                let mut slots = self.shared.slots.lock().await;
                let ours = self
                    .shared
                    .current_state()
                    .connected_peer()
                    .map(|peer| peer.address == address)
                    .unwrap_or(false);
                if ours {
                    info!("Link to {} dropped", address);
                    slots.attempt += 1;
                    self.shared.release_handles(&mut slots);
                    self.shared.transition(&mut slots, ConnectionState::Idle);
                }
            }
        }
    }

    // ----- connection lifecycle -----

    /// Listen for one inbound peer.
    pub async fn start_server(&self) -> Result<(), ControllerError> {
        self.ensure_running()?;
        if !self.granted(Capability::Connect) {
            debug!("Connect permission missing, ignoring start_server");
            return Ok(());
        }

        let mut slots = self.shared.slots.lock().await;
        let state = self.shared.current_state();
        if !state.is_idle() {
            return Err(ControllerError::Busy(state));
        }

        let listener = match self.shared.transport.listen(SERVICE_UUID).await {
            Ok(listener) => listener,
            Err(e @ TransportError::PermissionDenied) => {
                debug!("Not allowed to open RFCOMM server");
                self.shared.publish_result(ConnectionResult::Error(e.to_string()));
                return Ok(());
            }
            Err(e) => {
                warn!("Failed to start RFCOMM server: {}", e);
                self.shared.publish_result(ConnectionResult::Error(e.to_string()));
                return Ok(());
            }
        };

        slots.attempt += 1;
        let attempt = slots.attempt;
        slots.server = Some(listener.clone());
        self.shared.transition(&mut slots, ConnectionState::Listening);
        drop(slots);

        tokio::spawn(self.clone().accept_worker(attempt, listener));
        Ok(())
    }

    async fn accept_worker(self, attempt: u64, listener: Arc<dyn ListenHandle>) {
        info!("Waiting for connections...");
        let accepted = listener.accept().await;

        let mut slots = self.shared.slots.lock().await;
        if slots.attempt != attempt {
            if let Ok(connection) = accepted {
                connection.close();
            }
            debug!("Accept worker of attempt {} superseded", attempt);
            return;
        }

        match accepted {
            Ok(connection) => {
                // Only one inbound session per listen cycle.
                listener.close();
                slots.server = None;

                let address = connection.peer().address.clone();
                let Some(bonded) = self.shared.registry.paired_device(&address) else {
                    warn!("Rejecting inbound connection from non-paired device {}", address);
                    connection.close();
                    self.shared.release_handles(&mut slots);
                    self.shared.transition(
                        &mut slots,
                        ConnectionState::Failed(NON_PAIRED_DEVICE.to_string()),
                    );
                    self.shared.errors.emit(ErrorEvent::new(NON_PAIRED_DEVICE));
                    self.shared
                        .publish_result(ConnectionResult::Error(NON_PAIRED_DEVICE.to_string()));
                    self.shared.transition(&mut slots, ConnectionState::Idle);
                    return;
                };

                // The bonding database knows the name when the socket does not.
                let peer = if connection.peer().name.is_some() {
                    connection.peer().clone()
                } else {
                    bonded
                };
                self.establish(&mut slots, attempt, connection, peer, ConnectionRole::Server);
            }
            Err(e) => {
                info!("Accept loop ended: {}", e);
                self.shared.release_handles(&mut slots);
                self.shared.transition(&mut slots, ConnectionState::Idle);
                self.shared.publish_result(ConnectionResult::Error(e.to_string()));
            }
        }
    }

    /// Connect to a paired peer.
    pub async fn connect_to(&self, peer: PeerDevice) -> Result<(), ControllerError> {
        self.ensure_running()?;
        if !self.granted(Capability::Connect) {
            debug!("Connect permission missing, ignoring connect_to");
            return Ok(());
        }

        let mut slots = self.shared.slots.lock().await;
        let state = self.shared.current_state();
        if !state.is_idle() {
            return Err(ControllerError::Busy(state));
        }

        if !self.shared.registry.is_paired(&peer.address) {
            warn!("Refusing to connect to non-paired device {}", peer);
            self.shared.transition(
                &mut slots,
                ConnectionState::Failed(NON_PAIRED_DEVICE.to_string()),
            );
            self.shared.errors.emit(ErrorEvent::new(NON_PAIRED_DEVICE));
            self.shared
                .publish_result(ConnectionResult::Error(NON_PAIRED_DEVICE.to_string()));
            self.shared.transition(&mut slots, ConnectionState::Idle);
            return Ok(());
        }

        slots.attempt += 1;
        let attempt = slots.attempt;
        let cancel = Arc::new(CloseSignal::new());
        slots.cancel = Some(cancel.clone());
        self.shared
            .transition(&mut slots, ConnectionState::Connecting(peer.clone()));
        drop(slots);

        // An inquiry scan in progress slows down connection setup.
        self.halt_discovery().await;

        tokio::spawn(self.clone().connect_worker(attempt, peer, cancel));
        Ok(())
    }

    async fn connect_worker(self, attempt: u64, peer: PeerDevice, cancel: Arc<CloseSignal>) {
        let outcome = {
            let connect = with_timeout(
                self.shared.options.connect_timeout,
                self.shared.transport.connect(&peer.address, SERVICE_UUID),
            );
            tokio::select! {
                biased;
                _ = cancel.closed() => None,
                res = connect => Some(res),
            }
        };

        let mut slots = self.shared.slots.lock().await;
        let result = match outcome {
            None => {
                debug!("Connect attempt to {} cancelled", peer);
                return;
            }
            Some(result) => result,
        };

        if slots.attempt != attempt {
            if let Ok(connection) = result {
                connection.close();
            }
            debug!("Connect worker of attempt {} superseded", attempt);
            return;
        }

        match result {
            Ok(connection) => {
                slots.cancel = None;
                let peer = connection.peer().clone();
                self.establish(&mut slots, attempt, connection, peer, ConnectionRole::Client);
            }
            Err(TransportError::PermissionDenied) => {
                debug!("Not allowed to connect to {}", peer);
                self.shared.release_handles(&mut slots);
                self.shared.transition(&mut slots, ConnectionState::Idle);
                self.shared.publish_result(ConnectionResult::Error(
                    TransportError::PermissionDenied.to_string(),
                ));
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", peer, e);
                self.shared.release_handles(&mut slots);
                self.shared
                    .transition(&mut slots, ConnectionState::Failed(e.to_string()));
                self.shared
                    .errors
                    .emit(ErrorEvent::new(CONNECTION_INTERRUPTED));
                self.shared
                    .publish_result(ConnectionResult::Error(CONNECTION_INTERRUPTED.to_string()));
                self.shared.transition(&mut slots, ConnectionState::Idle);
            }
        }
    }

    /// Enter `Connected` with `connection` and start reading from it.
    fn establish(
        &self,
        slots: &mut Slots,
        attempt: u64,
        connection: Arc<dyn ConnectionHandle>,
        peer: PeerDevice,
        role: ConnectionRole,
    ) {
        if let Some(stale) = slots.client.replace(connection.clone()) {
            stale.close();
        }
        self.shared
            .transition(slots, ConnectionState::Connected { peer, role });
        self.shared
            .publish_result(ConnectionResult::ConnectionEstablished);

        tokio::spawn(self.clone().read_worker(attempt, connection));
    }

    async fn read_worker(self, attempt: u64, connection: Arc<dyn ConnectionHandle>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let reason = loop {
            match connection.receive(&mut buf).await {
                Ok(0) => break "closed by remote".to_string(),
                Ok(n) => {
                    debug!("Received {} bytes from {}", n, connection.peer());
                    let _ = self.shared.incoming.send(buf[..n].to_vec());
                }
                Err(e) => break e.to_string(),
            }
        };

        let mut slots = self.shared.slots.lock().await;
        if slots.attempt != attempt {
            return;
        }
        info!("Connection to {} lost: {}", connection.peer(), reason);
        slots.attempt += 1;
        self.shared.release_handles(&mut slots);
        self.shared.transition(&mut slots, ConnectionState::Idle);
    }

    /// Write raw bytes to the active connection.
    pub async fn send(&self, data: &[u8]) -> Result<(), ControllerError> {
        let connection = {
            let slots = self.shared.slots.lock().await;
            slots.client.clone().ok_or(ControllerError::NotConnected)?
        };
        connection.send(data).await?;
        Ok(())
    }

    /// Cancel any attempt, close all handles and return to `Idle`.
    pub async fn disconnect(&self) {
        let mut slots = self.shared.slots.lock().await;
        slots.attempt += 1;
        self.shared.release_handles(&mut slots);

        match self.shared.current_state() {
            ConnectionState::Idle => {}
            previous => {
                if matches!(
                    previous,
                    ConnectionState::Listening | ConnectionState::Connecting(_)
                ) {
                    self.shared
                        .publish_result(ConnectionResult::Error("cancelled".to_string()));
                }
                self.shared.transition(&mut slots, ConnectionState::Idle);
            }
        }
    }

    /// Stop everything. Later session commands fail with `ShutDown`.
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down Bluetooth controller");

        self.halt_discovery().await;
        if let Some(pump) = self.shared.link_pump.lock().take() {
            pump.abort();
        }
        self.disconnect().await;
    }
}

async fn with_timeout<F>(
    limit: Option<Duration>,
    connect: F,
) -> Result<Arc<dyn ConnectionHandle>, TransportError>
where
    F: Future<Output = Result<Arc<dyn ConnectionHandle>, TransportError>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectFailed(format!(
                "timed out after {:?}",
                limit
            ))),
        },
        None => connect.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::loopback::{LoopbackDiscovery, LoopbackHub};
    use crate::bluetooth::permissions::{GrantAll, StaticPermissions};
    use tokio::sync::broadcast::error::TryRecvError;

    const LOCAL: &str = "00:00:00:00:00:01";

    async fn controller_with(
        hub: &Arc<LoopbackHub>,
        discovery: Arc<LoopbackDiscovery>,
        permissions: Arc<dyn Permissions>,
    ) -> BluetoothController {
        let transport = Arc::new(hub.transport(PeerDevice::named("Local", LOCAL)));
        BluetoothController::new(transport, discovery, permissions, ControllerOptions::default())
            .await
    }

    async fn wait_for_state(
        controller: &BluetoothController,
        pred: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = controller.subscribe_state();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
            .await
            .expect("state not reached in time")
            .expect("state channel closed")
            .clone();
        state
    }

    #[tokio::test]
    async fn test_initial_paired_snapshot_is_loaded() {
        let hub = LoopbackHub::new();
        let discovery = Arc::new(LoopbackDiscovery::with_paired(vec![PeerDevice::named(
            "X", "AA:BB",
        )]));
        let controller = controller_with(&hub, discovery, Arc::new(GrantAll)).await;

        assert_eq!(controller.paired_devices(), vec![PeerDevice::named("X", "AA:BB")]);
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_non_paired_connect_is_rejected() {
        let hub = LoopbackHub::new();
        let discovery = Arc::new(LoopbackDiscovery::with_paired(vec![PeerDevice::named(
            "X", "AA:BB",
        )]));
        let controller = controller_with(&hub, discovery, Arc::new(GrantAll)).await;
        let mut errors = controller.errors();
        let mut states = controller.subscribe_state();

        controller
            .connect_to(PeerDevice::named("Y", "CC:DD"))
            .await
            .unwrap();

        assert_eq!(controller.state(), ConnectionState::Idle);
        assert!(!controller.is_connected());
        assert_eq!(errors.try_recv().unwrap().message, NON_PAIRED_DEVICE);
        assert_eq!(errors.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(hub.open_handles(), 0);
        assert_eq!(controller.open_handles().await, 0);
        assert!(states.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_missing_permission_is_silent_noop() {
        let hub = LoopbackHub::new();
        let discovery = Arc::new(LoopbackDiscovery::with_paired(vec![PeerDevice::named(
            "X", "AA:BB",
        )]));
        let controller =
            controller_with(&hub, discovery.clone(), Arc::new(StaticPermissions::none())).await;
        let mut errors = controller.errors();

        controller.start_discovery().await;
        controller.start_server().await.unwrap();
        controller
            .connect_to(PeerDevice::named("X", "AA:BB"))
            .await
            .unwrap();

        assert!(!controller.is_discovering());
        assert!(!discovery.is_scanning());
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert_eq!(errors.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(hub.open_handles(), 0);
        // Paired devices are not readable without the connect capability.
        assert!(controller.paired_devices().is_empty());
    }

    #[tokio::test]
    async fn test_listen_unavailable_stays_idle() {
        let hub = LoopbackHub::new();
        let transport = Arc::new(hub.transport(PeerDevice::named("Local", LOCAL)));
        transport.set_available(false);
        let controller = BluetoothController::new(
            transport,
            Arc::new(LoopbackDiscovery::new()),
            Arc::new(GrantAll),
            ControllerOptions::default(),
        )
        .await;

        let mut errors = controller.errors();
        let mut results = controller.results();

        controller.start_server().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert_eq!(hub.open_handles(), 0);
        assert!(matches!(
            results.try_recv(),
            Ok(ConnectionResult::Error(reason)) if reason.contains("radio is off")
        ));
        assert_eq!(results.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(errors.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_server_busy_while_listening() {
        let hub = LoopbackHub::new();
        let controller =
            controller_with(&hub, Arc::new(LoopbackDiscovery::new()), Arc::new(GrantAll)).await;

        controller.start_server().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Listening);

        let err = controller.start_server().await.unwrap_err();
        assert!(matches!(err, ControllerError::Busy(ConnectionState::Listening)));
        assert_eq!(hub.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_accept_failure_returns_to_idle_without_error() {
        let hub = LoopbackHub::new();
        let controller =
            controller_with(&hub, Arc::new(LoopbackDiscovery::new()), Arc::new(GrantAll)).await;
        let mut errors = controller.errors();
        let mut results = controller.results();

        controller.start_server().await.unwrap();
        assert!(hub.revoke(LOCAL, SERVICE_UUID));

        wait_for_state(&controller, |s| s.is_idle()).await;
        assert_eq!(controller.open_handles().await, 0);
        assert_eq!(hub.open_handles(), 0);
        assert_eq!(errors.try_recv(), Err(TryRecvError::Empty));
        assert!(matches!(results.recv().await, Ok(ConnectionResult::Error(_))));
    }

    #[tokio::test]
    async fn test_disconnect_while_listening_closes_server() {
        let hub = LoopbackHub::new();
        let controller =
            controller_with(&hub, Arc::new(LoopbackDiscovery::new()), Arc::new(GrantAll)).await;

        controller.start_server().await.unwrap();
        assert_eq!(hub.open_handles(), 1);

        controller.disconnect().await;
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert_eq!(controller.open_handles().await, 0);
        assert_eq!(hub.open_handles(), 0);

        // The listen cycle can be started again.
        controller.start_server().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Listening);
    }

    #[tokio::test]
    async fn test_connect_failure_emits_error_and_returns_to_idle() {
        let hub = LoopbackHub::new();
        let discovery = Arc::new(LoopbackDiscovery::with_paired(vec![PeerDevice::named(
            "X", "AA:BB",
        )]));
        let controller = controller_with(&hub, discovery, Arc::new(GrantAll)).await;
        let mut errors = controller.errors();
        let mut results = controller.results();

        // Nothing listens on AA:BB.
        controller
            .connect_to(PeerDevice::named("X", "AA:BB"))
            .await
            .unwrap();

        wait_for_state(&controller, |s| s.is_idle()).await;
        assert!(!controller.is_connected());
        assert_eq!(
            results.recv().await.unwrap(),
            ConnectionResult::Error(CONNECTION_INTERRUPTED.to_string())
        );
        let event = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.message, CONNECTION_INTERRUPTED);
        assert_eq!(hub.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_idempotent() {
        let hub = LoopbackHub::new();
        let controller =
            controller_with(&hub, Arc::new(LoopbackDiscovery::new()), Arc::new(GrantAll)).await;

        controller.disconnect().await;
        controller.disconnect().await;
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_discovery_feeds_registry_and_is_orthogonal() {
        let hub = LoopbackHub::new();
        let discovery = Arc::new(LoopbackDiscovery::new());
        let controller = controller_with(&hub, discovery.clone(), Arc::new(GrantAll)).await;

        controller.start_server().await.unwrap();
        controller.start_discovery().await;
        assert!(controller.is_discovering());

        discovery.announce(PeerDevice::named("B", "11:22"));
        discovery.announce(PeerDevice::named("A", "33:44"));
        discovery.announce(PeerDevice::named("B", "11:22"));

        let mut rx = controller.watch_discovered();
        let devices = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|d| d.len() == 2))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(
            devices,
            vec![PeerDevice::named("B", "11:22"), PeerDevice::named("A", "33:44")]
        );

        controller.stop_discovery().await;
        assert!(!controller.is_discovering());
        assert!(!discovery.is_scanning());
        assert_eq!(controller.state(), ConnectionState::Listening);
    }

    #[tokio::test]
    async fn test_link_from_non_paired_device_emits_error() {
        let hub = LoopbackHub::new();
        let controller =
            controller_with(&hub, Arc::new(LoopbackDiscovery::new()), Arc::new(GrantAll)).await;
        let mut errors = controller.errors();

        controller
            .on_link_event(LinkEvent::Connected(PeerDevice::named("Z", "EE:FF")))
            .await;
        assert_eq!(errors.try_recv().unwrap().message, NON_PAIRED_DEVICE);
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_sessions() {
        let hub = LoopbackHub::new();
        let controller =
            controller_with(&hub, Arc::new(LoopbackDiscovery::new()), Arc::new(GrantAll)).await;

        controller.start_server().await.unwrap();
        controller.shutdown().await;
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert_eq!(hub.open_handles(), 0);

        assert!(matches!(
            controller.start_server().await,
            Err(ControllerError::ShutDown)
        ));
        assert!(matches!(
            controller.send(b"hi").await,
            Err(ControllerError::NotConnected)
        ));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_from_non_paired_device_is_rejected() {
        let hub = LoopbackHub::new();
        let controller =
            controller_with(&hub, Arc::new(LoopbackDiscovery::new()), Arc::new(GrantAll)).await;
        let mut errors = controller.errors();
        let mut results = controller.results();

        controller.start_server().await.unwrap();
        let stranger = hub.transport(PeerDevice::named("Stranger", "00:00:00:00:00:0B"));
        let connection = stranger.connect(LOCAL, SERVICE_UUID).await.unwrap();

        assert_eq!(
            results.recv().await.unwrap(),
            ConnectionResult::Error(NON_PAIRED_DEVICE.to_string())
        );
        assert_eq!(errors.try_recv().unwrap().message, NON_PAIRED_DEVICE);
        wait_for_state(&controller, |s| s.is_idle()).await;
        assert!(!controller.is_connected());
        assert_eq!(controller.open_handles().await, 0);

        // The server side hung up on the stranger.
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), connection.receive(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0)));
        connection.close();
        assert_eq!(hub.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_inbound_from_paired_device_uses_bonded_name() {
        let hub = LoopbackHub::new();
        let discovery = Arc::new(LoopbackDiscovery::with_paired(vec![PeerDevice::named(
            "Phone",
            "00:00:00:00:00:0B",
        )]));
        let controller = controller_with(&hub, discovery, Arc::new(GrantAll)).await;

        controller.start_server().await.unwrap();
        let phone = hub.transport(PeerDevice::new(None, "00:00:00:00:00:0B"));
        let _connection = phone.connect(LOCAL, SERVICE_UUID).await.unwrap();

        let state = wait_for_state(&controller, |s| s.is_connected()).await;
        assert_eq!(
            state.connected_peer().and_then(|p| p.name.as_deref()),
            Some("Phone")
        );
        assert_eq!(
            state,
            ConnectionState::Connected {
                peer: PeerDevice::named("Phone", "00:00:00:00:00:0B"),
                role: ConnectionRole::Server,
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let hub = LoopbackHub::new();
        let discovery = Arc::new(LoopbackDiscovery::with_paired(vec![PeerDevice::named(
            "X", "AA:BB",
        )]));
        let controller = controller_with(&hub, discovery, Arc::new(GrantAll)).await;
        let mut errors = controller.errors();
        let mut results = controller.results();

        // A service that never accepts keeps the connect pending.
        let remote = hub.transport(PeerDevice::named("X", "AA:BB"));
        let listener = remote.listen(SERVICE_UUID).await.unwrap();

        controller
            .connect_to(PeerDevice::named("X", "AA:BB"))
            .await
            .unwrap();
        assert_eq!(
            controller.state(),
            ConnectionState::Connecting(PeerDevice::named("X", "AA:BB"))
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(controller.state(), ConnectionState::Connecting(_)));

        controller.disconnect().await;
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert_eq!(controller.open_handles().await, 0);

        // The woken worker must not report a second outcome.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            results.try_recv(),
            Ok(ConnectionResult::Error("cancelled".to_string()))
        );
        assert_eq!(results.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(errors.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(controller.state(), ConnectionState::Idle);

        assert_eq!(hub.open_handles(), 1);
        listener.close();
        assert_eq!(hub.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_connect_timeout_emits_error() {
        let hub = LoopbackHub::new();
        let transport = Arc::new(hub.transport(PeerDevice::named("Local", LOCAL)));
        let discovery = Arc::new(LoopbackDiscovery::with_paired(vec![PeerDevice::named(
            "X", "AA:BB",
        )]));
        let controller = BluetoothController::new(
            transport,
            discovery,
            Arc::new(GrantAll),
            ControllerOptions {
                connect_timeout: Some(Duration::from_millis(100)),
            },
        )
        .await;
        let mut errors = controller.errors();
        let mut results = controller.results();

        let remote = hub.transport(PeerDevice::named("X", "AA:BB"));
        let _listener = remote.listen(SERVICE_UUID).await.unwrap();

        controller
            .connect_to(PeerDevice::named("X", "AA:BB"))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            result,
            ConnectionResult::Error(CONNECTION_INTERRUPTED.to_string())
        );
        assert_eq!(errors.try_recv().unwrap().message, CONNECTION_INTERRUPTED);
        wait_for_state(&controller, |s| s.is_idle()).await;
        assert_eq!(controller.open_handles().await, 0);
    }
}
