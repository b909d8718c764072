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

//! BlueZ RFCOMM transport.
//!
//! Both roles register an RFCOMM profile for the service UUID with BlueZ.
//! As server, BlueZ hands every inbound connection to the profile; as
//! client, we ask BlueZ to connect the profile on the remote device and
//! receive the resulting socket through the same mechanism.

use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, Role};
use bluer::{Adapter, Address, ErrorKind, Session};
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::device::PeerDevice;
use super::discovery::device_name;
use super::stream::StreamConnection;
use super::transport::{
    CloseSignal, ConnectionHandle, ListenHandle, Transport, TransportError, SERVICE_NAME,
};

/// Adapter settings applied before listening.
#[derive(Debug, Clone, Default)]
pub struct RfcommOptions {
    /// Alias to advertise while listening.
    pub device_name: Option<String>,
    /// Make the adapter discoverable while listening.
    pub discoverable: bool,
    /// Fixed RFCOMM channel; BlueZ picks one when unset.
    pub channel: Option<u16>,
}

/// Transport over BlueZ RFCOMM profiles.
pub struct RfcommTransport {
    session: Session,
    adapter: Adapter,
    options: RfcommOptions,
}

impl RfcommTransport {
    /// Create a transport on `adapter`, powering it on if needed.
    pub async fn new(session: Session, adapter: Adapter, options: RfcommOptions) -> Result<Self> {
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let address = adapter.address().await?;
        info!("Adapter address: {}", address);

        Ok(Self {
            session,
            adapter,
            options,
        })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Apply alias and discoverability before registering the server.
    async fn prepare_adapter(&self) -> Result<(), TransportError> {
        if let Some(name) = &self.options.device_name {
            self.adapter
                .set_alias(name.clone())
                .await
                .map_err(|e| classify(e, TransportError::Unavailable))?;
            info!("Bluetooth name set to: {}", name);
        }

        if self.options.discoverable {
            self.adapter
                .set_discoverable(true)
                .await
                .map_err(|e| classify(e, TransportError::Unavailable))?;
            info!("Adapter is discoverable");
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    fn name(&self) -> &'static str {
        "BlueZ RFCOMM"
    }

    async fn listen(&self, service: Uuid) -> Result<Arc<dyn ListenHandle>, TransportError> {
        self.prepare_adapter().await?;

        let profile = Profile {
            uuid: service,
            name: Some(SERVICE_NAME.to_string()),
            role: Some(Role::Server),
            channel: self.options.channel,
            require_authentication: Some(true),
            require_authorization: Some(false),
            ..Default::default()
        };
        let handle = self
            .session
            .register_profile(profile)
            .await
            .map_err(|e| classify(e, TransportError::Unavailable))?;
        info!("RFCOMM server registered (UUID: {})", service);

        Ok(Arc::new(RfcommListener {
            adapter: self.adapter.clone(),
            profile: Mutex::new(Some(handle)),
            closed: CloseSignal::new(),
        }))
    }

    async fn connect(
        &self,
        address: &str,
        service: Uuid,
    ) -> Result<Arc<dyn ConnectionHandle>, TransportError> {
        let address: Address = address
            .parse()
            .map_err(|_| TransportError::ConnectFailed(format!("invalid address {}", address)))?;
        let device = self
            .adapter
            .device(address)
            .map_err(|e| classify(e, TransportError::ConnectFailed))?;

        let profile = Profile {
            uuid: service,
            role: Some(Role::Client),
            require_authentication: Some(true),
            require_authorization: Some(false),
            ..Default::default()
        };
        let mut handle = self
            .session
            .register_profile(profile)
            .await
            .map_err(|e| classify(e, TransportError::Unavailable))?;

        info!("Connecting to {} (UUID: {})", address, service);

        // BlueZ delivers the socket to our profile while connect_profile runs.
        let request = {
            let connect = device.connect_profile(&service);
            tokio::pin!(connect);
            let mut connect_done = false;
            loop {
                tokio::select! {
                    res = &mut connect, if !connect_done => {
                        connect_done = true;
                        if let Err(e) = res {
                            return Err(classify(e, TransportError::ConnectFailed));
                        }
                        debug!("Profile connect to {} completed", address);
                    }
                    req = handle.next() => break req,
                }
            }
        };

        let request = request
            .ok_or_else(|| TransportError::ConnectFailed("profile unregistered".to_string()))?;
        let stream = request
            .accept()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let name = device.name().await.ok().flatten();
        let peer = PeerDevice::new(name, address.to_string());
        info!("Connected to {}", peer);

        // The client profile stays registered for the lifetime of the socket.
        let connection = StreamConnection::new(peer, stream).with_release(move || drop(handle));
        Ok(Arc::new(connection))
    }
}

/// Registered server profile waiting for inbound connections.
pub struct RfcommListener {
    adapter: Adapter,
    profile: Mutex<Option<ProfileHandle>>,
    closed: CloseSignal,
}

#[async_trait]
impl ListenHandle for RfcommListener {
    async fn accept(&self) -> Result<Arc<dyn ConnectionHandle>, TransportError> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.profile.lock().await;
        loop {
            let next = match guard.as_mut() {
                None => return Err(TransportError::Closed),
                Some(profile) => {
                    tokio::select! {
                        biased;
                        _ = self.closed.closed() => None,
                        req = profile.next() => Some(req),
                    }
                }
            };

            let request = match next {
                None => {
                    guard.take();
                    return Err(TransportError::Closed);
                }
                Some(None) => {
                    guard.take();
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "RFCOMM profile unregistered",
                    )));
                }
                Some(Some(request)) => request,
            };

            let address = request.device();
            info!("Connection from: {}", address);

            match request.accept() {
                Ok(stream) => {
                    let name = device_name(&self.adapter, address).await;
                    let peer = PeerDevice::new(name, address.to_string());
                    return Ok(Arc::new(StreamConnection::new(peer, stream)));
                }
                Err(e) => {
                    // A refused socket does not end the listen cycle.
                    warn!("Accept error from {}: {}", address, e);
                }
            }
        }
    }

    fn close(&self) {
        if !self.closed.close() {
            return;
        }
        // A pending accept drops the profile itself when it wakes.
        if let Ok(mut profile) = self.profile.try_lock() {
            profile.take();
        }
        info!("RFCOMM server closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

/// Map a BlueZ error, using `otherwise` for failures that are not about
/// access or adapter readiness.
fn classify(err: bluer::Error, otherwise: fn(String) -> TransportError) -> TransportError {
    match err.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => TransportError::PermissionDenied,
        ErrorKind::NotReady => TransportError::Unavailable(err.to_string()),
        _ => otherwise(err.to_string()),
    }
}
