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

//! Device discovery and link-state reporting.

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::PeerDevice;

/// Errors raised by a discovery source.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

impl From<bluer::Error> for DiscoveryError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotAuthorized => DiscoveryError::PermissionDenied,
            _ => DiscoveryError::Unavailable(err.to_string()),
        }
    }
}

/// Low-level link change reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A baseband link to the device came up.
    Connected(PeerDevice),
    /// The link to the device at this address went down.
    Disconnected(String),
}

/// Platform scanner and bonding database.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Start scanning; found devices arrive on the returned channel until
    /// [`stop`](Self::stop) is called.
    async fn start(&self) -> Result<mpsc::Receiver<PeerDevice>, DiscoveryError>;

    async fn stop(&self);

    /// Snapshot of the devices currently bonded with this host.
    async fn paired_devices(&self) -> Result<Vec<PeerDevice>, DiscoveryError>;

    /// Subscribe to link changes for known devices.
    async fn link_events(&self) -> Result<mpsc::Receiver<LinkEvent>, DiscoveryError>;
}

/// Discovery backed by a BlueZ adapter.
pub struct BluerDiscovery {
    adapter: Adapter,
    scan_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    link_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BluerDiscovery {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            scan_task: parking_lot::Mutex::new(None),
            link_task: parking_lot::Mutex::new(None),
        }
    }
}

impl Drop for BluerDiscovery {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.link_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl DiscoverySource for BluerDiscovery {
    async fn start(&self) -> Result<mpsc::Receiver<PeerDevice>, DiscoveryError> {
        // BlueZ keeps scanning for as long as this stream is alive.
        let events = self.adapter.discover_devices().await?;
        info!("Discovery started on adapter {}", self.adapter.name());

        let (tx, rx) = mpsc::channel(32);
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    let name = device_name(&adapter, address).await;
                    if tx.send(PeerDevice::new(name, address.to_string())).await.is_err() {
                        break;
                    }
                }
            }
            debug!("Discovery stream ended");
        });

        if let Some(previous) = self.scan_task.lock().replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop(&self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
            info!("Discovery stopped");
        }
    }

    async fn paired_devices(&self) -> Result<Vec<PeerDevice>, DiscoveryError> {
        let mut devices = Vec::new();

        for address in self.adapter.device_addresses().await? {
            let device = self.adapter.device(address)?;
            if device.is_paired().await.unwrap_or(false) {
                let name = device.name().await.ok().flatten();
                devices.push(PeerDevice::new(name, address.to_string()));
            }
        }

        Ok(devices)
    }

    async fn link_events(&self) -> Result<mpsc::Receiver<LinkEvent>, DiscoveryError> {
        let adapter_events = self.adapter.events().await?;
        let known = self.adapter.device_addresses().await?;

        let (tx, rx) = mpsc::channel(32);
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            let mut watchers: HashMap<Address, JoinHandle<()>> = HashMap::new();
            for address in known {
                watchers.insert(address, watch_link(&adapter, address, tx.clone()));
            }

            let mut adapter_events = Box::pin(adapter_events);
            while let Some(event) = adapter_events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(address) => {
                        watchers
                            .entry(address)
                            .or_insert_with(|| watch_link(&adapter, address, tx.clone()));
                    }
                    AdapterEvent::DeviceRemoved(address) => {
                        if let Some(watcher) = watchers.remove(&address) {
                            watcher.abort();
                        }
                    }
                    _ => {}
                }
                if tx.is_closed() {
                    break;
                }
            }

            for watcher in watchers.into_values() {
                watcher.abort();
            }
        });

        if let Some(previous) = self.link_task.lock().replace(task) {
            previous.abort();
        }
        Ok(rx)
    }
}

pub(crate) async fn device_name(adapter: &Adapter, address: Address) -> Option<String> {
    let device = adapter.device(address).ok()?;
    device.name().await.ok().flatten()
}

/// Forward `Connected` property changes of one device.
fn watch_link(adapter: &Adapter, address: Address, tx: mpsc::Sender<LinkEvent>) -> JoinHandle<()> {
    let adapter = adapter.clone();
    tokio::spawn(async move {
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(e) => {
                warn!("Cannot watch link of {}: {}", address, e);
                return;
            }
        };
        let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch link of {}: {}", address, e);
                return;
            }
        };

        let mut events = Box::pin(events);
        while let Some(event) = events.next().await {
            let link = match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) => {
                    let name = device.name().await.ok().flatten();
                    LinkEvent::Connected(PeerDevice::new(name, address.to_string()))
                }
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                    LinkEvent::Disconnected(address.to_string())
                }
                _ => continue,
            };
            debug!("Link event: {:?}", link);
            if tx.send(link).await.is_err() {
                break;
            }
        }
    })
}
