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

//! Registry of discovered and paired devices.
//!
//! Both lists are published through `watch` channels so any number of
//! observers can follow them. Writes go through the channel's own lock,
//! which serializes concurrent inserts.

use tokio::sync::watch;
use tracing::debug;

use super::device::PeerDevice;

/// Deduplicated lists of discovered and paired peers.
#[derive(Debug)]
pub struct DeviceRegistry {
    discovered: watch::Sender<Vec<PeerDevice>>,
    paired: watch::Sender<Vec<PeerDevice>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (discovered, _) = watch::channel(Vec::new());
        let (paired, _) = watch::channel(Vec::new());
        Self { discovered, paired }
    }

    /// Insert a discovered device unless its address is already known.
    ///
    /// Returns `true` if the device was new.
    pub fn add_discovered(&self, device: PeerDevice) -> bool {
        self.discovered.send_if_modified(|devices| {
            if devices.contains(&device) {
                false
            } else {
                debug!("Discovered device: {}", device);
                devices.push(device);
                true
            }
        })
    }

    /// Replace the paired snapshot wholesale.
    pub fn set_paired(&self, devices: Vec<PeerDevice>) {
        let mut unique: Vec<PeerDevice> = Vec::with_capacity(devices.len());
        for device in devices {
            if !unique.contains(&device) {
                unique.push(device);
            }
        }
        debug!("Paired devices updated: {} entries", unique.len());
        self.paired.send_replace(unique);
    }

    pub fn discovered(&self) -> Vec<PeerDevice> {
        self.discovered.borrow().clone()
    }

    pub fn paired(&self) -> Vec<PeerDevice> {
        self.paired.borrow().clone()
    }

    /// Whether an address is part of the current paired snapshot.
    pub fn is_paired(&self, address: &str) -> bool {
        self.paired.borrow().iter().any(|d| d.address == address)
    }

    /// Look up the paired entry for an address, which carries the bonded name.
    pub fn paired_device(&self, address: &str) -> Option<PeerDevice> {
        self.paired
            .borrow()
            .iter()
            .find(|d| d.address == address)
            .cloned()
    }

    pub fn watch_discovered(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.discovered.subscribe()
    }

    pub fn watch_paired(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.paired.subscribe()
    }
}
