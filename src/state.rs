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

//! Application state management.
//!
//! Projects the controller's observables into a snapshot the front-end reads.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bluetooth::{BluetoothController, ConnectionState, PeerDevice};

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Listening,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Listening => "Waiting for a peer...",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Error => "Error",
        }
    }
}

impl From<&ConnectionState> for ConnectionStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Idle => ConnectionStatus::Disconnected,
            ConnectionState::Listening => ConnectionStatus::Listening,
            ConnectionState::Connecting(_) => ConnectionStatus::Connecting,
            ConnectionState::Connected { .. } => ConnectionStatus::Connected,
            ConnectionState::Failed(_) => ConnectionStatus::Error,
        }
    }
}

/// What the chat screen renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUiState {
    pub scanned_devices: Vec<PeerDevice>,
    pub paired_devices: Vec<PeerDevice>,
    pub is_connected: bool,
    pub status: ConnectionStatus,
    /// Display name of the connected peer.
    pub connected_device: Option<String>,
    /// Most recent error, kept until dismissed.
    pub error_message: Option<String>,
}

impl Default for ChatUiState {
    fn default() -> Self {
        Self {
            scanned_devices: Vec::new(),
            paired_devices: Vec::new(),
            is_connected: false,
            status: ConnectionStatus::Disconnected,
            connected_device: None,
            error_message: None,
        }
    }
}

/// Shared application state.
#[derive(Debug, Default)]
pub struct AppState {
    ui: RwLock<ChatUiState>,
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> ChatUiState {
        self.ui.read().clone()
    }

    pub fn apply_connection(&self, state: &ConnectionState) {
        let mut ui = self.ui.write();
        ui.status = ConnectionStatus::from(state);
        ui.is_connected = state.is_connected();
        ui.connected_device = state.connected_peer().map(|peer| peer.display_name().to_string());
    }

    pub fn set_scanned_devices(&self, devices: Vec<PeerDevice>) {
        self.ui.write().scanned_devices = devices;
    }

    pub fn set_paired_devices(&self, devices: Vec<PeerDevice>) {
        self.ui.write().paired_devices = devices;
    }

    pub fn set_error(&self, message: String) {
        self.ui.write().error_message = Some(message);
    }

    pub fn clear_error(&self) {
        self.ui.write().error_message = None;
    }

    pub fn get_status(&self) -> ConnectionStatus {
        self.ui.read().status
    }

    pub fn is_connected(&self) -> bool {
        self.ui.read().is_connected
    }
}

/// Keep `state` in sync with `controller` until the controller goes away.
pub fn bind(state: Arc<AppState>, controller: &BluetoothController) -> JoinHandle<()> {
    let mut connection = controller.subscribe_state();
    let mut scanned = controller.watch_discovered();
    let mut paired = controller.watch_paired();
    let mut errors = controller.errors();

    state.apply_connection(&connection.borrow_and_update());
    state.set_scanned_devices(scanned.borrow_and_update().clone());
    state.set_paired_devices(paired.borrow_and_update().clone());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    state.apply_connection(&connection.borrow_and_update());
                }
                changed = scanned.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    state.set_scanned_devices(scanned.borrow_and_update().clone());
                }
                changed = paired.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    state.set_paired_devices(paired.borrow_and_update().clone());
                }
                event = errors.recv() => match event {
                    Ok(event) => state.set_error(event.message),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("UI skipped {} error events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("UI state projection stopped");
    })
}
