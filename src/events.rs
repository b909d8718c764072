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

//! Transient error notifications.
//!
//! Errors are broadcast without retention: subscribers only see events
//! emitted after they subscribed, and a subscriber that falls too far
//! behind skips ahead.

use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Number of events a slow subscriber may lag behind before skipping.
const ERROR_BUS_CAPACITY: usize = 16;

/// Message shown when connecting to a device outside the paired set.
pub const NON_PAIRED_DEVICE: &str = "Cannot connect to a non-paired device.";

/// Message shown when an outbound connection attempt fails.
pub const CONNECTION_INTERRUPTED: &str = "Connection was interrupted";

/// A user-facing error notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Terminal outcome of one server or client attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionResult {
    ConnectionEstablished,
    Error(String),
}

/// One-to-many, fire-and-forget error channel.
#[derive(Debug, Clone)]
pub struct ErrorBus {
    tx: broadcast::Sender<ErrorEvent>,
}

impl Default for ErrorBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ERROR_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Never blocks; dropped if nobody is listening.
    pub fn emit(&self, event: ErrorEvent) {
        if self.tx.send(event).is_err() {
            debug!("Error event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.tx.subscribe()
    }
}
