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

//! Remote peer identity.

use std::fmt;
use std::hash::{Hash, Hasher};

/// A remote Bluetooth device.
///
/// Two devices are the same peer when their addresses match; the name is
/// informational and may differ between observations.
#[derive(Debug, Clone, Eq)]
pub struct PeerDevice {
    pub name: Option<String>,
    pub address: String,
}

impl PeerDevice {
    pub fn new(name: Option<String>, address: impl Into<String>) -> Self {
        Self {
            name,
            address: address.into(),
        }
    }

    /// Create a device with a known name.
    pub fn named(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(Some(name.into()), address)
    }

    /// Name to show to a user, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl PartialEq for PeerDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Hash for PeerDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for PeerDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_by_address() {
        let a = PeerDevice::named("Phone", "11:22:33:44:55:66");
        let b = PeerDevice::new(None, "11:22:33:44:55:66");
        let c = PeerDevice::named("Phone", "AA:BB:CC:DD:EE:FF");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display_name_falls_back_to_address() {
        let unnamed = PeerDevice::new(None, "11:22");
        assert_eq!(unnamed.display_name(), "11:22");
        assert_eq!(unnamed.to_string(), "11:22");

        let named = PeerDevice::named("Laptop", "33:44");
        assert_eq!(named.display_name(), "Laptop");
        assert_eq!(named.to_string(), "Laptop (33:44)");
    }
}
