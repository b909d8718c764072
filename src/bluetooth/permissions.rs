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

//! Capability checks guarding radio operations.

/// A capability the host must grant before the radio can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Scanning for nearby devices.
    Scan,
    /// Opening RFCOMM sockets in either role.
    Connect,
}

/// Source of permission decisions.
///
/// Commands whose capability is missing return without doing anything.
pub trait Permissions: Send + Sync {
    fn granted(&self, capability: Capability) -> bool;
}

/// Grants everything. On BlueZ, access is enforced by D-Bus policy and
/// surfaces as [`TransportError::PermissionDenied`](super::TransportError)
/// instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantAll;

impl Permissions for GrantAll {
    fn granted(&self, _capability: Capability) -> bool {
        true
    }
}

/// Fixed set of decisions.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissions {
    pub scan: bool,
    pub connect: bool,
}

impl StaticPermissions {
    pub fn none() -> Self {
        Self {
            scan: false,
            connect: false,
        }
    }
}

impl Permissions for StaticPermissions {
    fn granted(&self, capability: Capability) -> bool {
        match capability {
            Capability::Scan => self.scan,
            Capability::Connect => self.connect,
        }
    }
}
