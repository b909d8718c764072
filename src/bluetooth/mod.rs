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

//! Bluetooth communication module.
//!
//! Discovery, RFCOMM transport and the connection state machine.

mod controller;
mod device;
mod discovery;
pub mod loopback;
mod permissions;
mod registry;
mod rfcomm;
mod stream;
mod transport;

pub use controller::{
    BluetoothController, ConnectionRole, ConnectionState, ControllerError, ControllerOptions,
};
pub use device::PeerDevice;
pub use discovery::{BluerDiscovery, DiscoveryError, DiscoverySource, LinkEvent};
pub use permissions::{Capability, GrantAll, Permissions, StaticPermissions};
pub use registry::DeviceRegistry;
pub use rfcomm::{RfcommListener, RfcommOptions, RfcommTransport};
pub use stream::StreamConnection;
pub use transport::{
    CloseSignal, ConnectionHandle, ListenHandle, Transport, TransportError, SERVICE_NAME,
    SERVICE_UUID,
};
