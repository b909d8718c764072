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

//! Console commands and rendering.

use std::fmt::Write;

use crate::bluetooth::PeerDevice;
use crate::state::ChatUiState;

pub const HELP: &str = "Commands:
  scan                start discovery
  stop                stop discovery
  devices             list discovered devices
  paired              list paired devices
  listen              wait for a peer to connect
  connect <address>   connect to a paired device
  send <text>         send a line to the peer
  disconnect          close the session
  status              show the connection status
  help                show this help
  quit                exit";

/// Actions that can be typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleAction {
    Scan,
    StopScan,
    ListDevices,
    ListPaired,
    Listen,
    Connect(String),
    Send(String),
    Disconnect,
    Status,
    Help,
    Quit,
}

/// Parse one input line. `None` for blank lines, `Err` with a hint otherwise.
pub fn parse_action(line: &str) -> Result<Option<ConsoleAction>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let action = match command.to_ascii_lowercase().as_str() {
        "scan" => ConsoleAction::Scan,
        "stop" => ConsoleAction::StopScan,
        "devices" => ConsoleAction::ListDevices,
        "paired" => ConsoleAction::ListPaired,
        "listen" => ConsoleAction::Listen,
        "connect" if rest.is_empty() => return Err("usage: connect <address>".to_string()),
        "connect" => ConsoleAction::Connect(rest.to_ascii_uppercase()),
        "send" if rest.is_empty() => return Err("usage: send <text>".to_string()),
        "send" => ConsoleAction::Send(rest.to_string()),
        "disconnect" => ConsoleAction::Disconnect,
        "status" => ConsoleAction::Status,
        "help" | "?" => ConsoleAction::Help,
        "quit" | "exit" => ConsoleAction::Quit,
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };

    Ok(Some(action))
}

/// Render a device list, one per line.
pub fn format_devices(devices: &[PeerDevice]) -> String {
    if devices.is_empty() {
        return "  (none)".to_string();
    }

    let mut out = String::new();
    for (i, device) in devices.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        match &device.name {
            Some(name) => {
                let _ = write!(out, "  {}  {}", device.address, name);
            }
            None => {
                let _ = write!(out, "  {}", device.address);
            }
        }
    }
    out
}

/// One-line status summary.
pub fn format_status(ui: &ChatUiState) -> String {
    match &ui.connected_device {
        Some(device) => format!("{} to {}", ui.status.as_str(), device),
        None => ui.status.as_str().to_string(),
    }
}
