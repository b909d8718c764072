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

//! Bluetooth Chat console application

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bluetooth_chat::bluetooth::{
    BluerDiscovery, BluetoothController, GrantAll, PeerDevice, RfcommTransport,
};
use bluetooth_chat::config::Config;
use bluetooth_chat::events::ConnectionResult;
use bluetooth_chat::state::{self, AppState};
use bluetooth_chat::ui::{self, ConsoleAction};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    info!("Starting Bluetooth Chat v{}...", env!("CARGO_PKG_VERSION"));

    // Connect to BlueZ
    let session = bluer::Session::new().await?;
    let adapter = match &config.bluetooth.adapter {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    let transport =
        RfcommTransport::new(session, adapter, config.bluetooth.rfcomm_options()).await?;
    let discovery = BluerDiscovery::new(transport.adapter().clone());

    let controller = BluetoothController::new(
        Arc::new(transport),
        Arc::new(discovery),
        Arc::new(GrantAll),
        config.bluetooth.controller_options(),
    )
    .await;

    let state = AppState::new();
    let projection = state::bind(state.clone(), &controller);

    let mut errors = controller.errors();
    let mut results = controller.results();
    let mut incoming = controller.incoming();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("Ready as '{}'", config.bluetooth.device_name);
    println!("{}", ui::HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match ui::parse_action(&line) {
                    Ok(Some(action)) => {
                        if !handle_action(&controller, &state, action).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(hint) => println!("{}", hint),
                },
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            event = errors.recv() => match event {
                Ok(event) => println!("! {}", event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            result = results.recv() => match result {
                Ok(ConnectionResult::ConnectionEstablished) => {
                    println!("* {}", ui::format_status(&state.snapshot()));
                }
                Ok(ConnectionResult::Error(reason)) => println!("* attempt ended: {}", reason),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            data = incoming.recv() => match data {
                Ok(bytes) => println!("< {}", String::from_utf8_lossy(&bytes).trim_end()),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} incoming chunks", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    controller.shutdown().await;
    projection.abort();
    info!("Shutting down...");

    Ok(())
}

/// Run one console action. Returns `false` to quit.
async fn handle_action(
    controller: &BluetoothController,
    state: &AppState,
    action: ConsoleAction,
) -> bool {
    match action {
        ConsoleAction::Scan => controller.start_discovery().await,
        ConsoleAction::StopScan => controller.stop_discovery().await,
        ConsoleAction::ListDevices => {
            println!("{}", ui::format_devices(&state.snapshot().scanned_devices));
        }
        ConsoleAction::ListPaired => {
            println!("{}", ui::format_devices(&state.snapshot().paired_devices));
        }
        ConsoleAction::Listen => {
            if let Err(e) = controller.start_server().await {
                println!("cannot listen: {}", e);
            }
        }
        ConsoleAction::Connect(address) => {
            let peer = lookup(controller, &address);
            if let Err(e) = controller.connect_to(peer).await {
                println!("cannot connect: {}", e);
            }
        }
        ConsoleAction::Send(text) => {
            if let Err(e) = controller.send(text.as_bytes()).await {
                println!("cannot send: {}", e);
            } else {
                println!("> {}", text);
            }
        }
        ConsoleAction::Disconnect => {
            controller.disconnect().await;
            state.clear_error();
        }
        ConsoleAction::Status => {
            let ui = state.snapshot();
            println!("{}", ui::format_status(&ui));
            if let Some(message) = &ui.error_message {
                println!("last error: {}", message);
            }
        }
        ConsoleAction::Help => println!("{}", ui::HELP),
        ConsoleAction::Quit => return false,
    }
    true
}

/// Resolve an address to a known device so the name is kept.
fn lookup(controller: &BluetoothController, address: &str) -> PeerDevice {
    controller
        .paired_devices()
        .into_iter()
        .chain(controller.discovered_devices())
        .find(|device| device.address == address)
        .unwrap_or_else(|| PeerDevice::new(None, address))
}
