// Diagnostic CLI for relaylink.
//
// Drives real hardware through the btleplug adapter: scan for relay units,
// inspect the known-device store, connect and watch input-state updates,
// or toggle a relay channel.

use std::time::Duration;

use clap::{Parser, Subcommand};
use relaylink::{
    BtleRadio, DeviceId, LinkConfig, PlatformGate, RelayCommand, SessionManager, StatusEvent,
};

#[derive(Parser)]
#[command(name = "relay_cli", about = "SafeOp relay unit diagnostics")]
struct Cli {
    /// Only surface devices whose advertised name starts with this prefix.
    #[arg(long)]
    name_prefix: Option<String>,

    /// Scan window in milliseconds.
    #[arg(long, default_value_t = 8_000)]
    scan_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for nearby relay units and list them as they appear.
    Scan,
    /// List the persisted known devices.
    Known,
    /// Connect to a unit and stream its input-state updates until ctrl-c.
    Watch {
        /// Device id as printed by `scan`.
        id: String,
    },
    /// Connect, drive one relay channel, disconnect.
    Toggle {
        id: String,
        /// Relay channel index.
        relay: u8,
        /// Desired state: on or off.
        #[arg(value_parser = parse_state)]
        state: bool,
    },
    /// Remove a device from the known list.
    Forget { id: String },
}

fn parse_state(s: &str) -> Result<bool, String> {
    match s {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("expected 'on' or 'off', got '{other}'")),
    }
}

/// Run a scan window to completion, printing devices as they show up.
async fn scan_and_print(
    manager: &SessionManager<BtleRadio>,
    window_ms: u64,
) -> relaylink::Result<()> {
    let mut available = manager.watch_available();
    manager.start_scan().await?;

    let window = tokio::time::sleep(Duration::from_millis(window_ms + 500));
    tokio::pin!(window);
    let mut printed = 0;

    loop {
        tokio::select! {
            _ = &mut window => break,
            changed = available.changed() => {
                if changed.is_err() {
                    break;
                }
                let devices = available.borrow_and_update().clone();
                for device in devices.iter().skip(printed) {
                    println!("{}  {}  RSSI {}", device.id, device.name,
                        device.rssi.map_or("?".to_string(), |r| r.to_string()));
                }
                printed = devices.len();
            }
        }
    }
    if printed == 0 {
        println!("No relay units found");
    }
    Ok(())
}

/// The platform can only connect to peripherals it has seen, so run a scan
/// window before connecting to one by id.
async fn discover_then_connect(
    manager: &SessionManager<BtleRadio>,
    id: &DeviceId,
    window_ms: u64,
) -> relaylink::Result<()> {
    manager.start_scan().await?;
    tokio::time::sleep(Duration::from_millis(window_ms)).await;
    manager.stop_scan().await;
    manager.connect(id).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = LinkConfig::default();
    config.scan_window_ms = cli.scan_ms;
    config.name_prefix = cli.name_prefix.clone();

    let radio = BtleRadio::new().await?.with_service(config.relay_service);
    let manager = SessionManager::new(radio, PlatformGate, config)?;

    match cli.command {
        Command::Scan => {
            scan_and_print(&manager, cli.scan_ms).await?;
        }
        Command::Known => {
            let known = manager.known_devices();
            if known.is_empty() {
                println!("No known devices");
            }
            for device in known {
                println!("{}  {}  {:?}", device.id, device.name, device.status);
            }
        }
        Command::Watch { id } => {
            let id = DeviceId::new(id);
            discover_then_connect(&manager, &id, cli.scan_ms).await?;
            println!("Connected to {id}; streaming input states (ctrl-c to stop)");

            let mut events = manager.subscribe_status();
            while let Ok(event) = events.recv().await {
                match event {
                    StatusEvent::Update { id, state } => {
                        println!("{id}: inputs {:08b}", state.channels);
                    }
                    StatusEvent::DecodeError { id, reason } => {
                        eprintln!("{id}: undecodable update: {reason}");
                    }
                }
            }
        }
        Command::Toggle { id, relay, state } => {
            let id = DeviceId::new(id);
            discover_then_connect(&manager, &id, cli.scan_ms).await?;
            manager
                .send_command(&id, RelayCommand::new(relay, state))
                .await?;
            manager.disconnect(&id).await?;
            println!("Relay {relay} -> {}", if state { "on" } else { "off" });
        }
        Command::Forget { id } => {
            if manager.forget(&DeviceId::new(id))? {
                println!("Removed");
            } else {
                println!("No such device");
            }
        }
    }

    Ok(())
}
