//! HRAM - BLE heart-rate sensor scanner and live viewer
//!
//! Two commands:
//! - `hram scan` lists heart-rate sensors in range
//! - `hram connect <identifier>` keeps a sensor connected and prints its
//!   readings, reconnecting when the link drops
//!
//! `--simulate` swaps the radio for an in-memory one with two sensors.

use clap::{Parser, Subcommand};
use futures::StreamExt;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use hram_ble::{
    Central, ConnectObserver, Device, DeviceRepository, HramConfig, HramError, Identifier,
    Notification, ScanObserver, SimCentral,
};

#[derive(Parser)]
#[command(name = "hram")]
#[command(about = "Scan for and stream from BLE heart-rate sensors")]
struct Args {
    /// JSON configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Use simulated sensors instead of a Bluetooth adapter
    #[arg(long, global = true)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List heart-rate sensors in range
    Scan {
        /// Scan window, e.g. "5s" (defaults to the configured duration)
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },
    /// Connect to a sensor and print its readings
    Connect {
        /// Sensor address as printed by `scan`
        identifier: String,

        /// Exit after this many readings
        #[arg(long, short = 'n')]
        samples: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            HramConfig::from_file(path)?
        }
        None => HramConfig::default(),
    };

    let central = if args.simulate {
        info!("Using simulated sensors");
        simulated_central()
    } else {
        adapter_central().await?
    };

    match args.command {
        Command::Scan { duration } => {
            if let Some(duration) = duration {
                config.scan.duration = duration;
                config.validate()?;
            }
            scan(central, &config).await
        }
        Command::Connect {
            identifier,
            samples,
        } => connect(central, &config, Identifier::new(identifier), samples).await,
    }
}

#[cfg(feature = "platform")]
async fn adapter_central() -> anyhow::Result<Arc<dyn Central>> {
    let central = hram_ble::BtleplugCentral::first_adapter().await?;
    Ok(Arc::new(central))
}

#[cfg(not(feature = "platform"))]
async fn adapter_central() -> anyhow::Result<Arc<dyn Central>> {
    anyhow::bail!("built without the `platform` feature; rerun with --simulate")
}

fn simulated_central() -> Arc<dyn Central> {
    let central = SimCentral::new();

    let polar = central.add_sensor("C0:FF:EE:00:00:01", Some("Polar H10 A1B2C3D4"));
    polar.set_manufacturer(Some("Polar Electro Oy"));
    polar.push_battery(87);
    polar.spawn_heartbeat(Duration::from_secs(1));

    let tickr = central.add_sensor("C0:FF:EE:00:00:02", Some("TICKR 5F21"));
    tickr.push_battery(42);
    tickr.spawn_heartbeat(Duration::from_millis(1500));

    Arc::new(central)
}

struct ScanPrinter {
    done: Notify,
    error: Mutex<Option<String>>,
}

impl ScanObserver for ScanPrinter {
    fn on_update(&self, devices: &[Device]) {
        if let Some(device) = devices.last() {
            let name = if device.name.is_empty() {
                "(unnamed)"
            } else {
                device.name.as_str()
            };
            println!("{:<40} {}", device.identifier, name);
        }
    }

    fn on_complete(&self) {
        self.done.notify_one();
    }

    fn on_error(&self, error: &HramError) {
        *self.error.lock() = Some(error.to_string());
    }
}

async fn scan(central: Arc<dyn Central>, config: &HramConfig) -> anyhow::Result<()> {
    let repository = DeviceRepository::new(central, config);
    let printer = Arc::new(ScanPrinter {
        done: Notify::new(),
        error: Mutex::new(None),
    });

    repository.scan(printer.clone());
    tokio::select! {
        _ = printer.done.notified() => {}
        _ = tokio::signal::ctrl_c() => repository.cancel_scanning(),
    }

    if let Some(error) = printer.error.lock().take() {
        anyhow::bail!("scan failed: {}", error);
    }
    let found = repository.scanned_devices().len();
    info!("Scan finished, {} sensor(s) found", found);
    Ok(())
}

enum SessionEvent {
    Connected(Device),
    Failed(String),
}

struct SessionReporter {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectObserver for SessionReporter {
    fn on_init_connection(&self) {
        info!("Connecting...");
    }

    fn on_connected(&self, device: &Device) {
        let _ = self.events.send(SessionEvent::Connected(device.clone()));
    }

    fn on_error(&self, error: &HramError) {
        let _ = self.events.send(SessionEvent::Failed(error.to_string()));
    }
}

async fn connect(
    central: Arc<dyn Central>,
    config: &HramConfig,
    identifier: Identifier,
    samples: Option<usize>,
) -> anyhow::Result<()> {
    let repository = DeviceRepository::new(central, config);
    let mut notifications = repository.listen();
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let target = Device {
        name: identifier.to_string(),
        identifier,
        manufacturer: None,
    };
    repository.connect(&target, Arc::new(SessionReporter { events: events_tx }));

    let mut printed = 0usize;
    let mut waiting = false;
    let outcome = loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SessionEvent::Connected(device) => {
                    let manufacturer = device.manufacturer.as_deref().unwrap_or("unknown vendor");
                    info!("Connected to {} ({})", device.name, manufacturer);
                }
                SessionEvent::Failed(error) => break Err(anyhow::anyhow!(error)),
            },
            notification = notifications.next() => match notification {
                Some(notification) if notification.is_empty() => {
                    if !waiting && printed > 0 {
                        warn!("Link lost, waiting for the sensor");
                    }
                    waiting = true;
                }
                Some(notification) => {
                    waiting = false;
                    print_notification(&notification);
                    printed += 1;
                    if samples.is_some_and(|limit| printed >= limit) {
                        break Ok(());
                    }
                }
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    repository.release().await;
    outcome
}

fn print_notification(notification: &Notification) {
    let Some(sample) = notification.heart_rate else {
        return;
    };
    let contact = match (sample.sensor_contact_supported, sample.contact_detected) {
        (false, _) => "n/a",
        (true, true) => "yes",
        (true, false) => "no",
    };
    println!(
        "{:>8}ms  {:>3} bpm  contact {:<3}  battery {:>3}%",
        notification.elapsed_time_ms, sample.bpm, contact, notification.battery_level
    );
}
