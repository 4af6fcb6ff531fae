//! usb-frame-link
//!
//! Streams frames between two peers over a USB bulk link. The sender reads
//! frames from the files of a directory; the receiver writes the latest
//! reassembled frame into an output directory.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{
    DiscoveryEvent, EventReceiver, Role, SessionEvent, SessionState, event_channel, setup_logging,
};
use link::config::{LinkConfig, load_config};
use link::files::{DirectorySink, FileProducer};
use link::usb::{ConfigConsent, DeviceDiscovery, PermissionNegotiator, RusbOpener, list_devices};
use link::{Selection, StreamRole, TransportSession};
use protocol::DeviceDescriptor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-frame-link")]
#[command(author, version, about = "Stream frames over a USB bulk link")]
#[command(long_about = "
Streams a live sequence of frames between two peers over a USB bulk
interface. The first matching device is used; when it is unplugged the
link waits for the next one.

EXAMPLES:
    # Receive frames into ./frames
    usb-frame-link --role receiver --output-dir ./frames

    # Send every file of ./images in a loop, 30 frames per second
    usb-frame-link --role sender --input-dir ./images --frame-interval-ms 33

    # List matching USB devices and exit
    usb-frame-link --list-devices

CONFIGURATION:
    Read from --config if given, otherwise ~/.config/usb-frame-link/link.toml,
    otherwise built-in defaults.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Streaming role (sender, receiver)
    #[arg(short, long, value_name = "ROLE", value_parser = parse_role)]
    role: Option<Role>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Directory of files to send, one frame per file (sender)
    #[arg(long, value_name = "DIR")]
    input_dir: Option<PathBuf>,

    /// Directory the latest received frame is written to (receiver)
    #[arg(long, value_name = "DIR", default_value = "frames")]
    output_dir: PathBuf,

    /// Delay between submitted frames in milliseconds (sender)
    #[arg(long, value_name = "MS", default_value_t = 33)]
    frame_interval_ms: u64,
}

fn parse_role(s: &str) -> std::result::Result<Role, String> {
    match s.to_ascii_lowercase().as_str() {
        "sender" => Ok(Role::Sender),
        "receiver" => Ok(Role::Receiver),
        other => Err(format!("unknown role '{}', expected sender or receiver", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = LinkConfig::default();
        let path = LinkConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config.as_deref() {
        Some(path) => load_config(path).context("Failed to load configuration")?,
        None => LinkConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.link.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-frame-link v{}", env!("CARGO_PKG_VERSION"));

    let filters = config.device_filters()?;
    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&context, &config);
    }

    let role = args.role.unwrap_or(config.link.role);
    let input_dir = match (role, args.input_dir.clone()) {
        (Role::Sender, None) => return Err(anyhow!("--input-dir is required for the sender role")),
        (_, dir) => dir,
    };
    info!("Running as {}", role);

    let (discovery_tx, discovery_rx) = event_channel();
    let (session_tx, session_rx) = event_channel();

    let negotiator = PermissionNegotiator::new(
        Arc::new(ConfigConsent::new(
            config.permission.auto_grant,
            config.approved_devices()?,
        )),
        Arc::new(RusbOpener::new(context.clone(), config.usb.interface)),
    );
    let session = TransportSession::new(negotiator, config.transfer.settings(), session_tx);

    let mut discovery = DeviceDiscovery::start(context, filters, discovery_tx)
        .context("Failed to start device discovery")?;

    // A device plugged in before we started is picked like a fresh attach
    if let Some(device) = discovery.list_current_devices().into_iter().next() {
        info!("Found {} at startup", device);
        spawn_connect(&session, device);
    }

    let driver = Driver {
        session: session.clone(),
        role,
        input_dir,
        output_dir: args.output_dir.clone(),
        frame_interval: Duration::from_millis(args.frame_interval_ms),
        max_frame_bytes: config.transfer.max_frame_bytes,
    };

    let result = driver.run(&discovery, discovery_rx, session_rx).await;

    info!("Shutting down...");
    let closing = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || closing.stop_session()).await {
        error!("Session shutdown panicked: {}", e);
    }
    discovery.stop();

    result
}

/// List USB devices and exit
fn list_devices_mode(context: &rusb::Context, config: &LinkConfig) -> Result<()> {
    let devices = list_devices(context, &config.device_filters()?)?;

    if devices.is_empty() {
        println!("No matching USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x} - {}",
            device.vendor_id, device.product_id, device.name
        );
        println!(
            "      Bus {:03} Device {:03} Port {}",
            device.id.bus,
            device.id.address,
            device.bus_path()
        );
        println!();
    }
    Ok(())
}

fn spawn_connect(session: &TransportSession, device: DeviceDescriptor) {
    let session = session.clone();
    tokio::spawn(async move {
        match session.connect(&device, Selection::Automatic).await {
            Ok(state) => debug!("Connection attempt for {} ended {}", device, state),
            Err(e) => warn!("Not connecting to {}: {}", device, e),
        }
    });
}

#[derive(Clone)]
struct Driver {
    session: TransportSession,
    role: Role,
    input_dir: Option<PathBuf>,
    output_dir: PathBuf,
    frame_interval: Duration,
    max_frame_bytes: usize,
}

impl Driver {
    async fn run(
        &self,
        discovery: &DeviceDiscovery,
        discovery_rx: EventReceiver<DiscoveryEvent>,
        session_rx: EventReceiver<SessionEvent>,
    ) -> Result<()> {
        info!("Press Ctrl+C to stop");

        loop {
            tokio::select! {
                result = signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                    }
                    return Ok(());
                }
                event = discovery_rx.recv() => {
                    self.on_discovery(event.context("Discovery stopped")?).await;
                }
                event = session_rx.recv() => {
                    self.on_session(event.context("Session events stopped")?, discovery).await;
                }
            }
        }
    }

    async fn on_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Attached(device) => {
                info!("Device attached: {}", device);
                if self.session.current_state() == SessionState::Idle {
                    spawn_connect(&self.session, device);
                }
            }
            DiscoveryEvent::Detached(id) => {
                info!("Device detached: {}", id);
                let session = self.session.clone();
                // Joins the streaming worker
                if let Err(e) = tokio::task::spawn_blocking(move || session.handle_detach(id)).await
                {
                    error!("Detach handling panicked: {}", e);
                }
            }
        }
    }

    async fn on_session(&self, event: SessionEvent, discovery: &DeviceDiscovery) {
        match event {
            SessionEvent::StateChanged {
                to: SessionState::Connected,
                ..
            } => {
                let driver = self.clone();
                // A failed start closes the session, which joins its worker
                if let Err(e) = tokio::task::spawn_blocking(move || driver.start_or_close()).await {
                    error!("Stream startup panicked: {}", e);
                }
            }
            SessionEvent::StateChanged {
                session,
                to: SessionState::Idle,
                ..
            } => {
                info!("Session {} closed", session);
                // No automatic retry of the same device; wait for the next attach
                if discovery.list_current_devices().is_empty() {
                    info!("Waiting for a device...");
                }
            }
            SessionEvent::StateChanged { .. } => {}
            SessionEvent::Failed { session, error } => {
                error!("Session {} failed: {}", session, error);
            }
        }
    }

    fn start_or_close(&self) {
        if let Err(e) = self.start_streaming() {
            error!("Failed to start streaming: {:#}", e);
            self.session.stop_session();
        }
    }

    fn start_streaming(&self) -> Result<()> {
        match self.role {
            Role::Receiver => {
                let sink = DirectorySink::new(&self.output_dir)?;
                info!("Writing frames to {}", sink.latest_path().display());
                self.session.start_session(StreamRole::Receiver(Box::new(sink)))?;
            }
            Role::Sender => {
                let dir = self
                    .input_dir
                    .as_deref()
                    .ok_or_else(|| anyhow!("No input directory for the sender role"))?;
                let producer = FileProducer::open(dir, self.max_frame_bytes)?;
                self.session.start_session(StreamRole::Sender)?;
                spawn_producer(self.session.clone(), producer, self.frame_interval)?;
            }
        }
        Ok(())
    }
}

/// Feed frames into the session until it stops streaming
fn spawn_producer(
    session: TransportSession,
    mut producer: FileProducer,
    interval: Duration,
) -> Result<()> {
    std::thread::Builder::new()
        .name("frame-producer".to_string())
        .spawn(move || {
            loop {
                let frame = match producer.next_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Producer stopped: {:#}", e);
                        session.stop_session();
                        return;
                    }
                };
                if let Err(e) = session.submit(frame) {
                    debug!("Producer stopped: {}", e);
                    return;
                }
                std::thread::sleep(interval);
            }
        })
        .context("Failed to spawn producer thread")?;
    Ok(())
}
