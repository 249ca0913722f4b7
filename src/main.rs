mod backend;
mod config;
mod countdown;
mod link;
mod pairing;
mod poller;
mod queue;
mod session;

use anyhow::{bail, Context, Result};
use backend::{Backend, HttpBackend};
use clap::Parser;
use config::{ClientConfig, LinkMode};
use pairing::PairingInfo;
use queue::{QueueSettings, QueueWorker};
use remoteled_shared::{format_mm_ss, ServiceType, SessionState};
use session::{OrderRequest, SessionController, SessionStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "remoteled-client")]
#[command(about = "Pay for and run a session on a RemoteLED peripheral", long_about = None)]
struct Cli {
    /// Pairing deep link from the peripheral's QR code
    link: String,

    /// Backend device id (defaults to the machineId in the link)
    #[arg(short, long)]
    device: Option<String>,

    /// Backend service id to order
    #[arg(short, long)]
    service: String,

    /// Price in cents
    #[arg(short, long, default_value_t = 100)]
    amount_cents: u32,

    /// TRIGGER, FIXED or VARIABLE
    #[arg(short = 't', long, default_value = "FIXED")]
    service_type: ServiceType,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the in-process simulated peripheral instead of BLE
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if cli.simulate {
        config.link.mode = LinkMode::Simulated;
    }

    let pairing = PairingInfo::parse(&cli.link).context("Invalid pairing link")?;
    let device_id = match cli.device.clone().or_else(|| pairing.device_id.clone()) {
        Some(id) => id,
        None => bail!("No device id: pass --device or use a link carrying machineId"),
    };

    info!("RemoteLED client starting");
    info!("  Backend: {}", config.backend.base_url);
    info!("  Peripheral: {} ({:?} link)", pairing.address, config.link.mode);
    info!("  Device: {}", device_id);

    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    if let Err(e) = backend.health().await {
        warn!("[MAIN] Backend health check failed: {}", e);
    }

    // Queue worker owns the link from here on
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let link = link::build_link(&config.link, link_tx);
    let (queue, queue_events) =
        QueueWorker::spawn(link, link_rx, QueueSettings::from(&config.link));

    match queue.connect(pairing.clone()).await {
        Ok(led) => info!("[MAIN] Peripheral connected, LED is {:?}", led),
        Err(e) => warn!("[MAIN] Peripheral not reachable yet ({}), session will retry", e),
    }

    let backend: Arc<dyn Backend> = backend;
    let controller = SessionController::new(
        backend,
        queue.clone(),
        queue_events,
        pairing,
        config.session.clone(),
    )
    .skip_backend_led(config.backend.skip_backend_led);

    let request = OrderRequest {
        device_id,
        service_id: cli.service.clone(),
        amount_cents: cli.amount_cents,
        service_type: cli.service_type,
    };
    let session = match controller.place_order(&request).await {
        Ok(session) => session,
        Err(e) => {
            queue.disconnect().await;
            return Err(e).context("Could not place order");
        }
    };

    let mut handle = controller.start(session);
    tokio::spawn(report_status(handle.status()));

    let result = tokio::select! {
        result = handle.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("[MAIN] Interrupted, cancelling session");
            handle.cancel();
            handle.wait().await
        }
    };

    match result {
        Ok(session) => {
            info!(
                "[MAIN] Session {} finished after {}s authorized",
                session.session_id, session.authorized_seconds
            );
            Ok(())
        }
        Err(e) => {
            error!("[MAIN] Session ended in error: {}", e);
            Err(e.into())
        }
    }
}

/// Log state changes and a once-a-minute countdown
async fn report_status(mut status: watch::Receiver<SessionStatus>) {
    let mut last_state = SessionState::Created;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();

        if current.state != last_state {
            info!("[MAIN] Session is {:?} (LED {:?})", current.state, current.led);
            last_state = current.state;
        }
        if let Some(remaining) = current.remaining_secs {
            if remaining % 60 == 0 {
                info!("[MAIN] {} remaining", format_mm_ss(remaining));
            } else {
                debug!("[MAIN] {} remaining", format_mm_ss(remaining));
            }
        }
    }
}
