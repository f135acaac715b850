//! `rxbus` – standalone broker.
//!
//! 1. Sets up logging (`RUST_LOG`, `RXBUS_LOG_FORMAT=json`).
//! 2. Loads the bus config: first argument, else `RXBUS_CONFIG`, else
//!    `./rxbus.toml`, else defaults.
//! 3. Starts the bus and a listener for every server transport.
//! 4. Shuts the bus down cleanly on Ctrl-C.

use std::process::ExitCode;

use rxbus_middleware::Bus;
use rxbus_server::{config, logging, serve};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();

    let cli_arg = std::env::args().nth(1);
    let cfg = match config::load(cli_arg.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "cannot load config");
            return ExitCode::from(2);
        }
    };
    info!(transports = cfg.transports.len(), "config loaded");

    let bus = match Bus::new(cfg) {
        Ok(bus) => bus,
        Err(e) => {
            error!(error = %e, "cannot build bus");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = bus.init() {
        error!(error = %e, "cannot start bus");
        return ExitCode::FAILURE;
    }

    let listeners = match serve(&bus).await {
        Ok(listeners) => listeners,
        Err(e) => {
            error!(error = %e, "cannot start listeners");
            bus.destroy().await;
            return ExitCode::FAILURE;
        }
    };

    // ── Ctrl-C ──────────────────────────────────────────────────────────────
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process with a signal instead");
    }

    stop_rx.recv().await;
    info!("shutdown requested");
    for listener in listeners {
        listener.abort();
    }
    bus.destroy().await;
    ExitCode::SUCCESS
}
