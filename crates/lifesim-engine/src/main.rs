//! Engine binary for the life simulation.
//!
//! Wires the kernel together, attaches a logging feedback sink and a tick
//! logger, and runs the simulation until interrupted or until the
//! configured real-time limit is reached.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `lifesim-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Assemble the kernel (clock, bus, scheduler, controller)
//! 4. Attach the feedback sink and the tick logger
//! 5. Start the ticker if `run.autostart` is set
//! 6. Wait for Ctrl-C or the real-time limit
//! 7. Stop the controller and log the final status report

mod error;
mod tick_logger;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lifesim_core::config::KernelConfig;
use lifesim_core::{Kernel, TracingFeedback};
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::tick_logger::TickLogger;

/// Config file looked up in the working directory.
const CONFIG_FILE: &str = "lifesim-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if configuration, kernel assembly, or shutdown fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration (logging depends on it).
    let (config, from_file) = load_config()?;

    // 2. Initialize structured logging. RUST_LOG wins over the config.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .init();

    info!("lifesim-engine starting");
    if !from_file {
        info!("Config file not found, using defaults");
    }
    info!(
        start_date = %config.clock.start_date,
        time_unit = %config.clock.time_unit,
        speed = config.controller.speed,
        autostart = config.run.autostart,
        max_real_time_seconds = config.run.max_real_time_seconds,
        "Configuration loaded"
    );

    // 3. Assemble the kernel.
    let kernel = Kernel::new(&config, Handle::current()).map_err(EngineError::from)?;

    // 4. Feedback and the tick logger.
    let controller = kernel.controller();
    controller.set_feedback_sink(Some(Arc::new(TracingFeedback)));
    let tick_logger = Arc::new(TickLogger::default());
    kernel.bus().register_processor(tick_logger.clone());

    // 5. Start.
    if config.run.autostart {
        controller.start().map_err(EngineError::from)?;
    } else {
        info!("Autostart disabled, waiting for interrupt");
    }

    // 6. Wait.
    wait_for_shutdown(config.run.max_real_time_seconds).await?;

    // 7. Stop and report.
    controller.stop().await.map_err(EngineError::from)?;
    let report = serde_json::to_string(&controller.status_report()).map_err(EngineError::from)?;
    info!(ticks_logged = tick_logger.ticks(), report = %report, "lifesim-engine finished");
    Ok(())
}

/// Load configuration from `lifesim-config.yaml`.
///
/// Falls back to defaults if the file does not exist. The flag says
/// whether the file was found.
fn load_config() -> Result<(KernelConfig, bool), EngineError> {
    let config_path = Path::new(CONFIG_FILE);
    if config_path.exists() {
        let config = KernelConfig::from_file(config_path)?;
        Ok((config, true))
    } else {
        let mut config = KernelConfig::default();
        config.logging.apply_env_overrides();
        Ok((config, false))
    }
}

/// Resolve on Ctrl-C, or after `limit_seconds` when it is non-zero.
async fn wait_for_shutdown(limit_seconds: u64) -> Result<(), EngineError> {
    if limit_seconds == 0 {
        tokio::signal::ctrl_c().await?;
        warn!("Interrupt received, shutting down");
        return Ok(());
    }
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            warn!("Interrupt received, shutting down");
        }
        () = tokio::time::sleep(Duration::from_secs(limit_seconds)) => {
            info!(limit_seconds, "Real-time limit reached");
        }
    }
    Ok(())
}
