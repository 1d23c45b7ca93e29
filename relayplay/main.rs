mod config;
mod dbus;
mod error;
mod player;

use crate::config::{config_dir, Args, Settings};
use crate::dbus::DbusChannel;
use crate::error::App;
use crate::player::{FramePacer, GstBackend, PlaybackController};
use clap::Parser;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming};
use log::{error, info};
use tokio::fs;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use std::future::Future;
use tokio::task;

#[tokio::main]
async fn main() -> Result<(), App> {
    let settings = Settings::load(Args::parse())?;

    let log_dir = config_dir()?.join("logs");
    fs::create_dir_all(&log_dir).await?;

    // Logger setup
    let _logger = Logger::try_with_str(&settings.log_level)?
        .log_to_file(FileSpec::default().directory(&log_dir))
        .rotate(
            Criterion::Size(1_000_000),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(3),
        )
        .duplicate_to_stderr(Duplicate::Info)
        .start()?;

    if let Some(path) = &settings.config_file {
        info!("Loaded config from {}", path.display());
    }

    let backend = GstBackend::new(settings.max_frame_wait_ms)?;
    let channel = DbusChannel::open(&settings.name).await.map_err(|e| {
        error!("Could not open command channel {}: {}", settings.name, e);
        e
    })?;

    let (stop_sender, stop_receiver) = watch::channel(());
    task::spawn(forward_stop(wait_for_termination(), stop_sender));

    let pacer = FramePacer::new(settings.speedup, settings.max_frame_wait_ms);
    let mut controller = PlaybackController::new(settings.player, pacer, channel, backend)
        .with_stop_signal(stop_receiver);
    let reason = controller.run().await;
    info!("Player stopped: {:?}", reason);
    Ok(())
}

/// Fires the stop signal only if `received` reports an actual signal.
async fn forward_stop(received: impl Future<Output = bool>, stop_sender: watch::Sender<()>) {
    if received.await {
        let _ = stop_sender.send(());
    }
}

/// Resolves to `true` on SIGINT or SIGTERM, `false` if neither can be watched.
async fn wait_for_termination() -> bool {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => Some(terminate),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let interrupted = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to listen for interrupts: {}", e);
                false
            }
        }
    };

    let Some(terminate) = terminate.as_mut() else {
        if interrupted.await {
            info!("Interrupt received, stopping player...");
            return true;
        }
        return false;
    };

    tokio::select! {
        true = interrupted => {
            info!("Interrupt received, stopping player...");
        }
        Some(()) = terminate.recv() => {
            info!("SIGTERM received, stopping player...");
        }
        else => return false,
    }
    true
}
