//! Timeline Conductor - plays a show file against its devices

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use timeline_conductor::config::{AppConfig, ConfigWatcher, PinnedStarts};
use timeline_conductor::conductor::{Conductor, ConductorEvent, ConductorOptions};
use timeline_conductor::timeline::{LayerResolver, TimelineResolver};

/// Resolve a broadcast timeline and drive its devices on time
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the show file
    #[arg(short, long, default_value = "show.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Validate the show file and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("Starting Timeline Conductor {}", env!("CARGO_PKG_VERSION"));
    info!("Show file: {}", args.config);

    if args.check {
        return check_show(&args.config).await;
    }

    let (config_watcher, config) = ConfigWatcher::new(args.config.clone()).await?;
    info!("Show file loaded with hot-reload enabled");

    let (conductor, events) = Conductor::spawn(config.conductor.apply(ConductorOptions::default()));

    for device_id in config.devices.keys() {
        add_device(&conductor, &config, device_id).await;
    }
    conductor.set_mapping(config.mappings.clone());
    conductor.set_timeline(config.timeline.clone());

    if config.conductor.make_ready_on_start {
        conductor.devices_make_ready(true).await?;
    }

    run_app(&conductor, config, config_watcher, events, shutdown_signal()).await;

    conductor.destroy().await?;
    info!("Timeline Conductor shutdown complete");
    Ok(())
}

async fn run_app(
    conductor: &Conductor,
    mut config: AppConfig,
    mut config_watcher: ConfigWatcher,
    mut events: mpsc::UnboundedReceiver<ConductorEvent>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    let mut pinned = PinnedStarts::new();

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if let ConductorEvent::SetTimelineTriggerTime(fixed) = &event {
                    pinned.extend(fixed.iter().map(|trigger| (trigger.id.clone(), trigger.time)));
                }
                log_event(event);
            }

            Some(next) = config_watcher.next_config() => {
                apply_reload(conductor, &config, &next, &mut pinned).await;
                config = next;
            }

            _ = &mut shutdown => break,
        }
    }
}

async fn add_device(conductor: &Conductor, config: &AppConfig, device_id: &str) {
    let Some(options) = config.devices.get(device_id) else {
        return;
    };
    match conductor.add_device(device_id, options.clone()).await {
        Ok(device) => info!("🔌 Device '{}' ready ({})", device_id, device.device_name()),
        Err(e) => error!("Failed to add device '{}': {}", device_id, e),
    }
}

async fn apply_reload(conductor: &Conductor, current: &AppConfig, next: &AppConfig, pinned: &mut PinnedStarts) {
    let changes = current.device_changes(next);
    if !changes.is_empty() {
        info!(removed = ?changes.removed, added = ?changes.added, "Device set changed");
    }

    for device_id in &changes.removed {
        if let Err(e) = conductor.remove_device(device_id).await {
            warn!("Failed to remove device '{}': {}", device_id, e);
        }
    }
    for device_id in &changes.added {
        add_device(conductor, next, device_id).await;
    }

    conductor.set_mapping(next.mappings.clone());
    conductor.set_timeline(current.timeline_after_reload(next, pinned));
}

fn log_event(event: ConductorEvent) {
    match event {
        ConductorEvent::Error { device_id, message } => match device_id {
            Some(id) => error!(device = %id, "{}", message),
            None => error!("{}", message),
        },
        ConductorEvent::Warning { device_id, message } => match device_id {
            Some(id) => warn!(device = %id, "{}", message),
            None => warn!("{}", message),
        },
        ConductorEvent::Debug { device_id, command } => {
            debug!(device = %device_id, tl_obj = %command.timeline_obj_id, "{}", command.context);
        }
        ConductorEvent::ConnectionChanged { device_id, status } => {
            if status.is_good() {
                info!("✅ Device '{}' connected", device_id);
            } else {
                warn!("⚠️  Device '{}' {:?}: {}", device_id, status.status_code, status.messages.join(", "));
            }
        }
        ConductorEvent::TimelineCallback(callback) => {
            info!(
                object = %callback.object_id,
                kind = ?callback.kind,
                "Timeline callback '{}'",
                callback.callback
            );
        }
        ConductorEvent::SetTimelineTriggerTime(fixed) => {
            for trigger in fixed {
                debug!(object = %trigger.id, time = trigger.time, "Start time fixed");
            }
        }
        ConductorEvent::Resolved {
            resolve_time,
            next_resolve_time,
        } => {
            debug!(resolve_time, ?next_resolve_time, "Resolved");
        }
    }
}

/// Load, validate and dry-resolve the show file
async fn check_show(path: &str) -> Result<()> {
    let config = AppConfig::load(path).await?;
    let state = LayerResolver::new().resolve_state(&config.timeline, 0)?;

    info!(
        devices = config.devices.len(),
        mappings = config.mappings.len(),
        objects = config.timeline.len(),
        upcoming = state.next_events.len(),
        "Show file OK"
    );
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
