//! Conductor - public handle to the resolve loop
//!
//! The [`Conductor`] is a cheap, cloneable handle. All state lives in the
//! actor spawned by [`Conductor::spawn`]; the handle only sends commands and
//! awaits replies. Events (errors, device status, timeline callbacks, ...)
//! arrive on the receiver returned next to the handle.
//!
//! # Device lifecycle
//!
//! [`Conductor::add_device`] builds the driver inside the actor (reserving
//! its id), runs `init` on the caller's task so a slow connect never stalls
//! the resolve loop, then registers the driver and forces a resolve for
//! "now".

mod actor;
mod commands;


use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use self::actor::ConductorActor;
use self::commands::ConductorCommand;
use crate::clock::{Clock, SystemClock, Time};
use crate::drivers::{CommandWithContext, Device, DeviceOptions, DeviceStatus};
use crate::error::ConductorError;
use crate::timeline::{LayerResolver, Mappings, TimelineObject, TimelineResolver, TriggerTime};

/// Default distance a resolve target may lie ahead of now
pub const DEFAULT_LOOKAHEAD_MS: i64 = 5000;

/// Default backoff after a failed resolve
pub const DEFAULT_RESOLVE_RETRY_MS: i64 = 1000;

/// Whether a callback reports an object starting or stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackKind {
    Started,
    Stopped,
}

/// Start/stop notification for a timeline object carrying a callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineCallback {
    pub time: Time,
    pub object_id: String,
    pub callback: String,
    pub data: Option<Value>,
    pub kind: CallbackKind,
}

/// Everything the conductor reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ConductorEvent {
    /// `device_id` is `None` for conductor-level failures (e.g. resolve errors)
    Error {
        device_id: Option<String>,
        message: String,
    },
    Warning {
        device_id: Option<String>,
        message: String,
    },
    /// A device is about to send a command
    Debug {
        device_id: String,
        command: CommandWithContext,
    },
    ConnectionChanged {
        device_id: String,
        status: DeviceStatus,
    },
    TimelineCallback(TimelineCallback),
    /// `"now"` starts were pinned to absolute times
    SetTimelineTriggerTime(Vec<TriggerTime>),
    /// A resolve pass finished
    Resolved {
        resolve_time: Time,
        next_resolve_time: Option<Time>,
    },
}

/// Conductor construction options
#[derive(Clone)]
pub struct ConductorOptions {
    pub clock: Arc<dyn Clock>,
    pub resolver: Arc<dyn TimelineResolver>,
    pub lookahead_ms: i64,
    pub resolve_retry_ms: i64,
}

impl Default for ConductorOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock::new()),
            resolver: Arc::new(LayerResolver::new()),
            lookahead_ms: DEFAULT_LOOKAHEAD_MS,
            resolve_retry_ms: DEFAULT_RESOLVE_RETRY_MS,
        }
    }
}

impl ConductorOptions {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TimelineResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Handle to a running conductor
#[derive(Clone)]
pub struct Conductor {
    cmd_tx: mpsc::UnboundedSender<ConductorCommand>,
    clock: Arc<dyn Clock>,
}

impl Conductor {
    /// Start the resolve loop on the current Tokio runtime
    pub fn spawn(options: ConductorOptions) -> (Self, mpsc::UnboundedReceiver<ConductorEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = ConductorActor::new(
            Arc::clone(&options.clock),
            options.resolver,
            options.lookahead_ms,
            options.resolve_retry_ms,
            cmd_rx,
            event_tx,
        );
        tokio::spawn(actor.run());

        info!("Conductor spawned");

        (
            Self {
                cmd_tx,
                clock: options.clock,
            },
            event_rx,
        )
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> ConductorCommand,
    ) -> Result<R, ConductorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(response_tx))
            .map_err(|_| ConductorError::Stopped)?;
        response_rx.await.map_err(|_| ConductorError::Stopped)
    }

    // =========================================================================
    // Fire and forget
    // =========================================================================

    pub fn set_timeline(&self, timeline: Vec<TimelineObject>) {
        let _ = self.cmd_tx.send(ConductorCommand::SetTimeline(timeline));
    }

    pub fn set_mapping(&self, mappings: Mappings) {
        let _ = self.cmd_tx.send(ConductorCommand::SetMapping(mappings));
    }

    /// Resolve for "now" instead of the previously scheduled instant
    pub fn reset_resolver(&self) {
        let _ = self.cmd_tx.send(ConductorCommand::ResetResolver);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_current_time(&self) -> Time {
        self.clock.now()
    }

    pub async fn timeline(&self) -> Result<Vec<TimelineObject>, ConductorError> {
        self.request(|response| ConductorCommand::GetTimeline { response }).await
    }

    pub async fn mapping(&self) -> Result<Mappings, ConductorError> {
        self.request(|response| ConductorCommand::GetMapping { response }).await
    }

    pub async fn get_devices(&self) -> Result<Vec<Arc<dyn Device>>, ConductorError> {
        self.request(|response| ConductorCommand::GetDevices { response }).await
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Arc<dyn Device>>, ConductorError> {
        let device_id = device_id.to_string();
        self.request(|response| ConductorCommand::GetDevice { device_id, response })
            .await
    }

    // =========================================================================
    // Device lifecycle
    // =========================================================================

    /// Create, initialize and register a device
    pub async fn add_device(
        &self,
        device_id: impl Into<String>,
        options: DeviceOptions,
    ) -> Result<Arc<dyn Device>, ConductorError> {
        let device_id = device_id.into();
        let device = self
            .request(|response| ConductorCommand::CreateDevice {
                device_id: device_id.clone(),
                options,
                response,
            })
            .await??;

        match device.init().await {
            Ok(true) => {}
            Ok(false) => warn!(device = %device_id, "Device reported it is not initialized yet"),
            Err(source) => {
                let _ = self.cmd_tx.send(ConductorCommand::ReleaseDevice {
                    device_id: device_id.clone(),
                });
                if let Err(e) = device.terminate().await {
                    warn!(device = %device_id, "Terminate after failed init: {}", e);
                }
                return Err(ConductorError::DeviceInit { id: device_id, source });
            }
        }

        let registered = Arc::clone(&device);
        self.request(|response| ConductorCommand::RegisterDevice {
            device_id,
            device: registered,
            response,
        })
        .await?;

        Ok(device)
    }

    /// Detach and terminate a device
    pub async fn remove_device(&self, device_id: &str) -> Result<(), ConductorError> {
        let id = device_id.to_string();
        let device = self
            .request(|response| ConductorCommand::RemoveDevice { device_id: id, response })
            .await?
            .ok_or_else(|| ConductorError::DeviceNotFound(device_id.to_string()))?;

        if let Err(e) = device.terminate().await {
            warn!(device = %device_id, "Terminate failed: {}", e);
        }
        Ok(())
    }

    /// Broadcast `make_ready` to every device, then resolve for "now"
    pub async fn devices_make_ready(&self, ok_to_destroy_stuff: bool) -> Result<(), ConductorError> {
        for device in self.get_devices().await? {
            if let Err(e) = device.make_ready(ok_to_destroy_stuff).await {
                warn!(device = %device.device_id(), "make_ready failed: {}", e);
            }
        }
        self.reset_resolver();
        Ok(())
    }

    /// Broadcast `stand_down` to every device
    pub async fn devices_stand_down(&self, ok_to_destroy_stuff: bool) -> Result<(), ConductorError> {
        for device in self.get_devices().await? {
            if let Err(e) = device.stand_down(ok_to_destroy_stuff).await {
                warn!(device = %device.device_id(), "stand_down failed: {}", e);
            }
        }
        Ok(())
    }

    /// Terminate every device and stop the resolve loop
    pub async fn destroy(&self) -> Result<(), ConductorError> {
        let devices = self
            .request(|response| ConductorCommand::Shutdown { response })
            .await?;
        for device in devices {
            if let Err(e) = device.terminate().await {
                warn!(device = %device.device_id(), "Terminate failed: {}", e);
            }
        }
        info!("Conductor destroyed");
        Ok(())
    }
}
