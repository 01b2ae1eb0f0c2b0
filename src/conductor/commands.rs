//! Messages accepted by the conductor actor
//!
//! Like the rest of the actor plumbing, commands are split into
//! fire-and-forget updates and request-response queries answered through a
//! oneshot channel.

use std::sync::Arc;
use tokio::sync::oneshot;

use crate::drivers::{Device, DeviceOptions};
use crate::error::ConductorError;
use crate::timeline::{Mappings, TimelineObject};

pub enum ConductorCommand {
    // -------------------------------------------------------------------------
    // Fire and forget
    // -------------------------------------------------------------------------
    /// Replace the whole timeline and resolve again
    SetTimeline(Vec<TimelineObject>),

    /// Replace the layer mapping and resolve again
    SetMapping(Mappings),

    /// Resolve for "now" on the next turn of the loop
    ResetResolver,

    // -------------------------------------------------------------------------
    // Request-response
    // -------------------------------------------------------------------------
    GetTimeline {
        response: oneshot::Sender<Vec<TimelineObject>>,
    },

    GetMapping {
        response: oneshot::Sender<Mappings>,
    },

    GetDevices {
        response: oneshot::Sender<Vec<Arc<dyn Device>>>,
    },

    GetDevice {
        device_id: String,
        response: oneshot::Sender<Option<Arc<dyn Device>>>,
    },

    /// Build a driver and reserve its id. The caller runs `init` outside the
    /// actor and then sends [`ConductorCommand::RegisterDevice`] or
    /// [`ConductorCommand::ReleaseDevice`].
    CreateDevice {
        device_id: String,
        options: DeviceOptions,
        response: oneshot::Sender<Result<Arc<dyn Device>, ConductorError>>,
    },

    /// Make an initialized driver part of the resolve loop
    RegisterDevice {
        device_id: String,
        device: Arc<dyn Device>,
        response: oneshot::Sender<()>,
    },

    /// Drop a reservation whose `init` failed
    ReleaseDevice { device_id: String },

    /// Detach a driver; the caller terminates it
    RemoveDevice {
        device_id: String,
        response: oneshot::Sender<Option<Arc<dyn Device>>>,
    },

    /// Detach every driver and stop the loop
    Shutdown {
        response: oneshot::Sender<Vec<Arc<dyn Device>>>,
    },
}

impl std::fmt::Debug for ConductorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConductorCommand::SetTimeline(objects) => write!(f, "SetTimeline({} objects)", objects.len()),
            ConductorCommand::SetMapping(mappings) => write!(f, "SetMapping({} layers)", mappings.len()),
            ConductorCommand::ResetResolver => write!(f, "ResetResolver"),
            ConductorCommand::GetTimeline { .. } => write!(f, "GetTimeline"),
            ConductorCommand::GetMapping { .. } => write!(f, "GetMapping"),
            ConductorCommand::GetDevices { .. } => write!(f, "GetDevices"),
            ConductorCommand::GetDevice { device_id, .. } => write!(f, "GetDevice({})", device_id),
            ConductorCommand::CreateDevice { device_id, .. } => write!(f, "CreateDevice({})", device_id),
            ConductorCommand::RegisterDevice { device_id, .. } => write!(f, "RegisterDevice({})", device_id),
            ConductorCommand::ReleaseDevice { device_id } => write!(f, "ReleaseDevice({})", device_id),
            ConductorCommand::RemoveDevice { device_id, .. } => write!(f, "RemoveDevice({})", device_id),
            ConductorCommand::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}
