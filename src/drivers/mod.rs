//! Device drivers (one variant per device family)
//!
//! Every driver implements [`Device`]. The conductor never names a concrete
//! family: it builds drivers through [`create_device`] from a
//! [`DeviceOptions`] variant, so adding a family means adding a variant here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::clock::{Clock, Time};
use crate::error::DeviceError;
use crate::timeline::{Mappings, TimelineState};

pub mod sisyfos;
pub mod state_history;

pub use sisyfos::{SisyfosDevice, SisyfosOptions};
pub use state_history::StateHistory;

/// Known device families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Sisyfos,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Sisyfos => write!(f, "sisyfos"),
        }
    }
}

/// Device configuration, one variant per family
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceOptions {
    Sisyfos(SisyfosOptions),
}

impl DeviceOptions {
    pub fn device_type(&self) -> DeviceType {
        match self {
            DeviceOptions::Sisyfos(_) => DeviceType::Sisyfos,
        }
    }
}

/// Health of a device, worst last
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Unknown,
    Good,
    WarningMinor,
    WarningMajor,
    Bad,
    Fatal,
}

/// Status code plus diagnostic messages, computed on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub status_code: StatusCode,
    pub messages: Vec<String>,
}

impl DeviceStatus {
    pub fn good() -> Self {
        Self {
            status_code: StatusCode::Good,
            messages: Vec::new(),
        }
    }

    /// Degrade to `code` (if worse) and record why
    pub fn degrade(&mut self, code: StatusCode, message: impl Into<String>) {
        self.status_code = self.status_code.max(code);
        self.messages.push(message.into());
    }

    pub fn is_good(&self) -> bool {
        self.status_code == StatusCode::Good
    }
}

/// A command as it went out, for audit logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandWithContext {
    pub context: String,
    pub timeline_obj_id: String,
    pub command: Value,
}

/// Signal from a driver to its conductor
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEventKind {
    ConnectionChanged(DeviceStatus),
    /// The device wants the timeline resolved again for "now"
    ResetResolver,
    Error(String),
    Warning(String),
    /// A command is about to be sent
    Debug(CommandWithContext),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub device_id: String,
    pub kind: DeviceEventKind,
}

/// Sending half a driver uses to reach its conductor
#[derive(Clone)]
pub struct DeviceEventSender {
    device_id: String,
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceEventSender {
    pub fn new(device_id: impl Into<String>, tx: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self {
            device_id: device_id.into(),
            tx,
        }
    }

    pub fn emit(&self, kind: DeviceEventKind) {
        let _ = self.tx.send(DeviceEvent {
            device_id: self.device_id.clone(),
            kind,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(DeviceEventKind::Error(message.into()));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(DeviceEventKind::Warning(message.into()));
    }
}

/// What a conductor hands to every driver it creates
#[derive(Clone)]
pub struct DeviceContext {
    pub clock: Arc<dyn Clock>,
    pub events: DeviceEventSender,
}

/// Contract every device family implements
///
/// Methods take `&self`; drivers keep their mutable state behind locks so the
/// conductor can share them as `Arc<dyn Device>`.
#[async_trait]
pub trait Device: Send + Sync {
    fn device_id(&self) -> &str;

    fn device_type(&self) -> DeviceType;

    fn device_name(&self) -> String;

    /// Connect to the device. `Ok(true)` once the connection is up.
    async fn init(&self) -> Result<bool, DeviceError>;

    /// Called right before [`Device::handle_state`] for `new_state_time`
    fn prepare_for_handle_state(&self, new_state_time: Time);

    /// Plan the commands that bring the device into `state` at `state.time`
    fn handle_state(&self, state: &TimelineState, mappings: &Mappings);

    /// Drop commands planned after `clear_after_time`
    fn clear_future(&self, clear_after_time: Time);

    async fn make_ready(&self, ok_to_destroy_stuff: bool) -> Result<(), DeviceError>;

    async fn stand_down(&self, _ok_to_destroy_stuff: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Release the device. Idempotent.
    async fn terminate(&self) -> Result<bool, DeviceError>;

    fn get_status(&self) -> DeviceStatus;

    fn connected(&self) -> bool;

    /// Number of commands waiting in the timed queue
    fn queue_len(&self) -> usize;
}

/// Build the driver for `options`
pub fn create_device(
    device_id: &str,
    options: DeviceOptions,
    ctx: DeviceContext,
) -> Arc<dyn Device> {
    match options {
        DeviceOptions::Sisyfos(options) => Arc::new(SisyfosDevice::new(device_id, options, ctx)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_degrades_to_worst() {
        let mut status = DeviceStatus::good();
        assert!(status.is_good());

        status.degrade(StatusCode::WarningMinor, "slow");
        status.degrade(StatusCode::Bad, "Not connected");
        status.degrade(StatusCode::WarningMajor, "queue backlog");

        assert_eq!(status.status_code, StatusCode::Bad);
        assert_eq!(status.messages.len(), 3);
    }

    #[test]
    fn test_device_options_tagged_yaml() {
        let yaml = "type: sisyfos\nhost: 10.0.0.5\nport: 1176\nchannels: 4\n";
        let options: DeviceOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.device_type(), DeviceType::Sisyfos);
        let DeviceOptions::Sisyfos(sisyfos) = options;
        assert_eq!(sisyfos.host, "10.0.0.5");
        assert_eq!(sisyfos.channels, 4);
    }

    #[tokio::test]
    async fn test_event_sender_tags_device() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = DeviceEventSender::new("mixer1", tx);
        sender.warning("hello");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.device_id, "mixer1");
        assert_eq!(event.kind, DeviceEventKind::Warning("hello".into()));
    }
}
