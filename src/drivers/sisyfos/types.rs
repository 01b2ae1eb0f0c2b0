//! Sisyfos audio-mixer types: abstract state, content payload, commands

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::api::SisyfosApi;
use crate::clock::Time;
use crate::do_on_time::JobFuture;

/// Fader level Sisyfos treats as 0 dB
pub const DEFAULT_FADER_LEVEL: f64 = 0.75;

/// Default Sisyfos control port
pub const DEFAULT_PORT: u16 = 1176;

/// One mixer channel as the timeline wants it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SisyfosChannel {
    /// 0 = off, 1 = on air, 2 = voice-over
    pub pgm_on: u8,
    pub pst_on: u8,
    pub fader_level: f64,
    pub label: String,
    pub visible: bool,
    /// Timeline objects that set this channel in the last conversion
    pub tl_obj_ids: Vec<String>,
}

impl Default for SisyfosChannel {
    fn default() -> Self {
        Self {
            pgm_on: 0,
            pst_on: 0,
            fader_level: DEFAULT_FADER_LEVEL,
            label: String::new(),
            visible: true,
            tl_obj_ids: Vec::new(),
        }
    }
}

/// Abstract device state used for diffing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SisyfosState {
    pub channels: BTreeMap<u32, SisyfosChannel>,
    /// A full resync with the mixer is requested
    pub resync: bool,
}

/// A channel as reported by the mixer itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SisyfosApiChannel {
    pub pgm_on: u8,
    pub pst_on: u8,
    pub fader_level: f64,
    pub label: String,
    pub visible: bool,
}

impl Default for SisyfosApiChannel {
    fn default() -> Self {
        Self {
            pgm_on: 0,
            pst_on: 0,
            fader_level: DEFAULT_FADER_LEVEL,
            label: String::new(),
            visible: true,
        }
    }
}

/// Live mixer state as fetched from the device
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SisyfosApiState {
    pub channels: BTreeMap<u32, SisyfosApiChannel>,
}

/// Content of a timeline object addressed to a Sisyfos layer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SisyfosContent {
    #[serde(default)]
    pub is_pgm: Option<u8>,
    #[serde(default)]
    pub fader_level: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub visible: Option<bool>,
    #[serde(default)]
    pub resync: Option<bool>,
}

/// Commands understood by the mixer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SisyfosCommand {
    Resync,
    TogglePgm { channel: u32, value: u8 },
    TogglePst { channel: u32, value: u8 },
    SetFader { channel: u32, value: f64 },
    Label { channel: u32, value: String },
    Visible { channel: u32, value: bool },
}

/// A diff result waiting in the timed queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub command: SisyfosCommand,
    pub context: String,
    pub timeline_obj_id: String,
}

/// Performs device I/O for one command: `(time, command, context, timeline_obj_id)`
pub type CommandReceiver = Arc<dyn Fn(Time, SisyfosCommand, String, String) -> JobFuture + Send + Sync>;

/// Connection and behaviour options for a Sisyfos device
#[derive(Clone, Serialize, Deserialize)]
pub struct SisyfosOptions {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Channel count of the simulated mixer used when no API is injected
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Replaces the built-in command sink (testing, cross-process relay)
    #[serde(skip)]
    pub command_receiver: Option<CommandReceiver>,
    /// Replaces the built-in mixer API
    #[serde(skip)]
    pub api: Option<Arc<dyn SisyfosApi>>,
}

impl SisyfosOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            channels: default_channels(),
            command_receiver: None,
            api: None,
        }
    }

    pub fn with_api(mut self, api: Arc<dyn SisyfosApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_command_receiver(mut self, receiver: CommandReceiver) -> Self {
        self.command_receiver = Some(receiver);
        self
    }
}

impl std::fmt::Debug for SisyfosOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SisyfosOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("channels", &self.channels)
            .field("command_receiver", &self.command_receiver.is_some())
            .field("api", &self.api.is_some())
            .finish()
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_channels() -> u32 {
    8
}
