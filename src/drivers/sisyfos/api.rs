//! Connection-level contract between the Sisyfos driver and a mixer

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{SisyfosApiState, SisyfosCommand};

/// Notifications pushed by a mixer connection
#[derive(Debug, Clone, PartialEq)]
pub enum SisyfosApiEvent {
    Connected,
    Disconnected,
    /// The mixer's own link to the audio console went up or down
    MixerOnline(bool),
    /// A full state snapshot has been received
    Initialized,
    Error(String),
}

/// Transport to one Sisyfos instance
#[async_trait]
pub trait SisyfosApi: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;

    fn connected(&self) -> bool;

    /// Whether Sisyfos itself reaches the audio console
    fn mixer_online(&self) -> bool;

    /// Last full snapshot, `None` until the first [`SisyfosApiEvent::Initialized`]
    fn state(&self) -> Option<SisyfosApiState>;

    fn send(&self, command: &SisyfosCommand) -> anyhow::Result<()>;

    /// Ask for a fresh full snapshot; answered by [`SisyfosApiEvent::Initialized`]
    fn re_initialize(&self);

    /// Event stream; only the first caller gets it
    fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SisyfosApiEvent>>;
}
