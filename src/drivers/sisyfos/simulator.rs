//! In-process Sisyfos mixer
//!
//! Stands in for a real mixer: applies commands to its own channel state and
//! logs them. Used as the default transport and as the test double; the test
//! hooks (`set_connected`, `set_mixer_online`, ...) push the same events a
//! real connection would.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::api::{SisyfosApi, SisyfosApiEvent};
use super::types::{SisyfosApiChannel, SisyfosApiState, SisyfosCommand};

struct SimState {
    connected: bool,
    mixer_online: bool,
    /// Answer connect/re-initialize with a snapshot right away
    auto_initialize: bool,
    state: Option<SisyfosApiState>,
    sent: Vec<SisyfosCommand>,
}

pub struct SimulatedSisyfos {
    channels: u32,
    inner: Mutex<SimState>,
    events_tx: mpsc::UnboundedSender<SisyfosApiEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SisyfosApiEvent>>>,
}

impl SimulatedSisyfos {
    pub fn new(channels: u32) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            channels,
            inner: Mutex::new(SimState {
                connected: false,
                mixer_online: true,
                auto_initialize: true,
                state: None,
                sent: Vec::new(),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn emit(&self, event: SisyfosApiEvent) {
        let _ = self.events_tx.send(event);
    }

    fn initial_state(&self) -> SisyfosApiState {
        SisyfosApiState {
            channels: (1..=self.channels)
                .map(|i| (i, SisyfosApiChannel::default()))
                .collect(),
        }
    }

    /// Drop or restore the connection
    pub fn set_connected(&self, connected: bool) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.connected != connected;
            inner.connected = connected;
            changed
        };
        if changed {
            self.emit(if connected {
                SisyfosApiEvent::Connected
            } else {
                SisyfosApiEvent::Disconnected
            });
        }
    }

    pub fn set_mixer_online(&self, online: bool) {
        self.inner.lock().mixer_online = online;
        self.emit(SisyfosApiEvent::MixerOnline(online));
    }

    /// With `false`, snapshots only arrive through [`SimulatedSisyfos::confirm_initialized`]
    pub fn set_auto_initialize(&self, auto: bool) {
        self.inner.lock().auto_initialize = auto;
    }

    /// Deliver a full snapshot now
    pub fn confirm_initialized(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_none() {
                inner.state = Some(self.initial_state());
            }
        }
        self.emit(SisyfosApiEvent::Initialized);
    }

    /// Change a channel behind the driver's back (operator at the console)
    pub fn set_channel(&self, index: u32, channel: SisyfosApiChannel) {
        let mut inner = self.inner.lock();
        let state = inner.state.get_or_insert_with(SisyfosApiState::default);
        state.channels.insert(index, channel);
    }

    pub fn channel(&self, index: u32) -> Option<SisyfosApiChannel> {
        self.inner
            .lock()
            .state
            .as_ref()
            .and_then(|s| s.channels.get(&index).cloned())
    }

    pub fn sent_commands(&self) -> Vec<SisyfosCommand> {
        self.inner.lock().sent.clone()
    }
}

#[async_trait]
impl SisyfosApi for SimulatedSisyfos {
    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        info!("🎚️  Simulated Sisyfos at {}:{} ({} channels)", host, port, self.channels);
        self.set_connected(true);
        if self.inner.lock().auto_initialize {
            self.confirm_initialized();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn mixer_online(&self) -> bool {
        self.inner.lock().mixer_online
    }

    fn state(&self) -> Option<SisyfosApiState> {
        self.inner.lock().state.clone()
    }

    fn send(&self, command: &SisyfosCommand) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            bail!("Sisyfos not connected");
        }
        debug!(?command, "Simulated Sisyfos command");

        let state = inner.state.get_or_insert_with(SisyfosApiState::default);
        let mut touch = |channel: u32, apply: &dyn Fn(&mut SisyfosApiChannel)| {
            apply(state.channels.entry(channel).or_default());
        };
        match command {
            SisyfosCommand::Resync => {}
            SisyfosCommand::TogglePgm { channel, value } => touch(*channel, &|c| c.pgm_on = *value),
            SisyfosCommand::TogglePst { channel, value } => touch(*channel, &|c| c.pst_on = *value),
            SisyfosCommand::SetFader { channel, value } => touch(*channel, &|c| c.fader_level = *value),
            SisyfosCommand::Label { channel, value } => touch(*channel, &|c| c.label = value.clone()),
            SisyfosCommand::Visible { channel, value } => touch(*channel, &|c| c.visible = *value),
        }

        inner.sent.push(command.clone());
        Ok(())
    }

    fn re_initialize(&self) {
        let (connected, auto) = {
            let inner = self.inner.lock();
            (inner.connected, inner.auto_initialize)
        };
        if connected && auto {
            self.confirm_initialized();
        }
    }

    fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SisyfosApiEvent>> {
        self.events_rx.lock().take()
    }
}
