//! Sisyfos audio-mixer driver
//!
//! Converts resolved timeline states into [`SisyfosState`]s, diffs them
//! against the state recorded for the preceding instant and schedules the
//! resulting commands on a burst-mode [`DoOnTime`] queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::api::{SisyfosApi, SisyfosApiEvent};
use super::diff::{
    carry_forward_labels, convert_state_to_sisyfos_state, device_state_from_api, diff_states, unreadable_contents,
};
use super::simulator::SimulatedSisyfos;
use super::types::{CommandReceiver, QueuedCommand, SisyfosCommand, SisyfosOptions, SisyfosState};
use crate::clock::{Clock, Time};
use crate::do_on_time::{DoOnTime, ErrorSink, Executor, JobFuture, QueueEntry, SendMode};
use crate::drivers::{
    CommandWithContext, Device, DeviceContext, DeviceEventKind, DeviceEventSender, DeviceStatus, DeviceType,
    StateHistory, StatusCode,
};
use crate::error::DeviceError;
use crate::timeline::{Mappings, TimelineState};

/// How long a resync may stay unconfirmed before the flag is dropped
pub const RESYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// What the next `Initialized` from the mixer answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingInit {
    None,
    /// First connection: adopt the live state
    Initial,
    /// Re-diff the planned state against the live one
    Resync,
}

#[derive(Default)]
struct ResyncState {
    generation: u64,
    timeout: Option<CancellationToken>,
}

struct Inner {
    device_id: String,
    host: String,
    port: u16,
    clock: Arc<dyn Clock>,
    events: DeviceEventSender,
    api: Arc<dyn SisyfosApi>,
    command_receiver: Option<CommandReceiver>,
    history: Mutex<StateHistory<SisyfosState>>,
    queue: DoOnTime<QueuedCommand>,
    resync: Mutex<ResyncState>,
    pending_init: Mutex<PendingInit>,
    listener: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

/// Driver for one Sisyfos instance
pub struct SisyfosDevice {
    inner: Arc<Inner>,
}

impl SisyfosDevice {
    /// Build the driver. Must be called inside a Tokio runtime.
    pub fn new(device_id: &str, options: SisyfosOptions, ctx: DeviceContext) -> Self {
        let api: Arc<dyn SisyfosApi> = match options.api {
            Some(api) => api,
            None => Arc::new(SimulatedSisyfos::new(options.channels)),
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let executor: Executor<QueuedCommand> = {
                let weak = weak.clone();
                Arc::new(move |time: Time, queued: QueuedCommand| -> JobFuture {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(inner) => inner.send_command(time, queued).await,
                            None => Ok(()),
                        }
                    })
                })
            };

            let on_error: ErrorSink<QueuedCommand> = {
                let events = ctx.events.clone();
                Arc::new(move |entry: &QueueEntry<QueuedCommand>, e: anyhow::Error| {
                    error!("Sisyfos command failed ({}): {:#}", entry.payload.context, e);
                    events.error(format!(
                        "Failed to send command \"{}\": {:#}",
                        entry.payload.context, e
                    ));
                })
            };

            Inner {
                device_id: device_id.to_string(),
                host: options.host.clone(),
                port: options.port,
                clock: Arc::clone(&ctx.clock),
                events: ctx.events.clone(),
                api: Arc::clone(&api),
                command_receiver: options.command_receiver.clone(),
                history: Mutex::new(StateHistory::new()),
                queue: DoOnTime::new(
                    format!("sisyfos:{}", device_id),
                    Arc::clone(&ctx.clock),
                    SendMode::Burst,
                    executor,
                    on_error,
                ),
                resync: Mutex::new(ResyncState::default()),
                pending_init: Mutex::new(PendingInit::None),
                listener: Mutex::new(None),
                terminated: AtomicBool::new(false),
            }
        });

        if let Some(rx) = inner.api.take_event_receiver() {
            let handle = tokio::spawn(Inner::listen(Arc::downgrade(&inner), rx));
            *inner.listener.lock() = Some(handle);
        } else {
            warn!(device = %device_id, "Sisyfos API events already taken, status changes will not be reported");
        }

        Self { inner }
    }

    /// A destructive resync is waiting for confirmation
    pub fn is_resyncing(&self) -> bool {
        self.inner.is_resyncing()
    }

    /// Abstract state recorded as authoritative at `time`
    pub fn state_at(&self, time: Time) -> Option<SisyfosState> {
        self.inner.history.lock().get_state(time).map(|(_, s)| s.clone())
    }

    pub fn queue(&self) -> Vec<QueueEntry<QueuedCommand>> {
        self.inner.queue.get_queue()
    }
}

impl Inner {
    async fn listen(
        weak: Weak<Inner>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<SisyfosApiEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            debug!(device = %inner.device_id, ?event, "Sisyfos API event");
            match event {
                SisyfosApiEvent::Connected | SisyfosApiEvent::Disconnected | SisyfosApiEvent::MixerOnline(_) => {
                    inner.connection_changed();
                }
                SisyfosApiEvent::Initialized => inner.on_initialized(),
                SisyfosApiEvent::Error(e) => {
                    error!(device = %inner.device_id, "Sisyfos error: {}", e);
                    inner.events.error(format!("Sisyfos: {}", e));
                }
            }
        }
    }

    fn connection_changed(&self) {
        self.events.emit(DeviceEventKind::ConnectionChanged(self.status()));
    }

    fn status(&self) -> DeviceStatus {
        let mut status = DeviceStatus::good();
        if !self.api.connected() {
            status.degrade(StatusCode::Bad, "Not connected");
        }
        if self.api.state().is_none() && !self.is_resyncing() {
            status.degrade(
                StatusCode::Bad,
                "Sisyfos device connection not initialized (restart required)",
            );
        }
        if !self.api.mixer_online() {
            status.degrade(StatusCode::Bad, "Sisyfos has no connection to Audiomixer");
        }
        status
    }

    fn live_state(&self) -> SisyfosState {
        device_state_from_api(self.api.state().as_ref(), false)
    }

    fn on_initialized(self: &Arc<Self>) {
        let pending = std::mem::replace(&mut *self.pending_init.lock(), PendingInit::None);
        let now = self.clock.now();

        match pending {
            PendingInit::Initial => {
                info!(device = %self.device_id, "✅ Sisyfos state received");
                self.history.lock().set_state(self.live_state(), now);
                self.events.emit(DeviceEventKind::ResetResolver);
            }
            PendingInit::Resync => {
                self.end_resync();
                self.replan_after_resync(now);
            }
            PendingInit::None => {
                debug!(device = %self.device_id, "Unsolicited Sisyfos snapshot");
            }
        }

        self.connection_changed();
    }

    /// Bring the mixer back to the planned state and re-queue planned transitions
    fn replan_after_resync(&self, now: Time) {
        let mut live = self.live_state();
        let mut history = self.history.lock();

        let Some((_, target)) = history.get_state(now).map(|(t, s)| (t, s.clone())) else {
            info!(device = %self.device_id, "Resync finished without a planned state, adopting live state");
            history.set_state(live, now);
            drop(history);
            self.events.emit(DeviceEventKind::ResetResolver);
            return;
        };

        // The resync request itself is already satisfied
        live.resync = target.resync;

        self.queue.clear_queue_now_and_after(now);
        let corrections = diff_states(&live, &target);
        info!(
            device = %self.device_id,
            corrections = corrections.len(),
            "🔄 Sisyfos resynced"
        );
        self.add_to_queue(corrections, now);

        let mut previous = target;
        let future: Vec<(Time, SisyfosState)> =
            history.states_after(now).map(|(t, s)| (t, s.clone())).collect();
        for (time, state) in future {
            self.add_to_queue(diff_states(&previous, &state), time);
            previous = state;
        }
    }

    fn add_to_queue(&self, commands: Vec<QueuedCommand>, time: Time) {
        for command in commands {
            self.queue.queue(time, None, command);
        }
    }

    async fn send_command(self: Arc<Self>, time: Time, queued: QueuedCommand) -> anyhow::Result<()> {
        let QueuedCommand {
            command,
            context,
            timeline_obj_id,
        } = queued;

        if let Some(receiver) = &self.command_receiver {
            return receiver(time, command, context, timeline_obj_id).await;
        }

        self.events.emit(DeviceEventKind::Debug(CommandWithContext {
            context,
            timeline_obj_id,
            command: serde_json::to_value(&command)?,
        }));

        match command {
            SisyfosCommand::Resync => {
                self.make_ready_inner();
                Ok(())
            }
            other => self.api.send(&other),
        }
    }

    /// Destructive reinitialization; completes in [`Inner::on_initialized`]
    fn make_ready_inner(self: &Arc<Self>) {
        self.begin_resync();
        *self.pending_init.lock() = PendingInit::Resync;
        self.queue.clear_queue_now_and_after(self.clock.now());
        self.api.re_initialize();
    }

    fn is_resyncing(&self) -> bool {
        self.resync.lock().timeout.is_some()
    }

    fn begin_resync(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let generation = {
            let mut resync = self.resync.lock();
            if let Some(previous) = resync.timeout.replace(token.clone()) {
                previous.cancel();
            }
            resync.generation += 1;
            resync.generation
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(RESYNC_TIMEOUT) => {
                    let Some(inner) = weak.upgrade() else { return };
                    let expired = {
                        let mut resync = inner.resync.lock();
                        if resync.generation == generation && resync.timeout.is_some() {
                            resync.timeout = None;
                            true
                        } else {
                            false
                        }
                    };
                    if expired {
                        warn!(device = %inner.device_id, "Sisyfos resync not confirmed within {:?}", RESYNC_TIMEOUT);
                        inner.events.warning(format!(
                            "Sisyfos resync not confirmed within {}s",
                            RESYNC_TIMEOUT.as_secs()
                        ));
                        inner.connection_changed();
                    }
                }
            }
        });
    }

    fn end_resync(&self) {
        if let Some(token) = self.resync.lock().timeout.take() {
            token.cancel();
        }
    }
}

#[async_trait]
impl Device for SisyfosDevice {
    fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Sisyfos
    }

    fn device_name(&self) -> String {
        format!("Sisyfos {}", self.inner.device_id)
    }

    async fn init(&self) -> Result<bool, DeviceError> {
        info!("🔌 Sisyfos '{}' connecting to {}:{}", self.inner.device_id, self.inner.host, self.inner.port);
        *self.inner.pending_init.lock() = PendingInit::Initial;
        self.inner.api.connect(&self.inner.host, self.inner.port).await?;
        Ok(true)
    }

    fn prepare_for_handle_state(&self, new_state_time: Time) {
        self.inner.queue.clear_queue_now_and_after(new_state_time);
        let mut history = self.inner.history.lock();
        history.remove_from(new_state_time);
        history.prune_before(self.inner.clock.now());
    }

    fn handle_state(&self, state: &TimelineState, mappings: &Mappings) {
        let inner = &self.inner;
        let Some(api_state) = inner.api.state() else {
            inner.events.warning("Sisyfos State not initialized yet");
            return;
        };

        for message in unreadable_contents(state) {
            warn!(device = %inner.device_id, "{}", message);
            inner.events.warning(message);
        }

        let previous_state_time = inner.clock.now().max(state.time);
        let mut history = inner.history.lock();
        let old_state = history
            .get_state_before(previous_state_time)
            .map(|(_, s)| s.clone())
            .unwrap_or_default();

        let mut new_state = convert_state_to_sisyfos_state(
            state,
            mappings,
            &inner.device_id,
            device_state_from_api(Some(&api_state), true),
        );
        carry_forward_labels(&old_state, &mut new_state);

        let commands = diff_states(&old_state, &new_state);
        debug!(
            device = %inner.device_id,
            time = state.time,
            commands = commands.len(),
            "Sisyfos state handled"
        );

        inner.queue.clear_queue_now_and_after(previous_state_time);
        inner.add_to_queue(commands, state.time);
        history.set_state(new_state, state.time);
    }

    fn clear_future(&self, clear_after_time: Time) {
        self.inner.queue.clear_queue_after(clear_after_time);
    }

    async fn make_ready(&self, ok_to_destroy_stuff: bool) -> Result<(), DeviceError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(DeviceError::Terminated);
        }
        if ok_to_destroy_stuff {
            info!("🔄 Sisyfos '{}' resyncing", self.inner.device_id);
            self.inner.make_ready_inner();
        }
        Ok(())
    }

    async fn terminate(&self) -> Result<bool, DeviceError> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        self.inner.queue.dispose();
        self.inner.end_resync();
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        if let Err(e) = self.inner.api.disconnect().await {
            warn!(device = %self.inner.device_id, "Sisyfos disconnect failed: {:#}", e);
        }
        info!("Sisyfos '{}' terminated", self.inner.device_id);
        Ok(true)
    }

    fn get_status(&self) -> DeviceStatus {
        self.inner.status()
    }

    fn connected(&self) -> bool {
        self.inner.api.connected()
    }

    fn queue_len(&self) -> usize {
        self.inner.queue.get_queue().len()
    }
}
