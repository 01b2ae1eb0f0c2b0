//! ConductorActor - owns the timeline and runs the resolve loop
//!
//! All conductor state lives in this actor and is touched only from its run
//! loop, so a resolve pass never races a timeline or mapping update. Devices
//! plan their own commands; the actor only decides *when* to resolve and fans
//! the resolved state out.
//!
//! ```text
//!   commands ──┐
//!              ├──► select (biased) ──► handle / coalesce ──┐
//! device events┘          ▲                                  │ next_resolve_time
//!                         └──── sleep_until(target - lookahead) ◄┘
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::commands::ConductorCommand;
use super::{CallbackKind, ConductorEvent, TimelineCallback};
use crate::clock::{Clock, Time};
use crate::do_on_time::{sleep_until_opt, DoOnTime, ErrorSink, Executor, JobFuture, QueueEntry, SendMode};
use crate::drivers::{create_device, Device, DeviceContext, DeviceEvent, DeviceEventKind, DeviceEventSender, StateHistory};
use crate::timeline::{Mappings, StartTime, TimelineObject, TimelineResolver, TimelineState, TriggerTime};

/// Upper bound for the time a resolve pass is assumed to take
const MAX_RESOLVE_ESTIMATE_MS: i64 = 200;

/// Time a resolve pass over `objects` timeline objects is assumed to take
pub(crate) fn estimate_resolve_time(objects: usize) -> Time {
    ((objects / 2) as i64).clamp(1, MAX_RESOLVE_ESTIMATE_MS)
}

/// Callback-carrying object active in a resolved state
#[derive(Debug, Clone, PartialEq)]
struct ActiveCallback {
    start: Time,
    callback: Option<String>,
    callback_stopped: Option<String>,
    data: Option<serde_json::Value>,
}

type CallbackState = BTreeMap<String, ActiveCallback>;

pub(super) struct ConductorActor {
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn TimelineResolver>,
    lookahead_ms: i64,
    resolve_retry_ms: i64,

    timeline: Vec<TimelineObject>,
    mappings: Mappings,

    devices: BTreeMap<String, Arc<dyn Device>>,
    /// Ids created but still initializing
    reserved: HashSet<String>,

    command_rx: mpsc::UnboundedReceiver<ConductorCommand>,
    device_event_tx: mpsc::UnboundedSender<DeviceEvent>,
    device_event_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    events: mpsc::UnboundedSender<ConductorEvent>,

    /// Target of the next resolve; `None` while idle
    next_resolve_time: Option<Time>,
    /// Set after a failed resolve: no retry before this instant
    retry_not_before: Option<Time>,

    callback_queue: DoOnTime<TimelineCallback>,
    callback_history: StateHistory<CallbackState>,
}

impl ConductorActor {
    pub(super) fn new(
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn TimelineResolver>,
        lookahead_ms: i64,
        resolve_retry_ms: i64,
        command_rx: mpsc::UnboundedReceiver<ConductorCommand>,
        events: mpsc::UnboundedSender<ConductorEvent>,
    ) -> Self {
        let (device_event_tx, device_event_rx) = mpsc::unbounded_channel();

        let executor: Executor<TimelineCallback> = {
            let events = events.clone();
            Arc::new(move |_time: Time, callback: TimelineCallback| -> JobFuture {
                let sent = events.send(ConductorEvent::TimelineCallback(callback));
                Box::pin(async move {
                    sent.map_err(|_| anyhow::anyhow!("conductor event receiver dropped"))
                })
            })
        };
        let on_error: ErrorSink<TimelineCallback> =
            Arc::new(|entry: &QueueEntry<TimelineCallback>, e: anyhow::Error| {
                warn!(object = %entry.payload.object_id, "Timeline callback not delivered: {}", e);
            });

        Self {
            callback_queue: DoOnTime::new(
                "conductor:callbacks",
                Arc::clone(&clock),
                SendMode::InOrder,
                executor,
                on_error,
            ),
            clock,
            resolver,
            lookahead_ms,
            resolve_retry_ms,
            timeline: Vec::new(),
            mappings: Mappings::new(),
            devices: BTreeMap::new(),
            reserved: HashSet::new(),
            command_rx,
            device_event_tx,
            device_event_rx,
            events,
            next_resolve_time: None,
            retry_not_before: None,
            callback_history: StateHistory::new(),
        }
    }

    /// Main loop. Runs until the handle side shuts it down or every handle is dropped.
    pub(super) async fn run(mut self) {
        info!(lookahead_ms = self.lookahead_ms, "Conductor resolve loop started");

        let mut running = true;
        while running {
            let wake_at = self.wake_time();
            let clock = Arc::clone(&self.clock);

            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    running = self.handle_command(cmd);
                    // Everything already queued is applied before the next
                    // resolve, so bursts of updates cost one pass
                    while running {
                        match self.command_rx.try_recv() {
                            Ok(cmd) => running = self.handle_command(cmd),
                            Err(_) => break,
                        }
                    }
                }

                Some(event) = self.device_event_rx.recv() => {
                    self.handle_device_event(event);
                    while let Ok(event) = self.device_event_rx.try_recv() {
                        self.handle_device_event(event);
                    }
                }

                _ = sleep_until_opt(clock.as_ref(), wake_at) => {
                    self.resolve_timeline();
                }
            }
        }

        self.callback_queue.dispose();
        info!("Conductor resolve loop stopped");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Apply one command. Returns `false` when the loop must stop.
    fn handle_command(&mut self, cmd: ConductorCommand) -> bool {
        trace!(?cmd, "Conductor command");

        match cmd {
            ConductorCommand::SetTimeline(timeline) => {
                debug!(objects = timeline.len(), "Timeline replaced");
                self.timeline = timeline;
                self.reset_resolver();
            }
            ConductorCommand::SetMapping(mappings) => {
                debug!(layers = mappings.len(), "Mapping replaced");
                self.mappings = mappings;
                self.reset_resolver();
            }
            ConductorCommand::ResetResolver => self.reset_resolver(),

            ConductorCommand::GetTimeline { response } => {
                let _ = response.send(self.timeline.clone());
            }
            ConductorCommand::GetMapping { response } => {
                let _ = response.send(self.mappings.clone());
            }
            ConductorCommand::GetDevices { response } => {
                let _ = response.send(self.devices.values().cloned().collect());
            }
            ConductorCommand::GetDevice { device_id, response } => {
                let _ = response.send(self.devices.get(&device_id).cloned());
            }

            ConductorCommand::CreateDevice {
                device_id,
                options,
                response,
            } => {
                let result = if self.devices.contains_key(&device_id) || self.reserved.contains(&device_id) {
                    Err(crate::error::ConductorError::DeviceExists(device_id))
                } else {
                    let ctx = DeviceContext {
                        clock: Arc::clone(&self.clock),
                        events: DeviceEventSender::new(device_id.clone(), self.device_event_tx.clone()),
                    };
                    debug!(device = %device_id, kind = %options.device_type(), "Creating device");
                    let device = create_device(&device_id, options, ctx);
                    self.reserved.insert(device_id);
                    Ok(device)
                };
                let _ = response.send(result);
            }
            ConductorCommand::RegisterDevice {
                device_id,
                device,
                response,
            } => {
                self.reserved.remove(&device_id);
                info!(device = %device_id, name = %device.device_name(), "Device added");
                self.devices.insert(device_id, device);
                self.reset_resolver();
                let _ = response.send(());
            }
            ConductorCommand::ReleaseDevice { device_id } => {
                self.reserved.remove(&device_id);
            }
            ConductorCommand::RemoveDevice { device_id, response } => {
                let removed = self.devices.remove(&device_id);
                if removed.is_some() {
                    info!(device = %device_id, "Device removed");
                }
                let _ = response.send(removed);
            }

            ConductorCommand::Shutdown { response } => {
                let devices = std::mem::take(&mut self.devices).into_values().collect();
                let _ = response.send(devices);
                return false;
            }
        }
        true
    }

    /// When the loop has to run the next resolve pass
    fn wake_time(&self) -> Option<Time> {
        let target = self.next_resolve_time?;
        let wake = target - self.lookahead_ms;
        Some(match self.retry_not_before {
            Some(retry) => wake.max(retry),
            None => wake,
        })
    }

    /// Resolve for "now" at the next opportunity, keeping an earlier target
    fn reset_resolver(&mut self) {
        self.retry_not_before = None;
        let now = self.clock.now();
        self.next_resolve_time = Some(match self.next_resolve_time {
            Some(target) => target.min(now),
            None => now,
        });
    }

    fn emit(&self, event: ConductorEvent) {
        let _ = self.events.send(event);
    }

    fn handle_device_event(&mut self, event: DeviceEvent) {
        let DeviceEvent { device_id, kind } = event;
        if !self.devices.contains_key(&device_id) && !self.reserved.contains(&device_id) {
            debug!(device = %device_id, ?kind, "Ignoring event from detached device");
            return;
        }

        match kind {
            DeviceEventKind::ResetResolver => {
                debug!(device = %device_id, "Device requested a fresh resolve");
                self.reset_resolver();
            }
            DeviceEventKind::ConnectionChanged(status) => {
                info!(device = %device_id, status = ?status.status_code, "Device connection changed");
                self.emit(ConductorEvent::ConnectionChanged { device_id, status });
            }
            DeviceEventKind::Error(message) => {
                self.emit(ConductorEvent::Error {
                    device_id: Some(device_id),
                    message,
                });
            }
            DeviceEventKind::Warning(message) => {
                self.emit(ConductorEvent::Warning {
                    device_id: Some(device_id),
                    message,
                });
            }
            DeviceEventKind::Debug(command) => {
                self.emit(ConductorEvent::Debug { device_id, command });
            }
        }
    }

    // =========================================================================
    // Resolve
    // =========================================================================

    fn resolve_timeline(&mut self) {
        let Some(target) = self.next_resolve_time.take() else {
            return;
        };

        let now = self.clock.now();
        let resolve_time = target.max(now + estimate_resolve_time(self.timeline.len()));

        // Unpinned "now" starts resolve as `resolve_time`
        let state = match self.resolver.resolve_state(&self.timeline, resolve_time) {
            Ok(state) => state,
            Err(e) => {
                let retry_at = now + self.resolve_retry_ms;
                error!(resolve_time, retry_at, "Failed to resolve timeline: {}", e);
                self.emit(ConductorEvent::Error {
                    device_id: None,
                    message: format!("Failed to resolve timeline: {}", e),
                });
                self.next_resolve_time = Some(target);
                self.retry_not_before = Some(retry_at);
                return;
            }
        };

        self.retry_not_before = None;

        let fixed = self.fix_now_objects(resolve_time);
        if !fixed.is_empty() {
            debug!(count = fixed.len(), resolve_time, "Fixed \"now\" start times");
            self.emit(ConductorEvent::SetTimelineTriggerTime(fixed));
        }

        for (device_id, device) in &self.devices {
            device.prepare_for_handle_state(resolve_time);
            let slice = state.filter_for_device(&self.mappings, device_id);
            device.handle_state(&slice, &self.mappings);
        }

        self.queue_callbacks(&state, now);

        let next_resolve_time = state.next_change_after(resolve_time);
        self.next_resolve_time = next_resolve_time;

        debug!(
            resolve_time,
            ?next_resolve_time,
            layers = state.layers.len(),
            devices = self.devices.len(),
            "Timeline resolved"
        );
        self.emit(ConductorEvent::Resolved {
            resolve_time,
            next_resolve_time,
        });
    }

    /// Pin `"now"` starts to `time` so later passes see the same timeline
    fn fix_now_objects(&mut self, time: Time) -> Vec<TriggerTime> {
        let mut fixed = Vec::new();
        for object in self.timeline.iter_mut().filter(|o| o.enable.start.is_now()) {
            object.enable.start = StartTime::At(time);
            fixed.push(TriggerTime {
                id: object.id.clone(),
                time,
            });
        }
        fixed
    }

    /// Queue start/stop callbacks for objects entering or leaving the state
    fn queue_callbacks(&mut self, state: &TimelineState, now: Time) {
        let active: CallbackState = state
            .layers
            .values()
            .filter(|o| o.callback.is_some() || o.callback_stopped.is_some())
            .map(|o| {
                (
                    o.id.clone(),
                    ActiveCallback {
                        start: o.instance.start,
                        callback: o.callback.clone(),
                        callback_stopped: o.callback_stopped.clone(),
                        data: o.callback_data.clone(),
                    },
                )
            })
            .collect();

        self.callback_queue.clear_queue_now_and_after(state.time);
        self.callback_history.remove_from(state.time);
        self.callback_history.prune_before(now);

        let previous = self
            .callback_history
            .get_state_before(state.time)
            .map(|(_, s)| s.clone())
            .unwrap_or_default();

        for (id, old) in &previous {
            let still_running = active.get(id).is_some_and(|cb| cb.start == old.start);
            if let (false, Some(callback)) = (still_running, &old.callback_stopped) {
                self.queue_callback(state.time, id, callback, &old.data, CallbackKind::Stopped);
            }
        }
        for (id, cb) in &active {
            let already_running = previous.get(id).is_some_and(|old| old.start == cb.start);
            if let (false, Some(callback)) = (already_running, &cb.callback) {
                self.queue_callback(state.time, id, callback, &cb.data, CallbackKind::Started);
            }
        }

        self.callback_history.set_state(active, state.time);
    }

    fn queue_callback(
        &self,
        time: Time,
        object_id: &str,
        callback: &str,
        data: &Option<serde_json::Value>,
        kind: CallbackKind,
    ) {
        trace!(object = %object_id, callback, ?kind, time, "Queueing timeline callback");
        self.callback_queue.queue(
            time,
            None,
            TimelineCallback {
                time,
                object_id: object_id.to_string(),
                callback: callback.to_string(),
                data: data.clone(),
                kind,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_resolve_time_bounds() {
        assert_eq!(estimate_resolve_time(0), 1);
        assert_eq!(estimate_resolve_time(3), 1);
        assert_eq!(estimate_resolve_time(100), 50);
        assert_eq!(estimate_resolve_time(10_000), MAX_RESOLVE_ESTIMATE_MS);
    }
}
