//! Timed command queue ("do on time")
//!
//! Holds payloads keyed by fire time and hands each one to an executor when
//! the logical clock reaches it. One queue per device; the conductor keeps
//! one more for timeline callbacks.
//!
//! # Delivery modes
//!
//! - [`SendMode::Burst`]: every due entry is spawned as its own task. No
//!   ordering between entries due at the same check.
//! - [`SendMode::InOrder`]: due entries run one after the other in ascending
//!   fire time, each awaited before the next starts.
//!
//! A failing entry is reported through the error sink and never stops the
//! queue.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, Time};

/// Future returned by an executor for one entry
pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Runs one payload at its fire time
pub type Executor<T> = Arc<dyn Fn(Time, T) -> JobFuture + Send + Sync>;

/// Receives entries whose executor failed
pub type ErrorSink<T> = Arc<dyn Fn(&QueueEntry<T>, anyhow::Error) + Send + Sync>;

/// Delivery semantics of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Burst,
    InOrder,
}

/// A pending entry
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry<T> {
    pub id: u64,
    pub time: Time,
    pub group: Option<String>,
    pub payload: T,
}

struct Inner<T> {
    name: String,
    clock: Arc<dyn Clock>,
    mode: SendMode,
    /// Keyed by (fire time, insertion id) so equal times keep insertion order
    queue: Mutex<BTreeMap<(Time, u64), QueueEntry<T>>>,
    next_id: AtomicU64,
    executor: Executor<T>,
    on_error: ErrorSink<T>,
    changed: Notify,
    cancel: CancellationToken,
    /// Serializes in-order delivery across overlapping checks
    send_lock: tokio::sync::Mutex<()>,
}

/// Per-device timed queue with its own timer task
pub struct DoOnTime<T> {
    inner: Arc<Inner<T>>,
}

impl<T> DoOnTime<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create the queue and start its timer on the current Tokio runtime
    pub fn new(
        name: impl Into<String>,
        clock: Arc<dyn Clock>,
        mode: SendMode,
        executor: Executor<T>,
        on_error: ErrorSink<T>,
    ) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            clock,
            mode,
            queue: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            executor,
            on_error,
            changed: Notify::new(),
            cancel: CancellationToken::new(),
            send_lock: tokio::sync::Mutex::new(()),
        });

        tokio::spawn(Self::run_timer(Arc::clone(&inner)));

        Self { inner }
    }

    /// Schedule `payload` at `time`.
    ///
    /// An entry already pending under the same `group` is replaced
    /// (last writer wins for that slot). Returns the new entry id, or `None`
    /// once the queue has been disposed.
    pub fn queue(&self, time: Time, group: Option<String>, payload: T) -> Option<u64> {
        if self.inner.cancel.is_cancelled() {
            warn!(queue = %self.inner.name, "Ignoring entry queued after dispose");
            return None;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = self.inner.queue.lock();
            if let Some(group) = &group {
                queue.retain(|_, entry| entry.group.as_ref() != Some(group));
            }
            queue.insert(
                (time, id),
                QueueEntry {
                    id,
                    time,
                    group,
                    payload,
                },
            );
        }
        trace!(queue = %self.inner.name, id, time, "Queued entry");

        self.inner.changed.notify_one();
        Some(id)
    }

    /// Drop every entry firing strictly after `time`
    pub fn clear_queue_after(&self, time: Time) -> usize {
        self.retain(|entry_time| entry_time <= time)
    }

    /// Drop every entry firing at or after `time`
    pub fn clear_queue_now_and_after(&self, time: Time) -> usize {
        self.retain(|entry_time| entry_time < time)
    }

    fn retain(&self, keep: impl Fn(Time) -> bool) -> usize {
        let removed = {
            let mut queue = self.inner.queue.lock();
            let before = queue.len();
            queue.retain(|(time, _), _| keep(*time));
            before - queue.len()
        };
        if removed > 0 {
            trace!(queue = %self.inner.name, removed, "Cleared queued entries");
            self.inner.changed.notify_one();
        }
        removed
    }

    /// Snapshot of pending entries in fire order
    pub fn get_queue(&self) -> Vec<QueueEntry<T>> {
        self.inner.queue.lock().values().cloned().collect()
    }

    /// Fire everything that is due now
    pub async fn check_queue(&self) {
        Self::fire_due(&self.inner).await;
    }

    /// Cancel all pending entries and stop the timer. Safe to call twice.
    pub fn dispose(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        let dropped = {
            let mut queue = self.inner.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        debug!(queue = %self.inner.name, dropped, "Timed queue disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    async fn run_timer(inner: Arc<Inner<T>>) {
        debug!(queue = %inner.name, mode = ?inner.mode, "Timed queue started");

        loop {
            let next = inner.queue.lock().keys().next().map(|(time, _)| *time);

            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.changed.notified() => {}
                _ = sleep_until_opt(inner.clock.as_ref(), next) => {
                    Self::fire_due(&inner).await;
                }
            }
        }

        debug!(queue = %inner.name, "Timed queue stopped");
    }

    async fn fire_due(inner: &Arc<Inner<T>>) {
        let now = inner.clock.now();
        let due: Vec<QueueEntry<T>> = {
            let mut queue = inner.queue.lock();
            let later = queue.split_off(&(now + 1, 0));
            let due = std::mem::replace(&mut *queue, later);
            due.into_values().collect()
        };
        if due.is_empty() {
            return;
        }

        trace!(queue = %inner.name, count = due.len(), now, "Firing due entries");

        match inner.mode {
            SendMode::Burst => {
                for entry in due {
                    let job = (inner.executor)(entry.time, entry.payload.clone());
                    let on_error = Arc::clone(&inner.on_error);
                    tokio::spawn(async move {
                        if let Err(e) = job.await {
                            on_error(&entry, e);
                        }
                    });
                }
            }
            SendMode::InOrder => {
                let _guard = inner.send_lock.lock().await;
                for entry in due {
                    if inner.cancel.is_cancelled() {
                        break;
                    }
                    let job = (inner.executor)(entry.time, entry.payload.clone());
                    if let Err(e) = job.await {
                        (inner.on_error)(&entry, e);
                    }
                }
            }
        }
    }
}

impl<T> Drop for DoOnTime<T> {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// Sleep until `time` on `clock`, or forever when there is nothing to wait for
pub(crate) async fn sleep_until_opt(clock: &dyn Clock, time: Option<Time>) {
    match time {
        Some(time) => clock.sleep_until(time).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Fired = mpsc::UnboundedReceiver<(Time, &'static str)>;

    fn make_queue(clock: Arc<ManualClock>, mode: SendMode) -> (DoOnTime<&'static str>, Fired, Arc<Mutex<Vec<String>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let executor: Executor<&'static str> = Arc::new(move |time: Time, payload: &'static str| -> JobFuture {
            let tx = tx.clone();
            Box::pin(async move {
                if payload.starts_with("fail") {
                    anyhow::bail!("transport rejected {}", payload);
                }
                if payload.starts_with("slow") {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
                let _ = tx.send((time, payload));
                Ok(())
            })
        });
        let sink = Arc::clone(&errors);
        let on_error: ErrorSink<&'static str> = Arc::new(move |entry, e| {
            sink.lock().push(format!("{}: {}", entry.payload, e));
        });
        let queue = DoOnTime::new("test", clock, mode, executor, on_error);
        (queue, rx, errors)
    }

    async fn recv(rx: &mut Fired) -> (Time, &'static str) {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("entry should fire")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_fires_when_clock_reaches_time() {
        let clock = Arc::new(ManualClock::new(0));
        let (queue, mut rx, _) = make_queue(Arc::clone(&clock), SendMode::Burst);

        queue.queue(1000, None, "a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.get_queue().len(), 1);

        clock.set(1000);
        assert_eq!(recv(&mut rx).await, (1000, "a"));
        assert!(queue.get_queue().is_empty());
    }

    #[tokio::test]
    async fn test_clear_queue_now_and_after() {
        let clock = Arc::new(ManualClock::new(0));
        let (queue, _rx, _) = make_queue(clock, SendMode::Burst);

        queue.queue(500, None, "before");
        queue.queue(1000, None, "at");
        queue.queue(1500, None, "after");

        assert_eq!(queue.clear_queue_now_and_after(1000), 2);
        let remaining: Vec<_> = queue.get_queue().into_iter().map(|e| e.payload).collect();
        assert_eq!(remaining, vec!["before"]);
    }

    #[tokio::test]
    async fn test_clear_queue_after_keeps_boundary() {
        let clock = Arc::new(ManualClock::new(0));
        let (queue, _rx, _) = make_queue(clock, SendMode::Burst);

        queue.queue(1000, None, "at");
        queue.queue(1001, None, "after");

        assert_eq!(queue.clear_queue_after(1000), 1);
        let remaining: Vec<_> = queue.get_queue().into_iter().map(|e| e.time).collect();
        assert_eq!(remaining, vec![1000]);
    }

    #[tokio::test]
    async fn test_group_replaces_pending_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let (queue, _rx, _) = make_queue(clock, SendMode::Burst);

        queue.queue(1000, Some("fader1".into()), "first");
        queue.queue(1200, Some("fader1".into()), "second");
        queue.queue(1100, Some("fader2".into()), "other");

        let pending: Vec<_> = queue.get_queue().into_iter().map(|e| (e.time, e.payload)).collect();
        assert_eq!(pending, vec![(1100, "other"), (1200, "second")]);
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let clock = Arc::new(ManualClock::new(0));
        let (queue, mut rx, _) = make_queue(Arc::clone(&clock), SendMode::InOrder);

        queue.queue(300, None, "c");
        queue.queue(100, None, "slow-a");
        queue.queue(200, None, "b");

        clock.set(1000);
        assert_eq!(recv(&mut rx).await.1, "slow-a");
        assert_eq!(recv(&mut rx).await.1, "b");
        assert_eq!(recv(&mut rx).await.1, "c");
    }

    #[tokio::test]
    async fn test_burst_entries_do_not_wait_for_each_other() {
        let clock = Arc::new(ManualClock::new(0));
        let (queue, mut rx, _) = make_queue(Arc::clone(&clock), SendMode::Burst);

        queue.queue(100, None, "slow-a");
        queue.queue(100, None, "fast-b");

        clock.set(100);
        assert_eq!(recv(&mut rx).await, (100, "fast-b"));
        assert_eq!(recv(&mut rx).await, (100, "slow-a"));
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_queue() {
        let clock = Arc::new(ManualClock::new(0));
        let (queue, mut rx, errors) = make_queue(Arc::clone(&clock), SendMode::InOrder);

        queue.queue(100, None, "fail-1");
        queue.queue(200, None, "ok");

        clock.set(200);
        assert_eq!(recv(&mut rx).await, (200, "ok"));
        let errors = errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("transport rejected fail-1"));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let clock = Arc::new(ManualClock::new(0));
        let (queue, mut rx, _) = make_queue(Arc::clone(&clock), SendMode::Burst);

        queue.queue(100, None, "a");
        queue.dispose();
        queue.dispose();

        assert!(queue.is_disposed());
        assert!(queue.get_queue().is_empty());
        assert_eq!(queue.queue(150, None, "late"), None);

        clock.set(200);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_check_queue_fires_due_entries() {
        let clock = Arc::new(ManualClock::new(500));
        let (queue, mut rx, _) = make_queue(clock, SendMode::InOrder);

        queue.queue(400, None, "late");
        queue.check_queue().await;
        assert_eq!(recv(&mut rx).await, (400, "late"));
    }
}
