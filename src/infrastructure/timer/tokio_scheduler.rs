use crate::application::ports::{TimerCallback, TimerHandle, TimerScheduler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Timers backed by tokio tasks. Must be used from within a tokio runtime.
///
/// Cancelling drops the timer's stop channel instead of aborting the task, so a callback
/// that cancels its own timer (a background timeout forcing offline, for instance) still
/// runs to completion.
#[derive(Default)]
pub struct TokioTimerScheduler {
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<u64, watch::Sender<bool>>>>,
}

impl TokioTimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_timers(&self) -> usize {
        let mut timers = self.lock();
        timers.retain(|_, stop| !stop.is_closed());
        timers.len()
    }

    fn register(&self) -> (TimerHandle, watch::Receiver<bool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut timers = self.lock();
        timers.retain(|_, stop| !stop.is_closed());
        timers.insert(id, stop_tx);
        (TimerHandle::new(id), stop_rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, watch::Sender<bool>>> {
        match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TimerScheduler for TokioTimerScheduler {
    fn schedule_repeating(&self, interval: Duration, callback: TimerCallback) -> TimerHandle {
        let interval = interval.max(Duration::from_millis(1));
        let (handle, mut stop_rx) = self.register();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                callback().await;
            }
            trace!(timer_id = handle.id(), "repeating timer stopped");
        });
        handle
    }

    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let (handle, mut stop_rx) = self.register();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => callback().await,
                _ = stop_rx.changed() => {
                    trace!(timer_id = handle.id(), "one-shot timer cancelled");
                }
            }
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.lock().remove(&handle.id());
    }
}
