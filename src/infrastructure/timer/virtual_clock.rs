use crate::application::ports::{Clock, TimerCallback, TimerHandle, TimerScheduler};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

struct VirtualTimer {
    due: Duration,
    interval: Option<Duration>,
    callback: TimerCallback,
}

struct VirtualState {
    origin: DateTime<Utc>,
    elapsed: Duration,
    next_id: u64,
    timers: BTreeMap<u64, VirtualTimer>,
}

/// Manually driven clock and scheduler. Time only moves through [`advance`](Self::advance),
/// which runs every due callback to completion in due-time order.
pub struct VirtualTimerScheduler {
    state: Mutex<VirtualState>,
}

impl Default for VirtualTimerScheduler {
    fn default() -> Self {
        let origin = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_default();
        Self::starting_at(origin)
    }
}

impl VirtualTimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(VirtualState {
                origin,
                elapsed: Duration::ZERO,
                next_id: 0,
                timers: BTreeMap::new(),
            }),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    pub async fn advance(&self, by: Duration) {
        let target = self.lock().elapsed + by;
        loop {
            let callback = {
                let mut state = self.lock();
                let next = state
                    .timers
                    .iter()
                    .filter(|(_, timer)| timer.due <= target)
                    .min_by_key(|(id, timer)| (timer.due, **id))
                    .map(|(id, _)| *id);
                let Some(id) = next else {
                    state.elapsed = target;
                    break;
                };
                let (due, callback, interval) = match state.timers.get(&id) {
                    Some(timer) => (timer.due, timer.callback.clone(), timer.interval),
                    None => break,
                };
                state.elapsed = state.elapsed.max(due);
                match interval {
                    Some(interval) => {
                        if let Some(timer) = state.timers.get_mut(&id) {
                            timer.due = due + interval;
                        }
                    }
                    None => {
                        state.timers.remove(&id);
                    }
                }
                callback
            };
            callback().await;
            tokio::task::yield_now().await;
        }
    }

    fn insert(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerHandle {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let due = state.elapsed + delay;
        state.timers.insert(
            id,
            VirtualTimer {
                due,
                interval,
                callback,
            },
        );
        TimerHandle::new(id)
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TimerScheduler for VirtualTimerScheduler {
    fn schedule_repeating(&self, interval: Duration, callback: TimerCallback) -> TimerHandle {
        let interval = interval.max(Duration::from_millis(1));
        self.insert(interval, Some(interval), callback)
    }

    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        self.insert(delay, None, callback)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.lock().timers.remove(&handle.id());
    }
}

impl Clock for VirtualTimerScheduler {
    fn now(&self) -> DateTime<Utc> {
        let state = self.lock();
        let elapsed = chrono::Duration::from_std(state.elapsed).unwrap_or_default();
        state.origin + elapsed
    }
}
