use crate::application::ports::{
    AppLifecycleSource, AuthState, Clock, DocumentKey, RemoteStatusStore, TimerCallback,
    TimerHandle, TimerScheduler,
};
use crate::application::shared::SubscriptionRegistry;
use crate::application::shared::mappers::{offline_patch, online_patch, presence_key};
use crate::domain::value_objects::{AppLifecycleState, PresenceRole};
use crate::shared::config::{AppConfig, PresenceConfig};
use crate::shared::error::AppError;
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info, warn};

/// Collaborators a presence tracker runs against.
#[derive(Clone)]
pub struct PresencePorts {
    pub store: Arc<dyn RemoteStatusStore>,
    pub auth: Arc<dyn AuthState>,
    pub lifecycle: Arc<dyn AppLifecycleSource>,
    pub timers: Arc<dyn TimerScheduler>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    Offline,
    Online,
}

#[derive(Debug)]
struct TrackerState {
    phase: TrackerPhase,
    session_user: Option<String>,
    generation: u64,
    heartbeat: Option<TimerHandle>,
    background: Option<TimerHandle>,
}

struct TrackerInner {
    owner_id: String,
    role: PresenceRole,
    key: DocumentKey,
    config: PresenceConfig,
    ports: PresencePorts,
    state: Mutex<TrackerState>,
    subscriptions: SubscriptionRegistry,
}

/// Online/offline state machine for one (owner, role) presence record.
///
/// `initialize` flips the phase to online before any I/O so a second call while the first
/// is still writing is a no-op. Every store failure is logged and left for the next
/// heartbeat; callers never see presence write errors.
pub struct HeartbeatPresenceTracker {
    inner: Arc<TrackerInner>,
}

impl HeartbeatPresenceTracker {
    pub fn new(
        owner_id: impl Into<String>,
        role: PresenceRole,
        config: &AppConfig,
        ports: PresencePorts,
    ) -> Self {
        let owner_id = owner_id.into();
        let key = presence_key(&config.store, &owner_id, role);
        Self {
            inner: Arc::new(TrackerInner {
                owner_id,
                role,
                key,
                config: config.presence.clone(),
                ports,
                state: Mutex::new(TrackerState {
                    phase: TrackerPhase::Offline,
                    session_user: None,
                    generation: 0,
                    heartbeat: None,
                    background: None,
                }),
                subscriptions: SubscriptionRegistry::new(),
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn role(&self) -> PresenceRole {
        self.inner.role
    }

    pub fn phase(&self) -> TrackerPhase {
        self.inner.lock().phase
    }

    pub fn is_online(&self) -> bool {
        self.phase() == TrackerPhase::Online
    }

    pub async fn initialize(&self) -> Result<(), AppError> {
        let generation = match self.inner.begin_session() {
            Ok(generation) => generation,
            Err(AppError::ConcurrentInit(reason)) => {
                debug!(owner_id = %self.inner.owner_id, role = %self.inner.role, %reason, "presence already online");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self.inner.write_online().await {
            warn!(
                owner_id = %self.inner.owner_id,
                role = %self.inner.role,
                error = %err,
                "initial presence write failed, next heartbeat will retry"
            );
        }

        if !self.inner.is_current(generation) {
            debug!(owner_id = %self.inner.owner_id, "presence session ended during initialize");
            return Ok(());
        }

        self.inner.attach_listeners();
        self.inner.start_heartbeat();
        info!(owner_id = %self.inner.owner_id, role = %self.inner.role, "presence online");
        Ok(())
    }

    pub async fn on_app_lifecycle_change(&self, state: AppLifecycleState) {
        self.inner.handle_lifecycle(state).await;
    }

    pub async fn force_offline(&self) {
        self.inner.force_offline().await;
    }

    pub async fn cleanup(&self) {
        self.inner.cleanup().await;
    }
}

impl Drop for HeartbeatPresenceTracker {
    fn drop(&mut self) {
        self.inner.stop_local();
    }
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin_session(&self) -> Result<u64, AppError> {
        let user = self.ports.auth.current_user_id().ok_or_else(|| {
            AppError::AuthExpired(format!(
                "No authenticated user for {} presence of {}",
                self.role, self.owner_id
            ))
        })?;

        let mut state = self.lock();
        if state.phase == TrackerPhase::Online {
            return Err(AppError::ConcurrentInit(format!(
                "{} presence of {} is already online",
                self.role, self.owner_id
            )));
        }
        state.phase = TrackerPhase::Online;
        state.session_user = Some(user);
        state.generation += 1;
        Ok(state.generation)
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.phase == TrackerPhase::Online && state.generation == generation
    }

    async fn write_online(&self) -> Result<(), AppError> {
        let now = self.ports.clock.now();
        self.ports
            .store
            .set(&self.key, online_patch(&self.owner_id, self.role, now), true)
            .await
    }

    fn attach_listeners(self: &Arc<Self>) {
        // a background timeout leaves the previous session's pumps registered
        let replaced = self.subscriptions.dispose_all();
        if replaced > 0 {
            debug!(owner_id = %self.owner_id, replaced, "replacing presence listeners");
        }

        let (auth_handle, mut auth_updates) = self.ports.auth.subscribe().into_parts();
        let weak = Arc::downgrade(self);
        let auth_pump = tokio::spawn(async move {
            while let Some(user) = auth_updates.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_auth_lost(user.as_deref()) {
                    // cleanup disposes this pump, so it runs on its own task
                    tokio::spawn(async move {
                        warn!(owner_id = %inner.owner_id, role = %inner.role, "auth lost, forcing presence offline");
                        inner.cleanup().await;
                    });
                    break;
                }
            }
        });
        self.subscriptions
            .register("auth", auth_handle, Some(auth_pump));

        let (lifecycle_handle, mut lifecycle_updates) =
            self.ports.lifecycle.subscribe().into_parts();
        let weak = Arc::downgrade(self);
        let lifecycle_pump = tokio::spawn(async move {
            while let Some(state) = lifecycle_updates.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_lifecycle(state).await;
            }
        });
        self.subscriptions
            .register("lifecycle", lifecycle_handle, Some(lifecycle_pump));
    }

    fn is_auth_lost(&self, user: Option<&str>) -> bool {
        let state = self.lock();
        if state.phase != TrackerPhase::Online {
            return false;
        }
        match (user, state.session_user.as_deref()) {
            (None, _) => true,
            (Some(current), Some(session)) => current != session,
            (Some(_), None) => false,
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let callback: TimerCallback = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.heartbeat_tick().await;
                }
            }
            .boxed()
        });
        let handle = self
            .ports
            .timers
            .schedule_repeating(self.config.heartbeat_interval(), callback);
        let previous = self.lock().heartbeat.replace(handle);
        if let Some(previous) = previous {
            self.ports.timers.cancel(previous);
        }
    }

    async fn heartbeat_tick(&self) {
        if self.lock().phase != TrackerPhase::Online {
            return;
        }
        let user = self.ports.auth.current_user_id();
        if self.is_auth_lost(user.as_deref()) {
            warn!(owner_id = %self.owner_id, role = %self.role, "heartbeat found no session, forcing offline");
            self.cleanup().await;
            return;
        }
        match self.write_online().await {
            Ok(()) => debug!(owner_id = %self.owner_id, role = %self.role, "heartbeat written"),
            Err(err) if err.is_transient() => warn!(
                owner_id = %self.owner_id,
                role = %self.role,
                error = %err,
                "heartbeat write failed"
            ),
            Err(err) => error!(
                owner_id = %self.owner_id,
                role = %self.role,
                error = %err,
                "heartbeat rejected by store"
            ),
        }
    }

    async fn handle_lifecycle(self: &Arc<Self>, lifecycle: AppLifecycleState) {
        if lifecycle.is_foreground() {
            let (background, online) = {
                let mut state = self.lock();
                (state.background.take(), state.phase == TrackerPhase::Online)
            };
            if let Some(handle) = background {
                self.ports.timers.cancel(handle);
                debug!(owner_id = %self.owner_id, "background timeout cancelled");
            }
            if online {
                if let Err(err) = self.write_online().await {
                    warn!(owner_id = %self.owner_id, role = %self.role, error = %err, "foreground presence refresh failed");
                }
            }
            return;
        }

        {
            let state = self.lock();
            if state.phase != TrackerPhase::Online || state.background.is_some() {
                return;
            }
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let callback: TimerCallback = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().background.take();
                    info!(owner_id = %inner.owner_id, role = %inner.role, "background timeout reached");
                    inner.force_offline().await;
                }
            }
            .boxed()
        });
        let handle = self
            .ports
            .timers
            .schedule_once(self.config.background_timeout(), callback);

        let mut state = self.lock();
        if state.background.is_some() || state.phase != TrackerPhase::Online {
            drop(state);
            self.ports.timers.cancel(handle);
            return;
        }
        state.background = Some(handle);
        debug!(owner_id = %self.owner_id, state = ?lifecycle, "background timeout armed");
    }

    fn deletes_record(&self) -> bool {
        match self.role {
            PresenceRole::Operator => self.config.delete_operator_record_on_offline,
            PresenceRole::Member => self.config.delete_member_record_on_offline,
        }
    }

    fn take_timers(&self) -> (bool, Vec<TimerHandle>) {
        let mut state = self.lock();
        let was_online = state.phase == TrackerPhase::Online;
        state.phase = TrackerPhase::Offline;
        let timers = [state.heartbeat.take(), state.background.take()]
            .into_iter()
            .flatten()
            .collect();
        (was_online, timers)
    }

    async fn force_offline(&self) {
        let (was_online, timers) = self.take_timers();
        for handle in timers {
            self.ports.timers.cancel(handle);
        }
        if !was_online {
            return;
        }

        let now = self.ports.clock.now();
        if let Err(err) = self.ports.store.set(&self.key, offline_patch(now), true).await {
            warn!(owner_id = %self.owner_id, role = %self.role, error = %err, "offline write failed");
        }
        if self.deletes_record() {
            if let Err(err) = self.ports.store.delete(&self.key).await {
                warn!(owner_id = %self.owner_id, role = %self.role, error = %err, "presence record delete failed");
            }
        }
        info!(owner_id = %self.owner_id, role = %self.role, "presence offline");
    }

    async fn cleanup(&self) {
        self.force_offline().await;
        let disposed = self.subscriptions.dispose_all();
        self.lock().session_user = None;
        debug!(owner_id = %self.owner_id, role = %self.role, disposed, "presence tracker cleaned up");
    }

    fn stop_local(&self) {
        let (_, timers) = self.take_timers();
        for handle in timers {
            self.ports.timers.cancel(handle);
        }
        self.subscriptions.dispose_all();
    }
}
