use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use portal_sync_lib::{
    AppConfig, AppLifecycleState, Clock, ConversationId, ConversationKey, ConversationSummary,
    DeliveryOutcome, LifecycleBroadcaster, MemoryAuthState, MemoryStatusStore,
    MessageAuthor, MessageDeliveryPipeline, PresenceRole, PresenceView, SessionContext,
    SessionPorts, SystemClock, TimerScheduler, TokioTimerScheduler, VirtualTimerScheduler,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockMode {
    Virtual,
    System,
}

impl ClockMode {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Self::System,
            _ => Self::Virtual,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Virtual => "virtual",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
struct HarnessConfig {
    operator_id: String,
    operator_name: String,
    members: Vec<String>,
    clock: ClockMode,
    failed_sends: u32,
    summary_path: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize)]
struct HarnessStats {
    messages_sent: u64,
    messages_failed: u64,
    messages_retried: u64,
    marked_read: u64,
    store_writes: usize,
    last_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct HarnessSummary {
    operator_id: String,
    clock: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    operator_online_after_login: bool,
    operator_online_after_background: bool,
    presence: Vec<PresenceView>,
    conversations: Vec<ConversationSummary>,
    stats: HarnessStats,
}

/// Drives virtual time or sleeps on the real clock.
enum HarnessClock {
    Virtual(Arc<VirtualTimerScheduler>),
    System,
}

impl HarnessClock {
    async fn wait(&self, duration: Duration) {
        match self {
            Self::Virtual(scheduler) => scheduler.advance(duration).await,
            Self::System => tokio::time::sleep(duration).await,
        }
        settle().await;
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn parse_env_list(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn parse_required_string(key: &str, default_value: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_value.to_string())
}

fn build_config() -> HarnessConfig {
    let members = parse_env_list(std::env::var("PORTAL_HARNESS_MEMBERS").ok());
    HarnessConfig {
        operator_id: parse_required_string("PORTAL_HARNESS_OPERATOR", "admin-1"),
        operator_name: parse_required_string("PORTAL_HARNESS_OPERATOR_NAME", "Operator"),
        members: if members.is_empty() {
            vec!["student-1".to_string(), "student-2".to_string()]
        } else {
            members
        },
        clock: ClockMode::parse(&parse_required_string("PORTAL_HARNESS_CLOCK", "virtual")),
        failed_sends: std::env::var("PORTAL_HARNESS_FAILED_SENDS")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(1),
        summary_path: std::env::var("PORTAL_HARNESS_SUMMARY_PATH")
            .ok()
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from),
    }
}

fn conversation_id_for(member: &str) -> Result<ConversationId> {
    ConversationId::new(member).map_err(anyhow::Error::msg)
}

fn write_summary(path: &PathBuf, summary: &HarnessSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    fs::write(path, serde_json::to_vec_pretty(summary)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    portal_sync_lib::init_logging();

    let cfg = build_config();
    let app_config = AppConfig::from_env();
    if let Err(reason) = app_config.validate() {
        bail!("invalid configuration: {reason}");
    }

    let (timers, clock, harness_clock) = match cfg.clock {
        ClockMode::Virtual => {
            let scheduler = Arc::new(VirtualTimerScheduler::new());
            let timers: Arc<dyn TimerScheduler> = scheduler.clone();
            let clock: Arc<dyn Clock> = scheduler.clone();
            (timers, clock, HarnessClock::Virtual(scheduler))
        }
        ClockMode::System => {
            let timers: Arc<dyn TimerScheduler> = Arc::new(TokioTimerScheduler::new());
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            (timers, clock, HarnessClock::System)
        }
    };

    let store = Arc::new(MemoryStatusStore::new(clock.clone()));
    let auth = Arc::new(MemoryAuthState::signed_in(cfg.operator_id.clone()));
    let lifecycle = Arc::new(LifecycleBroadcaster::new());
    let session = SessionContext::new(
        app_config.clone(),
        SessionPorts {
            store: store.clone(),
            auth: auth.clone(),
            lifecycle: lifecycle.clone(),
            timers: timers.clone(),
            clock: clock.clone(),
        },
    )?;
    let started_at = clock.now();
    let mut stats = HarnessStats::default();

    info!(operator_id = %cfg.operator_id, clock = cfg.clock.as_str(), "harness starting");
    let tracker = session
        .login(&cfg.operator_id, PresenceRole::Operator)
        .await
        .context("operator login failed")?;
    let operator_online_after_login = tracker.is_online();

    // members write through their own pipeline, as another device would
    let member_pipeline = MessageDeliveryPipeline::new(&app_config, store.clone(), clock.clone());
    for member in &cfg.members {
        let conversation =
            ConversationKey::new(conversation_id_for(member)?, [cfg.operator_id.clone()]);
        let author = MessageAuthor::new(member.clone(), PresenceRole::Member)
            .with_display_name(format!("{member} (member)"));
        let ticket = member_pipeline.send(&conversation, &format!("hello from {member}"), &author)?;
        if let DeliveryOutcome::Delivered(_) = ticket.outcome().await? {
            stats.messages_sent += 1;
        }
        harness_clock.wait(Duration::from_secs(1)).await;
    }

    let operator = MessageAuthor::new(cfg.operator_id.clone(), PresenceRole::Operator)
        .with_display_name(cfg.operator_name.clone());
    for member in &cfg.members {
        let conversation_id = conversation_id_for(member)?;
        let marked = session
            .open_conversation(&conversation_id, &cfg.operator_id)
            .await?;
        stats.marked_read += marked as u64;

        let conversation = ConversationKey::new(conversation_id.clone(), [member.clone()]);
        store.fail_next_writes(cfg.failed_sends);
        let ticket = session
            .send(&conversation, &format!("hi {member}, noted"), &operator)
            .await?;
        let mut outcome = ticket.outcome().await?;
        while let DeliveryOutcome::Failed { message_id, reason } = outcome {
            stats.messages_failed += 1;
            stats.last_error = Some(reason.clone());
            warn!(message_id = %message_id, %reason, "send failed, retrying");
            stats.messages_retried += 1;
            outcome = session.retry(&message_id)?.outcome().await?;
        }
        if let DeliveryOutcome::Delivered(_) = outcome {
            stats.messages_sent += 1;
        }
        session.close_conversation(&conversation_id, &cfg.operator_id);
        harness_clock.wait(Duration::from_secs(1)).await;
    }

    harness_clock.wait(app_config.presence.heartbeat_interval()).await;

    let mut presence = Vec::new();
    let operator_view = session
        .presence_of(&cfg.operator_id, PresenceRole::Operator)
        .await;
    settle().await;
    presence.push(operator_view.borrow().clone());
    for member in &cfg.members {
        let view = session.presence_of(member, PresenceRole::Member).await;
        settle().await;
        presence.push(view.borrow().clone());
    }

    let conversations = session.conversation_list().await?.borrow().clone();

    lifecycle.publish(AppLifecycleState::Background);
    settle().await;
    harness_clock
        .wait(app_config.presence.background_timeout() + Duration::from_secs(1))
        .await;
    let operator_online_after_background = tracker.is_online();

    session.logout().await;
    stats.store_writes = store.write_count();

    let summary = HarnessSummary {
        operator_id: cfg.operator_id.clone(),
        clock: cfg.clock.as_str().to_string(),
        started_at,
        finished_at: clock.now(),
        operator_online_after_login,
        operator_online_after_background,
        presence,
        conversations,
        stats,
    };

    if let Some(path) = &cfg.summary_path {
        write_summary(path, &summary)?;
        info!(path = %path.display(), "harness summary written");
    } else {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}
