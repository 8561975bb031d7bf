//! Watchdog: the idle, traffic, and wake loops, plus the event stream the
//! TUI/daemon consumes.
//!
//! Each loop reads the registry and feeds decisions back into the
//! lifecycle engine. The engine's per-tenant in-flight gate is the only
//! synchronization: a trigger that finds its tenant busy is dropped
//! silently and the next tick retries if the condition still holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::WatchdogConfig;
use crate::error::LobsterError;
use crate::lifecycle::Engine;
use crate::net;
use crate::types::{Tenant, TenantStatus};

/// Buffered events before slow receivers start losing the oldest.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchEventKind {
    SuspendStart,
    SuspendComplete,
    SuspendFailed,
    ResumeStart,
    ResumeComplete,
    ResumeFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub tenant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WatchEvent {
    fn new(kind: WatchEventKind, tenant: &str, trigger: Option<&'static str>) -> Self {
        Self {
            kind,
            tenant: tenant.to_owned(),
            trigger,
            vm_pid: None,
            next_wake_at_ms: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Running,
    Draining,
}

/// What one traffic-loop observation of a tap counter means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrafficDecision {
    /// Strictly increased: inbound traffic, wake the tenant.
    Resume,
    /// Decreased: the counter reset (device recreated); rebase the
    /// baseline instead of treating it as activity.
    Rebase,
    Ignore,
}

fn traffic_decision(last_rx: u64, rx: u64) -> TrafficDecision {
    if rx > last_rx {
        TrafficDecision::Resume
    } else if rx < last_rx {
        TrafficDecision::Rebase
    } else {
        TrafficDecision::Ignore
    }
}

pub struct Watchdog {
    events: broadcast::Sender<WatchEvent>,
    mode: watch::Sender<Mode>,
    loops: JoinSet<()>,
}

impl Watchdog {
    /// Spawn the three scheduler loops.
    pub fn start(engine: Arc<Engine>) -> Self {
        let cfg = engine.config().watchdog.clone();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (mode, mode_rx) = watch::channel(Mode::Running);

        let mut loops = JoinSet::new();
        loops.spawn(idle_loop(
            Arc::clone(&engine),
            events.clone(),
            mode_rx.clone(),
            cfg.clone(),
        ));
        loops.spawn(traffic_loop(
            Arc::clone(&engine),
            events.clone(),
            mode_rx.clone(),
            cfg.clone(),
        ));
        loops.spawn(wake_loop(engine, events.clone(), mode_rx, cfg));

        info!("watchdog started");
        Self {
            events,
            mode,
            loops,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Stop accepting triggers, cancel the timers, and wait for in-flight
    /// operations to finish.
    pub async fn stop(mut self) {
        let _ = self.mode.send(Mode::Draining);
        while let Some(result) = self.loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "watchdog loop panicked");
            }
        }
        info!("watchdog stopped");
    }
}

fn emit(events: &broadcast::Sender<WatchEvent>, event: WatchEvent) {
    // No receivers is fine; broadcast drops the oldest for laggards.
    let _ = events.send(event);
}

fn draining(mode_rx: &watch::Receiver<Mode>) -> bool {
    *mode_rx.borrow() == Mode::Draining
}

/// Await in-flight operations spawned by a loop before it exits.
async fn drain(ops: &mut JoinSet<()>) {
    while let Some(result) = ops.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "scheduler operation panicked");
        }
    }
}

async fn load_by_status(engine: &Engine, status: TenantStatus) -> Vec<Tenant> {
    match engine.store().load().await {
        Ok(r) => r
            .tenants
            .into_iter()
            .filter(|t| t.status == status)
            .collect(),
        Err(e) => {
            warn!(error = %e, "scheduler registry read failed");
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Idle loop
// ---------------------------------------------------------------------------

async fn idle_loop(
    engine: Arc<Engine>,
    events: broadcast::Sender<WatchEvent>,
    mut mode_rx: watch::Receiver<Mode>,
    cfg: WatchdogConfig,
) {
    let period = Duration::from_millis(cfg.interval_ms);
    let threshold = Duration::from_millis(cfg.idle_threshold_ms);
    let mut idle: HashMap<String, Duration> = HashMap::new();
    let mut ops = JoinSet::new();

    loop {
        tokio::select! {
            changed = mode_rx.changed() => {
                if changed.is_err() || draining(&mode_rx) {
                    break;
                }
            }
            _ = tokio::time::sleep(period) => {
                idle_tick(&engine, &events, &mut idle, period, threshold, &mut ops).await;
            }
            Some(result) = ops.join_next(), if !ops.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "scheduler operation panicked");
                }
            }
        }
    }
    drain(&mut ops).await;
}

/// Advance a tenant's accumulated observed-idle time by one tick.
///
/// Idle time only accrues while the agent actually answers with zero
/// connections; unreachable ticks do not advance it.
fn advance_idle(idle: &mut HashMap<String, Duration>, name: &str, period: Duration) -> Duration {
    *idle
        .entry(name.to_owned())
        .and_modify(|d| *d += period)
        .or_insert(Duration::ZERO)
}

async fn idle_tick(
    engine: &Arc<Engine>,
    events: &broadcast::Sender<WatchEvent>,
    idle: &mut HashMap<String, Duration>,
    period: Duration,
    threshold: Duration,
    ops: &mut JoinSet<()>,
) {
    let active = load_by_status(engine, TenantStatus::Active).await;
    idle.retain(|name, _| active.iter().any(|t| t.name == *name));

    for tenant in active {
        if engine.is_busy(&tenant.name) {
            continue;
        }
        match engine.agent_client(&tenant).active_connections().await {
            // Unreachable agent: the idle clock is left untouched.
            Err(_) => {}
            Ok(ac) if !ac.is_idle() => {
                idle.remove(&tenant.name);
            }
            Ok(_) => {
                if advance_idle(idle, &tenant.name, period) >= threshold {
                    idle.remove(&tenant.name);
                    spawn_suspend(ops, Arc::clone(engine), events.clone(), tenant.name);
                }
            }
        }
    }
}

fn spawn_suspend(
    ops: &mut JoinSet<()>,
    engine: Arc<Engine>,
    events: broadcast::Sender<WatchEvent>,
    name: String,
) {
    ops.spawn(async move {
        emit(
            &events,
            WatchEvent::new(WatchEventKind::SuspendStart, &name, Some("idle")),
        );
        match engine.suspend(&name).await {
            Ok(tenant) => {
                let mut ev = WatchEvent::new(WatchEventKind::SuspendComplete, &name, Some("idle"));
                ev.next_wake_at_ms = tenant.suspend_info.and_then(|s| s.next_wake_at_ms);
                emit(&events, ev);
            }
            // Lost the race for the in-flight slot: drop silently.
            Err(LobsterError::OperationInFlight(_)) => {}
            Err(e) => {
                warn!(tenant = %name, error = %e, "auto-suspend failed");
                let mut ev = WatchEvent::new(WatchEventKind::SuspendFailed, &name, Some("idle"));
                ev.error = Some(e.to_string());
                emit(&events, ev);
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Traffic loop
// ---------------------------------------------------------------------------

async fn traffic_loop(
    engine: Arc<Engine>,
    events: broadcast::Sender<WatchEvent>,
    mut mode_rx: watch::Receiver<Mode>,
    cfg: WatchdogConfig,
) {
    let period = Duration::from_millis(cfg.traffic_poll_ms);
    let mut ops = JoinSet::new();

    loop {
        tokio::select! {
            changed = mode_rx.changed() => {
                if changed.is_err() || draining(&mode_rx) {
                    break;
                }
            }
            _ = tokio::time::sleep(period) => {
                traffic_tick(&engine, &events, &mut ops).await;
            }
            Some(result) = ops.join_next(), if !ops.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "scheduler operation panicked");
                }
            }
        }
    }
    drain(&mut ops).await;
}

async fn traffic_tick(
    engine: &Arc<Engine>,
    events: &broadcast::Sender<WatchEvent>,
    ops: &mut JoinSet<()>,
) {
    for tenant in load_by_status(engine, TenantStatus::Suspended).await {
        if engine.is_busy(&tenant.name) {
            continue;
        }
        let Some(info) = tenant.suspend_info.as_ref() else {
            continue;
        };
        let rx = match net::read_rx_bytes(&tenant.tap_dev).await {
            Ok(rx) => rx,
            Err(_) => continue,
        };
        match traffic_decision(info.last_rx_bytes, rx) {
            TrafficDecision::Resume => {
                spawn_resume(ops, Arc::clone(engine), events.clone(), tenant.name, "traffic");
            }
            TrafficDecision::Rebase => {
                let name = tenant.name.clone();
                let result = engine
                    .store()
                    .mutate(move |r| {
                        if let Some(t) = r.get_mut(&name) {
                            if let Some(si) = t.suspend_info.as_mut() {
                                si.last_rx_bytes = rx;
                            }
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    warn!(tenant = %tenant.name, error = %e, "rx baseline rebase failed");
                }
            }
            TrafficDecision::Ignore => {}
        }
    }
}

fn spawn_resume(
    ops: &mut JoinSet<()>,
    engine: Arc<Engine>,
    events: broadcast::Sender<WatchEvent>,
    name: String,
    trigger: &'static str,
) {
    ops.spawn(async move {
        emit(
            &events,
            WatchEvent::new(WatchEventKind::ResumeStart, &name, Some(trigger)),
        );
        match engine.resume(&name).await {
            Ok(tenant) => {
                let mut ev = WatchEvent::new(WatchEventKind::ResumeComplete, &name, Some(trigger));
                ev.vm_pid = tenant.vm_pid;
                emit(&events, ev);
            }
            Err(LobsterError::OperationInFlight(_)) => {}
            Err(e) => {
                warn!(tenant = %name, trigger, error = %e, "auto-resume failed");
                let mut ev = WatchEvent::new(WatchEventKind::ResumeFailed, &name, Some(trigger));
                ev.error = Some(e.to_string());
                emit(&events, ev);
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Wake loop
// ---------------------------------------------------------------------------

async fn wake_loop(
    engine: Arc<Engine>,
    events: broadcast::Sender<WatchEvent>,
    mut mode_rx: watch::Receiver<Mode>,
    cfg: WatchdogConfig,
) {
    let period = Duration::from_millis(cfg.traffic_poll_ms);
    let mut ops = JoinSet::new();

    loop {
        tokio::select! {
            changed = mode_rx.changed() => {
                if changed.is_err() || draining(&mode_rx) {
                    break;
                }
            }
            _ = tokio::time::sleep(period) => {
                wake_tick(&engine, &events, &mut ops).await;
            }
            Some(result) = ops.join_next(), if !ops.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "scheduler operation panicked");
                }
            }
        }
    }
    drain(&mut ops).await;
}

async fn wake_tick(
    engine: &Arc<Engine>,
    events: &broadcast::Sender<WatchEvent>,
    ops: &mut JoinSet<()>,
) {
    let now = Utc::now().timestamp_millis();
    for tenant in load_by_status(engine, TenantStatus::Suspended).await {
        if engine.is_busy(&tenant.name) {
            continue;
        }
        let due = tenant
            .suspend_info
            .as_ref()
            .and_then(|s| s.next_wake_at_ms)
            .is_some_and(|wake| wake <= now);
        if due {
            spawn_resume(ops, Arc::clone(engine), events.clone(), tenant.name, "cron");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LobsterdConfig;
    use crate::error::LobsterResult;
    use crate::paths::HostPaths;
    use crate::proxy::ProxyDriver;
    use async_trait::async_trait;

    struct NullProxy;

    #[async_trait]
    impl ProxyDriver for NullProxy {
        async fn ensure_base_config(&self) -> LobsterResult<()> {
            Ok(())
        }
        async fn add_route(&self, _: &str, _: &str, _: u16) -> LobsterResult<()> {
            Ok(())
        }
        async fn remove_route(&self, _: &str) -> LobsterResult<()> {
            Ok(())
        }
        async fn has_route(&self, _: &str) -> LobsterResult<bool> {
            Ok(false)
        }
        async fn list_routes(&self) -> LobsterResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn is_running(&self) -> bool {
            true
        }
    }

    #[test]
    fn traffic_increase_resumes() {
        assert_eq!(traffic_decision(100, 101), TrafficDecision::Resume);
        assert_eq!(traffic_decision(0, 1), TrafficDecision::Resume);
    }

    #[test]
    fn traffic_equal_ignores() {
        assert_eq!(traffic_decision(100, 100), TrafficDecision::Ignore);
    }

    #[test]
    fn traffic_counter_reset_rebases() {
        // Tap recreated: counter restarts near zero; must not wake.
        assert_eq!(traffic_decision(1_000_000, 40), TrafficDecision::Rebase);
    }

    #[test]
    fn idle_accrues_only_on_observations() {
        let mut idle = HashMap::new();
        let period = Duration::from_secs(15);
        // First idle observation starts the clock at zero.
        assert_eq!(advance_idle(&mut idle, "alice", period), Duration::ZERO);
        assert_eq!(advance_idle(&mut idle, "alice", period), period);
        assert_eq!(advance_idle(&mut idle, "alice", period), period * 2);
        // Another tenant accrues independently.
        assert_eq!(advance_idle(&mut idle, "bob", period), Duration::ZERO);
    }

    #[test]
    fn event_serialization_omits_absent_fields() {
        let ev = WatchEvent::new(WatchEventKind::SuspendStart, "alice", Some("idle"));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["kind"], "suspend-start");
        assert_eq!(v["tenant"], "alice");
        assert_eq!(v["trigger"], "idle");
        assert!(v.get("error").is_none());
        assert!(v.get("vmPid").is_none());
    }

    #[test]
    fn event_kind_names_are_kebab() {
        let v = serde_json::to_value(WatchEventKind::ResumeComplete).unwrap();
        assert_eq!(v, "resume-complete");
    }

    #[tokio::test]
    async fn start_stop_with_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = LobsterdConfig::default();
        cfg.watchdog.interval_ms = 20;
        cfg.watchdog.traffic_poll_ms = 20;
        let paths = HostPaths::rooted(dir.path());
        std::fs::create_dir_all(paths.config_dir()).unwrap();
        let engine = Arc::new(Engine::with_proxy(cfg, paths, Box::new(NullProxy)));

        let watchdog = Watchdog::start(engine);
        let _rx = watchdog.subscribe();
        // Let a few ticks happen against the empty registry.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(5), watchdog.stop())
            .await
            .expect("stop must drain promptly");
    }

    #[tokio::test]
    async fn busy_tenant_triggers_are_dropped() {
        // A tenant holding its in-flight slot must not even be probed.
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = LobsterdConfig::default();
        cfg.watchdog.interval_ms = 20;
        cfg.watchdog.traffic_poll_ms = 20;
        // Keep any accidental repair attempts inside the tempdir.
        cfg.jailer.chroot_base_dir = dir.path().join("jailer");
        cfg.firecracker.kernel_path = dir.path().join("vmlinux");
        cfg.firecracker.rootfs_path = dir.path().join("rootfs.img");
        let paths = HostPaths::rooted(dir.path());
        std::fs::create_dir_all(paths.config_dir()).unwrap();
        let engine = Arc::new(Engine::with_proxy(cfg, paths, Box::new(NullProxy)));

        engine
            .store()
            .mutate(|r| {
                let t = r.allocate("alice", 10_000, std::path::Path::new("/srv"), None)?;
                let row = r.get_mut(&t.name).unwrap();
                row.status = TenantStatus::Suspended;
                row.suspend_info = Some(crate::types::SuspendInfo {
                    last_rx_bytes: 0,
                    // Long overdue: would fire immediately if not gated.
                    next_wake_at_ms: Some(1),
                    suspended_at_ms: 0,
                });
                Ok(())
            })
            .await
            .unwrap();

        let guard = engine.gate("alice").unwrap();
        let watchdog = Watchdog::start(Arc::clone(&engine));
        let mut rx = watchdog.subscribe();

        // No resume-start may be emitted while the slot is held.
        let got = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(got.is_err(), "unexpected event: {got:?}");

        drop(guard);
        watchdog.stop().await;
    }
}
