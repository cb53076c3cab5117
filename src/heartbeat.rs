use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, future::join_all};
use module_plugin::{Event, MessageBus, Payload};
use thiserror::Error;
use tokio::{
    sync::{Mutex as TickLock, OwnedMutexGuard},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{bus::EventBus, bus::panic_message, logger::RuntimeMetrics, plugin::PluginRegistry};

pub const TICK_EVENT: &str = "heartbeat.tick";

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// A tick slower than this fraction of the interval logs a warning.
    pub latency_warning_ratio: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            latency_warning_ratio: 0.8,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum HeartbeatError {
    #[error("heartbeat is already running")]
    AlreadyRunning,
}

#[derive(Debug, Default)]
pub struct HeartbeatStats {
    ticks: AtomicU64,
    skipped: AtomicU64,
    slow: AtomicU64,
    last_latency_micros: AtomicU64,
}

impl HeartbeatStats {
    /// Completed ticks.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Timer fires dropped because the previous tick was still running.
    pub fn skipped_count(&self) -> u64 {
        self.skipped.load(Ordering::Acquire)
    }

    /// Ticks that took longer than the latency warning budget.
    pub fn slow_count(&self) -> u64 {
        self.slow.load(Ordering::Acquire)
    }

    pub fn last_latency(&self) -> Duration {
        Duration::from_micros(self.last_latency_micros.load(Ordering::Acquire))
    }
}

struct Runner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
struct TickDeps {
    registry: Arc<PluginRegistry>,
    bus: Arc<EventBus>,
    config: HeartbeatConfig,
    stats: Arc<HeartbeatStats>,
    metrics: Option<RuntimeMetrics>,
}

/// Fixed-interval driver for tickable modules.
///
/// At most one tick runs at a time. A timer fire that finds the previous tick
/// still running is dropped and counted, so a slow module can never pile ticks up.
pub struct HeartbeatLoop {
    deps: TickDeps,
    tick_lock: Arc<TickLock<()>>,
    runner: Mutex<Option<Runner>>,
}

impl HeartbeatLoop {
    pub fn new(registry: Arc<PluginRegistry>, bus: Arc<EventBus>, config: HeartbeatConfig) -> Self {
        Self {
            deps: TickDeps {
                registry,
                bus,
                config,
                stats: Arc::new(HeartbeatStats::default()),
                metrics: None,
            },
            tick_lock: Arc::new(TickLock::new(())),
            runner: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: RuntimeMetrics) -> Self {
        self.deps.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> Arc<HeartbeatStats> {
        Arc::clone(&self.deps.stats)
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.deps.config
    }

    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Spawn the timer task. Stops on its own when `parent` is cancelled.
    pub fn start(&self, parent: &CancellationToken) -> Result<(), HeartbeatError> {
        let mut runner = self.runner.lock().unwrap_or_else(|e| e.into_inner());
        if runner.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(HeartbeatError::AlreadyRunning);
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(run_loop(
            self.deps.clone(),
            Arc::clone(&self.tick_lock),
            cancel.clone(),
        ));
        info!(interval_ms = self.deps.config.interval.as_millis() as u64, "heartbeat started");
        *runner = Some(Runner { cancel, handle });
        Ok(())
    }

    /// Cancel the timer, wait for it and for any tick still in flight. Idempotent.
    pub async fn stop(&self) {
        let runner = self.runner.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runner) = runner {
            runner.cancel.cancel();
            if let Err(e) = runner.handle.await {
                error!("heartbeat loop ended abnormally: {}", e);
            }
            info!(
                ticks = self.deps.stats.tick_count(),
                skipped = self.deps.stats.skipped_count(),
                "heartbeat stopped"
            );
        }
        let _idle = self.tick_lock.lock().await;
    }
}

async fn run_loop(deps: TickDeps, tick_lock: Arc<TickLock<()>>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(deps.config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match Arc::clone(&tick_lock).try_lock_owned() {
                    Ok(guard) => {
                        tokio::spawn(run_tick(guard, deps.clone(), cancel.clone()));
                    }
                    Err(_) => {
                        deps.stats.skipped.fetch_add(1, Ordering::AcqRel);
                        if let Some(metrics) = &deps.metrics {
                            metrics.record_skipped_tick();
                        }
                        debug!("previous tick still running, skipping");
                    }
                }
            }
        }
    }
}

async fn run_tick(guard: OwnedMutexGuard<()>, deps: TickDeps, cancel: CancellationToken) {
    let started = Instant::now();

    let runs = deps.registry.tickables().into_iter().map(|(id, module)| {
        let cancel = cancel.clone();
        async move {
            match AssertUnwindSafe(module.tick(cancel)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(module = %id, "tick failed: {}", e),
                Err(panic) => error!(module = %id, "tick {}", panic_message(panic)),
            }
        }
    });
    join_all(runs).await;

    let elapsed = started.elapsed();
    let count = deps.stats.ticks.fetch_add(1, Ordering::AcqRel) + 1;
    deps.stats
        .last_latency_micros
        .store(elapsed.as_micros() as u64, Ordering::Release);

    let budget = deps.config.interval.mul_f64(deps.config.latency_warning_ratio);
    if elapsed > budget {
        deps.stats.slow.fetch_add(1, Ordering::AcqRel);
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            interval_ms = deps.config.interval.as_millis() as u64,
            "tick latency close to the interval"
        );
    }
    if let Some(metrics) = &deps.metrics {
        metrics.record_tick(elapsed);
    }

    let event = Event::new(TICK_EVENT, Payload::Number(count as f64)).from_source("heartbeat");
    deps.bus.publish(event).await;
    drop(guard);
}
