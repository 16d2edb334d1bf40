//! Speak Scheduler
//!
//! Drives proactive speaking on a fixed interval. One task runs the loop,
//! so ticks never overlap; a tick that falls behind is skipped rather than
//! bursting.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapter::Dispatcher;
use crate::engine::LearningChat;

/// Tick counters
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub ticks: AtomicU64,
    pub plans_delivered: AtomicU64,
    pub errors: AtomicU64,
}

pub struct SpeakScheduler {
    engine: Arc<LearningChat>,
    dispatcher: Arc<Dispatcher>,
    period: Duration,
    running: AtomicBool,
    stats: SchedulerStats,
}

impl SpeakScheduler {
    pub fn new(engine: Arc<LearningChat>, dispatcher: Arc<Dispatcher>, period: Duration) -> Self {
        Self {
            engine,
            dispatcher,
            period,
            running: AtomicBool::new(false),
            stats: SchedulerStats::default(),
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// One tick: plan and deliver. Returns whether anything was said.
    pub async fn tick(&self) -> Result<bool> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Previous speak tick still running");
            return Ok(false);
        }
        let result = self.tick_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self) -> Result<bool> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        if !self.engine.settings().snapshot().total_enable {
            return Ok(false);
        }
        let Some(plan) = self.engine.speak(self.engine.self_id()).await? else {
            return Ok(false);
        };
        let done = self.dispatcher.deliver_plan(&plan).await;
        info!(
            "Spoke in group {} ({} of {} actions)",
            plan.group_id,
            done,
            plan.actions.len()
        );
        self.stats.plans_delivered.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Tick every period until `shutdown` turns true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Speak scheduler started ({}s period)", self.period.as_secs());
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Speak tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Speak scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
