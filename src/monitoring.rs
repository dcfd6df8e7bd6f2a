use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    api::{PowerControl, ResetOutcome},
    config,
    liveness::{Evaluator, Verdict},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Checking the router on every tick.
    Normal,

    /// We have reset the router, and are waiting for it to come back online.
    /// Resuming monitoring at the given instant.
    Cooldown(Instant),
}

pub struct Watchdog {
    state: WatchdogState,
    evaluator: Evaluator,
    power: Arc<dyn PowerControl>,

    reset_delay: Duration,
    check_interval: Duration,
}

impl Watchdog {
    pub fn new(
        config: &config::Config,
        evaluator: Evaluator,
        power: Arc<dyn PowerControl>,
    ) -> Self {
        Self {
            state: WatchdogState::Normal,
            evaluator,
            power,
            reset_delay: config.reset_delay(),
            check_interval: config.check_interval(),
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Check the router every `check_interval`, forever.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.check_interval);
        // A slow cycle pushes the next one back instead of bunching ticks up.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One check cycle.
    pub async fn tick(&mut self) {
        // While the router is rebooting, don't even probe.
        if let WatchdogState::Cooldown(until) = self.state {
            let now = Instant::now();
            if now < until {
                tracing::debug!(
                    "Router was reset recently, resuming checks in {}s",
                    (until - now).as_secs()
                );
                return;
            }
            tracing::info!("Reset delay has passed, resuming monitoring");
            self.state = WatchdogState::Normal;
        }

        let evaluation = self.evaluator.evaluate().await;

        if evaluation.verdict == Verdict::Up {
            if evaluation.failed_local.is_empty() && evaluation.failed_global.is_empty() {
                tracing::info!("Router is up, no addresses failed");
            } else {
                tracing::warn!(
                    "Router is up, but some addresses failed: local {:?}, global {:?}",
                    evaluation.failed_local,
                    evaluation.failed_global
                );
            }
            return;
        }

        tracing::error!(
            "Router looks down (failed local {:?}, global {:?}). Resetting OPNsense",
            evaluation.failed_local,
            evaluation.failed_global
        );

        match self.power.invoke_reset().await {
            Ok(ResetOutcome::Reset) => tracing::info!("Reset command accepted by BMC"),
            Ok(ResetOutcome::DryRun) => {}
            Err(why) => tracing::error!("Failed to reset router: {why}"),
        }

        // Even a failed request may have reached the BMC, so the cooldown
        // starts regardless of the outcome.
        self.evaluator.clear_history();
        self.state = WatchdogState::Cooldown(Instant::now() + self.reset_delay);

        match chrono::TimeDelta::from_std(self.reset_delay)
            .ok()
            .and_then(|delay| chrono::Utc::now().checked_add_signed(delay))
        {
            Some(resume_at) => tracing::info!("Pausing checks until {resume_at}"),
            None => tracing::info!("Pausing checks for {:?}", self.reset_delay),
        }
    }
}
