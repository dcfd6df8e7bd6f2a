use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::Arc,
};

use futures::StreamExt;

use crate::{
    config::{AggregationPolicy, Config},
    probe::Prober,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Up,
    Down,
}

/// Outcome of one check cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub failed_local: Vec<IpAddr>,
    pub failed_global: Vec<IpAddr>,
}

impl AggregationPolicy {
    pub fn verdict(
        self,
        failed_local: usize,
        total_local: usize,
        failed_global: usize,
        total_global: usize,
    ) -> Verdict {
        let down = match self {
            AggregationPolicy::AllUnreachable => {
                failed_local == total_local && failed_global == total_global
            }
            AggregationPolicy::Majority => {
                (failed_local > 0 && failed_global > 0)
                    || failed_global * 2 > total_global
                    || failed_local * 2 > total_local
            }
        };
        if down { Verdict::Down } else { Verdict::Up }
    }
}

/// The last few probe results of every address.
#[derive(Debug)]
struct History {
    window: usize,
    results: HashMap<IpAddr, VecDeque<bool>>,
}

impl History {
    fn new(window: usize) -> Self {
        Self {
            window,
            results: HashMap::new(),
        }
    }

    fn record(&mut self, addr: IpAddr, reachable: bool) {
        let results = self.results.entry(addr).or_default();
        while results.len() >= self.window {
            results.pop_front();
        }
        results.push_back(reachable);
    }

    /// Failed means fewer than half of the remembered probes got a reply.
    /// An address we know nothing about has not failed.
    fn has_failed(&self, addr: &IpAddr) -> bool {
        match self.results.get(addr) {
            Some(results) if !results.is_empty() => {
                let ok = results.iter().filter(|reachable| **reachable).count();
                ok * 2 < results.len()
            }
            _ => false,
        }
    }

    fn clear(&mut self) {
        self.results.clear();
    }
}

pub struct Evaluator {
    prober: Arc<dyn Prober>,
    local: Vec<IpAddr>,
    global: Vec<IpAddr>,
    policy: AggregationPolicy,
    concurrency: usize,
    history: History,
}

impl Evaluator {
    pub fn new(prober: Arc<dyn Prober>, config: &Config) -> Self {
        Self {
            prober,
            local: config.check_ips.local.clone(),
            global: config.check_ips.global.clone(),
            policy: config.policy,
            concurrency: config.probe.concurrency.max(1),
            history: History::new(config.probe.history.max(1)),
        }
    }

    /// Probe every configured address and decide whether the router is down.
    pub async fn evaluate(&mut self) -> Evaluation {
        let targets: Vec<IpAddr> = self.local.iter().chain(&self.global).copied().collect();

        let prober = &self.prober;
        let results: Vec<bool> = futures::stream::iter(targets.iter().copied())
            .map(|addr| prober.probe(addr))
            .buffered(self.concurrency)
            .collect()
            .await;

        for (addr, reachable) in targets.into_iter().zip(results) {
            self.history.record(addr, reachable);
        }

        let failed = |addrs: &[IpAddr]| -> Vec<IpAddr> {
            addrs
                .iter()
                .filter(|addr| self.history.has_failed(addr))
                .copied()
                .collect()
        };
        let failed_local = failed(&self.local);
        let failed_global = failed(&self.global);

        let verdict = self.policy.verdict(
            failed_local.len(),
            self.local.len(),
            failed_global.len(),
            self.global.len(),
        );
        tracing::debug!(
            "{}/{} local and {}/{} global addresses failed",
            failed_local.len(),
            self.local.len(),
            failed_global.len(),
            self.global.len(),
        );

        Evaluation {
            verdict,
            failed_local,
            failed_global,
        }
    }

    /// Forget all recorded results, e.g. after the router was reset.
    pub fn clear_history(&mut self) {
        tracing::debug!("Clearing probe history");
        self.history.clear();
    }
}
