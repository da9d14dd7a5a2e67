//! Harvester (spec §3 sum type) and the parallel Harvester Set driver
//! (spec §4.10).
//!
//! Design notes §9: the teacher-shaped inheritance chain
//! (`AbstractCandidateHarvester -> StunCandidateHarvester ->
//! TurnCandidateHarvester`) is flattened here into a capability enum;
//! the shared STUN client logic each variant needs is the `StunClient`
//! value (`crate::stun::client::StunClient`) composed by method call.

pub mod host;
pub mod mapping;
pub mod single_port;
pub mod stun;
pub mod tcp;
pub mod turn;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::candidate::Candidate;
use crate::component::ComponentSink;
use crate::config::Config;
use crate::error::Result;

/// `Harvester` (spec §3): given a Component, produce a set of
/// Candidates. Each variant owns the single operation spec §4.6-§4.12
/// assigns it.
pub enum Harvester {
    Host(host::HostHarvester),
    Stun(stun::StunHarvester),
    Turn(turn::TurnHarvester),
    Mapping(mapping::MappingHarvester),
    SinglePortUdp(single_port::SinglePortUdpHarvester),
    Tcp(tcp::TcpListenerHarvester),
}

impl Harvester {
    /// A stable identity string used by the Harvester Set to
    /// deduplicate harvesters with equivalent server/credentials (spec
    /// §4.10: "two harvesters with equivalent server/credentials
    /// deduplicate").
    pub fn identity(&self) -> String {
        match self {
            Self::Host(h) => h.identity(),
            Self::Stun(h) => h.identity(),
            Self::Turn(h) => h.identity(),
            Self::Mapping(h) => h.identity(),
            Self::SinglePortUdp(h) => h.identity(),
            Self::Tcp(h) => h.identity(),
        }
    }

    /// `component` is the `Arc` itself, not just a reference: the TCP
    /// Listener variant retains a `Weak` handle past the end of this
    /// call, for hand-off when a channel's first STUN Binding Request
    /// arrives asynchronously later (spec §4.12).
    async fn harvest(&self, component: &Arc<dyn ComponentSink>) -> Result<Vec<Candidate>> {
        match self {
            Self::Host(h) => h.harvest(component.as_ref()).await,
            Self::Stun(h) => h.harvest(component.as_ref()).await,
            Self::Turn(h) => h.harvest(component.as_ref()).await,
            Self::Mapping(h) => h.harvest(component.as_ref()).await,
            Self::SinglePortUdp(h) => h.harvest(component.as_ref()).await,
            Self::Tcp(h) => h.harvest(Arc::clone(component)).await,
        }
    }

    /// Close this harvest (spec §5): cancel in-flight transactions and
    /// terminate any keep-alive task. A no-op for variants that hold
    /// neither (Host, Single-Port UDP, TCP Listener).
    fn close(&self) {
        match self {
            Self::Host(_) => {}
            Self::Stun(h) => h.close(),
            Self::Turn(h) => h.close(),
            Self::Mapping(h) => h.close(),
            Self::SinglePortUdp(_) => {}
            Self::Tcp(_) => {}
        }
    }
}

/// Per-component, per-harvest-round accounting (spec §4.7: "Transient
/// transaction failures ... are dropped and accounted for in
/// HarvestStatistics").
#[derive(Debug, Default, Clone, Copy)]
pub struct HarvestStatistics {
    pub candidates_produced: usize,
    pub transactions_started: usize,
    pub transactions_failed: usize,
}

struct HarvesterEntry {
    harvester: Harvester,
    identity: String,
    disabled: AtomicBool,
}

/// Callback invoked once per newly-discovered candidate batch, then a
/// final time with an empty batch to signal completion (spec §4.10,
/// glossary "Trickle").
pub type TrickleCallback = Arc<dyn Fn(&[Candidate]) + Send + Sync>;

/// Parallel driver over a set of harvesters (spec §4.10).
pub struct HarvesterSet {
    entries: Mutex<Vec<Arc<HarvesterEntry>>>,
    harvesting_timeout: Duration,
}

impl HarvesterSet {
    pub fn new(config: &Config) -> Self {
        Self { entries: Mutex::new(Vec::new()), harvesting_timeout: config.harvesting_timeout }
    }

    /// Insert a harvester in order, skipping it if an equivalent one
    /// (by identity) is already present.
    pub fn add(&self, harvester: Harvester) {
        let identity = harvester.identity();
        let mut guard = self.entries.lock();
        if guard.iter().any(|e| e.identity == identity) {
            return;
        }
        guard.push(Arc::new(HarvesterEntry { harvester, identity, disabled: AtomicBool::new(false) }));
    }

    pub fn harvester_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn disabled_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.disabled.load(Ordering::Relaxed)).count()
    }

    /// Close every harvester in the set (spec §5): cancel in-flight
    /// transactions and terminate keep-alive tasks. Idempotent, and
    /// safe to call from `Drop` or an explicit agent teardown path.
    pub fn close_all(&self) {
        for entry in self.entries.lock().iter() {
            entry.harvester.close();
        }
    }

    /// Dispatch one task per (non-disabled) harvester against
    /// `component`, each bounded by `HARVESTING_TIMEOUT`. Blocks until
    /// every dispatched task has completed, failed, or timed out (spec
    /// §4.10, §5: "harvest(Component) blocks the caller").
    pub async fn harvest(&self, component: Arc<dyn ComponentSink>, trickle: Option<TrickleCallback>) {
        let entries: Vec<Arc<HarvesterEntry>> =
            self.entries.lock().iter().filter(|e| !e.disabled.load(Ordering::Relaxed)).cloned().collect();

        let wg = waitgroup::WaitGroup::new();

        for entry in entries {
            let worker = wg.worker();
            let component = Arc::clone(&component);
            let trickle = trickle.clone();
            let timeout = self.harvesting_timeout;

            tokio::spawn(async move {
                let _worker = worker;

                match tokio::time::timeout(timeout, entry.harvester.harvest(&component)).await {
                    Ok(Ok(candidates)) => {
                        for candidate in &candidates {
                            component.add_local_candidate(candidate.clone());
                        }
                        if let Some(cb) = &trickle {
                            cb(&candidates);
                        }
                    }
                    Ok(Err(_)) | Err(_) => {
                        entry.disabled.store(true, Ordering::Relaxed);
                    }
                }
            });
        }

        wg.wait().await;

        if let Some(cb) = trickle {
            cb(&[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;

    #[tokio::test]
    async fn harvest_with_no_harvesters_completes_immediately() {
        let config = Config::default();
        let set = HarvesterSet::new(&config);
        let component: Arc<dyn ComponentSink> = Arc::new(Component::new(1, "ufrag", 1));

        let calls = Arc::new(Mutex::new(0usize));
        let calls_clone = Arc::clone(&calls);
        let cb: TrickleCallback = Arc::new(move |batch| {
            if batch.is_empty() {
                *calls_clone.lock() += 1;
            }
        });

        set.harvest(component, Some(cb)).await;
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn identity_dedup_keeps_only_one_entry() {
        let config = Config::default();
        let host_cfg = host::HostHarvesterConfig::default();
        set_up_and_assert_dedup(&config, host_cfg);
    }

    fn set_up_and_assert_dedup(config: &Config, host_cfg: host::HostHarvesterConfig) {
        let set = HarvesterSet::new(config);
        set.add(Harvester::Host(host::HostHarvester::new(
            Arc::new(crate::address::AddressInventory::new(config.clone()).unwrap()),
            Arc::new(crate::socket::BindingTable::new()),
            host_cfg.clone(),
        )));
        set.add(Harvester::Host(host::HostHarvester::new(
            Arc::new(crate::address::AddressInventory::new(config.clone()).unwrap()),
            Arc::new(crate::socket::BindingTable::new()),
            host_cfg,
        )));
        assert_eq!(set.harvester_count(), 1);
    }
}
