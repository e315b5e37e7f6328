//! Prometheus metrics for the node.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Proposals by outcome: accepted, rejected (not leader), dropped.
    pub static ref PROPOSAL_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("nubedb_proposals", "proposals submitted to the engine"),
        &["outcome"]
    )
    .unwrap();

    /// Committed entries applied to the state machine, by entry kind.
    pub static ref APPLIED_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("nubedb_applied_entries", "entries applied to the state machine"),
        &["type"]
    )
    .unwrap();

    /// Apply latency, by entry kind.
    pub static ref APPLY_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("nubedb_apply_seconds", "state machine apply latency"),
        &["type"]
    )
    .unwrap();

    /// Control-plane RPC activity, by method.
    pub static ref RPC_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("nubedb_cluster_rpc", "cluster RPC calls handled or issued"),
        &["method"]
    )
    .unwrap();
}

pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSAL_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLY_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RPC_COUNTER_VEC.clone()));
}
