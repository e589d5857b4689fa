//! Prometheus counters
//!
//! Metrics are registered once on the default registry. Until `init_metrics`
//! has run every `record_*` call is a no-op, which keeps unit tests free of
//! global registration.

use anyhow::{Context, Result};
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};
use std::sync::OnceLock;

static RECONCILE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SESSION_CACHE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TASK_SUBMITTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static IPAM_ADDRESSES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

static INIT_RESULT: OnceLock<Result<(), String>> = OnceLock::new();

/// Register all controller metrics; safe to call more than once
pub fn init_metrics() -> Result<()> {
    INIT_RESULT
        .get_or_init(|| register_all().map_err(|e| format!("{:#}", e)))
        .clone()
        .map_err(|e| anyhow::anyhow!("Metrics initialization failed: {}", e))
}

fn register_all() -> Result<()> {
    let reconcile_total = register_int_counter_vec!(
        "vsphere_machine_reconcile_total",
        "VSphereMachine reconciliations by result",
        &["result"]
    )
    .context("Failed to register vsphere_machine_reconcile_total")?;

    let session_cache_total = register_int_counter_vec!(
        "vsphere_session_cache_total",
        "vSphere session cache lookups by result (hit, miss, stale)",
        &["result"]
    )
    .context("Failed to register vsphere_session_cache_total")?;

    let task_submitted_total = register_int_counter_vec!(
        "vsphere_task_submitted_total",
        "vSphere tasks submitted by operation kind",
        &["kind"]
    )
    .context("Failed to register vsphere_task_submitted_total")?;

    let ipam_addresses_total = register_int_counter_vec!(
        "vsphere_ipam_addresses_total",
        "Addresses reserved or released through the IPAM agent",
        &["op"]
    )
    .context("Failed to register vsphere_ipam_addresses_total")?;

    let _ = RECONCILE_TOTAL.set(reconcile_total);
    let _ = SESSION_CACHE_TOTAL.set(session_cache_total);
    let _ = TASK_SUBMITTED_TOTAL.set(task_submitted_total);
    let _ = IPAM_ADDRESSES_TOTAL.set(ipam_addresses_total);
    Ok(())
}

pub fn record_reconcile(result: &str) {
    if let Some(counter) = RECONCILE_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

pub fn record_session_lookup(result: &str) {
    if let Some(counter) = SESSION_CACHE_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

pub fn record_task_submitted(kind: &str) {
    if let Some(counter) = TASK_SUBMITTED_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn record_ipam_addresses(op: &str, count: usize) {
    if let Some(counter) = IPAM_ADDRESSES_TOTAL.get() {
        counter.with_label_values(&[op]).inc_by(count as u64);
    }
}

/// Text exposition of the default registry
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
