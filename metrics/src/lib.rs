pub mod server;

use anyhow::Result;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    chain_best_block: IntGauge,
    // Sync
    sync_running: IntGauge,
    sync_target_block: IntGauge,
    sync_ancestor_block: IntGauge,
    sync_last_added_block: IntGauge,
    sync_max_requested_block: IntGauge,
    sync_runs_finished: IntCounterVec,
    sync_run_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let chain_best_block = IntGauge::with_opts(Opts::new("chain_best_block", "Height of the local best block"))?;
        registry.register(Box::new(chain_best_block.clone()))?;

        // Sync
        let sync_running = IntGauge::with_opts(Opts::new("sync_running", "Whether a sync run is in progress"))?;
        registry.register(Box::new(sync_running.clone()))?;

        let sync_target_block = IntGauge::with_opts(Opts::new("sync_target_block", "Target height of the current sync run"))?;
        registry.register(Box::new(sync_target_block.clone()))?;

        let sync_ancestor_block = IntGauge::with_opts(Opts::new("sync_ancestor_block", "Common ancestor height of the current sync run"))?;
        registry.register(Box::new(sync_ancestor_block.clone()))?;

        let sync_last_added_block = IntGauge::with_opts(Opts::new("sync_last_added_block", "Highest block applied by the current sync run"))?;
        registry.register(Box::new(sync_last_added_block.clone()))?;

        let sync_max_requested_block = IntGauge::with_opts(Opts::new("sync_max_requested_block", "Highest block requested by the current sync run"))?;
        registry.register(Box::new(sync_max_requested_block.clone()))?;

        let sync_runs_finished = IntCounterVec::new(
            Opts::new("sync_runs_finished_total", "Total number of finished sync runs"),
            &["result"],
        )?;
        registry.register(Box::new(sync_runs_finished.clone()))?;

        let sync_run_duration = HistogramVec::new(
            HistogramOpts::new("sync_run_duration_seconds", "Time from sync start to finish")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &[],
        )?;
        registry.register(Box::new(sync_run_duration.clone()))?;

        Ok(Self {
            registry,
            chain_best_block,
            sync_running,
            sync_target_block,
            sync_ancestor_block,
            sync_last_added_block,
            sync_max_requested_block,
            sync_runs_finished,
            sync_run_duration,
        })
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn set_chain_best_block(&self, v: i64) {
        self.chain_best_block.set(v);
    }

    // Sync
    pub fn set_sync_running(&self, running: bool) {
        self.sync_running.set(i64::from(running));
    }

    pub fn set_sync_target_block(&self, v: i64) {
        self.sync_target_block.set(v);
    }

    pub fn set_sync_ancestor_block(&self, v: i64) {
        self.sync_ancestor_block.set(v);
    }

    pub fn set_sync_last_added_block(&self, v: i64) {
        self.sync_last_added_block.set(v);
    }

    pub fn set_sync_max_requested_block(&self, v: i64) {
        self.sync_max_requested_block.set(v);
    }

    pub fn inc_sync_runs_finished(&self, result: &str) {
        self.sync_runs_finished.with_label_values(&[result]).inc();
    }

    pub fn observe_sync_run_duration(&self, duration: f64) {
        self.sync_run_duration.with_label_values::<&str>(&[]).observe(duration);
    }
}

pub type SharedMetrics = Arc<Metrics>;
