//! Per-worker state shared between the worker task and the status reporter.

use crate::config::TestArgs;
use crate::metrics::{AtomicFloat, LatencyHistogram, OpCounter};
use crate::recording::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

/// Timed loop a worker is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Measurement,
}

impl Phase {
    /// Minimum wall-clock gap between two elapsed-time snapshots
    pub fn snapshot_interval(&self) -> Duration {
        match self {
            Phase::Warmup => Duration::from_millis(300),
            Phase::Measurement => Duration::from_millis(100),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Warmup => "warm-up",
            Phase::Measurement => "measurement",
        }
    }
}

#[derive(Debug, Default)]
struct PhaseState {
    count: OpCounter,
    elapsed: AtomicFloat,
    start: OnceLock<Instant>,
}

/// State for one parallel worker.
///
/// Counters and elapsed cells are written only by the owning worker; everyone else reads.
#[derive(Debug)]
pub struct PerfTestOptions {
    name: String,
    parallel_index: usize,
    transport: Transport,
    args: Arc<TestArgs>,
    warmup: PhaseState,
    run: PhaseState,
    latency: LatencyHistogram,
    finished: AtomicBool,
}

impl PerfTestOptions {
    pub fn new(
        name: impl Into<String>,
        parallel_index: usize,
        transport: Transport,
        args: Arc<TestArgs>,
    ) -> Self {
        Self {
            name: name.into(),
            parallel_index,
            transport,
            args,
            warmup: PhaseState::default(),
            run: PhaseState::default(),
            latency: LatencyHistogram::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique worker id, `<name>-<index>`
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.parallel_index)
    }

    pub fn parallel_index(&self) -> usize {
        self.parallel_index
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn args(&self) -> &TestArgs {
        &self.args
    }

    fn phase(&self, phase: Phase) -> &PhaseState {
        match phase {
            Phase::Warmup => &self.warmup,
            Phase::Measurement => &self.run,
        }
    }

    pub fn count(&self, phase: Phase) -> u64 {
        self.phase(phase).count.get()
    }

    /// Seconds since the phase started, as of the last snapshot
    pub fn elapsed(&self, phase: Phase) -> f64 {
        self.phase(phase).elapsed.get()
    }

    pub fn started_at(&self, phase: Phase) -> Option<Instant> {
        self.phase(phase).start.get().copied()
    }

    pub fn run_count(&self) -> u64 {
        self.count(Phase::Measurement)
    }

    pub fn warmup_count(&self) -> u64 {
        self.count(Phase::Warmup)
    }

    pub fn run_elapsed(&self) -> f64 {
        self.elapsed(Phase::Measurement)
    }

    pub fn warmup_elapsed(&self) -> f64 {
        self.elapsed(Phase::Warmup)
    }

    pub fn latency(&self) -> &LatencyHistogram {
        &self.latency
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn begin_phase(&self, phase: Phase, start: Instant) {
        let _ = self.phase(phase).start.set(start);
    }

    pub(crate) fn record_op(&self, phase: Phase) {
        self.phase(phase).count.incr();
    }

    pub(crate) fn publish_elapsed(&self, phase: Phase, seconds: f64) {
        let cell = &self.phase(phase).elapsed;
        if seconds > cell.get() {
            cell.set(seconds);
        }
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set_phase_totals(&self, phase: Phase, count: u64, elapsed: f64) {
        let state = self.phase(phase);
        state.count.set(count);
        state.elapsed.set(elapsed);
    }
}
