//! Orchestrates one perf run: global setup, N workers, status, final report, cleanup.

use crate::config::{ConfigError, RunnerConfig};
use crate::metrics::LatencySnapshot;
use crate::options::{PerfTestOptions, Phase};
use crate::perftest::{
    GlobalOptions, GlobalPerfTest, PerfError, PerfTest, PerfTestFactory, RunContext,
};
use crate::recording::{
    ProxyOptions, RecordMode, RecordingError, RecordingHttpClient, Transport,
};
use crate::report::RunReport;
use crate::status::{PhaseStats, StatsError, StatusReporter};
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where in its lifecycle a worker failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStage {
    ProxyLive,
    ProxyRecord,
    ProxyPlayback,
    Warmup,
    Measurement,
    ProxyTeardown,
    Task,
}

impl std::fmt::Display for WorkerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStage::ProxyLive => "live request",
            WorkerStage::ProxyRecord => "proxy recording",
            WorkerStage::ProxyPlayback => "proxy playback setup",
            WorkerStage::Warmup => "warm-up",
            WorkerStage::Measurement => "measurement",
            WorkerStage::ProxyTeardown => "proxy teardown",
            WorkerStage::Task => "worker task",
        };
        f.write_str(s)
    }
}

/// A worker failure that invalidates the whole run's statistics
#[derive(Debug)]
pub struct FatalBenchmarkError {
    pub worker: String,
    pub stage: WorkerStage,
    pub source: PerfError,
}

impl FatalBenchmarkError {
    pub fn new(worker: impl Into<String>, stage: WorkerStage, source: impl Into<PerfError>) -> Self {
        Self {
            worker: worker.into(),
            stage,
            source: source.into(),
        }
    }
}

impl std::fmt::Display for FatalBenchmarkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Worker {} failed during {}: {}",
            self.worker, self.stage, self.source
        )
    }
}

impl std::error::Error for FatalBenchmarkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
pub enum RunnerError {
    Config(ConfigError),
    Client(String),
    Recording(RecordingError),
    Setup(PerfError),
    Fatal(FatalBenchmarkError),
    Stats(StatsError),
    Cleanup(PerfError),
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Config(e) => write!(f, "Configuration error: {}", e),
            RunnerError::Client(e) => write!(f, "Failed to build HTTP client: {}", e),
            RunnerError::Recording(e) => write!(f, "Proxy transport error: {}", e),
            RunnerError::Setup(e) => write!(f, "Test setup failed: {}", e),
            RunnerError::Fatal(e) => write!(f, "Benchmark aborted: {}", e),
            RunnerError::Stats(e) => write!(f, "Statistics error: {}", e),
            RunnerError::Cleanup(e) => write!(f, "Cleanup failed: {}", e),
        }
    }
}

impl std::error::Error for RunnerError {}

impl From<ConfigError> for RunnerError {
    fn from(e: ConfigError) -> Self {
        RunnerError::Config(e)
    }
}

impl From<RecordingError> for RunnerError {
    fn from(e: RecordingError) -> Self {
        RunnerError::Recording(e)
    }
}

impl From<FatalBenchmarkError> for RunnerError {
    fn from(e: FatalBenchmarkError) -> Self {
        RunnerError::Fatal(e)
    }
}

impl From<StatsError> for RunnerError {
    fn from(e: StatsError) -> Self {
        RunnerError::Stats(e)
    }
}

#[derive(Debug, Clone, Copy)]
struct PhaseDurations {
    warmup: Duration,
    duration: Duration,
}

struct WorkerOutcome {
    test: Box<dyn PerfTest>,
    result: Result<(), FatalBenchmarkError>,
}

/// Runs one registered test under a [`RunnerConfig`]
pub struct PerfRunner {
    config: RunnerConfig,
    factory: Arc<dyn PerfTestFactory>,
    workers: Vec<Arc<PerfTestOptions>>,
    tests: Vec<Box<dyn PerfTest>>,
    proxy_transports: HashMap<String, Arc<RecordingHttpClient>>,
}

impl PerfRunner {
    pub fn new(config: RunnerConfig, factory: Arc<dyn PerfTestFactory>) -> Self {
        Self {
            config,
            factory,
            workers: Vec::new(),
            tests: Vec::new(),
            proxy_transports: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Workers of the most recent iteration
    pub fn workers(&self) -> &[Arc<PerfTestOptions>] {
        &self.workers
    }

    pub fn proxy_transport(&self, worker_id: &str) -> Option<&Arc<RecordingHttpClient>> {
        self.proxy_transports.get(worker_id)
    }

    /// Run every iteration and return one report per iteration
    pub async fn run(&mut self) -> Result<Vec<RunReport>, RunnerError> {
        self.config.validate()?;
        let ctx = RunContext::background();
        let direct = build_direct_client(&self.config)?;
        let args = Arc::new(self.config.args.clone());

        info!(
            "Starting {} with {} parallel workers for {} iteration(s)",
            self.factory.name(),
            self.config.parallel,
            self.config.iterations
        );

        let global_options = GlobalOptions {
            name: self.factory.name().to_string(),
            args: Arc::clone(&args),
            transport: Transport::Direct(direct.clone()),
        };
        let mut global = self
            .factory
            .global_setup(&ctx, &global_options)
            .await
            .map_err(RunnerError::Setup)?;

        let mut reports = Vec::with_capacity(self.config.iterations as usize);
        for iteration in 0..self.config.iterations {
            let outcome = match self
                .create_perf_tests(global.as_ref(), &direct, &args)
                .await
            {
                Ok(()) => self.run_iteration(iteration).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(report) => {
                    report.print_text();
                    reports.push(report);
                    self.cleanup_tests(&ctx).await?;
                }
                Err(e) => {
                    self.abandon(&ctx, global.as_mut()).await;
                    return Err(e);
                }
            }
        }

        if self.config.no_cleanup {
            info!("Skipping global cleanup");
        } else {
            global
                .global_cleanup(&ctx)
                .await
                .map_err(RunnerError::Cleanup)?;
        }

        Ok(reports)
    }

    /// Build one test per worker, each wired to a direct or proxied transport
    async fn create_perf_tests(
        &mut self,
        global: &dyn GlobalPerfTest,
        direct: &Client,
        args: &Arc<crate::config::TestArgs>,
    ) -> Result<(), RunnerError> {
        self.workers.clear();
        self.tests.clear();
        self.proxy_transports.clear();

        let name = self.factory.name().to_string();
        let proxy_urls = self.proxy_urls()?;
        let ctx = RunContext::background();

        for index in 0..self.config.parallel {
            let transport = if proxy_urls.is_empty() {
                Transport::Direct(direct.clone())
            } else {
                let url = proxy_urls[index % proxy_urls.len()].clone();
                let id = format!("{}-{}", name, index);
                debug!("Worker {} uses test proxy {}", id, url);
                let options = ProxyOptions::for_url(url)
                    .with_cert(self.config.proxy_cert.clone())
                    .with_variables(self.config.proxy_variables.clone());
                let client = Arc::new(RecordingHttpClient::new(options, id.as_str())?);
                self.proxy_transports.insert(id, Arc::clone(&client));
                Transport::Recording(client)
            };

            let options = Arc::new(PerfTestOptions::new(
                name.as_str(),
                index,
                transport,
                Arc::clone(args),
            ));
            let test = global
                .new_perf_test(&ctx, Arc::clone(&options))
                .await
                .map_err(RunnerError::Setup)?;

            self.workers.push(options);
            self.tests.push(test);
        }

        Ok(())
    }

    fn proxy_urls(&self) -> Result<Vec<url::Url>, RunnerError> {
        let urls = self.config.proxy_urls()?;
        if urls.is_empty() {
            return Ok(urls);
        }
        if self.config.effective_record_mode()? == RecordMode::Live {
            info!("Record mode is live; bypassing {} test proxies", urls.len());
            return Ok(Vec::new());
        }
        Ok(urls)
    }

    async fn run_iteration(&mut self, iteration: u32) -> Result<RunReport, RunnerError> {
        let started_at = Utc::now();
        let phases = PhaseDurations {
            warmup: self.config.warmup,
            duration: self.config.duration,
        };

        let (done_tx, done_rx) = watch::channel(false);
        let reporter = if self.config.output.progress {
            let reporter = StatusReporter::new(self.workers.clone(), !phases.warmup.is_zero());
            Some(tokio::spawn(
                reporter.run(self.config.output.progress_interval, done_rx),
            ))
        } else {
            None
        };

        // cleared by the first worker that fails; peers stop at their next loop check
        let running = Arc::new(AtomicBool::new(true));
        let handles: Vec<_> = self
            .workers
            .iter()
            .zip(self.tests.drain(..))
            .map(|(options, test)| {
                tokio::spawn(run_test(
                    test,
                    Arc::clone(options),
                    phases,
                    Arc::clone(&running),
                ))
            })
            .collect();

        let mut fatal = None;
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(outcome) => {
                    self.tests.push(outcome.test);
                    if let Err(e) = outcome.result {
                        warn!("{}", e);
                        fatal.get_or_insert(e);
                    }
                }
                Err(e) => {
                    let worker = self.workers[index].id();
                    warn!("Worker {} task failed: {}", worker, e);
                    fatal.get_or_insert(FatalBenchmarkError::new(
                        worker,
                        WorkerStage::Task,
                        e.to_string(),
                    ));
                }
            }
        }

        let _ = done_tx.send(true);
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        if let Some(e) = fatal {
            return Err(RunnerError::Fatal(e));
        }

        let stats = PhaseStats::for_phase(&self.workers, Phase::Measurement)?;
        let latency = LatencySnapshot::merged(self.workers.iter().map(|w| w.latency()));
        Ok(RunReport::new(
            self.factory.name(),
            iteration,
            &self.config,
            stats,
            latency,
            started_at,
        ))
    }

    async fn cleanup_tests(&mut self, ctx: &RunContext) -> Result<(), RunnerError> {
        if self.config.no_cleanup {
            info!("Skipping per-test cleanup");
            self.tests.clear();
            return Ok(());
        }
        for mut test in self.tests.drain(..) {
            test.cleanup(ctx).await.map_err(RunnerError::Cleanup)?;
        }
        Ok(())
    }

    /// Best-effort cleanup after a failed iteration; failures are only logged
    async fn abandon(&mut self, ctx: &RunContext, global: &mut dyn GlobalPerfTest) {
        if self.config.no_cleanup {
            return;
        }
        for mut test in self.tests.drain(..) {
            if let Err(e) = test.cleanup(ctx).await {
                warn!("Cleanup after failure also failed: {}", e);
            }
        }
        if let Err(e) = global.global_cleanup(ctx).await {
            warn!("Global cleanup after failure also failed: {}", e);
        }
    }
}

fn build_direct_client(config: &RunnerConfig) -> Result<Client, RunnerError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.parallel)
        .tcp_keepalive(Duration::from_secs(60));

    if config.insecure {
        client_builder = client_builder.danger_accept_invalid_certs(true);
    }

    client_builder
        .build()
        .map_err(|e| RunnerError::Client(e.to_string()))
}

async fn run_test(
    mut test: Box<dyn PerfTest>,
    options: Arc<PerfTestOptions>,
    phases: PhaseDurations,
    running: Arc<AtomicBool>,
) -> WorkerOutcome {
    let result = drive_worker(test.as_mut(), &options, phases, &running).await;
    if result.is_err() {
        running.store(false, Ordering::SeqCst);
    }
    WorkerOutcome { test, result }
}

async fn drive_worker(
    test: &mut dyn PerfTest,
    options: &PerfTestOptions,
    phases: PhaseDurations,
    running: &AtomicBool,
) -> Result<(), FatalBenchmarkError> {
    let proxy = options.transport().recording().cloned();

    if let Some(proxy) = &proxy {
        establish_playback(test, options, proxy).await?;
    }

    if !phases.warmup.is_zero() {
        run_phase(test, options, Phase::Warmup, phases.warmup, running).await?;
    }
    run_phase(test, options, Phase::Measurement, phases.duration, running).await?;

    if let Some(proxy) = &proxy {
        proxy
            .stop()
            .await
            .map_err(|e| FatalBenchmarkError::new(options.id(), WorkerStage::ProxyTeardown, e))?;
        proxy.set_record_mode(RecordMode::Live);
    }

    if !running.load(Ordering::SeqCst) {
        debug!("Worker {} stopped early after a peer failed", options.id());
        return Ok(());
    }
    options.mark_finished();
    debug!("Worker {} finished", options.id());
    Ok(())
}

/// live request -> record one request -> start playback of that recording
async fn establish_playback(
    test: &mut dyn PerfTest,
    options: &PerfTestOptions,
    proxy: &RecordingHttpClient,
) -> Result<(), FatalBenchmarkError> {
    let id = options.id();
    let ctx = RunContext::background();

    test.run(&ctx)
        .await
        .map_err(|e| FatalBenchmarkError::new(id.as_str(), WorkerStage::ProxyLive, e))?;

    proxy.set_record_mode(RecordMode::Record);
    let record = async {
        proxy.start().await?;
        test.run(&ctx).await?;
        proxy.stop().await?;
        Ok::<(), PerfError>(())
    };
    record
        .await
        .map_err(|e| FatalBenchmarkError::new(id.as_str(), WorkerStage::ProxyRecord, e))?;

    proxy.set_record_mode(RecordMode::Playback);
    proxy
        .start()
        .await
        .map_err(|e| FatalBenchmarkError::new(id.as_str(), WorkerStage::ProxyPlayback, e))?;

    debug!(
        "Worker {} replaying recording {}",
        id,
        proxy.recording_id().unwrap_or_default()
    );
    Ok(())
}

async fn run_phase(
    test: &mut dyn PerfTest,
    options: &PerfTestOptions,
    phase: Phase,
    duration: Duration,
    running: &AtomicBool,
) -> Result<(), FatalBenchmarkError> {
    let stage = match phase {
        Phase::Warmup => WorkerStage::Warmup,
        Phase::Measurement => WorkerStage::Measurement,
    };
    let ctx = RunContext::with_timeout(duration);
    let snapshot_every = phase.snapshot_interval();
    let start = Instant::now();
    let mut last_snapshot = start;
    options.begin_phase(phase, start);

    while running.load(Ordering::SeqCst) && start.elapsed() < duration {
        let op_start = Instant::now();
        test.run(&ctx)
            .await
            .map_err(|e| FatalBenchmarkError::new(options.id(), stage, e))?;
        if phase == Phase::Measurement {
            options.latency().record(op_start.elapsed());
        }
        options.record_op(phase);

        let now = Instant::now();
        if now.duration_since(last_snapshot) >= snapshot_every {
            options.publish_elapsed(phase, now.duration_since(start).as_secs_f64());
            last_snapshot = now;
        }
    }

    options.publish_elapsed(phase, start.elapsed().as_secs_f64());
    debug!(
        "Worker {} completed {} with {} operations",
        options.id(),
        phase.label(),
        options.count(phase)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestArgs;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct StepTest {
        step: Duration,
        fail_after: Option<usize>,
        calls: usize,
    }

    #[async_trait]
    impl PerfTest for StepTest {
        async fn run(&mut self, _ctx: &RunContext) -> Result<(), PerfError> {
            self.calls += 1;
            if let Some(limit) = self.fail_after {
                if self.calls > limit {
                    return Err("boom".into());
                }
            }
            tokio::time::sleep(self.step).await;
            Ok(())
        }
    }

    fn step_options(index: usize) -> Arc<PerfTestOptions> {
        Arc::new(PerfTestOptions::new(
            "step",
            index,
            Transport::Direct(Client::new()),
            Arc::new(TestArgs::new()),
        ))
    }

    fn options() -> Arc<PerfTestOptions> {
        step_options(0)
    }

    #[tokio::test(start_paused = true)]
    async fn phase_counts_operations_until_deadline() {
        let opts = options();
        let mut test = StepTest {
            step: Duration::from_millis(10),
            fail_after: None,
            calls: 0,
        };

        let running = AtomicBool::new(true);
        run_phase(&mut test, &opts, Phase::Measurement, Duration::from_secs(1), &running)
            .await
            .unwrap();

        assert_eq!(opts.run_count(), 100);
        assert!((opts.run_elapsed() - 1.0).abs() < 1e-6);
        assert_eq!(opts.warmup_count(), 0);
        assert_eq!(opts.latency().count(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn warmup_does_not_touch_measurement_counters() {
        let opts = options();
        let mut test = StepTest {
            step: Duration::from_millis(100),
            fail_after: None,
            calls: 0,
        };

        let running = AtomicBool::new(true);
        run_phase(&mut test, &opts, Phase::Warmup, Duration::from_secs(1), &running)
            .await
            .unwrap();

        assert_eq!(opts.warmup_count(), 10);
        assert_eq!(opts.run_count(), 0);
        assert_eq!(opts.latency().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_error_is_fatal_for_the_worker() {
        let opts = options();
        let test = StepTest {
            step: Duration::from_millis(10),
            fail_after: Some(3),
            calls: 0,
        };

        let outcome = run_test(
            Box::new(test),
            Arc::clone(&opts),
            PhaseDurations {
                warmup: Duration::ZERO,
                duration: Duration::from_secs(1),
            },
            Arc::new(AtomicBool::new(true)),
        )
        .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.worker, "step-0");
        assert_eq!(err.stage, WorkerStage::Measurement);
        assert_eq!(opts.run_count(), 3);
        assert!(!opts.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_runs_warmup_then_measurement() {
        let opts = options();
        let test = StepTest {
            step: Duration::from_millis(50),
            fail_after: None,
            calls: 0,
        };

        let outcome = run_test(
            Box::new(test),
            Arc::clone(&opts),
            PhaseDurations {
                warmup: Duration::from_millis(500),
                duration: Duration::from_secs(1),
            },
            Arc::new(AtomicBool::new(true)),
        )
        .await;

        assert!(outcome.result.is_ok());
        assert_eq!(opts.warmup_count(), 10);
        assert_eq!(opts.run_count(), 20);
        assert!(opts.is_finished());
        let warmup_start = opts.started_at(Phase::Warmup).unwrap();
        let run_start = opts.started_at(Phase::Measurement).unwrap();
        assert!(run_start >= warmup_start + Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_stops_peer_workers() {
        let running = Arc::new(AtomicBool::new(true));
        let phases = PhaseDurations {
            warmup: Duration::ZERO,
            duration: Duration::from_secs(60),
        };
        let healthy_opts = step_options(0);
        let failing_opts = step_options(1);

        let healthy = tokio::spawn(run_test(
            Box::new(StepTest {
                step: Duration::from_millis(10),
                fail_after: None,
                calls: 0,
            }),
            Arc::clone(&healthy_opts),
            phases,
            Arc::clone(&running),
        ));
        let failing = tokio::spawn(run_test(
            Box::new(StepTest {
                step: Duration::from_millis(10),
                fail_after: Some(5),
                calls: 0,
            }),
            Arc::clone(&failing_opts),
            phases,
            Arc::clone(&running),
        ));

        let start = Instant::now();
        let failing = failing.await.unwrap();
        let healthy = healthy.await.unwrap();

        assert!(failing.result.is_err());
        assert!(healthy.result.is_ok());
        assert!(!running.load(Ordering::SeqCst));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(healthy_opts.run_count() < 10);
        assert!(!healthy_opts.is_finished());
    }

    struct CountingGlobal {
        created: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GlobalPerfTest for CountingGlobal {
        async fn new_perf_test(
            &self,
            _ctx: &RunContext,
            _options: Arc<PerfTestOptions>,
        ) -> Result<Box<dyn PerfTest>, PerfError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StepTest {
                step: Duration::from_millis(1),
                fail_after: None,
                calls: 0,
            }))
        }
    }

    struct CountingFactory;

    #[async_trait]
    impl PerfTestFactory for CountingFactory {
        fn name(&self) -> &str {
            "counting"
        }

        async fn global_setup(
            &self,
            _ctx: &RunContext,
            _options: &GlobalOptions,
        ) -> Result<Box<dyn GlobalPerfTest>, PerfError> {
            Ok(Box::new(CountingGlobal {
                created: Arc::new(AtomicUsize::new(0)),
            }))
        }
    }

    #[tokio::test]
    async fn proxies_are_assigned_round_robin() {
        let mut config = RunnerConfig::for_test("counting");
        config.parallel = 5;
        config.record_mode = Some(RecordMode::Playback);
        config.test_proxies = vec![
            "http://127.0.0.1:5100".to_string(),
            "http://127.0.0.1:5200".to_string(),
        ];

        let created = Arc::new(AtomicUsize::new(0));
        let global = CountingGlobal {
            created: Arc::clone(&created),
        };
        let mut runner = PerfRunner::new(config, Arc::new(CountingFactory));
        let args = Arc::new(TestArgs::new());
        runner
            .create_perf_tests(&global, &Client::new(), &args)
            .await
            .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 5);
        assert_eq!(runner.workers().len(), 5);
        let hosts: Vec<_> = (0..5)
            .map(|i| {
                runner
                    .proxy_transport(&format!("counting-{}", i))
                    .unwrap()
                    .options()
                    .base_url()
            })
            .collect();
        assert_eq!(
            hosts,
            vec![
                "http://127.0.0.1:5100",
                "http://127.0.0.1:5200",
                "http://127.0.0.1:5100",
                "http://127.0.0.1:5200",
                "http://127.0.0.1:5100",
            ]
        );
    }

    #[tokio::test]
    async fn live_record_mode_bypasses_proxies() {
        let mut config = RunnerConfig::for_test("counting");
        config.parallel = 2;
        config.record_mode = Some(RecordMode::Live);
        config.test_proxies = vec!["http://127.0.0.1:5100".to_string()];

        let global = CountingGlobal {
            created: Arc::new(AtomicUsize::new(0)),
        };
        let mut runner = PerfRunner::new(config, Arc::new(CountingFactory));
        runner
            .create_perf_tests(&global, &Client::new(), &Arc::new(TestArgs::new()))
            .await
            .unwrap();

        assert!(runner.workers().iter().all(|w| !w.transport().is_proxied()));
        assert!(runner.proxy_transport("counting-0").is_none());
    }

    #[test]
    fn fatal_error_names_worker_and_stage() {
        let err = FatalBenchmarkError::new("suite-2", WorkerStage::ProxyRecord, "no id");
        assert_eq!(
            err.to_string(),
            "Worker suite-2 failed during proxy recording: no id"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
