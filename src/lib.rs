pub mod config;
pub mod http;
pub mod metrics;
pub mod options;
pub mod perftest;
pub mod random;
pub mod recording;
pub mod report;
pub mod runner;
pub mod sleep;
pub mod status;

pub use config::{RunnerConfig, TestArgs};
pub use metrics::AtomicFloat;
pub use options::{PerfTestOptions, Phase};
pub use perftest::{GlobalOptions, GlobalPerfTest, PerfError, PerfTest, PerfTestFactory, Registry, RunContext};
pub use random::RandomStream;
pub use recording::{ProxyOptions, RecordMode, RecordingHttpClient, Transport};
pub use report::RunReport;
pub use runner::{FatalBenchmarkError, PerfRunner, RunnerError, WorkerStage};
