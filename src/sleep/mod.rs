//! `sleep`: a no-I/O test that measures the runner's own overhead.

use crate::options::PerfTestOptions;
use crate::perftest::{GlobalOptions, GlobalPerfTest, PerfError, PerfTest, PerfTestFactory, RunContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DELAY: Duration = Duration::from_millis(1);

pub struct SleepFactory;

#[async_trait]
impl PerfTestFactory for SleepFactory {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps for `delay` (default 1ms) per operation"
    }

    async fn global_setup(
        &self,
        _ctx: &RunContext,
        options: &GlobalOptions,
    ) -> Result<Box<dyn GlobalPerfTest>, PerfError> {
        let delay = options.args.duration_or("delay", DEFAULT_DELAY)?;
        Ok(Box::new(SleepGlobal { delay }))
    }
}

struct SleepGlobal {
    delay: Duration,
}

#[async_trait]
impl GlobalPerfTest for SleepGlobal {
    async fn new_perf_test(
        &self,
        _ctx: &RunContext,
        _options: Arc<PerfTestOptions>,
    ) -> Result<Box<dyn PerfTest>, PerfError> {
        Ok(Box::new(SleepTest { delay: self.delay }))
    }
}

struct SleepTest {
    delay: Duration,
}

#[async_trait]
impl PerfTest for SleepTest {
    async fn run(&mut self, _ctx: &RunContext) -> Result<(), PerfError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
