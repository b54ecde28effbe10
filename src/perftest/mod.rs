//! Contracts every benchmarked operation implements, plus the name-keyed registry.

use crate::config::TestArgs;
use crate::options::PerfTestOptions;
use crate::recording::Transport;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Error type returned by test bodies
pub type PerfError = Box<dyn std::error::Error + Send + Sync>;

/// Deadline handed to every test call.
///
/// The runner never interrupts a call in flight; tests that want to stop early should
/// bound their own work with [`RunContext::remaining`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunContext {
    deadline: Option<Instant>,
}

impl RunContext {
    /// No deadline
    pub fn background() -> Self {
        Self { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(r) if r.is_zero())
    }
}

/// One worker's benchmarked operation
#[async_trait]
pub trait PerfTest: Send {
    /// The measured operation, called in a tight loop
    async fn run(&mut self, ctx: &RunContext) -> Result<(), PerfError>;

    /// Called once after measurement ends
    async fn cleanup(&mut self, _ctx: &RunContext) -> Result<(), PerfError> {
        Ok(())
    }
}

/// Process-wide state shared by every worker of one test
#[async_trait]
pub trait GlobalPerfTest: Send + Sync {
    /// Build the per-worker test bound to `options`
    async fn new_perf_test(
        &self,
        ctx: &RunContext,
        options: Arc<PerfTestOptions>,
    ) -> Result<Box<dyn PerfTest>, PerfError>;

    /// Called once after every worker has finished
    async fn global_cleanup(&mut self, _ctx: &RunContext) -> Result<(), PerfError> {
        Ok(())
    }
}

/// What a test sees during global setup
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub name: String,
    pub args: Arc<TestArgs>,
    /// Direct transport for setup traffic; never proxied
    pub transport: Transport,
}

/// Named entry point that performs global setup
#[async_trait]
pub trait PerfTestFactory: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn global_setup(
        &self,
        ctx: &RunContext,
        options: &GlobalOptions,
    ) -> Result<Box<dyn GlobalPerfTest>, PerfError>;
}

/// Tests available to the runner, keyed by name
#[derive(Default, Clone)]
pub struct Registry {
    factories: BTreeMap<String, Arc<dyn PerfTestFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the tests shipped with this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(crate::sleep::SleepFactory);
        registry.register(crate::http::HttpGetFactory);
        registry.register(crate::http::HttpUploadFactory);
        registry
    }

    pub fn register(&mut self, factory: impl PerfTestFactory + 'static) {
        self.factories
            .insert(factory.name().to_string(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PerfTestFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PerfTestFactory>> {
        self.factories.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_lists_tests_by_name() {
        let registry = Registry::builtin();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["http-get", "http-upload", "sleep"]);
        assert!(registry.get("sleep").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn context_deadline_counts_down() {
        let ctx = RunContext::with_timeout(Duration::from_secs(2));
        assert!(!ctx.is_expired());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert!(RunContext::background().remaining().is_none());
    }
}
