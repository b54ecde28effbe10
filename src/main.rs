use clap::{Parser, Subcommand, ValueEnum};
use perf_harness::config::{parse_duration, parse_proxy_list, RunnerConfig, TestArgs};
use perf_harness::report::{self, OutputFormat, RunReport};
use perf_harness::{PerfRunner, Registry};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "perf-harness",
    about = "Parallel throughput benchmarks with optional test-proxy playback",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a registered perf test
    Run(RunArgs),

    /// List registered perf tests
    List,

    /// Compare two result files written with --output json
    Compare(CompareArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Test name (overrides the config file)
    test: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Measurement duration per iteration (e.g., "10s", "1m")
    #[arg(short, long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Number of warm-up + measurement cycles
    #[arg(short, long)]
    iterations: Option<u32>,

    /// Number of parallel workers
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Warm-up duration; 0 disables warm-up
    #[arg(short, long = "warm-up", value_parser = parse_duration)]
    warmup: Option<Duration>,

    /// Skip per-test and global cleanup
    #[arg(long)]
    no_cleanup: bool,

    /// Skip TLS verification on direct connections
    #[arg(long)]
    insecure: bool,

    /// Test-proxy endpoints separated by ';'
    #[arg(short = 'x', long)]
    test_proxies: Option<String>,

    /// Test arguments (can be specified multiple times)
    #[arg(short = 'a', long = "arg")]
    args: Vec<String>,

    /// Output format
    #[arg(short, long)]
    output: Option<OutputFormatArg>,

    /// Output file path
    #[arg(long)]
    output_file: Option<String>,

    /// Disable the live status table
    #[arg(long)]
    no_progress: bool,
}

#[derive(Parser)]
struct CompareArgs {
    /// Baseline result file (JSON)
    #[arg(required = true)]
    baseline: String,

    /// Current result file (JSON)
    #[arg(required = true)]
    current: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormatArg {
    Text,
    Json,
    Csv,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Text => OutputFormat::Text,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Csv => OutputFormat::Csv,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("perf_harness=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_test(args).await,
        Commands::List => list_tests(),
        Commands::Compare(args) => compare_results(args),
    }
}

fn build_config(args: RunArgs) -> Result<RunnerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path);
            RunnerConfig::from_file(path)?
        }
        None => RunnerConfig::default(),
    };

    if let Some(test) = args.test {
        config.test = test;
    }
    if let Some(duration) = args.duration {
        config.duration = duration;
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
    }
    if let Some(warmup) = args.warmup {
        config.warmup = warmup;
    }
    if let Some(proxies) = args.test_proxies {
        config.test_proxies = parse_proxy_list(&proxies);
    }
    config.no_cleanup |= args.no_cleanup;
    config.insecure |= args.insecure;
    config.args.merge(TestArgs::from_pairs(&args.args)?);

    if let Some(output) = args.output {
        config.output.format = match output {
            OutputFormatArg::Text => "text",
            OutputFormatArg::Json => "json",
            OutputFormatArg::Csv => "csv",
        }
        .to_string();
    }
    if args.output_file.is_some() {
        config.output.file = args.output_file;
    }
    if args.no_progress {
        config.output.progress = false;
    }

    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

async fn run_test(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(args)?;
    let registry = Registry::builtin();
    let factory = registry.get(&config.test).ok_or_else(|| {
        let known: Vec<_> = registry.names().collect();
        format!(
            "Unknown test: {}. Available tests: {}",
            config.test,
            known.join(", ")
        )
    })?;

    let format: OutputFormat = config.output.format.parse()?;
    let file = config.output.file.clone();

    let mut runner = PerfRunner::new(config, factory);
    let reports = runner.run().await?;

    output_reports(&reports, format, file.as_deref())
}

fn list_tests() -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::builtin();
    for factory in registry.iter() {
        println!("{:<16}{}", factory.name(), factory.description());
    }
    Ok(())
}

fn compare_results(args: CompareArgs) -> Result<(), Box<dyn std::error::Error>> {
    let baseline = report::load_reports(&std::fs::read_to_string(&args.baseline)?)?;
    let current = report::load_reports(&std::fs::read_to_string(&args.current)?)?;

    for (baseline, current) in baseline.iter().zip(current.iter()) {
        report::compare_reports(baseline, current).print();
    }

    Ok(())
}

/// The runner already printed text results; only machine formats and files remain
fn output_reports(
    reports: &[RunReport],
    format: OutputFormat,
    file_path: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rendered = match format {
        OutputFormat::Text => None,
        other => Some(report::render_reports(reports, other)?),
    };

    match (rendered, file_path) {
        (Some(content), Some(path)) => {
            std::fs::write(path, content)?;
            println!("Results written to {}", path);
        }
        (Some(content), None) => println!("{}", content),
        // text on screen, JSON on disk
        (None, Some(path)) => {
            std::fs::write(path, report::render_reports(reports, OutputFormat::Json)?)?;
            println!("Results written to {}", path);
        }
        (None, None) => {}
    }

    Ok(())
}
