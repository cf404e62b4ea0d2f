//! Audio Editor E2E - Main Entry Point
//!
//! Runs YAML scenarios against a running instance of the audio editor.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

use audio_editor_e2e::config::Browser;
use audio_editor_e2e::playwright::{PlaywrightConfig, PlaywrightLauncher};
use audio_editor_e2e::probe::AppProbe;
use audio_editor_e2e::runner::{load_scenarios, ScenarioRunner, SuiteResult};
use audio_editor_e2e::{HarnessConfig, RunContext, Scenario};

/// Browser verification harness for the TTS audio editor
#[derive(Parser)]
#[command(name = "audio-editor-e2e")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios from a file or directory
    Run(RunArgs),

    /// List scenarios without running them
    List {
        /// Scenario file or directory
        path: PathBuf,
    },

    /// Parse and validate scenarios
    Validate {
        /// Scenario file or directory
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Scenario file or directory
    path: PathBuf,

    /// Only run the scenario with this name
    #[arg(long)]
    name: Option<String>,

    /// Only run scenarios carrying this tag
    #[arg(long)]
    tag: Option<String>,

    /// Base URL of the application under test
    #[arg(long, env = "E2E_BASE_URL")]
    base_url: Option<String>,

    /// Directory for screenshots and reports
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default per-step timeout
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// chromium, firefox or webkit
    #[arg(long)]
    browser: Option<Browser>,

    /// Skip waiting for the application to answer HTTP
    #[arg(long)]
    skip_probe: bool,
}

const EXIT_INTERNAL: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::List { path } => list(path).map(|_| 0),
        Commands::Validate { path } => validate(path).map(|_| 0),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<u8> {
    let mut config = HarnessConfig::load(args.config.as_deref())?;
    if let Some(base_url) = args.base_url {
        config.base_url = Some(base_url);
    }
    if let Some(dir) = args.artifacts {
        config.artifact_dir = dir;
    }
    if let Some(ms) = args.timeout_ms {
        config.default_timeout_ms = ms;
    }
    if let Some(browser) = args.browser {
        config.browser = browser;
    }
    let ctx = RunContext::from_config(&config)?;

    let scenarios = load_scenarios(&args.path)
        .with_context(|| format!("loading scenarios from {}", args.path.display()))?;
    let selected: Vec<&Scenario> = scenarios
        .iter()
        .filter(|s| args.name.as_deref().map_or(true, |n| s.name() == n))
        .filter(|s| args.tag.as_deref().map_or(true, |t| s.tags().iter().any(|tag| tag == t)))
        .collect();
    if selected.is_empty() {
        anyhow::bail!("no scenarios matched in {}", args.path.display());
    }

    if !args.skip_probe {
        AppProbe::default().wait_until_reachable(&ctx.base_url).await?;
    }

    let launcher = PlaywrightLauncher::new(PlaywrightConfig::from(&config)).await?;
    let runner = ScenarioRunner::new(Arc::new(launcher), ctx);

    info!("Running {} scenario(s)...", selected.len());
    let suite = runner.run_all(selected).await;
    runner.write_results(&suite)?;
    print_report(&suite);

    Ok(suite.exit_code() as u8)
}

fn print_report(suite: &SuiteResult) {
    for result in &suite.results {
        if result.passed() {
            println!("✓ {} ({} ms)", result.scenario, result.duration_ms);
        } else {
            eprint!("{}", result.diagnostics());
        }
    }
    for error in &suite.errors {
        eprintln!("Scenario '{}': executor error: {}", error.scenario, error.message);
    }
    println!(
        "\n{} passed, {} failed, {} timed out, {} errored ({} ms)",
        suite.passed,
        suite.failed,
        suite.timed_out,
        suite.errors.len(),
        suite.duration_ms
    );
}

fn list(path: PathBuf) -> anyhow::Result<()> {
    let scenarios = load_scenarios(&path)?;
    for scenario in &scenarios {
        let tags = if scenario.tags().is_empty() {
            String::new()
        } else {
            format!(" [{}]", scenario.tags().join(", "))
        };
        println!(
            "{}{} - {} step(s), {} route(s)",
            scenario.name(),
            tags,
            scenario.steps().len(),
            scenario.route_count()
        );
        if !scenario.description().is_empty() {
            println!("    {}", scenario.description());
        }
    }
    Ok(())
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let scenarios = load_scenarios(&path)?;
    for scenario in &scenarios {
        println!("✅ {}", scenario.name());
    }
    println!("{} scenario(s) valid", scenarios.len());
    Ok(())
}
