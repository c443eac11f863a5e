//! Stepbook - run runbooks from the command line.
//!
//! Loads runbooks from files or directories, selects and schedules them, and
//! reports a result per runbook.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stepbook::core::duration::{format_elapsed, parse_duration};
use stepbook::core::Shard;
use stepbook::runbook::{expand_paths, Engine, LogCapturer, Outcome, OperatorSet, RunResult};
use stepbook::Config;

/// Runbook-driven automation and scenario testing
#[derive(Parser)]
#[command(name = "stepbook")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run runbooks
    Run(RunArgs),

    /// List runbooks and their IDs
    List {
        /// Runbook files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Runbook files or directories
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Only run runbooks whose path matches this regex
    #[arg(long = "run")]
    path_match: Option<String>,

    /// Only run runbooks whose labels satisfy this expression (repeatable)
    #[arg(short, long = "label")]
    labels: Vec<String>,

    /// Only run runbooks whose ID starts with this prefix (repeatable, keeps order)
    #[arg(long = "id")]
    ids: Vec<String>,

    /// Shuffle the selection with this seed
    #[arg(long)]
    shuffle: Option<u64>,

    /// Index of the shard to run
    #[arg(long, requires = "shard_n")]
    shard_index: Option<usize>,

    /// Number of shards
    #[arg(long, requires = "shard_index")]
    shard_n: Option<usize>,

    /// Run N randomly sampled runbooks
    #[arg(long)]
    sample: Option<usize>,

    /// Run N random picks, duplicates allowed
    #[arg(long)]
    random: Option<usize>,

    /// Seed for --sample and --random
    #[arg(long)]
    seed: Option<u64>,

    /// Skip runbooks included by another selected runbook
    #[arg(long)]
    skip_included: bool,

    /// Maximum runbooks running at once ("auto" for one per CPU)
    #[arg(short = 'c', long, value_parser = parse_concurrency)]
    concurrent: Option<usize>,

    /// Stop starting runbooks after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Bound on the wait for runners to close (e.g. 30s)
    #[arg(long, value_parser = parse_duration)]
    wait_timeout: Option<Duration>,

    /// Write a profile of the run to this file
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Repeat the whole run N times
    #[arg(long, default_value_t = 1)]
    times: usize,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,
}

fn parse_concurrency(s: &str) -> std::result::Result<usize, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(num_cpus::get());
    }
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("expected a positive number or \"auto\", got '{s}'")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run(args) => {
            if !cmd_run(args, config)? {
                std::process::exit(1);
            }
        }
        Commands::List { paths, format } => {
            cmd_list(&paths, &format, config)?;
        }
        Commands::Completions { shell } => {
            cmd_completions(shell);
        }
    }

    Ok(())
}

/// Apply command-line overrides on top of file configuration.
fn apply_overrides(config: &mut Config, args: &RunArgs) {
    let select = &mut config.select;
    if args.path_match.is_some() {
        select.path_match.clone_from(&args.path_match);
    }
    if !args.labels.is_empty() {
        select.labels.clone_from(&args.labels);
    }
    if !args.ids.is_empty() {
        select.ids.clone_from(&args.ids);
    }
    select.skip_included |= args.skip_included;
    select.shuffle = args.shuffle.or(select.shuffle);
    if let (Some(index), Some(total)) = (args.shard_index, args.shard_n) {
        select.shard = Some(Shard { index, total });
    }
    select.sample = args.sample.or(select.sample);
    select.random = args.random.or(select.random);
    select.seed = args.seed.or(select.seed);

    if let Some(n) = args.concurrent {
        config.run.concurrency = n;
    }
    config.run.fail_fast |= args.fail_fast;
    config.run.wait_timeout = args.wait_timeout.or(config.run.wait_timeout);
    if let Some(path) = &args.profile {
        config.profile.enabled = true;
        config.profile.dump = Some(path.clone());
    }
}

/// Run runbooks. Returns whether everything passed.
fn cmd_run(args: RunArgs, mut config: Config) -> Result<bool> {
    apply_overrides(&mut config, &args);
    config.validate()?;

    let paths = expand_paths(&args.paths)?;
    let engine = Engine::builder(config).capturer(Arc::new(LogCapturer)).build();
    let mut set = OperatorSet::load(engine, &paths)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("Interrupted; cancelling run");
            cancel.cancel();
        })?;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(set.run_n(args.times.max(1), &cancel));

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(set.results())?),
        _ => {
            for (n, run) in set.results().iter().enumerate() {
                if set.results().len() > 1 {
                    println!("Run {} ({})", n + 1, format_elapsed(run.elapsed));
                }
                for result in &run.results {
                    print_result(result, 0);
                }
                println!("\n{}", run.summary());
            }
        }
    }

    let failed = set.results().iter().any(|r| r.has_failure());
    match outcome {
        Ok(()) => Ok(!failed),
        Err(e) => {
            eprintln!("\nError: {e}");
            Ok(false)
        }
    }
}

fn print_result(result: &RunResult, depth: usize) {
    let indent = "  ".repeat(depth);
    let icon = match result.outcome() {
        Outcome::Success => "✓",
        Outcome::Failure => "✗",
        Outcome::Skipped | Outcome::NotRun => "-",
    };
    let desc = if result.desc.is_empty() { String::new() } else { format!(" - {}", result.desc) };
    println!("{indent}{icon} {}{desc} ({})", result.path.display(), format_elapsed(result.elapsed));

    for step in &result.steps {
        if step.outcome == Outcome::Failure {
            println!("{indent}    step {}: {}", step.key, step.error.as_deref().unwrap_or("failed"));
        }
        for child in &step.included {
            print_result(child, depth + 2);
        }
    }
}

#[derive(Serialize)]
struct Listed<'a> {
    id: &'a str,
    path: String,
    desc: &'a str,
    labels: &'a [String],
    steps: usize,
}

/// List runbooks with their IDs.
fn cmd_list(paths: &[PathBuf], format: &str, config: Config) -> Result<()> {
    let paths = expand_paths(paths)?;
    let engine = Engine::builder(config).build();
    let set = OperatorSet::load(engine, &paths)?;

    let listed: Vec<Listed<'_>> = set
        .books()
        .iter()
        .map(|e| Listed {
            id: &e.id,
            path: e.book.display_path(),
            desc: &e.book.desc,
            labels: &e.book.labels,
            steps: e.book.step_count(),
        })
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&listed)?),
        _ => {
            for item in &listed {
                let short = item.id.get(..8).unwrap_or(item.id);
                println!("{short}  {}  {}", item.path, item.desc);
            }
            println!("\nTotal: {} runbooks", listed.len());
        }
    }
    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "stepbook", &mut io::stdout());
}
