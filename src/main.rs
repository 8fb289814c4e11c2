//! scriptdeck CLI entry point

use anyhow::Result;
use clap::Parser;
use scriptdeck::{
    DefaultResolver, RunnerConfig, RunnerEvent, ScriptRunner, SnapshotContext, StatsAggregator,
    StatsSnapshot,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for killed scripts to report their exit on Ctrl-C
const KILL_SETTLE: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "scriptdeck", version, about = "Run a batch of .bat and .ps1 scripts")]
struct Cli {
    /// Scripts to run; files of other types are skipped
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Config file (defaults to ~/.scriptdeck/config.yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print events and the summary as JSON lines
    #[arg(long)]
    json: bool,

    /// Leave running scripts alive on Ctrl-C
    #[arg(long)]
    no_kill: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RunnerConfig::load(cli.config.as_deref())?;

    // Initialize logger
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_filter.as_str()),
    )
    .init();

    let resolver = DefaultResolver::from_config(&config);
    let total = cli.paths.len() as u64;
    let selected = cli
        .paths
        .iter()
        .filter(|p| resolver.resolve(p).is_some())
        .count() as u64;

    let runner = ScriptRunner::new(&config);
    let stats = Arc::new(StatsAggregator::new());
    {
        let stats = stats.clone();
        runner.subscribe(move |event| stats.record_event(event));
    }
    let json = cli.json;
    runner.subscribe(move |event| print_event(event, json));

    let kill = config.kill_on_cancel && !cli.no_kill;
    let batch = runner.start_many(cli.paths, None)?;

    let finished = async {
        let report = batch.join().await;
        runner.wait_idle().await;
        report
    };

    tokio::select! {
        report = finished => {
            log::debug!("Batch report: {:?}", report);
        }
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted; cancelling run (kill: {})", kill);
            runner.cancel_all(kill);
            if kill && !stats.wait_finished(KILL_SETTLE).await {
                log::warn!("Some killed scripts did not report an exit in time");
            }
        }
    }

    let summary = stats.snapshot(SnapshotContext {
        total,
        selected,
        running: runner.running_count() as u64,
    });
    runner.dispose();
    print_summary(&summary, json)?;

    if summary.errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn print_event(event: &RunnerEvent, json: bool) {
    if json {
        println!("{}", event.to_json_line());
        return;
    }

    match event {
        RunnerEvent::Started { pid, path } => {
            println!("[{}] started {}", pid, path.display());
        }
        RunnerEvent::Output {
            pid,
            line,
            is_error: false,
        } => println!("[{}] {}", pid, line),
        RunnerEvent::Output {
            pid,
            line,
            is_error: true,
        } => println!("[{}:err] {}", pid, line),
        RunnerEvent::Exited {
            pid,
            exit_code,
            record,
        } => {
            let elapsed = record
                .as_ref()
                .and_then(|r| r.duration())
                .map(|d| format!(" after {}ms", d.num_milliseconds()))
                .unwrap_or_default();
            match exit_code {
                Some(code) => println!("[{}] exited with code {}{}", pid, code, elapsed),
                None => println!("[{}] terminated{}", pid, elapsed),
            }
        }
    }
}

fn print_summary(summary: &StatsSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }

    println!();
    println!(
        "scripts: {} total, {} selected, {} still running",
        summary.total, summary.selected, summary.running
    );
    println!(
        "launched: {}, completed: {}, errors: {}",
        summary.launched, summary.completed, summary.errors
    );
    Ok(())
}
