use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::PathBuf;
use std::process;
use std::thread;
use tokio::signal;

use sckraken_rs::{
    run_pipeline, BrackenRunner, CancelToken, Config, Error, MissingTaxonPolicy, RecordPolicy,
    RunOptions, RunSummary,
};

/// Per-cell taxonomic abundance reports from single-cell Kraken output.
#[derive(Parser, Debug)]
#[command(name = "sckraken-rs", version)]
struct Cli {
    /// Pipeline config file (key=value)
    #[arg(long)]
    cfg: PathBuf,

    /// Taxonomy report, overrides `kreport`
    #[arg(long)]
    kreport: Option<PathBuf>,

    /// Per-read classification output (.gz allowed), overrides `koutput`
    #[arg(long)]
    koutput: Option<PathBuf>,

    /// Number of barcode workers, overrides `process`
    #[arg(long)]
    process: Option<usize>,

    /// Stop the run when a barcode names a taxon missing from the report
    #[arg(long)]
    abort_on_missing_taxon: bool,

    /// Drop malformed classification lines instead of failing
    #[arg(long)]
    skip_malformed_records: bool,

    /// Only write the per-barcode reports
    #[arg(long)]
    no_reestimate: bool,
}

fn spinner(color: &str, msg: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template(&format!("{{spinner:.{color}}} {{msg}}"))
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(msg.to_string());
    spinner
}

fn barcode_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} barcodes")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

fn exit_code(error: &Error) -> i32 {
    match error {
        Error::Config(_) => 2,
        Error::Io(_) => 3,
        Error::MalformedReport { .. } | Error::OrphanNode { .. } | Error::MalformedRecord { .. } => 4,
        _ => 1,
    }
}

/// 0 when every barcode was reported or skipped, 1 when any barcode failed
/// or was never started, 5 when a missing taxon aborted the run.
fn exit_status(outcome: &Result<RunSummary, Error>) -> i32 {
    match outcome {
        Ok(summary) if summary.aborted => 5,
        Ok(summary) if summary.has_failures() || summary.cancelled > 0 => 1,
        Ok(_) => 0,
        Err(e) => exit_code(e),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Cancels `cancel` once `signal` resolves. Barcodes already running finish.
async fn cancel_on<F: Future<Output = ()>>(signal: F, cancel: CancelToken) {
    signal.await;
    log::warn!("Interrupted: no new barcodes will start, waiting for running ones");
    cancel.cancel();
}

/// Watches for shutdown signals on a background thread. The first signal
/// cancels the run; a second one exits immediately.
fn watch_for_shutdown(cancel: CancelToken) {
    let spawned = thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::warn!("Signal handling unavailable: {e}");
                    return;
                }
            };
            runtime.block_on(async move {
                cancel_on(shutdown_signal(), cancel).await;
                shutdown_signal().await;
                log::error!("Interrupted again, exiting");
                process::exit(130);
            });
        });
    if let Err(e) = spawned {
        log::warn!("Signal handling unavailable: {e}");
    }
}

fn run(cli: Cli, cancel: CancelToken) -> Result<RunSummary, Error> {
    // 1. Configuration
    let loading = spinner("blue", "Loading configuration...");
    let mut config = Config::from_path(&cli.cfg)?;
    if let Some(path) = cli.kreport {
        config.kraken_report = path;
    }
    if let Some(path) = cli.koutput {
        config.kraken_output = path;
    }
    if let Some(process) = cli.process {
        config.process = process;
    }
    if cli.abort_on_missing_taxon {
        config.missing_taxon = MissingTaxonPolicy::Abort;
    }
    if cli.skip_malformed_records {
        config.malformed_records = RecordPolicy::Skip;
    }
    config.validate()?;
    loading.finish_with_message(format!("Configuration loaded for sample {}.", config.sample));

    // 2. Per-barcode reports
    let reestimator = BrackenRunner::from_config(&config);
    let options = RunOptions {
        reestimate: !cli.no_reestimate,
        cancel,
        progress: barcode_bar(),
    };
    let summary = run_pipeline(&config, &reestimator, options)?;

    // 3. Final message
    let done = spinner("cyan", "Summarising...");
    done.finish_with_message(format!(
        "{} of {} barcodes reported.",
        summary.reported, summary.barcodes
    ));
    Ok(summary)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cancel = CancelToken::new();
    watch_for_shutdown(cancel.clone());

    let outcome = run(cli, cancel);
    if let Err(e) = &outcome {
        eprintln!("Error: {e}");
    }
    process::exit(exit_status(&outcome));
}
