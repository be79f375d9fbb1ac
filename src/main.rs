use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use proxy_probe_rs::config::{self, Config};
use proxy_probe_rs::runner::{RunProgress, Runner};
use proxy_probe_rs::server;
use proxy_probe_rs::types::{ProtocolClass, RunReport};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// proxy-probe-rs — Probe public proxy lists and keep the ones that actually work.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "proxy-probe-rs",
    version,
    about = "Probe public proxy lists concurrently and write the working ones to per-protocol files.",
    long_about = None
)]
struct Cli {
    /// JSON config file (lists, outputs, target, limits). Built-in defaults if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// URL requested through every candidate.
    #[arg(long = "target-url")]
    target_url: Option<String>,

    /// Per-probe timeout in milliseconds (connect + response).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Max concurrent probe attempts per protocol class.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Directory for relative output files.
    #[arg(long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Only probe these protocol classes (repeatable): http, https, socks4, socks5.
    #[arg(long = "class")]
    classes: Vec<ProtocolClass>,

    /// Count only 2xx answers from the target as working.
    #[arg(long = "strict-status", default_value_t = false)]
    strict_status: bool,

    /// Write the run report as pretty JSON to this path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Serve the status API on this address instead of running once (e.g. 127.0.0.1:8080).
    #[arg(long)]
    serve: Option<String>,

    /// Log every failed probe.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = build_config(&cli)?;
    print_config(&cfg);

    let runner = Runner::from_config(cfg);

    if let Some(bind) = cli.serve.as_deref() {
        let bind = bind.to_string();
        let state = server::AppState::new(runner);
        let server_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, server_state).await {
                tracing::error!(error = %e, "status API server error");
            }
        });
        println!("Press Ctrl+C to stop the server...");
        let _ = tokio::signal::ctrl_c().await;
        // Let an in-flight run flush and sync its output files before exiting.
        if !state.shutdown(SHUTDOWN_GRACE).await {
            eprintln!(
                "run still in progress after {}s; output files may be incomplete",
                SHUTDOWN_GRACE.as_secs()
            );
        }
        return Ok(());
    }

    // Ctrl-C cancels the run; batches still finalize their output files.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_ctrlc.cancel();
        }
    });

    let report = runner
        .run_with(cancel, RunProgress::for_config(runner.config()))
        .await;
    print_results_table(&report);

    if let Some(path) = cli.report.as_deref() {
        if let Err(e) = write_report_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {:#}", path.display(), e);
        } else {
            println!("Wrote JSON report to {}", path.display());
        }
    }

    println!("All requests completed.");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match cli.config.as_deref() {
        Some(path) => config::load_config_from_path(path)?,
        None => Config::default(),
    };
    if let Some(url) = &cli.target_url {
        cfg.target_url = url.clone();
    }
    if let Some(t) = cli.timeout_ms {
        cfg.timeout_ms = t;
    }
    if let Some(c) = cli.concurrency {
        cfg.concurrency = c;
    }
    if cli.strict_status {
        cfg.strict_status = true;
    }
    cfg.retain_classes(&cli.classes);
    if let Some(dir) = cli.output_dir.as_deref() {
        cfg.set_output_dir(dir);
    }
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn print_config(cfg: &Config) {
    println!("proxy-probe-rs configuration:");
    println!("  target_url    : {}", cfg.target_url);
    println!("  timeout_ms    : {}", cfg.timeout_ms);
    println!("  concurrency   : {}", cfg.effective_concurrency());
    println!("  strict_status : {}", cfg.strict_status);
    for c in &cfg.classes {
        println!("  {:<13} : {} -> {}", c.class, c.source, c.output.display());
    }
}

fn print_results_table(report: &RunReport) {
    let class_w = 6usize;
    let num_w = 9usize;
    let mut out_w = "output".len();
    for c in &report.classes {
        out_w = out_w.max(c.output.len());
    }

    println!(
        "\nVerified proxies: {}{}",
        report.total_verified(),
        if report.cancelled { " (run cancelled)" } else { "" }
    );
    println!(
        "{:<class_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:<out_w$}",
        "class",
        "total",
        "working",
        "failed",
        "timeout",
        "cancelled",
        "output",
    );
    println!(
        "{:-<class_w$}  {:-<num_w$}  {:-<num_w$}  {:-<num_w$}  {:-<num_w$}  {:-<num_w$}  {:-<out_w$}",
        "", "", "", "", "", "", "",
    );
    for c in &report.classes {
        let s = &c.summary;
        println!(
            "{:<class_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:<out_w$}",
            c.class.as_str(),
            s.total,
            s.succeeded,
            s.failed,
            s.timed_out,
            s.cancelled,
            c.output,
        );
        if let Some(err) = &c.list_error {
            println!("  ! {} list unavailable: {}", c.class, err);
        }
    }
}

fn write_report_json(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
