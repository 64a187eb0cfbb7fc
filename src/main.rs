use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use last_ping::config::{LastPingConfig, StatsConfig, DEFAULT_CONFIG_FILE};
use last_ping::output::{LastPingFile, OutputLock};
use last_ping::signals::SignalHandler;
use last_ping::stats::{CounterNode, CounterTree, StatsSampler};
use last_ping::{ProbeMonitor, ProbeReader};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Ping a host continuously and store the timestamps of the last successful
/// and the last failed ping.
#[derive(Parser, Debug)]
#[command(name = "last-ping", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Extra logging (every probe line, spawn details)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ping HOST continuously and keep OUTPUT updated with the last results
    Watch {
        /// Host to ping
        host: String,

        /// File where the last success/failure timestamps are stored
        output: PathBuf,

        /// Timeout value for the ping command, in seconds (overrides config)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Interval value for the ping command and restart delay, in seconds
        /// (overrides config)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Serve the current state over HTTP
        #[arg(long)]
        serve: bool,

        /// Validate config and print the resolved probe command, don't run
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the timestamps stored in a last-ping file
    Status {
        output: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Print disk and network counter deltas every sample interval
    Stats {
        /// Stop after this many samples
        #[arg(long)]
        count: Option<u64>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match LastPingConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch {
            host,
            output,
            timeout,
            interval,
            serve,
            dry_run,
        } => watch(config, &host, &output, timeout, interval, serve, dry_run).await,
        Commands::Status { output, json } => status(&output, json),
        Commands::Stats { count, json } => stats(&config.stats, count, json).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_directive = if verbose {
        "last_ping=debug"
    } else if quiet {
        "last_ping=warn"
    } else {
        "last_ping=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Write the current snapshot; failures are logged and never stop the monitor.
fn persist(sink: &LastPingFile, reader: &ProbeReader) {
    if let Err(e) = sink.write(&reader.snapshot()) {
        tracing::warn!(error = %e, "failed to write last-ping file");
    }
}

async fn watch(
    mut config: LastPingConfig,
    host: &str,
    output: &Path,
    timeout: Option<u64>,
    interval: Option<u64>,
    serve: bool,
    dry_run: bool,
) -> Result<(), Box<dyn Error>> {
    config.apply_overrides(timeout, interval);
    config.validate()?;
    let monitor_config = config.monitor_config(host);

    if dry_run {
        println!(
            "Probe command: {}",
            monitor_config.command.render(
                &monitor_config.host,
                monitor_config.timeout,
                monitor_config.interval
            )
        );
        println!("Restart delay: {}s", config.probe.interval_secs);
        println!("Output file:   {}", output.display());
        println!("Dry run mode: config validated, not running.");
        return Ok(());
    }

    let _lock = if config.output.lock {
        Some(OutputLock::acquire(output)?)
    } else {
        None
    };

    let sink = LastPingFile::new(output);
    let monitor = ProbeMonitor::new(monitor_config);
    let reader = monitor.reader();
    let monitor = monitor
        .on_update({
            let sink = sink.clone();
            let reader = reader.clone();
            move || persist(&sink, &reader)
        })
        .on_restart({
            let sink = sink.clone();
            let reader = reader.clone();
            move |exit_code| {
                tracing::info!(exit_code = ?exit_code, "probe command restarted");
                persist(&sink, &reader);
            }
        });

    persist(&sink, &reader);
    let mut signals = SignalHandler::install()?;
    let handle = monitor.start()?;

    if serve {
        spawn_server(&config, host, &monitor);
    }

    let signal = signals.recv().await;
    tracing::info!(%signal, "shutting down, stopping probe");
    monitor.stop();

    tokio::select! {
        joined = handle.join() => joined?,
        signal = signals.recv() => {
            tracing::warn!(%signal, "second signal, exiting immediately");
            // exit() skips kill_on_drop; the probe has its own process group
            monitor.kill_probe();
            std::process::exit(130);
        }
    }

    persist(&sink, &reader);
    Ok(())
}

#[cfg(feature = "serve")]
fn spawn_server(config: &LastPingConfig, host: &str, monitor: &ProbeMonitor) {
    let serve_config = config.serve.clone();
    let host = host.to_string();
    let reader = monitor.reader();
    let phase = monitor.phase_watch();
    tokio::spawn(async move {
        if let Err(e) = last_ping::serve::run(&serve_config, &host, reader, phase).await {
            tracing::warn!(error = %e, "status server stopped");
        }
    });
}

#[cfg(not(feature = "serve"))]
fn spawn_server(_config: &LastPingConfig, _host: &str, _monitor: &ProbeMonitor) {
    tracing::warn!("built without the `serve` feature, --serve ignored");
}

fn status(output: &Path, json: bool) -> Result<(), Box<dyn Error>> {
    let snapshot = LastPingFile::new(output).read()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let now = Utc::now();
    println!("Last success: {}", describe(snapshot.success(), now));
    println!("Last failure: {}", describe(snapshot.failure(), now));
    Ok(())
}

fn describe(ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match ts {
        None => "never".to_string(),
        Some(ts) => format!(
            "{} ({} ago)",
            ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            format_age(now - ts)
        ),
    }
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

async fn stats(config: &StatsConfig, count: Option<u64>, json: bool) -> Result<(), Box<dyn Error>> {
    let mut sampler = StatsSampler::new(config.clone())?;
    let mut ticker = tokio::time::interval(Duration::from_secs(config.sample_interval_secs));
    // First tick completes immediately
    ticker.tick().await;

    let mut printed = 0u64;
    while count.map_or(true, |c| printed < c) {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        sampler.update()?;

        let elapsed = sampler
            .time_delta()
            .and_then(|d| d.to_std().ok())
            .unwrap_or(Duration::ZERO);
        let delta = sampler.values_delta();

        if json {
            let line = serde_json::json!({
                "elapsed_secs": elapsed.as_secs_f64(),
                "delta": delta,
            });
            println!("{line}");
        } else {
            print_summary(&delta, elapsed);
        }
        printed += 1;
    }
    Ok(())
}

fn branch<'a>(tree: &'a CounterTree, key: &str) -> Option<&'a CounterTree> {
    match tree.get(key) {
        Some(CounterNode::Branch(b)) => Some(b),
        _ => None,
    }
}

fn leaf_count(tree: &CounterTree, key: &str) -> i64 {
    match tree.get(key) {
        Some(CounterNode::Count(v)) => *v,
        _ => 0,
    }
}

fn print_summary(delta: &CounterTree, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!("--- {:.1}s ---", elapsed.as_secs_f64());

    if let Some(network) = branch(delta, "network") {
        for (iface, node) in network {
            if let CounterNode::Branch(stats) = node {
                println!(
                    "{:<12} rx {:>12.0} B/s  tx {:>12.0} B/s",
                    iface,
                    leaf_count(stats, "rx_bytes") as f64 / secs,
                    leaf_count(stats, "tx_bytes") as f64 / secs
                );
            }
        }
    }

    if let Some(storage) = branch(delta, "storage") {
        for (device, node) in storage {
            if let CounterNode::Branch(stats) = node {
                println!(
                    "{:<12} read {:>10} sectors  write {:>10} sectors",
                    device,
                    leaf_count(stats, "sectors_read"),
                    leaf_count(stats, "sectors_written")
                );
            }
        }
    }
}
