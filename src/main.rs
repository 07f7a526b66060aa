#![warn(missing_docs)]
//! The gscan command line entry point.

use std::time::Instant;

use anyhow::Context;
use colored::Colorize;
use env_logger::Env;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use gscan::address::read_range_file;
use gscan::input::{executable_dir, resolve_path, Config, Opts};
use gscan::output::{rank, write_results};
use gscan::probe::{PingProbe, Protocol};
use gscan::scanner::{cancel_on_interrupt, PingGate, Scanner};

/// Descriptors a worker can hold at once: the probe socket plus an ICMP socket.
#[cfg(unix)]
const DESCRIPTORS_PER_WORKER: u64 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let opts = Opts::read();
    let exec_dir = executable_dir()?;
    let config_path = resolve_path(&opts.config_path, &exec_dir)?;
    debug!("Loading configuration from {}", config_path.display());

    let mut config = Config::read(&config_path)?;
    config.merge(&opts);
    config.resolve_paths(&exec_dir)?;
    config.validate()?;
    debug!("Main() `config` arguments are {config:?}");

    #[cfg(unix)]
    adjust_ulimit_size(opts.ulimit, config.scan_worker);

    let operation = config.operation;
    let section = config.section().clone();

    info!("Start loading IP range file: {}", section.input_file.display());
    let ranges = read_range_file(&section.input_file)
        .await
        .with_context(|| format!("Cannot start the {operation} scan"))?;

    let protocol = Protocol::pick(operation, &section)?;
    let scanner = Scanner::new(
        ranges,
        protocol,
        config.scan_worker,
        config.scan_count_per_ip,
        section.min_rtt,
        section.record_limit,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_interrupt(&cancel);

    info!("Start scanning available IPs with {operation}, level {}", section.level);
    let started = Instant::now();
    let ledger = if config.verify_ping {
        let gate = PingGate::new(PingProbe::new(config.ping_max_rtt), config.ping_min_rtt);
        scanner.with_ping_gate(gate).run(cancel.clone()).await
    } else {
        scanner.run(cancel.clone()).await
    };
    let elapsed = started.elapsed();

    cancel.cancel();
    if let Err(e) = interrupt.await {
        warn!("Interrupt listener failed: {e}");
    }

    let mut records = ledger.take_records();
    rank(&mut records);

    println!(
        "{}",
        format!(
            "Scanned {} IPs in {elapsed:.2?}, found {} records",
            ledger.scan_count(),
            records.len()
        )
        .green()
    );

    let backup = write_results(
        &records,
        &section.output_separator,
        &section.output_file,
        &config.backup_dir,
        operation,
    )
    .await?;

    println!(
        "{} {}",
        "Results written to".blue(),
        section.output_file.display().to_string().bold()
    );
    if let Some(backup) = backup {
        println!("{} {}", "Backup copy at".blue(), backup.display());
    }
    Ok(())
}

/// Raises the open file limit to `ulimit` when given, then warns when the
/// resulting soft limit is too low for the worker pool.
#[cfg(unix)]
fn adjust_ulimit_size(ulimit: Option<u64>, workers: usize) {
    use rlimit::Resource;

    if let Some(limit) = ulimit {
        match Resource::NOFILE.set(limit, limit) {
            Ok(()) => debug!("Automatically increasing ulimit value to {limit}."),
            Err(e) => warn!("Failed to set ulimit value to {limit}: {e}"),
        }
    } else if let Err(e) = rlimit::increase_nofile_limit(u64::MAX) {
        debug!("Could not raise the open file limit: {e}");
    }

    match Resource::NOFILE.get() {
        Ok((soft, _)) => {
            let needed = u64::try_from(workers)
                .unwrap_or(u64::MAX)
                .saturating_mul(DESCRIPTORS_PER_WORKER);
            if soft < needed {
                warn!(
                    "File limit {soft} is lower than {workers} workers need; lower scan_worker or use --ulimit {needed}"
                );
            }
        }
        Err(e) => debug!("Could not read the open file limit: {e}"),
    }
}
