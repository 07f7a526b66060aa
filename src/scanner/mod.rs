//! Core functionality for actual scanning behaviour.
//!
//! One producer walks the address ranges and feeds a bounded channel; a fixed
//! pool of workers pulls from it, verifies each address and appends accepted
//! records to a ledger built fresh for the run. The record limit and an
//! interrupt both end the run through the same cancellation token.
use std::net::Ipv4Addr;
use std::num::NonZero;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::address::{addresses, AddressRange};
use crate::ledger::{ResultLedger, ScanRecord};
use crate::probe::{PingProbe, Probe};

/// Addresses buffered between the producer and the workers.
pub const FEED_CAPACITY: usize = 100;

/// ICMP pre-filter run once per address before any protocol sample.
#[derive(Debug, Clone)]
pub struct PingGate<G> {
    probe: G,
    min_rtt: Duration,
}

impl<G> PingGate<G> {
    /// A zero `min_rtt` disables the lower bound.
    pub const fn new(probe: G, min_rtt: Duration) -> Self {
        Self { probe, min_rtt }
    }
}

#[derive(Debug)]
struct AddressVerifier<P, G> {
    probe: P,
    gate: Option<PingGate<G>>,
    samples: NonZero<u32>,
    min_rtt: Duration,
}

impl<P: Probe, G: Probe> AddressVerifier<P, G> {
    /// Runs the gate, then `samples` sequential protocol samples. The first
    /// failure or too-quick answer discards the address.
    async fn verify(&self, ip: Ipv4Addr) -> Option<ScanRecord> {
        let ping_rtt = match &self.gate {
            Some(gate) => {
                let rtt = gate.probe.sample(ip).await?;
                if !gate.min_rtt.is_zero() && rtt < gate.min_rtt {
                    debug!("{ip} ping {rtt:?} is below {:?}", gate.min_rtt);
                    return None;
                }
                rtt
            }
            None => Duration::ZERO,
        };

        let samples = self.samples.get();
        let mut total = Duration::ZERO;
        for nr_sample in 1..=samples {
            let elapsed = self.probe.sample(ip).await?;
            if elapsed <= self.min_rtt {
                debug!(
                    "{ip} sample {nr_sample} answered in {elapsed:?}, not above {:?}",
                    self.min_rtt
                );
                return None;
            }
            total += elapsed;
        }

        Some(ScanRecord {
            ip,
            rtt: total / samples,
            ping_rtt,
        })
    }
}

/// Scans address ranges with one protocol probe and an optional ping gate.
#[derive(Debug)]
pub struct Scanner<P, G = PingProbe> {
    ranges: Vec<AddressRange>,
    workers: NonZero<usize>,
    record_limit: usize,
    verifier: AddressVerifier<P, G>,
}

impl<P: Probe> Scanner<P> {
    /// `workers` and `samples` below one are raised to one.
    pub fn new(
        ranges: Vec<AddressRange>,
        probe: P,
        workers: usize,
        samples: u32,
        min_rtt: Duration,
        record_limit: usize,
    ) -> Self {
        Self {
            ranges,
            workers: NonZero::new(workers).unwrap_or(NonZero::<usize>::MIN),
            record_limit,
            verifier: AddressVerifier {
                probe,
                gate: None,
                samples: NonZero::new(samples).unwrap_or(NonZero::<u32>::MIN),
                min_rtt,
            },
        }
    }
}

impl<P: Probe, G: Probe> Scanner<P, G> {
    /// Requires every address to pass `gate` before it is sampled.
    pub fn with_ping_gate<H: Probe>(self, gate: PingGate<H>) -> Scanner<P, H> {
        let AddressVerifier {
            probe,
            samples,
            min_rtt,
            ..
        } = self.verifier;
        Scanner {
            ranges: self.ranges,
            workers: self.workers,
            record_limit: self.record_limit,
            verifier: AddressVerifier {
                probe,
                gate: Some(gate),
                samples,
                min_rtt,
            },
        }
    }
}

impl<P: Probe + 'static, G: Probe + 'static> Scanner<P, G> {
    /// Scans until the ranges are exhausted, the record limit is reached or
    /// `cancel` fires, and returns the run's ledger once every worker has exited.
    ///
    /// Records may exceed the limit by fewer than the number of workers: each
    /// worker already verifying when the limit is hit may still add its record.
    pub async fn run(self, cancel: CancellationToken) -> Arc<ResultLedger> {
        let Self {
            ranges,
            workers,
            record_limit,
            verifier,
        } = self;
        let verifier = Arc::new(verifier);
        let ledger = Arc::new(ResultLedger::new());

        debug!(
            "Start scanning.\nRanges {}\nAddresses {}\nWorkers {}\nSamples per address {}\nRecord limit {}",
            ranges.len(),
            ranges.iter().map(AddressRange::size).sum::<u64>(),
            workers,
            verifier.samples,
            record_limit,
        );

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let mut pool = JoinSet::new();
        for _ in 0..workers.get() {
            pool.spawn(work(
                Arc::clone(&verifier),
                Arc::clone(&rx),
                Arc::clone(&ledger),
                record_limit,
                cancel.clone(),
            ));
        }

        feed(&ranges, tx, &ledger, record_limit, &cancel).await;

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                warn!("Scan worker failed: {e}");
            }
        }
        debug!(
            "Scan finished: {} scanned, {} records",
            ledger.scan_count(),
            ledger.record_size()
        );
        ledger
    }
}

/// Pushes every address onto the channel until input runs out, the limit is
/// reached or the run is cancelled. Dropping `tx` tells idle workers to exit.
async fn feed(
    ranges: &[AddressRange],
    tx: mpsc::Sender<Ipv4Addr>,
    ledger: &ResultLedger,
    record_limit: usize,
    cancel: &CancellationToken,
) {
    for ip in addresses(ranges) {
        if ledger.record_size() >= record_limit {
            cancel.cancel();
            break;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = tx.send(ip) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn work<P: Probe, G: Probe>(
    verifier: Arc<AddressVerifier<P, G>>,
    feed: Arc<Mutex<mpsc::Receiver<Ipv4Addr>>>,
    ledger: Arc<ResultLedger>,
    record_limit: usize,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            ip = async { feed.lock().await.recv().await } => ip,
        };
        let Some(ip) = next else { break };

        // dropping an in-flight verification closes its connections
        let verdict = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            verdict = verifier.verify(ip) => verdict,
        };

        ledger.inc_scan_counter();
        if let Some(record) = verdict {
            ledger.add_record(record);
            if ledger.record_size() >= record_limit {
                cancel.cancel();
            }
        }
    }
}

/// Cancels `cancel` on the first Ctrl-C. The listener ends with the run.
pub fn cancel_on_interrupt(cancel: &CancellationToken) -> JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    warn!("Interrupted, stopping the scan");
                    cancel.cancel();
                }
                Err(e) => warn!("Cannot listen for interrupts: {e}"),
            },
        }
    })
}
