//! Concurrency-safe accumulation of accepted addresses and scan progress.
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::info;

const PROGRESS_EVERY: usize = 1000;

/// An address that passed every sample, with its averaged timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    /// The accepted address.
    pub ip: Ipv4Addr,
    /// Mean elapsed time of the protocol samples.
    pub rtt: Duration,
    /// Round trip of the ICMP gate, zero when the gate is off.
    pub ping_rtt: Duration,
}

/// Records found so far plus the number of addresses scanned.
///
/// Every method takes `&self` and is safe to call from all workers at once. The
/// record lock is held only for the push or the length read, never across I/O.
#[derive(Debug, Default)]
pub struct ResultLedger {
    records: Mutex<Vec<ScanRecord>>,
    scanned: AtomicUsize,
}

impl ResultLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ScanRecord>> {
        // a worker that panicked mid-push cannot leave the Vec inconsistent
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a record and logs it.
    pub fn add_record(&self, record: ScanRecord) {
        info!("Found a record: IP={}, RTT={:?}", record.ip, record.rtt);
        self.lock().push(record);
    }

    /// Counts one scanned address, logging progress every thousandth call.
    pub fn inc_scan_counter(&self) {
        let scanned = self.scanned.fetch_add(1, Ordering::Relaxed) + 1;
        if scanned % PROGRESS_EVERY == 0 {
            info!("Scanned {scanned} IPs, found {} records", self.record_size());
        }
    }

    /// Number of records held.
    pub fn record_size(&self) -> usize {
        self.lock().len()
    }

    /// Number of addresses scanned, accepted or not.
    pub fn scan_count(&self) -> usize {
        self.scanned.load(Ordering::Relaxed)
    }

    /// A snapshot of the records, in insertion order.
    pub fn records(&self) -> Vec<ScanRecord> {
        self.lock().clone()
    }

    /// Takes the records out, leaving the ledger empty.
    pub fn take_records(&self) -> Vec<ScanRecord> {
        std::mem::take(&mut *self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(last: u8) -> ScanRecord {
        ScanRecord {
            ip: Ipv4Addr::new(10, 0, 0, last),
            rtt: Duration::from_millis(u64::from(last)),
            ping_rtt: Duration::ZERO,
        }
    }

    #[test]
    fn counts_records_and_scans_separately() {
        let ledger = ResultLedger::new();
        ledger.add_record(record(1));
        ledger.inc_scan_counter();
        ledger.inc_scan_counter();

        assert_eq!(ledger.record_size(), 1);
        assert_eq!(ledger.scan_count(), 2);
        assert_eq!(ledger.records(), vec![record(1)]);
    }

    #[test]
    fn take_records_drains() {
        let ledger = ResultLedger::new();
        ledger.add_record(record(1));
        ledger.add_record(record(2));

        assert_eq!(ledger.take_records().len(), 2);
        assert_eq!(ledger.record_size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_lose_nothing() {
        let ledger = Arc::new(ResultLedger::new());
        let mut handles = Vec::new();
        for worker in 0..8u8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                for i in 0..250u16 {
                    ledger.inc_scan_counter();
                    if i % 10 == 0 {
                        ledger.add_record(record(worker));
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.scan_count(), 2000);
        assert_eq!(ledger.record_size(), 8 * 25);
    }
}
