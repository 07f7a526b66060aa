//! Ranking and writing of the final record set.
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use itertools::Itertools;
use log::{info, warn};
use tokio::fs;

use crate::input::Operation;
use crate::ledger::ScanRecord;

/// Separator that renders the addresses as a quoted, comma-terminated list.
pub const GOP_SEPARATOR: &str = "gop";

/// Sorts by ascending mean RTT. Ties keep their ledger order.
pub fn rank(records: &mut [ScanRecord]) {
    records.sort_by_key(|record| record.rtt);
}

/// The addresses joined by `separator`, or for `gop` as `"a", "b",`.
pub fn format_ips(records: &[ScanRecord], separator: &str) -> String {
    if records.is_empty() {
        return String::new();
    }
    let mut ips = records.iter().map(|record| record.ip);
    if separator == GOP_SEPARATOR {
        format!("\"{}\",", ips.format("\", \""))
    } else {
        ips.join(separator)
    }
}

/// `<backup_dir>/<operation>_<YYYYmmdd_HHMMSS>.txt`
pub fn backup_path(backup_dir: &Path, operation: Operation, at: DateTime<Local>) -> PathBuf {
    backup_dir.join(format!("{operation}_{}.txt", at.format("%Y%m%d_%H%M%S")))
}

/// Writes the formatted records to `output`, truncating it even when there are
/// none, then copies them into `backup_dir` when there are.
///
/// A failed output write is an error; a failed backup is only logged. Returns
/// the backup path when one was written.
pub async fn write_results(
    records: &[ScanRecord],
    separator: &str,
    output: &Path,
    backup_dir: &Path,
    operation: Operation,
) -> anyhow::Result<Option<PathBuf>> {
    let text = format_ips(records, separator);
    fs::write(output, &text)
        .await
        .with_context(|| format!("Failed to write output file {}", output.display()))?;
    info!("All results written to {}", output.display());

    if records.is_empty() {
        return Ok(None);
    }
    let backup = backup_path(backup_dir, operation, Local::now());
    let written = async {
        fs::create_dir_all(backup_dir).await?;
        fs::write(&backup, &text).await
    };
    match written.await {
        Ok(()) => Ok(Some(backup)),
        Err(e) => {
            warn!("Failed to write backup file {}: {e}", backup.display());
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn record(last: u8, rtt_ms: u64) -> ScanRecord {
        ScanRecord {
            ip: Ipv4Addr::new(10, 0, 0, last),
            rtt: Duration::from_millis(rtt_ms),
            ping_rtt: Duration::ZERO,
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gscan-{name}-{}", std::process::id()))
    }

    #[test]
    fn rank_orders_by_rtt() {
        let mut records = vec![record(1, 30), record(2, 10), record(3, 20)];
        rank(&mut records);
        let order: Vec<u8> = records.iter().map(|r| r.ip.octets()[3]).collect();
        assert_eq!(order, [2, 3, 1]);
    }

    #[test]
    fn plain_separator_joins() {
        let records = [record(1, 1), record(2, 2)];
        assert_eq!(format_ips(&records, "|"), "10.0.0.1|10.0.0.2");
        assert_eq!(format_ips(&records[..1], "|"), "10.0.0.1");
    }

    #[test]
    fn gop_separator_quotes() {
        let records = [record(1, 1), record(2, 2), record(3, 3)];
        assert_eq!(
            format_ips(&records, GOP_SEPARATOR),
            r#""10.0.0.1", "10.0.0.2", "10.0.0.3","#
        );
    }

    #[test]
    fn no_records_format_empty() {
        assert_eq!(format_ips(&[], GOP_SEPARATOR), "");
        assert_eq!(format_ips(&[], "|"), "");
    }

    #[test]
    fn backup_name_carries_operation_and_time() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            backup_path(Path::new("/bak"), Operation::Tls, at),
            Path::new("/bak/tls_20240309_070501.txt")
        );
    }

    #[tokio::test]
    async fn writes_output_and_backup() {
        let dir = scratch_dir("write");
        fs::create_dir_all(&dir).await.unwrap();
        let output = dir.join("quic_ip.txt");
        let backup_dir = dir.join("bak");

        let backup = write_results(&[record(1, 1)], "|", &output, &backup_dir, Operation::Quic)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fs::read_to_string(&output).await.unwrap(), "10.0.0.1");
        assert_eq!(fs::read_to_string(&backup).await.unwrap(), "10.0.0.1");
        assert!(backup.starts_with(&backup_dir));
        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn empty_run_truncates_output_without_backup() {
        let dir = scratch_dir("empty");
        fs::create_dir_all(&dir).await.unwrap();
        let output = dir.join("tls_ip.txt");
        fs::write(&output, "stale").await.unwrap();

        let backup = write_results(&[], "|", &output, &dir.join("bak"), Operation::Tls)
            .await
            .unwrap();

        assert_eq!(backup, None);
        assert_eq!(fs::read_to_string(&output).await.unwrap(), "");
        assert!(!dir.join("bak").exists());
        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn unwritable_backup_is_not_fatal() {
        let dir = scratch_dir("badbak");
        fs::create_dir_all(&dir).await.unwrap();
        let output = dir.join("sni_ip.txt");
        // a file where the backup directory should be
        let blocker = dir.join("bak");
        fs::write(&blocker, "").await.unwrap();

        let backup = write_results(&[record(1, 1)], "|", &output, &blocker, Operation::Sni)
            .await
            .unwrap();

        assert_eq!(backup, None);
        assert_eq!(fs::read_to_string(&output).await.unwrap(), "10.0.0.1");
        fs::remove_dir_all(&dir).await.unwrap();
    }
}
