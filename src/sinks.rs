use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::pipeline::ExpirySnapshot;

/// Append-only persistence seam for realized expiry snapshots. Physical
/// encodings richer than the bundled CSV writer live outside this crate.
pub trait SnapshotSink: Send + Sync {
    fn name(&self) -> &str;
    fn append(&self, snapshot: &ExpirySnapshot) -> Result<()>;
}

/// Reference sink: one CSV file per (index, expiry date), append-only,
/// header on create. A per-file lock keeps each file single-writer.
pub struct CsvSink {
    dir: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CsvSink {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating csv dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl SnapshotSink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn append(&self, snapshot: &ExpirySnapshot) -> Result<()> {
        let path = self.dir.join(format!(
            "{}_{}.csv",
            snapshot.index, snapshot.expiry_date
        ));
        let file_lock = self.lock_for(&path);
        let _guard = file_lock.lock();

        let new_file = !path.exists();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        if new_file {
            writeln!(
                file,
                "ts,index,tag,strike,type,last_price,volume,oi,bid,ask,iv,interpolated"
            )?;
        }
        for row in &snapshot.options {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{},{},{},{}",
                row.quote_ts.to_rfc3339(),
                row.index,
                snapshot.tag.as_str(),
                row.strike,
                row.option_type.as_str(),
                row.last_price,
                row.volume,
                row.oi,
                row.bid,
                row.ask,
                row.iv.map(|v| v.to_string()).unwrap_or_default(),
                row.interpolated,
            )?;
        }
        debug!(
            "csv sink appended {} rows to {}",
            snapshot.options.len(),
            path.display()
        );
        Ok(())
    }
}

/// Sink that drops everything; stands in when persistence is disabled.
pub struct NullSink;

impl SnapshotSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn append(&self, _snapshot: &ExpirySnapshot) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExpiryTag;
    use crate::coverage::ExpiryStatus;
    use crate::enrichment::EnrichedOption;
    use crate::provider::OptionType;
    use chrono::{NaiveDate, Utc};
    use std::collections::BTreeSet;

    fn snapshot(rows: usize) -> ExpirySnapshot {
        let expiry = NaiveDate::from_ymd_opt(2025, 8, 7).unwrap();
        ExpirySnapshot {
            index: "NIFTY".to_string(),
            tag: ExpiryTag::ThisWeek,
            expiry_date: expiry,
            options: (0..rows)
                .map(|i| EnrichedOption {
                    symbol: format!("NIFTY{}CE", 24_000 + i * 50),
                    index: "NIFTY".to_string(),
                    expiry_date: expiry,
                    strike: (24_000 + i * 50) as f64,
                    option_type: OptionType::CE,
                    last_price: 100.0,
                    volume: 10,
                    oi: 10,
                    bid: 99.0,
                    ask: 101.0,
                    avg_price: Some(100.0),
                    iv: Some(0.2),
                    delta: Some(0.5),
                    quote_ts: Utc::now(),
                    interpolated: false,
                })
                .collect(),
            strike_coverage: 1.0,
            field_coverage: 1.0,
            interpolated_fraction: 0.0,
            quality_score: 1.0,
            status: ExpiryStatus::Ok,
            partial_reasons: BTreeSet::new(),
            requested_strikes: rows,
            clamped: false,
        }
    }

    #[test]
    fn appends_are_cumulative_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        sink.append(&snapshot(2)).unwrap();
        sink.append(&snapshot(3)).unwrap();

        let path = dir.path().join("NIFTY_2025-08-07.csv");
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1 + 2 + 3);
        assert!(lines[0].starts_with("ts,index,tag"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("ts,")).count(), 1);
    }
}
