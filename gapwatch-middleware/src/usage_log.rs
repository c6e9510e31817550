//! Append-only CSV audit log of quota consumption attempts.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use gapwatch_core::{GapwatchError, UsageLogRecord};

/// Column order of the log file.
pub const USAGE_LOG_COLUMNS: [&str; 11] = [
    "timestamp",
    "provider",
    "endpoint",
    "count",
    "usage_before",
    "usage_after",
    "limit",
    "percentage",
    "period",
    "success",
    "error_message",
];

/// Append-only usage log backed by a CSV file.
///
/// Rows are flushed on every append and never rewritten.
pub struct UsageLog {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl std::fmt::Debug for UsageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLog").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Per-provider aggregate over a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderUsage {
    /// Units granted.
    pub total_calls: u64,
    /// Rows that succeeded.
    pub success_count: u64,
    /// Rows that were rejected.
    pub fail_count: u64,
    /// Units granted per endpoint.
    pub endpoints: BTreeMap<String, u64>,
}

impl ProviderUsage {
    /// The `n` busiest endpoints, busiest first, ties by name.
    #[must_use]
    pub fn top_endpoints(&self, n: usize) -> Vec<(String, u64)> {
        let mut v: Vec<(String, u64)> = self
            .endpoints
            .iter()
            .map(|(k, c)| (k.clone(), *c))
            .collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        v.truncate(n);
        v
    }
}

/// Aggregate of the log over a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSummary {
    /// Units granted across providers.
    pub total_calls: u64,
    /// Successful rows across providers.
    pub success_count: u64,
    /// Rejected rows across providers.
    pub fail_count: u64,
    /// Breakdown per provider.
    pub by_provider: BTreeMap<String, ProviderUsage>,
}

impl UsageSummary {
    fn add(&mut self, rec: &UsageLogRecord) {
        let p = self.by_provider.entry(rec.provider.clone()).or_default();
        if rec.success {
            self.total_calls += rec.count;
            self.success_count += 1;
            p.total_calls += rec.count;
            p.success_count += 1;
            *p.endpoints.entry(rec.endpoint.clone()).or_default() += rec.count;
        } else {
            self.fail_count += 1;
            p.fail_count += 1;
        }
    }
}

impl UsageLog {
    /// Open (or create) the log at `path`, writing the header for new files.
    ///
    /// # Errors
    /// Returns `GapwatchError::Persistence` when the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GapwatchError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| GapwatchError::persistence(parent, e))?;
        }
        let has_rows = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GapwatchError::persistence(&path, e))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !has_rows {
            writer
                .write_record(USAGE_LOG_COLUMNS)
                .and_then(|()| writer.flush().map_err(csv::Error::from))
                .map_err(|e| GapwatchError::persistence(&path, e))?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and flush it.
    ///
    /// # Errors
    /// Returns `GapwatchError::Persistence` if the row cannot be written.
    pub fn append(&self, record: &UsageLogRecord) -> Result<(), GapwatchError> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| GapwatchError::persistence(&self.path, "usage log lock poisoned"))?;
        w.serialize(record)
            .map_err(|e| GapwatchError::persistence(&self.path, e))?;
        w.flush().map_err(|e| GapwatchError::persistence(&self.path, e))
    }

    /// Read back every row.
    ///
    /// # Errors
    /// Returns `GapwatchError::Persistence` on I/O or decoding failures.
    pub fn records(&self) -> Result<Vec<UsageLogRecord>, GapwatchError> {
        let mut rdr =
            csv::Reader::from_path(&self.path).map_err(|e| GapwatchError::persistence(&self.path, e))?;
        rdr.deserialize()
            .map(|r| r.map_err(|e| GapwatchError::persistence(&self.path, e)))
            .collect()
    }

    /// Aggregate rows stamped within the last `days` days before `now`.
    ///
    /// # Errors
    /// Propagates read failures from [`records`](Self::records).
    pub fn summary(&self, days: u32, now: DateTime<Utc>) -> Result<UsageSummary, GapwatchError> {
        let since = now - TimeDelta::days(i64::from(days));
        let mut out = UsageSummary::default();
        for rec in self.records()? {
            if rec.timestamp >= since && rec.timestamp <= now {
                out.add(&rec);
            }
        }
        Ok(out)
    }

    /// Aggregate rows stamped on one UTC calendar day.
    ///
    /// # Errors
    /// Propagates read failures from [`records`](Self::records).
    pub fn day_summary(&self, date: NaiveDate) -> Result<UsageSummary, GapwatchError> {
        let mut out = UsageSummary::default();
        for rec in self.records()? {
            if rec.timestamp.date_naive() == date {
                out.add(&rec);
            }
        }
        Ok(out)
    }

    /// Write `quota_summary_YYYY-MM-DD.csv` into `dir` for one UTC day.
    ///
    /// Columns: `provider,total_calls,success_count,fail_count,top_endpoints`,
    /// where `top_endpoints` lists up to three entries as `name(count)` joined by `;`.
    ///
    /// # Errors
    /// Returns `GapwatchError::Persistence` when reading the log or writing the export fails.
    pub fn export_daily_summary(
        &self,
        date: NaiveDate,
        dir: impl AsRef<Path>,
    ) -> Result<PathBuf, GapwatchError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| GapwatchError::persistence(dir, e))?;
        let out_path = dir.join(format!("quota_summary_{}.csv", date.format("%Y-%m-%d")));
        let summary = self.day_summary(date)?;

        let mut w = csv::Writer::from_path(&out_path)
            .map_err(|e| GapwatchError::persistence(&out_path, e))?;
        w.write_record(["provider", "total_calls", "success_count", "fail_count", "top_endpoints"])
            .map_err(|e| GapwatchError::persistence(&out_path, e))?;
        for (provider, usage) in &summary.by_provider {
            let top = usage
                .top_endpoints(3)
                .into_iter()
                .map(|(name, n)| format!("{name}({n})"))
                .collect::<Vec<_>>()
                .join(";");
            w.write_record([
                provider.clone(),
                usage.total_calls.to_string(),
                usage.success_count.to_string(),
                usage.fail_count.to_string(),
                top,
            ])
            .map_err(|e| GapwatchError::persistence(&out_path, e))?;
        }
        w.flush().map_err(|e| GapwatchError::persistence(&out_path, e))?;
        tracing::info!(path = %out_path.display(), providers = summary.by_provider.len(), "exported daily quota summary");
        Ok(out_path)
    }
}
