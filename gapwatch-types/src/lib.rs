//! Gapwatch-specific error, configuration and ledger types shared by every crate in the workspace.
#![warn(missing_docs)]

mod config;
mod connector;
mod error;
mod market;
mod quota;
mod scan;

pub use config::{
    BackoffConfig, BusConfig, CacheConfig, ChainConfig, CoordinatorConfig, GapwatchConfig,
    QuotaGuardConfig, QuotaLimit, SchedulerConfig, TriggerConfig, parse_local_time,
};
pub use connector::{ConnectionState, DataPriority, ProviderKey};
pub use error::GapwatchError;
pub use market::{HistoryRequest, Interval, Range};
pub use quota::{QuotaLedgerEntry, QuotaPeriod, QuotaSnapshot, UsageLogRecord};
pub use scan::ScanKind;
