//! Ordered provider resolution with quota gating, result caching and a
//! supervised streaming leg.
//!
//! Lookup order for a quote is: latest streamed quote (while a session is
//! up), then the TTL cache, then each provider in effective rank order. A
//! provider is skipped when it lacks the capability, fails its health check,
//! or has no quota left. Provider failures are logged and folded; callers see
//! `None` or an empty collection, never the transport error.

pub mod streaming;
pub(crate) mod util;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gapwatch_core::{
    Bar, CacheConfig, ChainConfig, Clock, ConnectionState, DataPriority, DataProvider,
    GapwatchError, HistoryRequest, Interval, Quote, Range, Symbol, SystemClock,
};
use gapwatch_middleware::{QuotaGuard, TtlCache, cache_key};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use streaming::controller::{StreamParams, spawn_stream_supervisor};
use streaming::{QuoteCallback, QuoteSink};
use util::{collapse_errors, provider_call_with_timeout};

#[derive(Debug, Clone, Copy, Default)]
struct HealthRecord {
    healthy: bool,
    checked_at: Option<DateTime<Utc>>,
}

struct Registered {
    provider: Arc<dyn DataProvider>,
    index: usize,
    health: Mutex<HealthRecord>,
}

impl Registered {
    fn name(&self) -> &'static str {
        self.provider.name()
    }
}

struct StreamTask {
    provider: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Last known state of one registered provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    /// Provider name.
    pub provider: &'static str,
    /// Configured freshness rank.
    pub rank: DataPriority,
    /// Outcome of the latest health check; `true` before the first check.
    pub healthy: bool,
    /// When the latest health check ran.
    pub checked_at: Option<DateTime<Utc>>,
    /// Whether quota pressure currently ranks this provider below its peers.
    pub demoted: bool,
    /// Quota usage, for tracked providers.
    pub usage_percent: Option<f64>,
}

/// Builder for [`ProviderFallbackChain`].
pub struct ChainBuilder {
    providers: Vec<Arc<dyn DataProvider>>,
    quota: Option<Arc<QuotaGuard>>,
    cache: Option<Arc<TtlCache>>,
    clock: Arc<dyn Clock>,
    cfg: ChainConfig,
    quote_ttl: Duration,
    history_ttl: Duration,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    /// Empty builder with default configuration and the system clock.
    #[must_use]
    pub fn new() -> Self {
        let cache = CacheConfig::default();
        Self {
            providers: Vec::new(),
            quota: None,
            cache: None,
            clock: Arc::new(SystemClock),
            cfg: ChainConfig::default(),
            quote_ttl: cache.quote_ttl(),
            history_ttl: cache.history_ttl(),
        }
    }

    /// Register a provider. Registration order breaks ties inside a rank.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Gate provider calls through this ledger.
    #[must_use]
    pub fn quota(mut self, quota: Arc<QuotaGuard>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Cache results in this store.
    #[must_use]
    pub fn cache(mut self, cache: Arc<TtlCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Clock used for health timestamps and the default cache.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Chain configuration.
    #[must_use]
    pub fn config(mut self, cfg: ChainConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Take quote and history TTLs from a cache configuration.
    #[must_use]
    pub fn cache_ttls(mut self, cfg: &CacheConfig) -> Self {
        self.quote_ttl = cfg.quote_ttl();
        self.history_ttl = cfg.history_ttl();
        self
    }

    /// Build the chain.
    ///
    /// # Errors
    /// Returns `InvalidArg` if no providers were registered, and persistence
    /// errors from the default quota guard.
    pub fn build(self) -> Result<ProviderFallbackChain, GapwatchError> {
        if self.providers.is_empty() {
            return Err(GapwatchError::InvalidArg(
                "no providers registered; add at least one via with_provider(...)".to_string(),
            ));
        }
        let quota = match self.quota {
            Some(q) => q,
            None => Arc::new(QuotaGuard::builder().clock(Arc::clone(&self.clock)).build()?),
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(TtlCache::new(10_000, Arc::clone(&self.clock))));
        let providers = self
            .providers
            .into_iter()
            .enumerate()
            .map(|(index, provider)| Registered {
                provider,
                index,
                health: Mutex::new(HealthRecord {
                    healthy: true,
                    checked_at: None,
                }),
            })
            .collect();
        let (desired, _) = watch::channel::<Arc<[Symbol]>>(Arc::from(Vec::new()));
        Ok(ProviderFallbackChain {
            providers,
            quota,
            cache,
            clock: self.clock,
            cfg: self.cfg,
            quote_ttl: self.quote_ttl,
            history_ttl: self.history_ttl,
            demoted: Mutex::new(HashSet::new()),
            sink: Arc::new(QuoteSink::new()),
            desired,
            stream: tokio::sync::Mutex::new(None),
        })
    }
}

/// Resolves market data through ranked providers.
pub struct ProviderFallbackChain {
    providers: Vec<Registered>,
    quota: Arc<QuotaGuard>,
    cache: Arc<TtlCache>,
    clock: Arc<dyn Clock>,
    cfg: ChainConfig,
    quote_ttl: Duration,
    history_ttl: Duration,
    demoted: Mutex<HashSet<&'static str>>,
    sink: Arc<QuoteSink>,
    desired: watch::Sender<Arc<[Symbol]>>,
    stream: tokio::sync::Mutex<Option<StreamTask>>,
}

impl std::fmt::Debug for ProviderFallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFallbackChain")
            .field(
                "providers",
                &self.providers.iter().map(Registered::name).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl ProviderFallbackChain {
    /// Start building a chain.
    #[must_use]
    pub fn builder() -> ChainBuilder {
        ChainBuilder::new()
    }

    /// The quota ledger gating this chain.
    #[must_use]
    pub const fn quota(&self) -> &Arc<QuotaGuard> {
        &self.quota
    }

    /// The result cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// Clock shared with the ledger and cache.
    #[must_use]
    pub const fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn is_demoted(&self, name: &str) -> bool {
        self.quota
            .usage_percent(name)
            .is_some_and(|pct| pct > self.cfg.demotion_threshold_percent)
    }

    /// Providers in the order they are tried right now.
    ///
    /// Demoted providers sort after every non-demoted one; inside each group
    /// the order is rank, then registration.
    fn effective_order(&self) -> Vec<&Registered> {
        let mut flagged: Vec<(bool, &Registered)> = self
            .providers
            .iter()
            .map(|r| (self.is_demoted(r.name()), r))
            .collect();
        {
            let mut demoted = self.demoted.lock().unwrap_or_else(PoisonError::into_inner);
            for (is_demoted, r) in &flagged {
                let name = r.name();
                if *is_demoted && demoted.insert(name) {
                    tracing::info!(
                        provider = name,
                        threshold = self.cfg.demotion_threshold_percent,
                        "quota pressure; demoting provider"
                    );
                } else if !*is_demoted && demoted.remove(name) {
                    tracing::info!(provider = name, "quota recovered; restoring provider rank");
                }
            }
        }
        flagged.sort_by_key(|(d, r)| (*d, r.provider.rank(), r.index));
        flagged.into_iter().map(|(_, r)| r).collect()
    }

    /// Best freshness rank currently available without a demoted provider.
    ///
    /// Returns `Delayed` when every provider is demoted.
    #[must_use]
    pub fn current_priority_level(&self) -> DataPriority {
        self.effective_order()
            .into_iter()
            .filter(|r| !self.is_demoted(r.name()))
            .map(|r| r.provider.rank())
            .min()
            .unwrap_or(DataPriority::Delayed)
    }

    async fn health_check(&self, reg: &Registered) -> bool {
        let healthy = tokio::time::timeout(
            self.cfg.provider_timeout(),
            reg.provider.health_check(),
        )
        .await
        .unwrap_or(false);
        let mut h = reg.health.lock().unwrap_or_else(PoisonError::into_inner);
        h.healthy = healthy;
        h.checked_at = Some(self.clock.now());
        healthy
    }

    /// Health, quota check and consumption for `units` on `endpoint`.
    async fn admit(&self, reg: &Registered, units: u64, endpoint: &str) -> Result<(), GapwatchError> {
        let name = reg.name();
        if !self.health_check(reg).await {
            tracing::debug!(provider = name, "skipping unhealthy provider");
            return Err(GapwatchError::provider(name, "health check failed"));
        }
        if !self.quota.check_quota(name, units) {
            tracing::debug!(provider = name, units, "skipping provider without quota");
            return Err(self.quota.snapshot(name).map_or_else(
                || GapwatchError::provider(name, "quota unavailable"),
                GapwatchError::quota_exhausted,
            ));
        }
        self.quota.consume_quota(name, units, endpoint).await?;
        Ok(())
    }

    fn tag(reg: &Registered, q: &mut Quote) {
        q.provider = reg.name().to_string();
        q.delayed = q.delayed || reg.provider.rank().is_delayed();
    }

    fn streamed(&self, symbol: &Symbol) -> Option<Quote> {
        if self.sink.state() != ConnectionState::Connected {
            return None;
        }
        self.sink.latest(symbol)
    }

    /// Quote for one symbol, or `None` when every source failed.
    pub async fn get_one(&self, symbol: &Symbol) -> Option<Quote> {
        if let Some(q) = self.streamed(symbol) {
            return Some(q);
        }
        let key = cache_key("quote", &[symbol.as_str()]);
        if let Some(q) = self.cache.get::<Quote>(&key).await {
            return Some(q);
        }
        self.fetch_and_cache(symbol, &key).await
    }

    /// Quote for one symbol straight from the providers, bypassing both caches.
    ///
    /// The result still refreshes the TTL cache.
    pub async fn get_fresh(&self, symbol: &Symbol) -> Option<Quote> {
        let key = cache_key("quote", &[symbol.as_str()]);
        self.fetch_and_cache(symbol, &key).await
    }

    async fn fetch_and_cache(&self, symbol: &Symbol, key: &str) -> Option<Quote> {
        match self.resolve_quote(symbol).await {
            Ok(q) => {
                self.cache.set(key, &q, self.quote_ttl).await;
                Some(q)
            }
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "no provider could serve quote");
                None
            }
        }
    }

    async fn resolve_quote(&self, symbol: &Symbol) -> Result<Quote, GapwatchError> {
        let mut attempted = false;
        let mut errors = Vec::new();
        for reg in self.effective_order() {
            let Some(qp) = reg.provider.as_quote_provider() else {
                continue;
            };
            attempted = true;
            let name = reg.name();
            if let Err(e) = self.admit(reg, 1, "quote").await {
                errors.push(e);
                continue;
            }
            let fut = qp.quote(symbol);
            match provider_call_with_timeout(name, "quote", self.cfg.provider_timeout(), fut).await {
                Ok(Some(mut q)) => {
                    Self::tag(reg, &mut q);
                    if q.delayed {
                        tracing::debug!(symbol = %symbol, provider = name, "serving delayed quote");
                    }
                    return Ok(q);
                }
                Ok(None) => errors.push(GapwatchError::not_found(format!("quote for {symbol} via {name}"))),
                Err(e) => {
                    tracing::warn!(provider = name, symbol = %symbol, error = %e, "provider declined quote");
                    errors.push(e);
                }
            }
        }
        Err(collapse_errors(
            "quote",
            attempted,
            errors,
            Some(format!("quote for {symbol}")),
        ))
    }

    /// Quotes for several symbols. Symbols no source could serve are absent.
    ///
    /// Unresolved symbols are fetched in batches of `batch_size`; each batch
    /// consumes one quota unit per symbol on the provider that serves it.
    pub async fn get_many(&self, symbols: &[Symbol]) -> HashMap<Symbol, Quote> {
        let mut out = HashMap::with_capacity(symbols.len());
        let mut missing = Vec::new();
        let unique: BTreeSet<&Symbol> = symbols.iter().collect();
        for s in unique {
            if let Some(q) = self.streamed(s) {
                out.insert(s.clone(), q);
                continue;
            }
            let key = cache_key("quote", &[s.as_str()]);
            match self.cache.get::<Quote>(&key).await {
                Some(q) => {
                    out.insert(s.clone(), q);
                }
                None => missing.push(s.clone()),
            }
        }
        for batch in missing.chunks(self.cfg.batch_size.max(1)) {
            for (s, q) in self.resolve_batch(batch).await {
                let key = cache_key("quote", &[s.as_str()]);
                self.cache.set(key, &q, self.quote_ttl).await;
                out.insert(s, q);
            }
        }
        out
    }

    async fn resolve_batch(&self, batch: &[Symbol]) -> HashMap<Symbol, Quote> {
        let mut found = HashMap::with_capacity(batch.len());
        let mut remaining: Vec<Symbol> = batch.to_vec();
        let mut errors = Vec::new();
        for reg in self.effective_order() {
            if remaining.is_empty() {
                break;
            }
            let Some(qp) = reg.provider.as_quote_provider() else {
                continue;
            };
            let name = reg.name();
            if let Err(e) = self.admit(reg, remaining.len() as u64, "quotes").await {
                errors.push(e);
                continue;
            }
            let fut = qp.quotes(&remaining);
            match provider_call_with_timeout(name, "quotes", self.cfg.provider_timeout(), fut).await {
                Ok(map) => {
                    for (s, mut q) in map {
                        if remaining.contains(&s) {
                            Self::tag(reg, &mut q);
                            found.insert(s, q);
                        }
                    }
                    remaining.retain(|s| !found.contains_key(s));
                }
                Err(e) => {
                    tracing::warn!(provider = name, symbols = remaining.len(), error = %e, "provider declined batch");
                    errors.push(e);
                }
            }
        }
        if !remaining.is_empty() {
            tracing::warn!(
                unresolved = remaining.len(),
                failures = errors.len(),
                "batch partially unresolved"
            );
        }
        found
    }

    /// Bars for one symbol. Empty when every provider failed or had no data.
    pub async fn get_history(&self, symbol: &Symbol, range: Range, interval: Interval) -> Vec<Bar> {
        let range_s = range.to_string();
        let interval_s = interval.to_string();
        let key = cache_key("history", &[symbol.as_str(), &range_s, &interval_s]);
        if let Some(bars) = self.cache.get::<Vec<Bar>>(&key).await {
            return bars;
        }
        match self.resolve_history(symbol, HistoryRequest::new(range, interval)).await {
            Ok(bars) => {
                self.cache.set(key, &bars, self.history_ttl).await;
                bars
            }
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "no provider could serve history");
                Vec::new()
            }
        }
    }

    async fn resolve_history(&self, symbol: &Symbol, req: HistoryRequest) -> Result<Vec<Bar>, GapwatchError> {
        let mut attempted = false;
        let mut errors = Vec::new();
        for reg in self.effective_order() {
            let Some(hp) = reg.provider.as_history_provider() else {
                continue;
            };
            attempted = true;
            let name = reg.name();
            if let Err(e) = self.admit(reg, 1, "history").await {
                errors.push(e);
                continue;
            }
            let fut = hp.history(symbol, req);
            match provider_call_with_timeout(name, "history", self.cfg.provider_timeout(), fut).await {
                Ok(bars) if bars.is_empty() => {
                    errors.push(GapwatchError::not_found(format!("history for {symbol} via {name}")));
                }
                Ok(mut bars) => {
                    for b in &mut bars {
                        if b.provider.is_empty() {
                            b.provider = name.to_string();
                        }
                    }
                    return Ok(bars);
                }
                Err(e) => {
                    tracing::warn!(provider = name, symbol = %symbol, error = %e, "provider declined history");
                    errors.push(e);
                }
            }
        }
        Err(collapse_errors(
            "history",
            attempted,
            errors,
            Some(format!("history for {symbol}")),
        ))
    }

    /// Add symbols to the streamed set. A change restarts the session.
    pub fn subscribe_stream(&self, symbols: &[Symbol]) {
        self.desired.send_if_modified(|cur| {
            let mut set: BTreeSet<Symbol> = cur.iter().cloned().collect();
            let before = set.len();
            set.extend(symbols.iter().cloned());
            if set.len() == before {
                return false;
            }
            *cur = set.into_iter().collect::<Vec<_>>().into();
            true
        });
    }

    /// Remove symbols from the streamed set.
    pub fn unsubscribe_stream(&self, symbols: &[Symbol]) {
        self.desired.send_if_modified(|cur| {
            let before = cur.len();
            let kept: Vec<Symbol> = cur.iter().filter(|s| !symbols.contains(s)).cloned().collect();
            if kept.len() == before {
                return false;
            }
            *cur = kept.into();
            true
        });
    }

    /// Symbols currently requested from the stream.
    #[must_use]
    pub fn streamed_symbols(&self) -> Vec<Symbol> {
        self.desired.borrow().to_vec()
    }

    /// Register a callback run for every streamed quote.
    pub fn on_quote<F>(&self, callback: F)
    where
        F: Fn(&Quote) + Send + Sync + 'static,
    {
        let cb: QuoteCallback = Arc::new(callback);
        self.sink.register(cb);
    }

    /// Latest streamed quote for `symbol`, regardless of connection state.
    #[must_use]
    pub fn latest_quote(&self, symbol: &Symbol) -> Option<Quote> {
        self.sink.latest(symbol)
    }

    /// Every latest streamed quote.
    #[must_use]
    pub fn latest_quotes(&self) -> HashMap<Symbol, Quote> {
        self.sink.latest_all()
    }

    /// Watch the streaming connection state.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.sink.subscribe_state()
    }

    /// Health and demotion state of every provider in registration order.
    #[must_use]
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.providers
            .iter()
            .map(|r| {
                let h = *r.health.lock().unwrap_or_else(PoisonError::into_inner);
                ProviderHealth {
                    provider: r.name(),
                    rank: r.provider.rank(),
                    healthy: h.healthy,
                    checked_at: h.checked_at,
                    demoted: self.is_demoted(r.name()),
                    usage_percent: self.quota.usage_percent(r.name()),
                }
            })
            .collect()
    }

    /// Start supervising a stream on the best-ranked streaming provider.
    ///
    /// Returns the provider chosen, or `None` when no provider can stream.
    /// Calling it while already streaming keeps the running session.
    pub async fn start_streaming(&self) -> Option<&'static str> {
        let mut guard = self.stream.lock().await;
        if let Some(task) = guard.as_ref()
            && !task.join.is_finished()
        {
            return Some(task.provider);
        }
        let Some(reg) = self
            .providers
            .iter()
            .filter(|r| r.provider.as_stream_provider().is_some())
            .min_by_key(|r| (r.provider.rank(), r.index))
        else {
            tracing::info!("no streaming provider registered; quotes are polled only");
            return None;
        };
        let cancel = CancellationToken::new();
        let params = StreamParams {
            provider: Arc::clone(&reg.provider),
            symbols: self.desired.subscribe(),
            sink: Arc::clone(&self.sink),
            backoff: self.cfg.backoff,
            connect_timeout: self.cfg.provider_timeout(),
        };
        let join = spawn_stream_supervisor(params, cancel.clone());
        tracing::info!(provider = reg.name(), "stream supervisor started");
        *guard = Some(StreamTask {
            provider: reg.name(),
            cancel,
            join,
        });
        Some(reg.name())
    }

    /// Stop the stream supervisor and wait for it to close its session.
    pub async fn stop_streaming(&self) {
        let task = self.stream.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.join.await {
                tracing::error!(error = %e, "stream supervisor task failed");
            }
        }
    }
}
