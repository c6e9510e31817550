//! Composition root wiring every component from one configuration.

use std::sync::Arc;

use gapwatch_core::{Clock, DataProvider, GapwatchConfig, GapwatchError, Stages, SystemClock};
use gapwatch_middleware::{QuotaGuard, TtlCache};

use crate::bus::EventBus;
use crate::chain::ProviderFallbackChain;
use crate::coordinator::Coordinator;
use crate::scheduler::Scheduler;

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    cfg: GapwatchConfig,
    providers: Vec<Arc<dyn DataProvider>>,
    stages: Option<Stages>,
    clock: Arc<dyn Clock>,
}

impl RuntimeBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(cfg: GapwatchConfig) -> Self {
        Self {
            cfg,
            providers: Vec::new(),
            stages: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Register a provider in the fallback chain.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Pipeline stages run by the coordinator.
    #[must_use]
    pub fn stages(mut self, stages: Stages) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Clock shared by the ledger, cache, chain and scheduler.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and construct every component.
    ///
    /// # Errors
    /// Returns `Config` for invalid configuration or missing stages,
    /// `InvalidArg` without providers, and `Persistence` when durable state
    /// cannot be opened.
    pub fn build(self) -> Result<Runtime, GapwatchError> {
        self.cfg.validate()?;
        let stages = self
            .stages
            .ok_or_else(|| GapwatchError::Config("pipeline stages are required".into()))?;
        let bus = EventBus::with_clock(&self.cfg.bus, Arc::clone(&self.clock));
        let quota = Arc::new(QuotaGuard::from_config(&self.cfg.quota, Arc::clone(&self.clock))?);
        let cache = Arc::new(TtlCache::from_config(&self.cfg.cache, Arc::clone(&self.clock))?);
        let chain = self
            .providers
            .into_iter()
            .fold(ProviderFallbackChain::builder(), |b, p| b.with_provider(p))
            .quota(Arc::clone(&quota))
            .cache(cache)
            .clock(Arc::clone(&self.clock))
            .config(self.cfg.chain)
            .cache_ttls(&self.cfg.cache)
            .build()?;
        let chain = Arc::new(chain);
        let coordinator = Coordinator::new(
            bus.clone(),
            Arc::clone(&chain),
            stages,
            self.cfg.coordinator,
        );
        let scheduler = Scheduler::new(
            &self.cfg.scheduler,
            bus.clone(),
            Some(Arc::clone(&chain)),
            self.clock,
        )?;
        Ok(Runtime {
            bus,
            quota,
            chain,
            coordinator,
            scheduler,
        })
    }
}

/// Every component of a running agent.
#[derive(Debug)]
pub struct Runtime {
    bus: EventBus,
    quota: Arc<QuotaGuard>,
    chain: Arc<ProviderFallbackChain>,
    coordinator: Coordinator,
    scheduler: Scheduler,
}

impl Runtime {
    /// Start building a runtime.
    #[must_use]
    pub fn builder(cfg: GapwatchConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(cfg)
    }

    /// Start the bus, then the coordinator, then the scheduler.
    pub async fn start(&self) {
        self.bus.start().await;
        self.coordinator.start();
        self.scheduler.start().await;
        tracing::info!("runtime started");
    }

    /// Stop in reverse order and flush the quota ledger.
    ///
    /// # Errors
    /// Returns `Persistence` when the ledger cannot be flushed; every
    /// component has been stopped by then.
    pub async fn shutdown(&self) -> Result<(), GapwatchError> {
        self.scheduler.stop().await;
        self.coordinator.stop().await;
        self.bus.stop().await;
        let flushed = self.quota.flush();
        if let Err(e) = flushed.as_ref() {
            tracing::error!(error = %e, "failed to flush quota ledger on shutdown");
        }
        tracing::info!("runtime stopped");
        flushed
    }

    /// The event bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The quota ledger.
    #[must_use]
    pub const fn quota(&self) -> &Arc<QuotaGuard> {
        &self.quota
    }

    /// The provider chain.
    #[must_use]
    pub const fn chain(&self) -> &Arc<ProviderFallbackChain> {
        &self.chain
    }

    /// The workflow coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// The scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
