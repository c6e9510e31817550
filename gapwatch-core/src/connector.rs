use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::GapwatchError;
use crate::stream::StreamHandle;
use crate::types::{Bar, DataPriority, HistoryRequest, ProviderKey, Quote, Symbol};

/// Focused role trait for providers that serve point-in-time quotes.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Fetch a quote for one symbol. `Ok(None)` means the provider has no data for it.
    async fn quote(&self, symbol: &Symbol) -> Result<Option<Quote>, GapwatchError>;

    /// Fetch quotes for several symbols in one call.
    ///
    /// Missing symbols are simply absent from the returned map. The default
    /// issues one `quote` call per symbol and stops at the first error.
    async fn quotes(&self, symbols: &[Symbol]) -> Result<HashMap<Symbol, Quote>, GapwatchError> {
        let mut out = HashMap::with_capacity(symbols.len());
        for s in symbols {
            if let Some(q) = self.quote(s).await? {
                out.insert(s.clone(), q);
            }
        }
        Ok(out)
    }
}

/// Focused role trait for providers that serve OHLCV history.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Fetch bars for the given symbol and request. An empty vector means no data.
    async fn history(&self, symbol: &Symbol, req: HistoryRequest) -> Result<Vec<Bar>, GapwatchError>;
}

/// Focused role trait for providers that push live quotes over a session.
#[async_trait]
pub trait StreamProvider: Send + Sync {
    /// Open a session for `symbols`.
    ///
    /// The receiver closes when the session ends for any reason; the handle
    /// stops the session when dropped or stopped.
    async fn stream_quotes(
        &self,
        symbols: &[Symbol],
    ) -> Result<(StreamHandle, mpsc::Receiver<Quote>), GapwatchError>;
}

/// A market data source that can be ranked inside the fallback chain.
///
/// Capabilities are advertised through the `as_*_provider` accessors; a
/// provider that returns `None` for a capability is never asked for it.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Stable provider name. Also used as the quota ledger identifier.
    fn name(&self) -> &'static str;

    /// Typed key for this provider.
    fn key(&self) -> ProviderKey {
        ProviderKey::new(self.name())
    }

    /// Freshness rank of the data this provider serves.
    fn rank(&self) -> DataPriority;

    /// Liveness check run before each use. Must not consume quota.
    async fn health_check(&self) -> bool {
        true
    }

    /// Quote capability, if supported.
    fn as_quote_provider(&self) -> Option<&dyn QuoteProvider> {
        None
    }

    /// History capability, if supported.
    fn as_history_provider(&self) -> Option<&dyn HistoryProvider> {
        None
    }

    /// Streaming capability, if supported.
    fn as_stream_provider(&self) -> Option<&dyn StreamProvider> {
        None
    }
}
