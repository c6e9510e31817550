use gapwatch_core::GapwatchError;

/// Bound one provider call by `timeout`, mapping expiry to `ProviderTimeout`.
#[tracing::instrument(
    name = "gapwatch::chain::provider_call",
    skip(fut),
    fields(timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
)]
pub(crate) async fn provider_call_with_timeout<T, Fut>(
    provider: &'static str,
    capability: &'static str,
    timeout: std::time::Duration,
    fut: Fut,
) -> Result<T, GapwatchError>
where
    Fut: core::future::Future<Output = Result<T, GapwatchError>>,
{
    (tokio::time::timeout(timeout, fut).await)
        .unwrap_or_else(|_| Err(GapwatchError::provider_timeout(provider, capability)))
}

/// Fold the failures of one lookup into a single error.
///
/// - nothing attempted: `NotFound("provider for <capability>")`
/// - every error a `NotFound` and `not_found_what` given: `NotFound(what)`
/// - a single error: that error
/// - otherwise: `AllProvidersFailed`
pub(crate) fn collapse_errors(
    capability: &str,
    attempted_any: bool,
    mut errors: Vec<GapwatchError>,
    not_found_what: Option<String>,
) -> GapwatchError {
    if !attempted_any {
        return GapwatchError::not_found(format!("provider for {capability}"));
    }
    if let Some(what) = not_found_what
        && errors
            .iter()
            .all(|e| matches!(e, GapwatchError::NotFound { .. }))
    {
        return GapwatchError::not_found(what);
    }
    if errors.len() == 1
        && let Some(only) = errors.pop()
    {
        return only;
    }
    GapwatchError::AllProvidersFailed(errors)
}
