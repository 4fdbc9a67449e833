use std::future::Future;
use tracing::Instrument;

/// Wraps a fallible future in a `gateway.proxy`-style span, recording a
/// `success` boolean and, on error, an `error` field carrying the
/// `Display` of the error before re-surfacing it. A disabled tracing
/// subscriber makes this a pass-through at effectively zero cost, so there
/// is no separate runtime toggle here.
pub async fn traced<F, T, E>(name: &'static str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let span = tracing::info_span!("gateway.proxy", otel.name = name, success = tracing::field::Empty, error = tracing::field::Empty);
    async {
        let result = fut.await;
        let current = tracing::Span::current();
        match &result {
            Ok(_) => current.record("success", true),
            Err(e) => {
                current.record("success", false);
                current.record("error", tracing::field::display(e));
            }
        };
        result
    }
    .instrument(span)
    .await
}
