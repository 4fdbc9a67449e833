use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Prometheus facade for the pipeline. Every method is side-effect only and
/// never returns an error — a metrics backend hiccup must never affect a
/// request's outcome.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: CounterVec,
    request_duration: HistogramVec,
    upstream_requests_total: CounterVec,
    upstream_duration: HistogramVec,
    cache_hits_total: CounterVec,
    cache_misses_total: CounterVec,
    rate_limit_exceeded_total: CounterVec,
    budget_spent_usd: GaugeVec,
    provider_health: GaugeVec,
    schema_drift_total: CounterVec,
}

impl GatewayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("apibridge_requests_total", "Total proxied requests by connector/method/status"),
            &["connector", "method", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("apibridge_request_duration_seconds", "End-to-end request duration"),
            &["connector", "method"],
        )?;
        let upstream_requests_total = CounterVec::new(
            Opts::new("apibridge_upstream_requests_total", "Total upstream attempts by connector/provider/status"),
            &["connector", "provider", "status"],
        )?;
        let upstream_duration = HistogramVec::new(
            HistogramOpts::new("apibridge_upstream_duration_seconds", "Upstream attempt duration"),
            &["connector", "provider"],
        )?;
        let cache_hits_total = CounterVec::new(Opts::new("apibridge_cache_hits_total", "Cache hits by connector"), &["connector"])?;
        let cache_misses_total =
            CounterVec::new(Opts::new("apibridge_cache_misses_total", "Cache misses by connector"), &["connector"])?;
        let rate_limit_exceeded_total = CounterVec::new(
            Opts::new("apibridge_rate_limit_exceeded_total", "Rate limit rejections by connector"),
            &["connector"],
        )?;
        let budget_spent_usd = GaugeVec::new(
            Opts::new("apibridge_budget_spent_usd", "Accumulated monthly spend by connector/month"),
            &["connector", "month"],
        )?;
        let provider_health = GaugeVec::new(
            Opts::new("apibridge_provider_health", "1 if the provider's last attempt succeeded, else 0"),
            &["connector", "provider"],
        )?;
        let schema_drift_total =
            CounterVec::new(Opts::new("apibridge_schema_drift_total", "Response schema drift events by connector"), &["connector"])?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(upstream_requests_total.clone()))?;
        registry.register(Box::new(upstream_duration.clone()))?;
        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(cache_misses_total.clone()))?;
        registry.register(Box::new(rate_limit_exceeded_total.clone()))?;
        registry.register(Box::new(budget_spent_usd.clone()))?;
        registry.register(Box::new(provider_health.clone()))?;
        registry.register(Box::new(schema_drift_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            upstream_requests_total,
            upstream_duration,
            cache_hits_total,
            cache_misses_total,
            rate_limit_exceeded_total,
            budget_spent_usd,
            provider_health,
            schema_drift_total,
        })
    }

    pub fn record_request(&self, connector: &str, method: &str, status: u16, duration_s: f64) {
        self.requests_total.with_label_values(&[connector, method, &status.to_string()]).inc();
        self.request_duration.with_label_values(&[connector, method]).observe(duration_s);
    }

    pub fn record_upstream(&self, connector: &str, provider: &str, status: &str, duration_s: f64) {
        self.upstream_requests_total.with_label_values(&[connector, provider, status]).inc();
        self.upstream_duration.with_label_values(&[connector, provider]).observe(duration_s);
    }

    pub fn record_cache_hit(&self, connector: &str) {
        self.cache_hits_total.with_label_values(&[connector]).inc();
    }

    pub fn record_cache_miss(&self, connector: &str) {
        self.cache_misses_total.with_label_values(&[connector]).inc();
    }

    pub fn record_rate_limit(&self, connector: &str) {
        self.rate_limit_exceeded_total.with_label_values(&[connector]).inc();
    }

    pub fn update_budget(&self, connector: &str, month: &str, amount: f64) {
        self.budget_spent_usd.with_label_values(&[connector, month]).set(amount);
    }

    pub fn update_provider_health(&self, connector: &str, provider: &str, healthy: bool) {
        self.provider_health.with_label_values(&[connector, provider]).set(if healthy { 1.0 } else { 0.0 });
    }

    pub fn record_schema_drift(&self, connector: &str) {
        self.schema_drift_total.with_label_values(&[connector]).inc();
    }

    /// Prometheus text exposition format for `/metrics`.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
