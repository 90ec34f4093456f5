//! Prometheus registry for `GET /metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Gateway-wide Prometheus collectors.
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    tokens_total: IntCounterVec,
    cost_usd_total: prometheus::CounterVec,
    latency_seconds: HistogramVec,
    in_flight: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("pllm_requests_total", "Completed requests by model, provider, and status"),
            &["model", "provider", "status"],
        )
        .expect("valid metric definition");

        let tokens_total = IntCounterVec::new(
            Opts::new("pllm_tokens_total", "Tokens processed by model and direction"),
            &["model", "direction"],
        )
        .expect("valid metric definition");

        let cost_usd_total = prometheus::CounterVec::new(
            Opts::new("pllm_cost_usd_total", "Accumulated cost in USD by model"),
            &["model"],
        )
        .expect("valid metric definition");

        let latency_seconds = HistogramVec::new(
            HistogramOpts::new("pllm_request_latency_seconds", "End-to-end request latency")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["model"],
        )
        .expect("valid metric definition");

        let in_flight = IntGauge::new("pllm_in_flight_requests", "Requests currently in flight")
            .expect("valid metric definition");

        registry.register(Box::new(requests_total.clone())).expect("unique collector");
        registry.register(Box::new(tokens_total.clone())).expect("unique collector");
        registry.register(Box::new(cost_usd_total.clone())).expect("unique collector");
        registry.register(Box::new(latency_seconds.clone())).expect("unique collector");
        registry.register(Box::new(in_flight.clone())).expect("unique collector");

        Self { registry, requests_total, tokens_total, cost_usd_total, latency_seconds, in_flight }
    }

    pub fn request_started(&self) {
        self.in_flight.inc();
    }

    pub fn request_finished(
        &self,
        model: &str,
        provider: &str,
        status: u16,
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
        latency_secs: f64,
    ) {
        self.in_flight.dec();
        self.requests_total
            .with_label_values(&[model, provider, &status.to_string()])
            .inc();
        self.tokens_total
            .with_label_values(&[model, "input"])
            .inc_by(input_tokens as u64);
        self.tokens_total
            .with_label_values(&[model, "output"])
            .inc_by(output_tokens as u64);
        self.cost_usd_total.with_label_values(&[model]).inc_by(cost);
        self.latency_seconds.with_label_values(&[model]).observe(latency_secs);
    }

    /// Render the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_renders() {
        let metrics = GatewayMetrics::new();
        metrics.request_started();
        metrics.request_finished("gpt-4", "openai", 200, 100, 50, 0.006, 0.8);

        let text = metrics.render();
        assert!(text.contains("pllm_requests_total"));
        assert!(text.contains("model=\"gpt-4\""));
        assert!(text.contains("pllm_tokens_total"));
        assert!(text.contains("pllm_cost_usd_total"));
        assert!(text.contains("pllm_request_latency_seconds"));
    }

    #[test]
    fn in_flight_gauge_balances() {
        let metrics = GatewayMetrics::new();
        metrics.request_started();
        metrics.request_started();
        metrics.request_finished("m", "openai", 200, 1, 1, 0.0, 0.1);
        let text = metrics.render();
        assert!(text.contains("pllm_in_flight_requests 1"));
    }
}
