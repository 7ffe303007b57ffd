use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and register metric help texts.
    pub fn init() -> Self {
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .expect("prometheus: install recorder");

        describe_all();

        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

fn describe_all() {
    static DESCRIBED: OnceCell<()> = OnceCell::new();
    DESCRIBED.get_or_init(|| {
        describe_counter!("gateway_sync_runs_total", "Successful history fetch cycles.");
        describe_counter!("gateway_sync_errors_total", "Failed fetch cycles.");
        describe_counter!(
            "gateway_captcha_failures_total",
            "Cycles failed on captcha resolution."
        );
        describe_counter!("gateway_login_failures_total", "Cycles failed on login.");
        describe_counter!(
            "gateway_error_streaks_total",
            "Error-streak signals emitted by pollers."
        );
        describe_counter!(
            "gateway_recoveries_total",
            "Recovery signals emitted by pollers."
        );
        describe_gauge!(
            "gateway_last_sync_ts",
            "Unix timestamp of the last successful fetch."
        );
        describe_counter!(
            "payments_observed_total",
            "Payments seen in fetched batches, duplicates included."
        );
        describe_counter!("payments_created_total", "Genuinely new payments stored.");
        describe_gauge!("payments_retained", "Payments currently held by the store.");
        describe_counter!("webhook_enqueued_total", "Delivery jobs accepted.");
        describe_counter!("webhook_delivered_total", "Webhooks delivered.");
        describe_counter!("webhook_retries_total", "Delivery attempts that were retried.");
        describe_counter!(
            "webhook_failed_total",
            "Deliveries abandoned after the attempt cap."
        );
        describe_counter!(
            "webhook_filtered_total",
            "Payments skipped by webhook filters."
        );
    });
}
