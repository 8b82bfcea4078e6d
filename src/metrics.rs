use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and register all application metrics.
///
/// With `listen_addr` set, an HTTP scrape endpoint is served there; without
/// it the recorder is installed but nothing is exposed.
pub fn init_metrics(listen_addr: Option<&str>) -> anyhow::Result<()> {
    match listen_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            tracing::info!(%addr, "Prometheus exporter listening");
        }
        None => {
            PrometheusBuilder::new().install_recorder()?;
        }
    }

    // Pre-register counters so they appear even before the first increment.
    counter!("fills_received_total").absolute(0);
    counter!("copy_orders_submitted_total").absolute(0);
    counter!("copy_orders_failed_total").absolute(0);
    counter!("feed_reconnects_total").absolute(0);
    counter!("dispatch_requests_total").absolute(0);
    counter!("dispatch_rate_limited_total").absolute(0);

    gauge!("subscribed_masters").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("replication_latency_seconds").record(0.0);

    Ok(())
}
