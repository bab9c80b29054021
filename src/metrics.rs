//! Metrics sink: the Prometheus registry, the always-present serial
//! message/error counters and last-message gauge, and the `/metrics` HTTP
//! endpoint.

use anyhow::Result;
use axum::{routing::get, Router};
use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use strum::IntoEnumIterator;

use crate::error::ErrorKind;
use crate::frame::Exchange;

/// `{"source": "sniffed"|"injected"}` and `{"error": <ErrorKind label>}`
/// label domains are enumerated eagerly at construction so that the very
/// first `/metrics` scrape already shows zero samples for every value.
pub struct Metrics {
    pub registry: Registry,
    messages: CounterVec,
    errors: CounterVec,
    last_message: Gauge,
}

impl Metrics {
    pub fn new(go_collector: bool, process_collector: bool) -> Result<Self> {
        let registry = Registry::new();

        let messages = CounterVec::new(
            Opts::new("solis_serial_messages_total", "Number of packet exchanges"),
            &["source"],
        )?;
        let errors = CounterVec::new(
            Opts::new(
                "solis_serial_errors_total",
                "Serial bus transmission or reception errors",
            ),
            &["error"],
        )?;
        let last_message = Gauge::with_opts(Opts::new(
            "solis_serial_last_message_time_seconds",
            "Time when last message received, in unixtime",
        ))?;

        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(last_message.clone()))?;

        for source in ["sniffed", "injected"] {
            messages.with_label_values(&[source]);
        }
        for kind in ErrorKind::iter() {
            errors.with_label_values(&[kind.label()]);
        }

        if go_collector {
            log::debug!("go_collector requested but has no meaning outside the Go runtime; ignored");
        }
        if process_collector {
            registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;
        }

        Ok(Metrics {
            registry,
            messages,
            errors,
            last_message,
        })
    }

    /// Records bookkeeping common to every exchange: the source counter,
    /// the error counter (if any), and the last-message gauge on success.
    pub fn record_exchange(&self, exchange: &Exchange) {
        let source = if exchange.sniffed { "sniffed" } else { "injected" };
        self.messages.with_label_values(&[source]).inc();

        match exchange.error {
            Some(kind) => {
                self.errors.with_label_values(&[kind.label()]).inc();
            }
            None => {
                self.last_message.set(now_epoch_seconds());
            }
        }
    }

    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move { render(&registry) }
            }),
        )
    }
}

fn now_epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn render(registry: &Registry) -> (axum::http::StatusCode, String) {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (
            axum::http::StatusCode::OK,
            String::from_utf8_lossy(&buffer).into_owned(),
        ),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode error: {e}"),
        ),
    }
}

/// Serves the metrics endpoint on `addr` until the process exits.
pub async fn serve(metrics: &Metrics, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("metrics listener on {addr}");
    axum::serve(listener, metrics.router()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_domains_are_pre_enumerated() {
        let metrics = Metrics::new(false, false).unwrap();
        let families = metrics.registry.gather();
        let messages = families
            .iter()
            .find(|f| f.get_name() == "solis_serial_messages_total")
            .unwrap();
        assert_eq!(messages.get_metric().len(), 2);

        let errors = families
            .iter()
            .find(|f| f.get_name() == "solis_serial_errors_total")
            .unwrap();
        assert_eq!(errors.get_metric().len(), 4);
    }

    #[test]
    fn successful_exchange_sets_last_message_time() {
        let metrics = Metrics::new(false, false).unwrap();
        let exchange = Exchange::new(true);
        metrics.record_exchange(&exchange);
        let families = metrics.registry.gather();
        let last = families
            .iter()
            .find(|f| f.get_name() == "solis_serial_last_message_time_seconds")
            .unwrap();
        assert!(last.get_metric()[0].get_gauge().get_value() > 0.0);
    }

    #[test]
    fn errored_exchange_increments_error_counter() {
        let metrics = Metrics::new(false, false).unwrap();
        let mut exchange = Exchange::new(true);
        exchange.error = Some(ErrorKind::CrcFailed);
        metrics.record_exchange(&exchange);
        let families = metrics.registry.gather();
        let errors = families
            .iter()
            .find(|f| f.get_name() == "solis_serial_errors_total")
            .unwrap();
        let crc = errors
            .get_metric()
            .iter()
            .find(|m| m.get_label().iter().any(|l| l.get_value() == "crc_failed"))
            .unwrap();
        assert_eq!(crc.get_counter().get_value(), 1.0);
    }
}
