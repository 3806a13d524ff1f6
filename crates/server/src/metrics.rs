//! Operation metrics, gated by the `enable_monitor` switch.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Histogram,
    HistogramVec, IntCounterVec,
};
use tracing::debug;

lazy_static! {
    pub static ref KEYGEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tss_keygen_total",
        "Keygen operations by terminal result",
        &["result"]
    )
    .expect("failed to register tss_keygen_total");

    pub static ref KEYSIGN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tss_keysign_total",
        "Keysign operations by terminal result",
        &["result"]
    )
    .expect("failed to register tss_keysign_total");

    pub static ref JOIN_PARTY_DURATION: Histogram = register_histogram!(
        "tss_join_party_duration_seconds",
        "Time spent forming a party"
    )
    .expect("failed to register tss_join_party_duration_seconds");

    pub static ref SESSION_DURATION: HistogramVec = register_histogram_vec!(
        "tss_session_duration_seconds",
        "End-to-end session duration by operation",
        &["operation"]
    )
    .expect("failed to register tss_session_duration_seconds");
}

/// Recording facade; a disabled monitor records nothing.
#[derive(Debug, Clone, Copy)]
pub struct Monitor {
    enabled: bool,
}

impl Monitor {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn record_keygen(&self, result: &str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        KEYGEN_TOTAL.with_label_values(&[result]).inc();
        SESSION_DURATION
            .with_label_values(&["keygen"])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_keysign(&self, result: &str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        KEYSIGN_TOTAL.with_label_values(&[result]).inc();
        SESSION_DURATION
            .with_label_values(&["keysign"])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_join_party(&self, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        JOIN_PARTY_DURATION.observe(elapsed.as_secs_f64());
    }

    /// Periodically dump the registry in text form to the log.
    pub fn spawn_reporter(&self, interval: Duration) {
        if !self.enabled {
            return;
        }
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                let families = prometheus::gather();
                match prometheus::TextEncoder::new().encode_to_string(&families) {
                    Ok(text) => debug!(target: "tss_metrics", "{text}"),
                    Err(e) => debug!("metrics encoding failed: {e}"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let before = KEYGEN_TOTAL.with_label_values(&["success"]).get();
        let monitor = Monitor::new(false);
        monitor.record_keygen("success", Duration::from_secs(1));
        assert_eq!(KEYGEN_TOTAL.with_label_values(&["success"]).get(), before);
    }

    #[test]
    fn test_enabled_monitor_counts() {
        let before = KEYSIGN_TOTAL.with_label_values(&["fail"]).get();
        let monitor = Monitor::new(true);
        monitor.record_keysign("fail", Duration::from_millis(5));
        assert_eq!(KEYSIGN_TOTAL.with_label_values(&["fail"]).get(), before + 1);
    }
}
