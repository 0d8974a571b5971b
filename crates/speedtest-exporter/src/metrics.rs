use std::{sync::Arc, time::Duration};

use speedtest_common::error::Result;
use speedtest_metrics::{CounterMetric, HistogramMetric, MetricsRegistry, fq_name};

use crate::{collector::NAMESPACE, version::BuildInfo};

pub const STAGE_ADDRESS: &str = "address";
pub const STAGE_MEASUREMENT: &str = "measurement";
pub const STAGE_TIMEOUT: &str = "timeout";

/// The exporter's own instrumentation, served next to the speedtest
/// gauges.
pub struct ExporterMetrics {
    collect_failures_total: Arc<CounterMetric>,
    measurement_duration_seconds: Arc<HistogramMetric>,
}

impl ExporterMetrics {
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        let collect_failures_total = registry.register_counter(
            &fq_name(NAMESPACE, "", "collect_failures_total"),
            "Collection cycles that hit a failure, by stage.",
            &["stage"],
        )?;

        let measurement_duration_seconds = registry.register_histogram(
            &fq_name(NAMESPACE, "", "measurement_duration_seconds"),
            "Duration of successful speedtest measurements in seconds.",
            &[],
            &[5.0, 10.0, 20.0, 30.0, 45.0, 60.0, 90.0, 120.0, 180.0],
        )?;

        let build_info = registry.register_gauge(
            &fq_name(NAMESPACE, "exporter", "build_info"),
            "A metric with a constant '1' value labeled by version, revision and branch.",
            &["version", "revision", "branch"],
        )?;
        let build = BuildInfo::current();
        build_info.set(&[build.version, build.revision, build.branch], 1.0);

        Ok(Self {
            collect_failures_total,
            measurement_duration_seconds,
        })
    }

    pub fn record_failure(&self, stage: &str) {
        self.collect_failures_total.inc_one(&[stage]);
    }

    pub fn record_measurement(&self, duration: Duration) {
        self.measurement_duration_seconds
            .observe(&[], duration.as_secs_f64());
    }

    #[cfg(test)]
    pub(crate) fn failures(&self, stage: &str) -> u64 {
        self.collect_failures_total.get(&[stage])
    }
}
