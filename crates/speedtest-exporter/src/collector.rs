use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use speedtest_client::{MeasurementKey, MeasurementProvider, MeasurementReading};
use speedtest_common::error::{Result, SpeedtestError};
use speedtest_metrics::{Collector, MetricDescriptor, MetricType, Sample, SampleSender, fq_name};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    metrics::{ExporterMetrics, STAGE_ADDRESS, STAGE_MEASUREMENT, STAGE_TIMEOUT},
    resolver::AddressResolver,
};

pub const NAMESPACE: &str = "speedtest";
pub const UNKNOWN_ADDRESS: &str = "unknown";

const ADDRESS_LABEL: &str = "ip";

/// Runs one speedtest per scrape and exports ping, download and upload as
/// gauges labeled with the caller's public address.
///
/// Cycles are serialized: concurrent measurements would compete for the
/// same bandwidth, and each cycle's address must stay paired with its own
/// reading.
pub struct SpeedtestCollector {
    provider: Option<Arc<dyn MeasurementProvider>>,
    resolver: Arc<dyn AddressResolver>,
    metrics: Arc<ExporterMetrics>,
    descriptors: Vec<(MeasurementKey, Arc<MetricDescriptor>)>,
    timeout: Option<Duration>,
    cycle: Mutex<()>,
}

impl SpeedtestCollector {
    pub fn new(
        provider: Arc<dyn MeasurementProvider>,
        resolver: Arc<dyn AddressResolver>,
        metrics: Arc<ExporterMetrics>,
    ) -> Self {
        Self::build(Some(provider), resolver, metrics)
    }

    /// A collector with no measurement client. Every cycle logs an error
    /// and emits nothing.
    pub fn unconfigured(
        resolver: Arc<dyn AddressResolver>,
        metrics: Arc<ExporterMetrics>,
    ) -> Self {
        Self::build(None, resolver, metrics)
    }

    fn build(
        provider: Option<Arc<dyn MeasurementProvider>>,
        resolver: Arc<dyn AddressResolver>,
        metrics: Arc<ExporterMetrics>,
    ) -> Self {
        let descriptors = MeasurementKey::ALL
            .into_iter()
            .map(|key| {
                let descriptor = MetricDescriptor::new(
                    fq_name(NAMESPACE, "", key.as_str()),
                    help_text(key),
                    MetricType::Gauge,
                    &[ADDRESS_LABEL],
                );
                (key, Arc::new(descriptor))
            })
            .collect();

        Self {
            provider,
            resolver,
            metrics,
            descriptors,
            timeout: None,
            cycle: Mutex::new(()),
        }
    }

    /// Bounds each measurement. `None` lets a measurement run as long as
    /// the provider takes.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn resolve_address(&self) -> String {
        match self.resolver.resolve().await {
            Ok(address) => address,
            Err(err) => {
                warn!(error = %err, "failed to resolve public address");
                self.metrics.record_failure(STAGE_ADDRESS);
                UNKNOWN_ADDRESS.to_string()
            }
        }
    }

    async fn measure(&self, provider: &dyn MeasurementProvider) -> Result<MeasurementReading> {
        let started_at = Instant::now();
        let reading = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, provider.network_metrics())
                .await
                .map_err(|_| SpeedtestError::Timeout(limit))??,
            None => provider.network_metrics().await?,
        };
        let reading = reading.validate()?;

        self.metrics.record_measurement(started_at.elapsed());
        Ok(reading)
    }
}

fn help_text(key: MeasurementKey) -> &'static str {
    match key {
        MeasurementKey::Ping => "Latency (ms)",
        MeasurementKey::Download => "Download bandwidth (Mbps).",
        MeasurementKey::Upload => "Upload bandwidth (Mbps).",
    }
}

#[async_trait]
impl Collector for SpeedtestCollector {
    fn describe(&self) -> Vec<Arc<MetricDescriptor>> {
        self.descriptors
            .iter()
            .map(|(_, descriptor)| descriptor.clone())
            .collect()
    }

    async fn collect(&self, sink: &SampleSender) {
        info!("speedtest collection starting");
        let Some(provider) = self.provider.as_deref() else {
            error!("speedtest client not configured");
            return;
        };

        let _cycle = self.cycle.lock().await;
        let address = self.resolve_address().await;

        let reading = match self.measure(provider).await {
            Ok(reading) => reading,
            Err(err) => {
                let stage = match err {
                    SpeedtestError::Timeout(_) => STAGE_TIMEOUT,
                    _ => STAGE_MEASUREMENT,
                };
                self.metrics.record_failure(stage);
                error!(error = %err, ip = %address, "speedtest measurement failed, skipping cycle");
                return;
            }
        };

        for (key, descriptor) in &self.descriptors {
            let sample =
                match Sample::new_const(descriptor.clone(), reading.get(*key), vec![address.clone()]) {
                    Ok(sample) => sample,
                    Err(err) => {
                        error!(error = %err, metric = %descriptor.name, "failed to build sample");
                        continue;
                    }
                };

            if sink.send(sample).is_err() {
                warn!("sample sink closed before collection finished");
                return;
            }
        }

        info!(
            ip = %address,
            ping_ms = reading.ping,
            download_mbps = reading.download,
            upload_mbps = reading.upload,
            "speedtest collection finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use speedtest_client::{MeasurementProvider, MeasurementReading};
    use speedtest_common::error::{Result, SpeedtestError};
    use speedtest_metrics::{Collector, MetricsRegistry, Sample};
    use tokio::sync::mpsc;

    use crate::{metrics::ExporterMetrics, resolver::AddressResolver};

    use super::{SpeedtestCollector, UNKNOWN_ADDRESS};

    struct FixedProvider(MeasurementReading);

    #[async_trait]
    impl MeasurementProvider for FixedProvider {
        async fn network_metrics(&self) -> Result<MeasurementReading> {
            Ok(self.0)
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl MeasurementProvider for FailingProvider {
        async fn network_metrics(&self) -> Result<MeasurementReading> {
            Err(SpeedtestError::Network("connection reset".to_string()))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl MeasurementProvider for SlowProvider {
        async fn network_metrics(&self) -> Result<MeasurementReading> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(READING)
        }
    }

    /// Hands out the n-th reading on the n-th call, pausing so concurrent
    /// cycles get a chance to interleave.
    #[derive(Default)]
    struct CountingProvider(AtomicUsize);

    #[async_trait]
    impl MeasurementProvider for CountingProvider {
        async fn network_metrics(&self) -> Result<MeasurementReading> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let n = self.0.fetch_add(1, Ordering::SeqCst) as f64;
            Ok(MeasurementReading {
                ping: n,
                download: n,
                upload: n,
            })
        }
    }

    struct FixedResolver(&'static str);

    #[async_trait]
    impl AddressResolver for FixedResolver {
        async fn resolve(&self) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl AddressResolver for FailingResolver {
        async fn resolve(&self) -> Result<String> {
            Err(SpeedtestError::Network("no route to host".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingResolver(AtomicUsize);

    #[async_trait]
    impl AddressResolver for CountingResolver {
        async fn resolve(&self) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("10.0.0.{n}"))
        }
    }

    const READING: MeasurementReading = MeasurementReading {
        ping: 12.5,
        download: 85.2,
        upload: 9.7,
    };

    fn collector(
        provider: Option<Arc<dyn MeasurementProvider>>,
        resolver: Arc<dyn AddressResolver>,
    ) -> (SpeedtestCollector, Arc<ExporterMetrics>) {
        let registry = MetricsRegistry::new();
        let metrics = Arc::new(ExporterMetrics::register(&registry).expect("register metrics"));
        let collector = match provider {
            Some(provider) => SpeedtestCollector::new(provider, resolver, metrics.clone()),
            None => SpeedtestCollector::unconfigured(resolver, metrics.clone()),
        };
        (collector, metrics)
    }

    async fn run(collector: &SpeedtestCollector) -> Vec<Sample> {
        let (sink, mut receiver) = mpsc::unbounded_channel();
        collector.collect(&sink).await;
        drop(sink);

        let mut samples = Vec::new();
        while let Some(sample) = receiver.recv().await {
            samples.push(sample);
        }
        samples
    }

    fn summarize(samples: &[Sample]) -> Vec<(String, String, f64)> {
        samples
            .iter()
            .map(|sample| {
                (
                    sample.descriptor().name.clone(),
                    sample.label_values()[0].clone(),
                    sample.value(),
                )
            })
            .collect()
    }

    #[test]
    fn describe_is_stable() {
        let (collector, _) = collector(None, Arc::new(FailingResolver));
        let first = collector.describe();
        let names = first
            .iter()
            .map(|descriptor| descriptor.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["speedtest_ping", "speedtest_download", "speedtest_upload"]
        );

        for _ in 0..5 {
            assert_eq!(collector.describe(), first);
        }
        assert!(
            first
                .iter()
                .all(|descriptor| descriptor.variable_labels == vec!["ip".to_string()])
        );
    }

    #[tokio::test]
    async fn emits_one_gauge_per_reading() {
        let (collector, metrics) = collector(
            Some(Arc::new(FixedProvider(READING))),
            Arc::new(FixedResolver("198.51.100.4")),
        );

        let samples = run(&collector).await;
        assert_eq!(
            summarize(&samples),
            vec![
                ("speedtest_ping".to_string(), "198.51.100.4".to_string(), 12.5),
                ("speedtest_download".to_string(), "198.51.100.4".to_string(), 85.2),
                ("speedtest_upload".to_string(), "198.51.100.4".to_string(), 9.7),
            ]
        );
        assert_eq!(metrics.failures("address"), 0);
    }

    #[tokio::test]
    async fn address_failure_uses_sentinel_label() {
        let (collector, metrics) = collector(
            Some(Arc::new(FixedProvider(READING))),
            Arc::new(FailingResolver),
        );

        let samples = run(&collector).await;
        assert_eq!(samples.len(), 3);
        assert!(
            samples
                .iter()
                .all(|sample| sample.label_values() == [UNKNOWN_ADDRESS.to_string()])
        );
        assert_eq!(metrics.failures("address"), 1);
    }

    #[tokio::test]
    async fn missing_provider_emits_nothing() {
        let (collector, _) = collector(None, Arc::new(FixedResolver("198.51.100.4")));
        assert!(run(&collector).await.is_empty());
    }

    #[tokio::test]
    async fn measurement_failure_emits_nothing() {
        let (collector, metrics) = collector(
            Some(Arc::new(FailingProvider)),
            Arc::new(FixedResolver("198.51.100.4")),
        );

        assert!(run(&collector).await.is_empty());
        assert_eq!(metrics.failures("measurement"), 1);
    }

    #[tokio::test]
    async fn malformed_reading_emits_nothing() {
        let malformed = MeasurementReading {
            download: f64::NAN,
            ..READING
        };
        let (collector, metrics) = collector(
            Some(Arc::new(FixedProvider(malformed))),
            Arc::new(FixedResolver("198.51.100.4")),
        );

        assert!(run(&collector).await.is_empty());
        assert_eq!(metrics.failures("measurement"), 1);
    }

    #[tokio::test]
    async fn slow_measurement_times_out() {
        let (collector, metrics) = collector(
            Some(Arc::new(SlowProvider)),
            Arc::new(FixedResolver("198.51.100.4")),
        );
        let collector = collector.with_timeout(Some(Duration::from_millis(20)));

        assert!(run(&collector).await.is_empty());
        assert_eq!(metrics.failures("timeout"), 1);
        assert_eq!(metrics.failures("measurement"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cycles_keep_address_and_reading_paired() {
        let (collector, _) = collector(
            Some(Arc::new(CountingProvider::default())),
            Arc::new(CountingResolver::default()),
        );
        let collector = Arc::new(collector);

        let handles = (0..8)
            .map(|_| {
                let collector = collector.clone();
                tokio::spawn(async move { run(&collector).await })
            })
            .collect::<Vec<_>>();

        let mut seen = Vec::new();
        for handle in handles {
            let samples = handle.await.expect("cycle task");
            assert_eq!(samples.len(), 3);
            let address = samples[0].label_values()[0].clone();
            let n = samples[0].value();
            assert_eq!(address, format!("10.0.0.{n}"));
            assert!(
                samples
                    .iter()
                    .all(|sample| sample.label_values()[0] == address && sample.value() == n)
            );
            seen.push(n as usize);
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }
}
