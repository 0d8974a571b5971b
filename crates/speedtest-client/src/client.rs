use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use speedtest_common::error::{Result, SpeedtestError};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::SpeedtestConfig,
    provider::{MeasurementProvider, MeasurementReading},
    servers::{Server, closest, parse_server_list},
};

/// Knobs for one measurement run. The defaults follow the sizes the
/// speedtest.net servers publish.
#[derive(Debug, Clone)]
pub struct MeasurementOptions {
    /// How many of the nearest servers are probed for latency.
    pub latency_candidates: usize,
    pub latency_samples: usize,
    /// Side length of the `random{N}x{N}.jpg` images to download.
    pub download_sizes: Vec<u32>,
    /// Upload payload sizes in bytes.
    pub upload_sizes: Vec<usize>,
}

impl Default for MeasurementOptions {
    fn default() -> Self {
        Self {
            latency_candidates: 5,
            latency_samples: 3,
            download_sizes: vec![350, 500, 750, 1000, 1500, 2000],
            upload_sizes: vec![256 * 1024, 512 * 1024, 1024 * 1024, 2 * 1024 * 1024],
        }
    }
}

pub struct SpeedtestClient {
    http: reqwest::Client,
    config: SpeedtestConfig,
    servers: Vec<Server>,
    options: MeasurementOptions,
}

impl SpeedtestClient {
    /// Discovers client configuration and the server list. Any failure
    /// here is a configuration error.
    pub async fn new(config_url: &str, server_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("speedtest-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                SpeedtestError::Configuration(format!("failed to build http client: {err}"))
            })?;

        Self::with_http_client(http, config_url, server_url, MeasurementOptions::default()).await
    }

    pub async fn with_http_client(
        http: reqwest::Client,
        config_url: &str,
        server_url: &str,
        options: MeasurementOptions,
    ) -> Result<Self> {
        let config_document = fetch_document(&http, config_url).await?;
        let config = SpeedtestConfig::parse(&config_document)?;

        let server_document = fetch_document(&http, server_url).await?;
        let servers = parse_server_list(&server_document, &config.ignored_server_ids())?;

        info!(
            client_ip = %config.client.ip,
            isp = %config.client.isp,
            servers = servers.len(),
            "speedtest configuration loaded"
        );

        Ok(Self {
            http,
            config,
            servers,
            options,
        })
    }

    #[cfg(test)]
    fn config(&self) -> &SpeedtestConfig {
        &self.config
    }

    #[cfg(test)]
    fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Probes the nearest servers and returns the one with the lowest
    /// latency together with that latency in milliseconds.
    pub async fn select_server(&self) -> Result<(Server, f64)> {
        let candidates = closest(
            &self.servers,
            self.config.client.lat,
            self.config.client.lon,
            self.options.latency_candidates.max(1),
        );

        let probes = join_all(candidates.iter().map(|server| self.measure_latency(server))).await;

        let mut best: Option<(Server, f64)> = None;
        for (server, probe) in candidates.into_iter().zip(probes) {
            match probe {
                Ok(latency) => {
                    debug!(server = %server.id, latency_ms = latency, "latency probe");
                    if best.as_ref().is_none_or(|(_, current)| latency < *current) {
                        best = Some((server, latency));
                    }
                }
                Err(err) => warn!(server = %server.id, error = %err, "latency probe failed"),
            }
        }

        best.ok_or_else(|| SpeedtestError::Network("no speedtest server answered".to_string()))
    }

    /// Best round trip to `latency.txt`, in milliseconds.
    pub async fn measure_latency(&self, server: &Server) -> Result<f64> {
        let url = server.endpoint("latency.txt")?;
        let mut best: Option<Duration> = None;

        for _ in 0..self.options.latency_samples.max(1) {
            let started_at = Instant::now();
            let fetched = self.fetch(url.clone()).await?;
            let elapsed = started_at.elapsed();
            if fetched == 0 {
                return Err(SpeedtestError::Protocol(format!(
                    "empty latency response from server {}",
                    server.id
                )));
            }
            best = Some(best.map_or(elapsed, |current| current.min(elapsed)));
        }

        best.map(|duration| duration.as_secs_f64() * 1000.0)
            .ok_or_else(|| SpeedtestError::Protocol("no latency samples taken".to_string()))
    }

    /// Download throughput in Mbps.
    pub async fn measure_download(&self, server: &Server) -> Result<f64> {
        let threads = self.config.thread_count();
        let mut total_bytes = 0_usize;
        let started_at = Instant::now();

        for size in &self.options.download_sizes {
            let url = server.endpoint(&format!("random{size}x{size}.jpg"))?;
            let fetches = join_all((0..threads).map(|_| self.fetch(url.clone()))).await;
            for fetched in fetches {
                total_bytes += fetched?;
            }
        }

        throughput_mbps(total_bytes, started_at.elapsed())
    }

    /// Upload throughput in Mbps.
    pub async fn measure_upload(&self, server: &Server) -> Result<f64> {
        let threads = self.config.thread_count();
        let url = server.upload_url()?;
        let mut total_bytes = 0_usize;
        let started_at = Instant::now();

        for size in &self.options.upload_sizes {
            let payload = upload_payload(*size);
            let uploads =
                join_all((0..threads).map(|_| self.upload(url.clone(), payload.clone()))).await;
            for uploaded in uploads {
                total_bytes += uploaded?;
            }
        }

        throughput_mbps(total_bytes, started_at.elapsed())
    }

    async fn fetch(&self, url: Url) -> Result<usize> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|err| SpeedtestError::Network(format!("request to {url} failed: {err}")))?;

        if !response.status().is_success() {
            return Err(SpeedtestError::Network(format!(
                "{url} returned status {}",
                response.status()
            )));
        }

        let body = response.bytes().await.map_err(|err| {
            SpeedtestError::Network(format!("failed to read body from {url}: {err}"))
        })?;
        Ok(body.len())
    }

    async fn upload(&self, url: Url, payload: Bytes) -> Result<usize> {
        let sent = payload.len();
        let response = self
            .http
            .post(url.clone())
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(payload)
            .send()
            .await
            .map_err(|err| SpeedtestError::Network(format!("upload to {url} failed: {err}")))?;

        if !response.status().is_success() {
            return Err(SpeedtestError::Network(format!(
                "upload to {url} returned status {}",
                response.status()
            )));
        }

        let acknowledgement = response.text().await.map_err(|err| {
            SpeedtestError::Network(format!("failed to read upload response from {url}: {err}"))
        })?;
        if acknowledgement.trim().is_empty() {
            return Err(SpeedtestError::Protocol(format!(
                "empty upload response from {url}"
            )));
        }

        Ok(sent)
    }
}

#[async_trait]
impl MeasurementProvider for SpeedtestClient {
    async fn network_metrics(&self) -> Result<MeasurementReading> {
        let (server, ping) = self.select_server().await?;
        info!(
            server = %server.id,
            name = %server.name,
            sponsor = %server.sponsor,
            latency_ms = ping,
            "selected speedtest server"
        );

        let download = self.measure_download(&server).await?;
        let upload = self.measure_upload(&server).await?;

        MeasurementReading {
            ping,
            download,
            upload,
        }
        .validate()
    }
}

async fn fetch_document(http: &reqwest::Client, url: &str) -> Result<String> {
    let response = http.get(url).send().await.map_err(|err| {
        SpeedtestError::Configuration(format!("failed to fetch {url}: {err}"))
    })?;

    if !response.status().is_success() {
        return Err(SpeedtestError::Configuration(format!(
            "{url} returned status {}",
            response.status()
        )));
    }

    response.text().await.map_err(|err| {
        SpeedtestError::Configuration(format!("failed to read {url}: {err}"))
    })
}

/// Form-encoded filler of exactly `size` bytes.
fn upload_payload(size: usize) -> Bytes {
    const PREFIX: &[u8] = b"content1=";
    let mut payload = Vec::with_capacity(size.max(PREFIX.len()));
    payload.extend_from_slice(PREFIX);
    payload.resize(size.max(PREFIX.len()), b'0');
    Bytes::from(payload)
}

fn throughput_mbps(bytes: usize, elapsed: Duration) -> Result<f64> {
    if bytes == 0 {
        return Err(SpeedtestError::Protocol(
            "transfer completed without moving any data".to_string(),
        ));
    }

    let seconds = elapsed.as_secs_f64().max(f64::EPSILON);
    Ok(bytes as f64 * 8.0 / seconds / 1_000_000.0)
}
