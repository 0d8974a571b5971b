use async_trait::async_trait;
use speedtest_common::error::{Result, SpeedtestError};

pub const DEFAULT_RESOLVER_URL: &str = "http://checkip.amazonaws.com";

/// Looks up the caller's public address. Only ever used as a label, so
/// callers treat failures as non-fatal.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

/// Asks an address-reflection endpoint that answers with the caller's IP
/// as plain text.
pub struct CheckIpResolver {
    endpoint: String,
    client: reqwest::Client,
}

impl CheckIpResolver {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AddressResolver for CheckIpResolver {
    async fn resolve(&self) -> Result<String> {
        let response = self.client.get(&self.endpoint).send().await.map_err(|err| {
            SpeedtestError::Network(format!("failed to query {}: {err}", self.endpoint))
        })?;

        if !response.status().is_success() {
            return Err(SpeedtestError::Network(format!(
                "{} returned status {}",
                self.endpoint,
                response.status()
            )));
        }

        let body = response.text().await.map_err(|err| {
            SpeedtestError::Network(format!(
                "failed to read response from {}: {err}",
                self.endpoint
            ))
        })?;

        let address = body.trim();
        if address.is_empty() {
            return Err(SpeedtestError::Network(format!(
                "{} returned an empty address",
                self.endpoint
            )));
        }

        Ok(address.to_string())
    }
}
