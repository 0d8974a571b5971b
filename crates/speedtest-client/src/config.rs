use std::collections::HashSet;

use quick_xml::de::from_str as xml_from_str;
use serde::Deserialize;
use speedtest_common::error::{Result, SpeedtestError};

const DEFAULT_THREAD_COUNT: usize = 4;

/// The parts of `speedtest-config.php` the client relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeedtestConfig {
    pub client: ClientInfo,
    #[serde(rename = "server-config", default)]
    pub server_config: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    #[serde(rename = "@ip", default)]
    pub ip: String,
    #[serde(rename = "@lat")]
    pub lat: f64,
    #[serde(rename = "@lon")]
    pub lon: f64,
    #[serde(rename = "@isp", default)]
    pub isp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "@threadcount", default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(rename = "@ignoreids", default)]
    pub ignore_ids: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            ignore_ids: String::new(),
        }
    }
}

fn default_thread_count() -> usize {
    DEFAULT_THREAD_COUNT
}

impl SpeedtestConfig {
    pub fn parse(document: &str) -> Result<Self> {
        xml_from_str(document).map_err(|err| {
            SpeedtestError::Configuration(format!("unparseable speedtest config: {err}"))
        })
    }

    /// Server ids the service asks clients not to test against.
    pub fn ignored_server_ids(&self) -> HashSet<&str> {
        self.server_config
            .ignore_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect()
    }

    pub fn thread_count(&self) -> usize {
        self.server_config.thread_count.max(1)
    }
}
