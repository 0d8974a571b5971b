use std::time::Duration;

use clap::Parser;
use speedtest_exporter::DEFAULT_RESOLVER_URL;
use uuid::Uuid;

const DEFAULT_CONFIG_URL: &str = "http://c.speedtest.net/speedtest-config.php";
const DEFAULT_SERVER_URL: &str = "http://c.speedtest.net/speedtest-servers-static.php";

#[derive(Debug, Parser)]
#[command(
    name = "speedtest_exporter",
    about = "Prometheus exporter for speedtest.net measurements",
    disable_version_flag = true
)]
pub struct Cli {
    /// Print version information and exit.
    #[arg(long = "version", default_value_t = false)]
    pub show_version: bool,

    /// Address to listen on for web interface and telemetry.
    #[arg(long = "web.listen-address", default_value = ":9112")]
    pub listen_address: String,

    /// Path under which to expose metrics.
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    pub metrics_path: String,

    /// Speedtest configuration URL. Defaults to speedtest.net with a
    /// cache-busting token.
    #[arg(long = "speedtest.config-url")]
    pub config_url: Option<String>,

    /// Speedtest server list URL. Defaults to speedtest.net with a
    /// cache-busting token.
    #[arg(long = "speedtest.server-url")]
    pub server_url: Option<String>,

    /// Deadline for one measurement in seconds, 0 to disable.
    #[arg(long = "speedtest.timeout", default_value_t = 120)]
    pub timeout_secs: u64,

    /// Endpoint answering with the caller's public IP address.
    #[arg(long = "ip.resolver-url", default_value = DEFAULT_RESOLVER_URL)]
    pub resolver_url: String,

    /// Default log level; RUST_LOG directives take precedence.
    #[arg(long = "log.level", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// A bare `:port` listens on every interface.
    pub fn bind_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }

    pub fn config_url(&self) -> String {
        self.config_url
            .clone()
            .unwrap_or_else(|| cache_busting(DEFAULT_CONFIG_URL))
    }

    pub fn server_url(&self) -> String {
        self.server_url
            .clone()
            .unwrap_or_else(|| cache_busting(DEFAULT_SERVER_URL))
    }

    pub fn measurement_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn cache_busting(url: &str) -> String {
    format!("{url}?x={}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::Cli;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["speedtest_exporter"]).expect("defaults parse");
        assert!(!cli.show_version);
        assert_eq!(cli.bind_address(), "0.0.0.0:9112");
        assert_eq!(cli.metrics_path, "/metrics");
        assert_eq!(cli.resolver_url, "http://checkip.amazonaws.com");
        assert_eq!(cli.measurement_timeout(), Some(Duration::from_secs(120)));

        let config_url = cli.config_url();
        assert!(config_url.starts_with("http://c.speedtest.net/speedtest-config.php?x="));
        assert_ne!(config_url, cli.config_url());
        assert!(
            cli.server_url()
                .starts_with("http://c.speedtest.net/speedtest-servers-static.php?x=")
        );
    }

    #[test]
    fn dotted_flags() {
        let cli = Cli::try_parse_from([
            "speedtest_exporter",
            "--web.listen-address",
            "127.0.0.1:9200",
            "--web.telemetry-path",
            "/probe",
            "--speedtest.config-url",
            "http://mirror.example/config",
            "--speedtest.timeout",
            "0",
            "--version",
        ])
        .expect("flags parse");

        assert!(cli.show_version);
        assert_eq!(cli.bind_address(), "127.0.0.1:9200");
        assert_eq!(cli.metrics_path, "/probe");
        assert_eq!(cli.config_url(), "http://mirror.example/config");
        assert_eq!(cli.measurement_timeout(), None);
    }
}
