pub mod collector;
pub mod handlers;
pub mod metrics;
pub mod resolver;
pub mod router;
pub mod version;

pub use collector::{NAMESPACE, SpeedtestCollector, UNKNOWN_ADDRESS};
pub use metrics::ExporterMetrics;
pub use resolver::{AddressResolver, CheckIpResolver, DEFAULT_RESOLVER_URL};
pub use router::{ExporterState, exporter_router};
pub use version::BuildInfo;
