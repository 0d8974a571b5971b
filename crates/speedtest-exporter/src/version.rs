/// Build metadata exported as `speedtest_exporter_build_info` and printed
/// at startup. Revision and branch come from the build environment when
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub revision: &'static str,
    pub branch: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            revision: option_env!("SPEEDTEST_EXPORTER_REVISION").unwrap_or("unknown"),
            branch: option_env!("SPEEDTEST_EXPORTER_BRANCH").unwrap_or("unknown"),
        }
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(version={}, branch={}, revision={})",
            self.version, self.branch, self.revision
        )
    }
}
