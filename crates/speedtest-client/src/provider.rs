use async_trait::async_trait;
use speedtest_common::error::{Result, SpeedtestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeasurementKey {
    Ping,
    Download,
    Upload,
}

impl MeasurementKey {
    pub const ALL: [Self; 3] = [Self::Ping, Self::Download, Self::Upload];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

/// One measurement: latency in milliseconds, throughput in Mbps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementReading {
    pub ping: f64,
    pub download: f64,
    pub upload: f64,
}

impl MeasurementReading {
    pub fn get(&self, key: MeasurementKey) -> f64 {
        match key {
            MeasurementKey::Ping => self.ping,
            MeasurementKey::Download => self.download,
            MeasurementKey::Upload => self.upload,
        }
    }

    /// Rejects readings that would export nonsense: non-finite or
    /// negative values.
    pub fn validate(self) -> Result<Self> {
        for key in MeasurementKey::ALL {
            let value = self.get(key);
            if !value.is_finite() || value < 0.0 {
                return Err(SpeedtestError::Protocol(format!(
                    "malformed {} reading: {value}",
                    key.as_str()
                )));
            }
        }
        Ok(self)
    }
}

/// A long-lived measurement handle shared by concurrent scrapes.
#[async_trait]
pub trait MeasurementProvider: Send + Sync {
    async fn network_metrics(&self) -> Result<MeasurementReading>;
}

#[cfg(test)]
mod tests {
    use super::{MeasurementKey, MeasurementReading};

    #[test]
    fn validate_rejects_non_finite_and_negative() {
        let good = MeasurementReading {
            ping: 12.5,
            download: 85.2,
            upload: 9.7,
        };
        assert_eq!(good.validate().expect("valid"), good);

        for bad in [
            MeasurementReading { ping: f64::NAN, ..good },
            MeasurementReading { download: f64::INFINITY, ..good },
            MeasurementReading { upload: -1.0, ..good },
        ] {
            assert!(bad.validate().is_err());
        }
    }

    #[test]
    fn keys_map_to_fields() {
        let reading = MeasurementReading {
            ping: 1.0,
            download: 2.0,
            upload: 3.0,
        };
        let values = MeasurementKey::ALL
            .iter()
            .map(|key| (key.as_str(), reading.get(*key)))
            .collect::<Vec<_>>();
        assert_eq!(values, vec![("ping", 1.0), ("download", 2.0), ("upload", 3.0)]);
    }
}
