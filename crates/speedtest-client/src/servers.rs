use std::collections::HashSet;

use quick_xml::de::from_str as xml_from_str;
use serde::Deserialize;
use speedtest_common::error::{Result, SpeedtestError};
use url::Url;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Deserialize)]
struct ServerListDocument {
    servers: ServerList,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerList {
    #[serde(rename = "server", default)]
    entries: Vec<Server>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@url")]
    pub url: String,
    #[serde(rename = "@lat")]
    pub lat: f64,
    #[serde(rename = "@lon")]
    pub lon: f64,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@country", default)]
    pub country: String,
    #[serde(rename = "@sponsor", default)]
    pub sponsor: String,
}

impl Server {
    /// Resolves a file living next to the server's `upload.php`, e.g.
    /// `latency.txt` or `random350x350.jpg`.
    pub fn endpoint(&self, file: &str) -> Result<Url> {
        let upload = self.upload_url()?;
        upload.join(file).map_err(|err| {
            SpeedtestError::Protocol(format!("invalid endpoint {file} for server {}: {err}", self.id))
        })
    }

    pub fn upload_url(&self) -> Result<Url> {
        Url::parse(&self.url).map_err(|err| {
            SpeedtestError::Protocol(format!("invalid url for server {}: {err}", self.id))
        })
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, lat: f64, lon: f64) -> f64 {
        let (lat1, lat2) = (lat.to_radians(), self.lat.to_radians());
        let delta_lat = (self.lat - lat).to_radians();
        let delta_lon = (self.lon - lon).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

pub fn parse_server_list(document: &str, ignored: &HashSet<&str>) -> Result<Vec<Server>> {
    let parsed: ServerListDocument = xml_from_str(document).map_err(|err| {
        SpeedtestError::Configuration(format!("unparseable speedtest server list: {err}"))
    })?;

    let servers = parsed
        .servers
        .entries
        .into_iter()
        .filter(|server| !ignored.contains(server.id.as_str()))
        .collect::<Vec<_>>();

    if servers.is_empty() {
        return Err(SpeedtestError::Configuration(
            "speedtest server list is empty".to_string(),
        ));
    }

    Ok(servers)
}

/// The `limit` servers nearest to the given coordinates, closest first.
pub fn closest(servers: &[Server], lat: f64, lon: f64, limit: usize) -> Vec<Server> {
    let mut ranked = servers
        .iter()
        .map(|server| (server.distance_km(lat, lon), server))
        .collect::<Vec<_>>();
    ranked.sort_by(|left, right| left.0.total_cmp(&right.0));

    ranked
        .into_iter()
        .take(limit)
        .map(|(_, server)| server.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{closest, parse_server_list};

    const SERVERS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<settings>
<servers>
<server url="http://paris.example:8080/speedtest/upload.php" lat="48.8567" lon="2.3508" name="Paris" country="France" cc="FR" sponsor="Example" id="10" host="paris.example:8080" />
<server url="http://tokyo.example/speedtest/upload.php" lat="35.6833" lon="139.6833" name="Tokyo" country="Japan" cc="JP" sponsor="Example" id="20" host="tokyo.example" />
<server url="http://lyon.example/speedtest/upload.php" lat="45.7500" lon="4.8500" name="Lyon" country="France" cc="FR" sponsor="Example" id="30" host="lyon.example" />
</servers>
</settings>"#;

    #[test]
    fn parses_and_filters_ignored_servers() {
        let ignored = HashSet::from(["20"]);
        let servers = parse_server_list(SERVERS, &ignored).expect("server list should parse");
        let ids = servers.iter().map(|server| server.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["10", "30"]);
        assert_eq!(servers[0].name, "Paris");
    }

    #[test]
    fn empty_list_is_a_configuration_error() {
        let ignored = HashSet::from(["10", "20", "30"]);
        assert!(parse_server_list(SERVERS, &ignored).is_err());
    }

    #[test]
    fn closest_orders_by_distance() {
        let servers = parse_server_list(SERVERS, &HashSet::new()).expect("server list");
        // Somewhere near Lyon.
        let nearest = closest(&servers, 45.0, 4.5, 2);
        let ids = nearest.iter().map(|server| server.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["30", "10"]);
    }

    #[test]
    fn distance_is_roughly_right() {
        let servers = parse_server_list(SERVERS, &HashSet::new()).expect("server list");
        // Paris to Lyon is about 390 km.
        let distance = servers[0].distance_km(servers[2].lat, servers[2].lon);
        assert!((380.0..400.0).contains(&distance), "distance was {distance}");
    }

    #[test]
    fn endpoints_sit_next_to_upload_script() {
        let servers = parse_server_list(SERVERS, &HashSet::new()).expect("server list");
        let latency = servers[0].endpoint("latency.txt").expect("endpoint");
        assert_eq!(latency.as_str(), "http://paris.example:8080/speedtest/latency.txt");
    }
}
